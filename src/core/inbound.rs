//! Inbound event queue: the multi-producer, single-consumer boundary
//! between external threads and the loop thread.
//!
//! Producers allocate an event slot under the pool lock and hand the key
//! over a bounded channel; the loop thread is the only consumer. A full
//! queue or exhausted pool fails the post visibly. Dropping is never
//! silent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender, TrySendError};
use thiserror::Error;

use super::event::{
    Event, EventData, EventKey, EventPool, EventType, FreeCallback, InstanceId, PoolExhausted,
    SharedEventPool, event_type, lock_pool,
};

#[derive(Debug, Error)]
pub enum PostError {
    /// The loop has stopped (or was asked to); no further events are
    /// accepted.
    #[error("event loop is not accepting events")]
    LoopStopped,
    /// The posting nanoapp is being unloaded; its posts are refused so no
    /// new references to it enter the queues.
    #[error("nanoapp is stopping")]
    NanoappStopping,
    #[error(transparent)]
    PoolExhausted(#[from] PoolExhausted),
    #[error("inbound queue full ({capacity})")]
    QueueFull { capacity: usize },
}

/// Loop state shared with producers and platform hooks.
pub struct LoopShared {
    running: AtomicBool,
    /// Stack of instance ids currently executing a hook or free callback;
    /// the top entry attributes reentrant posts. A stack (not a slot)
    /// because free callbacks can run nested inside a delivery.
    current_app: Mutex<Vec<InstanceId>>,
    stopping_app: Mutex<Option<InstanceId>>,
}

impl LoopShared {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            current_app: Mutex::new(Vec::new()),
            stopping_app: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Instance id of the nanoapp whose hook or free callback is executing.
    pub fn current_app(&self) -> Option<InstanceId> {
        self.lock_current().last().copied()
    }

    pub(crate) fn push_current(&self, instance_id: InstanceId) {
        self.lock_current().push(instance_id);
    }

    pub(crate) fn pop_current(&self) {
        let popped = self.lock_current().pop();
        debug_assert!(popped.is_some(), "current-app stack underflow");
    }

    pub(crate) fn set_stopping(&self, instance_id: Option<InstanceId>) {
        *self
            .stopping_app
            .lock()
            .unwrap_or_else(|err| err.into_inner()) = instance_id;
    }

    /// True when the executing nanoapp must be refused new posts: the loop
    /// is shutting down, or the app itself is mid-unload.
    pub fn current_nanoapp_is_stopping(&self) -> bool {
        if !self.is_running() {
            return true;
        }
        let stopping = *self
            .stopping_app
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        match (self.current_app(), stopping) {
            (Some(current), Some(stopping)) => current == stopping,
            _ => false,
        }
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Vec<InstanceId>> {
        self.current_app
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }
}

impl Default for LoopShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable producer handle to the inbound queue.
#[derive(Clone)]
pub struct EventSender {
    pool: SharedEventPool,
    tx: Sender<EventKey>,
    shared: Arc<LoopShared>,
    queue_capacity: usize,
}

impl EventSender {
    /// Post an event for distribution.
    ///
    /// On failure the payload and callback are dropped without the free
    /// callback running (no event was created); ownership stays Rust-managed
    /// so nothing leaks.
    pub fn post_event(
        &self,
        event_type: EventType,
        payload: Option<EventData>,
        free_callback: Option<FreeCallback>,
        sender: InstanceId,
        target: InstanceId,
    ) -> Result<(), PostError> {
        if !self.shared.is_running() {
            return Err(PostError::LoopStopped);
        }

        let event = Event::new(event_type, payload, free_callback, sender, target);
        let key = lock_pool(&self.pool).allocate(event)?;
        match self.tx.try_send(key) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(key)) => {
                lock_pool(&self.pool).deallocate(key);
                Err(PostError::QueueFull {
                    capacity: self.queue_capacity,
                })
            }
            Err(TrySendError::Disconnected(key)) => {
                lock_pool(&self.pool).deallocate(key);
                Err(PostError::LoopStopped)
            }
        }
    }

    /// Post on behalf of the currently-executing nanoapp (or the system
    /// when no hook is running). Refused while that nanoapp is stopping.
    pub fn post_from_current(
        &self,
        event_type: EventType,
        payload: Option<EventData>,
        free_callback: Option<FreeCallback>,
        target: InstanceId,
    ) -> Result<(), PostError> {
        if self.shared.current_nanoapp_is_stopping() {
            return Err(PostError::NanoappStopping);
        }
        let sender = self.shared.current_app().unwrap_or(InstanceId::SYSTEM);
        self.post_event(event_type, payload, free_callback, sender, target)
    }

    /// Run `f` on the loop thread. The closure rides an undeliverable
    /// system event and executes in its free callback during distribution.
    pub fn defer(&self, f: impl FnOnce() + Send + 'static) -> Result<(), PostError> {
        self.post_event(
            event_type::DEFERRED_CALLBACK,
            None,
            Some(Box::new(move |_event_type, _payload| f())),
            InstanceId::SYSTEM,
            InstanceId::SYSTEM,
        )
    }

    /// Nudge a loop that may be blocked waiting for events. A full queue
    /// means the loop has work anyway, so that failure is ignored.
    pub(crate) fn post_wake(&self) {
        let _ = self.post_event(
            event_type::NONE,
            None,
            None,
            InstanceId::SYSTEM,
            InstanceId::SYSTEM,
        );
    }

    pub fn shared(&self) -> &Arc<LoopShared> {
        &self.shared
    }

    pub(crate) fn pool(&self) -> &SharedEventPool {
        &self.pool
    }
}

/// Build the inbound boundary: pool, shared loop state, and both channel
/// ends.
pub(crate) fn inbound_queue(
    pool_capacity: usize,
    queue_capacity: usize,
) -> (EventSender, Receiver<EventKey>, SharedEventPool, Arc<LoopShared>) {
    let pool: SharedEventPool = Arc::new(Mutex::new(EventPool::new(pool_capacity)));
    let shared = Arc::new(LoopShared::new());
    let (tx, rx) = crossbeam::channel::bounded(queue_capacity);
    let sender = EventSender {
        pool: Arc::clone(&pool),
        tx,
        shared: Arc::clone(&shared),
        queue_capacity,
    };
    (sender, rx, pool, shared)
}
