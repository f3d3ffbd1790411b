//! The event loop: distribution, round-robin delivery, nanoapp lifecycle,
//! orderly shutdown.
//!
//! Events arrive in two stages. The inbound queue hands the loop one event
//! at a time; distribution fans it out to the inboxes of subscribed or
//! directly-addressed nanoapps, bumping the refcount per recipient. A
//! delivery pass then hands each nanoapp exactly one event, so no app can
//! starve its peers. When the last reference drops, the event's free
//! callback runs and the slot returns to the pool.
//!
//! The loop thread owns the nanoapp list outright; no lock is taken here.
//! Cross-thread lifecycle requests travel over a control channel and are
//! answered between iterations, and external lookups go through the shared
//! registry snapshot instead of the list itself.

use crossbeam::channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::context::RuntimeContext;
use super::event::{AppId, EventKey, EventType, InstanceId, lock_pool};
use super::inbound::EventSender;
use super::nanoapp::Nanoapp;

/// Externally visible snapshot of a loaded nanoapp.
#[derive(Clone, Copy, Debug)]
pub struct NanoappSummary {
    pub app_id: AppId,
    pub version: u32,
    pub instance_id: InstanceId,
    pub is_system: bool,
}

/// Subscription change requested by a hook through the context; applied by
/// the loop once the hook returns.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SubscriptionOp {
    pub instance_id: InstanceId,
    pub event_type: EventType,
    pub register: bool,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("app {0} is already loaded")]
    AlreadyExists(AppId),
    #[error("no nanoapp with instance id {0}")]
    UnknownInstance(InstanceId),
    #[error("refusing to unload system nanoapp {0}")]
    SystemNanoapp(InstanceId),
    #[error("nanoapp {0} failed to start")]
    StartFailed(AppId),
    #[error("event loop is unavailable")]
    LoopUnavailable,
}

/// Cross-thread lifecycle request, answered over a oneshot reply channel.
pub enum LoopCommand {
    StartNanoapp {
        nanoapp: Nanoapp,
        reply: Sender<Result<InstanceId, LifecycleError>>,
    },
    UnloadNanoapp {
        instance_id: InstanceId,
        allow_system_unload: bool,
        reply: Sender<Result<(), LifecycleError>>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Initialising,
    Running,
    Stopping,
    Stopped,
}

pub struct EventLoop {
    rx: Receiver<EventKey>,
    control_rx: Receiver<LoopCommand>,
    ctx: RuntimeContext,
    nanoapps: Vec<Nanoapp>,
    state: LoopState,
    have_pending_events: bool,
}

impl EventLoop {
    pub(crate) fn new(
        rx: Receiver<EventKey>,
        control_rx: Receiver<LoopCommand>,
        ctx: RuntimeContext,
    ) -> Self {
        Self {
            rx,
            control_rx,
            ctx,
            nanoapps: Vec::new(),
            state: LoopState::Initialising,
            have_pending_events: false,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn nanoapp_count(&self) -> usize {
        self.nanoapps.len()
    }

    /// True when nothing is queued inbound and no nanoapp has pending
    /// events; the single-step driver uses this to know when to stop.
    pub fn is_idle(&self) -> bool {
        !self.have_pending_events && self.rx.is_empty()
    }

    /// Run until [`RuntimeContext::stop`] is called, then shut down in
    /// order. The blocking pop below is the loop's only suspension point;
    /// the stop sentinel guarantees it wakes.
    pub fn run(&mut self) {
        info!("event loop started");
        self.state = LoopState::Running;

        while self.ctx.shared().is_running() {
            self.drain_control();

            // Only block for inbound events when no nanoapp has pending
            // work; otherwise distribute only what has already arrived so
            // delivery is never starved.
            if !self.have_pending_events || !self.rx.is_empty() {
                match self.rx.recv() {
                    Ok(key) => self.distribute_event(key),
                    Err(_) => break,
                }
            }

            self.have_pending_events = self.deliver_events();
        }

        self.state = LoopState::Stopping;
        self.shutdown();
        self.state = LoopState::Stopped;
        info!("event loop exited");
    }

    /// One non-blocking iteration: handle queued lifecycle requests,
    /// distribute at most one inbound event, run one delivery pass.
    /// Returns whether per-nanoapp work remains.
    pub fn run_once(&mut self) -> bool {
        if self.state == LoopState::Initialising {
            self.state = LoopState::Running;
        }
        self.drain_control();
        if (!self.have_pending_events || !self.rx.is_empty())
            && let Ok(key) = self.rx.try_recv()
        {
            self.distribute_event(key);
        }
        self.have_pending_events = self.deliver_events();
        self.have_pending_events
    }

    /// Shutdown entered after the run loop exits: drain every queue so all
    /// free callbacks run, then unload the nanoapps in reverse start order.
    /// Nanoapps can no longer post at this point, so the drains terminate.
    pub fn shutdown(&mut self) {
        debug_assert!(!self.ctx.shared().is_running());

        while let Ok(command) = self.control_rx.try_recv() {
            match command {
                LoopCommand::StartNanoapp { reply, .. } => {
                    let _ = reply.send(Err(LifecycleError::LoopUnavailable));
                }
                LoopCommand::UnloadNanoapp { reply, .. } => {
                    let _ = reply.send(Err(LifecycleError::LoopUnavailable));
                }
            }
        }

        self.flush_nanoapp_event_queues();
        while let Ok(key) = self.rx.try_recv() {
            self.free_event(key);
        }

        while !self.nanoapps.is_empty() {
            self.unload_nanoapp_at_index(self.nanoapps.len() - 1);
        }
        self.state = LoopState::Stopped;
    }

    /// Load a nanoapp: assign a fresh instance id, publish it, and run its
    /// `start` hook with the app bound as current.
    ///
    /// A false return from `start` tears the app straight back down; events
    /// and messages it posted while starting are flushed the same way the
    /// unload path flushes them, then the instance is destroyed without
    /// `end` running.
    pub fn start_nanoapp(&mut self, mut nanoapp: Nanoapp) -> Result<InstanceId, LifecycleError> {
        let app_id = nanoapp.app_id();
        if let Some(existing) = self.nanoapps.iter().find(|app| app.app_id() == app_id) {
            error!(
                %app_id,
                existing_instance = %existing.instance_id(),
                "app is already loaded"
            );
            return Err(LifecycleError::AlreadyExists(app_id));
        }

        let instance_id = self.ctx.allocate_instance_id();
        nanoapp.set_instance_id(instance_id);
        debug!(%instance_id, %app_id, "instance id assigned");

        self.ctx.registry_insert(NanoappSummary {
            app_id,
            version: nanoapp.version(),
            instance_id,
            is_system: nanoapp.is_system(),
        });
        self.nanoapps.push(nanoapp);

        self.ctx.shared().push_current(instance_id);
        let started = self
            .nanoapps
            .last_mut()
            .expect("nanoapp was just pushed")
            .hooks_mut()
            .start(&self.ctx);
        self.ctx.shared().pop_current();
        self.apply_subscription_ops();

        if !started {
            error!(%instance_id, %app_id, "nanoapp failed to start");
            self.ctx.flush_host_messages_for(app_id);
            self.flush_inbound_event_queue();
            self.ctx.shared().set_stopping(Some(instance_id));
            self.flush_nanoapp_event_queues();
            self.ctx.shared().set_stopping(None);

            let app = self.nanoapps.pop().expect("failed nanoapp is still last");
            self.ctx.registry_remove(instance_id);
            drop(app);
            return Err(LifecycleError::StartFailed(app_id));
        }

        debug!(%instance_id, %app_id, "nanoapp started");
        Ok(instance_id)
    }

    /// Unload a nanoapp in three phases so nothing can reference it
    /// afterwards: park its outbound host-message callbacks in the inbound
    /// queue, distribute everything pending so they run, then drain the
    /// per-nanoapp inboxes with the app marked stopping (its own posts are
    /// refused from that moment). Only then do `end` and destruction run.
    pub fn unload_nanoapp(
        &mut self,
        instance_id: InstanceId,
        allow_system_unload: bool,
    ) -> Result<(), LifecycleError> {
        let index = self
            .nanoapps
            .iter()
            .position(|app| app.instance_id() == instance_id)
            .ok_or(LifecycleError::UnknownInstance(instance_id))?;
        if self.nanoapps[index].is_system() && !allow_system_unload {
            error!(%instance_id, "refusing to unload system nanoapp");
            return Err(LifecycleError::SystemNanoapp(instance_id));
        }
        let app_id = self.nanoapps[index].app_id();

        self.ctx.flush_host_messages_for(app_id);
        self.flush_inbound_event_queue();

        self.ctx.shared().set_stopping(Some(instance_id));
        self.flush_nanoapp_event_queues();
        self.ctx.release_resources_for(instance_id);
        self.unload_nanoapp_at_index(index);
        self.ctx.shared().set_stopping(None);

        debug!(%instance_id, %app_id, "nanoapp unloaded");
        Ok(())
    }

    /// Drain every inbound event pending distribution right now.
    pub fn flush_inbound_event_queue(&mut self) {
        while let Ok(key) = self.rx.try_recv() {
            self.distribute_event(key);
        }
    }

    /// Run delivery passes until every nanoapp inbox is empty.
    fn flush_nanoapp_event_queues(&mut self) {
        while self.deliver_events() {}
    }

    fn drain_control(&mut self) {
        while let Ok(command) = self.control_rx.try_recv() {
            match command {
                LoopCommand::StartNanoapp { nanoapp, reply } => {
                    let _ = reply.send(self.start_nanoapp(nanoapp));
                }
                LoopCommand::UnloadNanoapp {
                    instance_id,
                    allow_system_unload,
                    reply,
                } => {
                    let _ = reply.send(self.unload_nanoapp(instance_id, allow_system_unload));
                }
            }
        }
    }

    /// Fan one inbound event out to every interested inbox. An event nobody
    /// receives is freed on the spot; that is the expected path for system
    /// carrier events, and a logged drop for anything else.
    fn distribute_event(&mut self, key: EventKey) {
        self.apply_subscription_ops();
        let (event_type, sender, target) = {
            let pool = lock_pool(self.ctx.pool());
            let event = pool.get(key);
            (event.event_type, event.sender, event.target)
        };

        for app in &mut self.nanoapps {
            let wants = if target.is_broadcast() {
                app.is_registered_for(event_type)
            } else {
                target == app.instance_id()
            };
            if !wants {
                continue;
            }
            match app.push_event(key) {
                Ok(()) => lock_pool(self.ctx.pool()).increment_ref(key),
                Err(err) => warn!(
                    instance_id = %app.instance_id(),
                    %event_type,
                    %err,
                    "inbox full; event not delivered to nanoapp"
                ),
            }
        }

        if lock_pool(self.ctx.pool()).get(key).is_unreferenced() {
            if !sender.is_system() {
                warn!(%event_type, %sender, "dropping event with no recipients");
            }
            self.free_event(key);
        }
    }

    /// One round-robin pass: each nanoapp with pending work gets exactly
    /// one event. Returns whether anything is still pending afterwards.
    fn deliver_events(&mut self) -> bool {
        let mut have_pending = false;
        for index in 0..self.nanoapps.len() {
            if self.nanoapps[index].has_pending_event() {
                have_pending |= self.deliver_next_event(index);
            }
        }
        have_pending
    }

    fn deliver_next_event(&mut self, index: usize) -> bool {
        let Some(key) = self.nanoapps[index].take_next_event() else {
            return false;
        };
        let instance_id = self.nanoapps[index].instance_id();
        let (sender, event_type) = {
            let pool = lock_pool(self.ctx.pool());
            let event = pool.get(key);
            (event.sender, event.event_type)
        };
        // Check the payload out so the hook can borrow it with the pool
        // unlocked; a hook that posts events re-enters the pool.
        let payload = lock_pool(self.ctx.pool()).take_payload(key);

        self.ctx.shared().push_current(instance_id);
        self.nanoapps[index]
            .hooks_mut()
            .handle_event(&self.ctx, sender, event_type, payload.as_deref());
        self.ctx.shared().pop_current();
        self.apply_subscription_ops();

        let unreferenced = {
            let mut pool = lock_pool(self.ctx.pool());
            pool.restore_payload(key, payload);
            pool.decrement_ref(key)
        };
        if unreferenced {
            self.free_event(key);
        }

        self.nanoapps[index].has_pending_event()
    }

    /// Release the last reference: run the free callback exactly once, on
    /// this thread, attributed to the event's creator so reentrant posts
    /// from the callback name the right sender.
    fn free_event(&mut self, key: EventKey) {
        let event = lock_pool(self.ctx.pool()).deallocate(key);
        let (event_type, sender, payload, free_callback) = event.into_free_parts();
        if let Some(callback) = free_callback {
            self.ctx.shared().push_current(sender);
            callback(event_type, payload);
            self.ctx.shared().pop_current();
        }
    }

    fn unload_nanoapp_at_index(&mut self, index: usize) {
        let mut app = self.nanoapps.remove(index);

        // The flush sequences leave the inbox empty on every path; release
        // stragglers anyway so an event can never outlive its recipient.
        while let Some(key) = app.take_next_event() {
            if lock_pool(self.ctx.pool()).decrement_ref(key) {
                self.free_event(key);
            }
        }

        self.ctx.shared().push_current(app.instance_id());
        app.hooks_mut().end();
        self.ctx.shared().pop_current();
        self.ctx.registry_remove(app.instance_id());
    }

    fn apply_subscription_ops(&mut self) {
        for op in self.ctx.take_subscription_ops() {
            let Some(app) = self
                .nanoapps
                .iter_mut()
                .find(|app| app.instance_id() == op.instance_id)
            else {
                warn!(instance_id = %op.instance_id, "subscription change for unknown nanoapp");
                continue;
            };
            if op.register {
                app.register_event_type(op.event_type);
            } else {
                app.unregister_event_type(op.event_type);
            }
        }
    }
}

/// Cross-thread handle for lifecycle requests against a running loop.
///
/// Each request enqueues a command and posts a wake event so a loop blocked
/// on an empty queue notices; the reply arrives once the loop processes the
/// command between iterations.
#[derive(Clone)]
pub struct LoopHandle {
    control_tx: Sender<LoopCommand>,
    sender: EventSender,
}

impl LoopHandle {
    pub(crate) fn new(control_tx: Sender<LoopCommand>, sender: EventSender) -> Self {
        Self { control_tx, sender }
    }

    pub fn start_nanoapp(&self, nanoapp: Nanoapp) -> Result<InstanceId, LifecycleError> {
        if !self.sender.shared().is_running() {
            return Err(LifecycleError::LoopUnavailable);
        }
        let (reply, reply_rx) = crossbeam::channel::bounded(1);
        self.control_tx
            .send(LoopCommand::StartNanoapp { nanoapp, reply })
            .map_err(|_| LifecycleError::LoopUnavailable)?;
        self.sender.post_wake();
        reply_rx.recv().map_err(|_| LifecycleError::LoopUnavailable)?
    }

    pub fn unload_nanoapp(
        &self,
        instance_id: InstanceId,
        allow_system_unload: bool,
    ) -> Result<(), LifecycleError> {
        if !self.sender.shared().is_running() {
            return Err(LifecycleError::LoopUnavailable);
        }
        let (reply, reply_rx) = crossbeam::channel::bounded(1);
        self.control_tx
            .send(LoopCommand::UnloadNanoapp {
                instance_id,
                allow_system_unload,
                reply,
            })
            .map_err(|_| LifecycleError::LoopUnavailable)?;
        self.sender.post_wake();
        reply_rx.recv().map_err(|_| LifecycleError::LoopUnavailable)?
    }
}
