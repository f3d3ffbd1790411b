//! Timer pool: many logical timers multiplexed over one hardware one-shot.
//!
//! The pool keeps requests sorted by absolute expiration (stable on ties,
//! so the earlier `set_timer` call wins) and always keeps the backing
//! one-shot armed at the head's expiration, or disarmed when empty. Expiry
//! handling does minimal work on the driver thread: it posts timer events
//! into the inbound queue and re-arms; the owning nanoapp's handler runs
//! only through normal loop dispatch.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::collections::{SortKey, SortedList};
use super::event::{EventData, InstanceId, event_type};
use super::inbound::{EventSender, PostError};
use super::time::{Nanoseconds, SharedClock};

/// Identifier of an active timer, unique across the pool's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub u32);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque caller token, handed back on every fire.
pub type Cookie = Arc<dyn Any + Send + Sync>;

/// Payload of [`event_type::TIMER`] events.
pub struct TimerFired {
    pub timer_id: TimerId,
    pub cookie: Cookie,
}

impl fmt::Debug for TimerFired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerFired")
            .field("timer_id", &self.timer_id)
            .finish()
    }
}

pub struct TimerRequest {
    pub timer_id: TimerId,
    pub owner: InstanceId,
    pub expiration: Nanoseconds,
    /// Zero means one-shot.
    pub interval: Nanoseconds,
    cookie: Cookie,
}

impl fmt::Debug for TimerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRequest")
            .field("timer_id", &self.timer_id)
            .field("owner", &self.owner)
            .field("expiration", &self.expiration)
            .field("interval", &self.interval)
            .finish()
    }
}

impl SortKey for TimerRequest {
    type Key = Nanoseconds;

    fn sort_key(&self) -> Nanoseconds {
        self.expiration
    }
}

/// The platform's single one-shot timer.
pub trait SystemTimer: Send {
    /// (Re)program the one-shot to fire at `deadline`. Supersedes any
    /// earlier programming.
    fn arm(&mut self, deadline: Nanoseconds);

    fn disarm(&mut self);
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("timer pool full ({capacity} timers)")]
    PoolFull { capacity: usize },
}

pub struct TimerPool {
    timers: SortedList<TimerRequest>,
    next_timer_id: u32,
    sender: EventSender,
    system_timer: Box<dyn SystemTimer>,
    clock: SharedClock,
}

impl TimerPool {
    pub fn new(
        sender: EventSender,
        system_timer: Box<dyn SystemTimer>,
        clock: SharedClock,
        capacity: usize,
    ) -> Self {
        Self {
            timers: SortedList::new(capacity),
            next_timer_id: 1,
            sender,
            system_timer,
            clock,
        }
    }

    /// Arm a timer firing `duration` from now, then every `interval`
    /// (zero for one-shot).
    pub fn set_timer(
        &mut self,
        owner: InstanceId,
        duration: Nanoseconds,
        interval: Nanoseconds,
        cookie: Cookie,
    ) -> Result<TimerId, TimerError> {
        let timer_id = TimerId(self.next_timer_id);
        let expiration = self.clock.now() + duration;
        let request = TimerRequest {
            timer_id,
            owner,
            expiration,
            interval,
            cookie,
        };

        let index = self.timers.insert(request).map_err(|err| TimerError::PoolFull {
            capacity: err.capacity,
        })?;
        self.next_timer_id = self.next_timer_id.wrapping_add(1).max(1);

        if index == 0 {
            self.system_timer.arm(expiration);
        }
        Ok(timer_id)
    }

    /// Cancel a timer. Fails (returning false) when the id is unknown or
    /// owned by a different nanoapp. A cancellation that races an expiry
    /// already posted may still see that fire delivered.
    pub fn cancel_timer(&mut self, owner: InstanceId, timer_id: TimerId) -> bool {
        let mut owner_mismatch = false;
        let found = self.timers.position(|t| {
            if t.timer_id != timer_id {
                return false;
            }
            owner_mismatch = t.owner != owner;
            true
        });
        let Some(index) = found else {
            return false;
        };
        if owner_mismatch {
            warn!(%timer_id, %owner, "cancel refused: timer owned by another nanoapp");
            return false;
        }

        self.timers.remove(index);
        if index == 0 {
            self.rearm_to_head();
        }
        true
    }

    /// Drop every timer owned by `owner`; used at nanoapp unload.
    pub fn cancel_all_for(&mut self, owner: InstanceId) -> usize {
        let head_before = self.timers.front().map(|t| t.timer_id);
        let before = self.timers.len();
        self.timers.retain(|t| t.owner != owner);
        let removed = before - self.timers.len();

        if removed > 0 && self.timers.front().map(|t| t.timer_id) != head_before {
            self.rearm_to_head();
        }
        removed
    }

    /// Hardware expiry callback. Runs on the driver thread; posts one timer
    /// event per due timer, reinserts periodic timers at `expiration +
    /// interval`, and re-arms to the new head.
    pub fn handle_expiry(&mut self) {
        let now = self.clock.now();
        while let Some(front) = self.timers.front()
            && front.expiration <= now
        {
            let fired = self
                .timers
                .pop_front()
                .expect("non-empty timer list has a front");
            self.post_fired(&fired);

            if !fired.interval.is_zero() {
                let reinserted = TimerRequest {
                    expiration: fired.expiration + fired.interval,
                    ..fired
                };
                if self.timers.insert(reinserted).is_err() {
                    warn!("timer pool full; periodic timer lapsed");
                }
            }
        }
        self.rearm_to_head();
    }

    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    /// Expiration the hardware timer should currently be armed at.
    pub fn head_expiration(&self) -> Option<Nanoseconds> {
        self.timers.front().map(|t| t.expiration)
    }

    fn post_fired(&mut self, fired: &TimerRequest) {
        let payload: EventData = Box::new(TimerFired {
            timer_id: fired.timer_id,
            cookie: Arc::clone(&fired.cookie),
        });
        if let Err(err) = self.sender.post_event(
            event_type::TIMER,
            Some(payload),
            None,
            InstanceId::SYSTEM,
            fired.owner,
        ) {
            match err {
                PostError::LoopStopped => {
                    debug!(timer_id = %fired.timer_id, "loop stopped; timer fire dropped")
                }
                err => warn!(timer_id = %fired.timer_id, %err, "failed to post timer fire"),
            }
        }
    }

    fn rearm_to_head(&mut self) {
        match self.timers.front() {
            Some(front) => self.system_timer.arm(front.expiration),
            None => self.system_timer.disarm(),
        }
    }
}

/// Production [`SystemTimer`]: a generation-counted sleeper thread per
/// programming. Superseded threads wake, notice their generation is stale,
/// and exit without firing.
pub struct ThreadSystemTimer {
    on_fire: Arc<dyn Fn() + Send + Sync>,
    clock: SharedClock,
    generation: Arc<AtomicU64>,
}

impl ThreadSystemTimer {
    pub fn new(on_fire: Arc<dyn Fn() + Send + Sync>, clock: SharedClock) -> Self {
        Self {
            on_fire,
            clock,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl SystemTimer for ThreadSystemTimer {
    fn arm(&mut self, deadline: Nanoseconds) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generations = Arc::clone(&self.generation);
        let on_fire = Arc::clone(&self.on_fire);
        let clock = Arc::clone(&self.clock);
        std::thread::spawn(move || {
            let now = clock.now();
            if deadline > now {
                std::thread::sleep((deadline - now).as_duration());
            }
            if generations.load(Ordering::SeqCst) == generation {
                on_fire();
            }
        });
    }

    fn disarm(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}
