//! Events and the fixed-capacity event pool.
//!
//! An [`Event`] is the unit of communication in the runtime: a typed,
//! reference-counted envelope around an opaque payload. Its free callback
//! runs exactly once, on the loop thread, when the last reference is
//! released; the payload is never touched afterwards.
//!
//! Reference counts are plain integers, not atomics. The loop thread is the
//! only mutator (allocation through the posting path aside, which happens
//! under the pool lock); this thread-confinement discipline is what makes
//! the free-on-last-reference mechanism sound with a single loop.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

/// Runtime-assigned identifier of a loaded nanoapp.
///
/// `SYSTEM` (0) is reserved for the runtime itself; `BROADCAST` (`u32::MAX`)
/// targets every nanoapp subscribed to the event's type. Ids are handed out
/// monotonically and never reused within a process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u32);

impl InstanceId {
    pub const SYSTEM: InstanceId = InstanceId(0);
    pub const BROADCAST: InstanceId = InstanceId(u32::MAX);

    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vendor-assigned 64-bit identity of a nanoapp.
///
/// May repeat across restarts but must be unique among currently-loaded
/// nanoapps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppId(pub u64);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// 16-bit event type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventType(pub u16);

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Reserved event-type ranges.
///
/// `0x0000..=0x00ff` is system plumbing, `0x0100..` sensor samples (base
/// plus per-sensor offset), `0x8000..` user-defined types.
pub mod event_type {
    use super::EventType;

    /// Shutdown sentinel and loop wake-up; never delivered to a nanoapp.
    pub const NONE: EventType = EventType(0x0000);
    pub const MESSAGE_FROM_HOST: EventType = EventType(0x0001);
    pub const TIMER: EventType = EventType(0x0002);
    /// Carrier for a host-message free callback.
    pub const MESSAGE_FREE: EventType = EventType(0x0003);
    /// Carrier for a deferred system callback; the work runs in the free
    /// callback when the undeliverable event is released.
    pub const DEFERRED_CALLBACK: EventType = EventType(0x0004);
    pub const SENSOR_DATA_BASE: u16 = 0x0100;
    pub const WIFI_ASYNC_RESULT: EventType = EventType(0x0320);
    pub const FIRST_USER: EventType = EventType(0x8000);
}

/// Opaque event payload; concrete type is owned by the event type.
pub type EventData = Box<dyn Any + Send>;

/// Runs exactly once when the event's refcount returns to zero.
pub type FreeCallback = Box<dyn FnOnce(EventType, Option<EventData>) + Send>;

pub struct Event {
    pub event_type: EventType,
    pub sender: InstanceId,
    pub target: InstanceId,
    payload: Option<EventData>,
    free_callback: Option<FreeCallback>,
    ref_count: usize,
}

impl Event {
    pub fn new(
        event_type: EventType,
        payload: Option<EventData>,
        free_callback: Option<FreeCallback>,
        sender: InstanceId,
        target: InstanceId,
    ) -> Self {
        Self {
            event_type,
            sender,
            target,
            payload,
            free_callback,
            ref_count: 0,
        }
    }

    pub fn is_unreferenced(&self) -> bool {
        self.ref_count == 0
    }

    fn increment_ref_count(&mut self) {
        self.ref_count += 1;
    }

    fn decrement_ref_count(&mut self) {
        debug_assert!(self.ref_count > 0, "refcount underflow");
        self.ref_count = self.ref_count.saturating_sub(1);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_type", &self.event_type)
            .field("sender", &self.sender)
            .field("target", &self.target)
            .field("has_payload", &self.payload.is_some())
            .field("ref_count", &self.ref_count)
            .finish()
    }
}

/// Handle to a slot in the [`EventPool`].
///
/// Only meaningful to the pool that produced it; keys are reused after
/// deallocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventKey(usize);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("event pool exhausted ({capacity} slots)")]
pub struct PoolExhausted {
    pub capacity: usize,
}

/// Fixed-capacity slab of in-flight events.
pub struct EventPool {
    slots: Vec<Option<Event>>,
    free: Vec<usize>,
    capacity: usize,
}

impl EventPool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            free: (0..capacity).rev().collect(),
            capacity,
        }
    }

    pub fn allocate(&mut self, event: Event) -> Result<EventKey, PoolExhausted> {
        let Some(index) = self.free.pop() else {
            return Err(PoolExhausted {
                capacity: self.capacity,
            });
        };
        debug_assert!(self.slots[index].is_none(), "free slot in use");
        self.slots[index] = Some(event);
        Ok(EventKey(index))
    }

    /// Release a slot, returning the event for its final free pass.
    ///
    /// Only valid while the event is unreferenced.
    pub fn deallocate(&mut self, key: EventKey) -> Event {
        let event = self.slots[key.0].take().expect("event slot occupied");
        debug_assert!(event.is_unreferenced(), "freeing a referenced event");
        self.free.push(key.0);
        event
    }

    pub fn get(&self, key: EventKey) -> &Event {
        self.slots[key.0].as_ref().expect("event slot occupied")
    }

    pub fn increment_ref(&mut self, key: EventKey) {
        self.slot_mut(key).increment_ref_count();
    }

    /// Drop one reference; returns true when the event became unreferenced.
    pub fn decrement_ref(&mut self, key: EventKey) -> bool {
        let event = self.slot_mut(key);
        event.decrement_ref_count();
        event.is_unreferenced()
    }

    /// Check the payload out of a slot so a nanoapp hook can borrow it
    /// without the pool lock held. Must be paired with
    /// [`EventPool::restore_payload`].
    pub fn take_payload(&mut self, key: EventKey) -> Option<EventData> {
        self.slot_mut(key).payload.take()
    }

    pub fn restore_payload(&mut self, key: EventKey, payload: Option<EventData>) {
        self.slot_mut(key).payload = payload;
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot_mut(&mut self, key: EventKey) -> &mut Event {
        self.slots[key.0].as_mut().expect("event slot occupied")
    }
}

pub type SharedEventPool = Arc<Mutex<EventPool>>;

/// Lock the pool, recovering from a poisoned mutex.
///
/// A panic inside a nanoapp hook must not wedge every later event post.
pub fn lock_pool(pool: &SharedEventPool) -> MutexGuard<'_, EventPool> {
    pool.lock().unwrap_or_else(|err| err.into_inner())
}

impl Event {
    /// Split into the pieces the free pass needs.
    pub(crate) fn into_free_parts(self) -> (EventType, InstanceId, Option<EventData>, Option<FreeCallback>) {
        (self.event_type, self.sender, self.payload, self.free_callback)
    }
}
