//! Nanoapp state: identity, subscriptions, inbox, lifecycle hooks.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;

use super::collections::{CapacityExceeded, RingQueue};
use super::context::RuntimeContext;
use super::event::{AppId, EventKey, EventType, InstanceId};

/// Lifecycle hooks a nanoapp module implements.
///
/// All three run on the loop thread with the app bound as current, so
/// runtime services invoked through the context attribute the caller
/// correctly. `handle_event` is expected to be cooperative: no blocking
/// primitives (a contract, not enforced).
pub trait NanoappHooks: Send {
    /// Returns false to abort the load; the nanoapp is then destroyed
    /// without `end` being called.
    fn start(&mut self, ctx: &RuntimeContext) -> bool;

    fn handle_event(
        &mut self,
        ctx: &RuntimeContext,
        sender: InstanceId,
        event_type: EventType,
        payload: Option<&(dyn Any + Send)>,
    );

    fn end(&mut self);
}

/// A loaded nanoapp, exclusively owned by the event loop for its lifetime.
pub struct Nanoapp {
    app_id: AppId,
    version: u32,
    instance_id: InstanceId,
    is_system: bool,
    subscriptions: BTreeSet<EventType>,
    inbox: RingQueue<EventKey>,
    hooks: Box<dyn NanoappHooks>,
}

impl Nanoapp {
    /// The instance id is assigned by the loop at start; until then the
    /// nanoapp is unaddressable (`BROADCAST` doubles as the invalid id).
    pub fn new(
        app_id: AppId,
        version: u32,
        is_system: bool,
        inbox_capacity: usize,
        hooks: Box<dyn NanoappHooks>,
    ) -> Self {
        Self {
            app_id,
            version,
            instance_id: InstanceId::BROADCAST,
            is_system,
            subscriptions: BTreeSet::new(),
            inbox: RingQueue::new(inbox_capacity),
            hooks,
        }
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn is_system(&self) -> bool {
        self.is_system
    }

    pub(crate) fn set_instance_id(&mut self, instance_id: InstanceId) {
        debug_assert_eq!(
            self.instance_id,
            InstanceId::BROADCAST,
            "instance id is set exactly once"
        );
        self.instance_id = instance_id;
    }

    pub fn is_registered_for(&self, event_type: EventType) -> bool {
        self.subscriptions.contains(&event_type)
    }

    /// Returns false if the subscription already existed.
    pub fn register_event_type(&mut self, event_type: EventType) -> bool {
        self.subscriptions.insert(event_type)
    }

    /// Returns false if there was no such subscription.
    pub fn unregister_event_type(&mut self, event_type: EventType) -> bool {
        self.subscriptions.remove(&event_type)
    }

    /// Append to the inbox. The caller owns the matching refcount bump.
    pub(crate) fn push_event(&mut self, key: EventKey) -> Result<(), CapacityExceeded> {
        self.inbox.push(key)
    }

    pub fn has_pending_event(&self) -> bool {
        !self.inbox.is_empty()
    }

    pub(crate) fn take_next_event(&mut self) -> Option<EventKey> {
        self.inbox.pop()
    }

    pub(crate) fn hooks_mut(&mut self) -> &mut dyn NanoappHooks {
        &mut *self.hooks
    }
}

impl fmt::Debug for Nanoapp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nanoapp")
            .field("app_id", &self.app_id)
            .field("instance_id", &self.instance_id)
            .field("is_system", &self.is_system)
            .field("subscriptions", &self.subscriptions.len())
            .field("pending_events", &self.inbox.len())
            .finish()
    }
}
