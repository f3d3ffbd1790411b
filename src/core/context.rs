//! The process-scoped runtime context.
//!
//! One `RuntimeContext` holds every shared singleton: the event sender,
//! timer pool, capability managers, host adapter, clock, and instance-id
//! counter. Components receive a (cheap, cloneable) context reference
//! instead of reaching into a global, and nanoapp hooks use it as their
//! syscall surface: calls made while a hook runs are attributed to that
//! nanoapp through the loop's current-app binding.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::Sender;
use tracing::warn;

use crate::config::Config;
use crate::host::comms::{HostCommsManager, MessageFreeCallback};
use crate::host::HostLink;

use super::event::{
    AppId, EventData, EventType, FreeCallback, InstanceId, SharedEventPool,
};
use super::event_loop::{
    EventLoop, LoopCommand, LoopHandle, NanoappSummary, SubscriptionOp,
};
use super::inbound::{EventSender, LoopShared, PostError, inbound_queue};
use super::sensor::{PlatformSensor, SensorError, SensorRequest, SensorRequestManager, SensorType};
use super::time::{MonotonicClock, Nanoseconds, SharedClock};
use super::timer::{Cookie, SystemTimer, ThreadSystemTimer, TimerError, TimerId, TimerPool};
use super::wifi::{AsyncErrorCode, PlatformWifi, WifiError, WifiScanManager};

/// Platform seams injected at initialisation.
pub struct Platform {
    pub wifi: Box<dyn PlatformWifi>,
    pub sensors: Vec<(SensorType, Box<dyn PlatformSensor>)>,
    pub host_link: Box<dyn HostLink>,
    /// `None` selects the thread-based production timer.
    pub system_timer: Option<Box<dyn SystemTimer>>,
    /// `None` selects the process monotonic clock.
    pub clock: Option<SharedClock>,
}

#[derive(Clone)]
pub struct RuntimeContext {
    sender: EventSender,
    clock: SharedClock,
    timers: Arc<Mutex<TimerPool>>,
    wifi: Arc<Mutex<WifiScanManager>>,
    sensors: Arc<Mutex<SensorRequestManager>>,
    host: Arc<Mutex<HostCommsManager>>,
    control_tx: Sender<LoopCommand>,
    registry: Arc<Mutex<Vec<NanoappSummary>>>,
    subscription_ops: Arc<Mutex<Vec<SubscriptionOp>>>,
    next_instance_id: Arc<AtomicU32>,
}

impl RuntimeContext {
    /// Build the runtime: every singleton plus the (not yet running) event
    /// loop that consumes its queues.
    pub fn init(config: &Config, platform: Platform) -> (RuntimeContext, EventLoop) {
        let limits = &config.limits;
        let clock = platform
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()) as SharedClock);

        let (sender, rx, _pool, _shared) =
            inbound_queue(limits.event_pool_capacity, limits.inbound_queue_capacity);
        let (control_tx, control_rx) = crossbeam::channel::unbounded();

        let timers = match platform.system_timer {
            Some(timer) => Arc::new(Mutex::new(TimerPool::new(
                sender.clone(),
                timer,
                Arc::clone(&clock),
                limits.max_timers,
            ))),
            None => {
                // The production one-shot notifies through a weak handle so
                // the pool can own its own backing timer.
                Arc::new_cyclic(|weak: &std::sync::Weak<Mutex<TimerPool>>| {
                    let weak = weak.clone();
                    let on_fire: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
                        if let Some(pool) = weak.upgrade() {
                            pool.lock()
                                .unwrap_or_else(|err| err.into_inner())
                                .handle_expiry();
                        }
                    });
                    Mutex::new(TimerPool::new(
                        sender.clone(),
                        Box::new(ThreadSystemTimer::new(on_fire, Arc::clone(&clock))),
                        Arc::clone(&clock),
                        limits.max_timers,
                    ))
                })
            }
        };

        let wifi = Arc::new(Mutex::new(WifiScanManager::new(
            sender.clone(),
            platform.wifi,
            limits.max_scan_monitor_subscribers,
            limits.max_scan_monitor_transitions,
        )));
        let sensors = Arc::new(Mutex::new(SensorRequestManager::new(platform.sensors)));
        let registry: Arc<Mutex<Vec<NanoappSummary>>> = Arc::new(Mutex::new(Vec::new()));
        let host = Arc::new(Mutex::new(HostCommsManager::new(
            sender.clone(),
            control_tx.clone(),
            Arc::clone(&registry),
            platform.host_link,
            Arc::clone(&clock),
            config,
        )));

        let ctx = RuntimeContext {
            sender,
            clock,
            timers,
            wifi,
            sensors,
            host,
            control_tx,
            registry,
            subscription_ops: Arc::new(Mutex::new(Vec::new())),
            next_instance_id: Arc::new(AtomicU32::new(1)),
        };
        let event_loop = EventLoop::new(rx, control_rx, ctx.clone());
        (ctx, event_loop)
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn now(&self) -> Nanoseconds {
        self.clock.now()
    }

    /// Stop the loop: a sentinel wakes the blocking pop, then the running
    /// flag falls. Idempotent; later posts fail with `LoopStopped`.
    pub fn stop(&self) {
        self.sender.post_wake();
        self.sender.shared().set_running(false);
    }

    pub fn loop_handle(&self) -> LoopHandle {
        LoopHandle::new(self.control_tx.clone(), self.sender.clone())
    }

    pub fn event_sender(&self) -> &EventSender {
        &self.sender
    }

    pub fn host_comms(&self) -> &Arc<Mutex<HostCommsManager>> {
        &self.host
    }

    /// The timer pool; platform glue drives expiry through this handle
    /// when it owns the backing one-shot.
    pub fn timer_pool(&self) -> &Arc<Mutex<TimerPool>> {
        &self.timers
    }

    // === Nanoapp syscall surface ===================================

    /// Post an event on behalf of the executing nanoapp (or the system
    /// outside any hook).
    pub fn post_event(
        &self,
        event_type: EventType,
        payload: Option<EventData>,
        free_callback: Option<FreeCallback>,
        target: InstanceId,
    ) -> Result<(), PostError> {
        self.sender
            .post_from_current(event_type, payload, free_callback, target)
    }

    /// Post with explicit attribution; for platform and embedder paths.
    pub fn post_system_event(
        &self,
        event_type: EventType,
        payload: Option<EventData>,
        free_callback: Option<FreeCallback>,
        sender: InstanceId,
        target: InstanceId,
    ) -> Result<(), PostError> {
        self.sender
            .post_event(event_type, payload, free_callback, sender, target)
    }

    pub fn set_timer(
        &self,
        duration: Nanoseconds,
        interval: Nanoseconds,
        cookie: Cookie,
    ) -> Result<TimerId, TimerError> {
        let owner = self.current_app().unwrap_or(InstanceId::SYSTEM);
        self.lock_timers().set_timer(owner, duration, interval, cookie)
    }

    pub fn cancel_timer(&self, timer_id: TimerId) -> bool {
        let owner = self.current_app().unwrap_or(InstanceId::SYSTEM);
        self.lock_timers().cancel_timer(owner, timer_id)
    }

    pub fn configure_scan_monitor(&self, enable: bool, cookie: Cookie) -> Result<(), WifiError> {
        let instance_id = self.current_app().unwrap_or(InstanceId::SYSTEM);
        self.wifi
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .configure(instance_id, enable, cookie)
    }

    pub fn set_sensor_request(
        &self,
        sensor_type: SensorType,
        request: SensorRequest,
    ) -> Result<(), SensorError> {
        let instance_id = self.current_app().unwrap_or(InstanceId::SYSTEM);
        self.sensors
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .set_request(instance_id, sensor_type, request)
    }

    /// Send a message to the host on behalf of the executing nanoapp.
    pub fn send_host_message(
        &self,
        message_type: u32,
        host_endpoint: u16,
        payload: Vec<u8>,
        free_callback: Option<MessageFreeCallback>,
    ) -> Result<(), crate::host::HostError> {
        let Some(instance_id) = self.current_app() else {
            return Err(crate::host::HostError::NoCurrentNanoapp);
        };
        if self.sender.shared().current_nanoapp_is_stopping() {
            return Err(crate::host::HostError::NoCurrentNanoapp);
        }
        let Some(app_id) = self.app_id_of(instance_id) else {
            return Err(crate::host::HostError::NoCurrentNanoapp);
        };
        self.host
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .send_message_to_host(
                instance_id,
                app_id,
                message_type,
                host_endpoint,
                payload,
                free_callback,
            )
    }

    /// Subscribe the executing nanoapp to a broadcast event type. The
    /// change is applied by the loop when the current hook returns; false
    /// means no nanoapp hook is executing.
    pub fn register_event_type(&self, event_type: EventType) -> bool {
        self.queue_subscription_op(event_type, true)
    }

    pub fn unregister_event_type(&self, event_type: EventType) -> bool {
        self.queue_subscription_op(event_type, false)
    }

    // === Platform indication entry points ==========================

    /// Platform outcome of a scan-monitor change. Callable from any
    /// thread; the work is deferred onto the loop thread.
    pub fn handle_scan_monitor_state_change(
        &self,
        enabled: bool,
        error_code: AsyncErrorCode,
    ) -> Result<(), PostError> {
        let wifi = Arc::clone(&self.wifi);
        self.sender.defer(move || {
            wifi.lock()
                .unwrap_or_else(|err| err.into_inner())
                .handle_scan_monitor_state_change(enabled, error_code);
        })
    }

    // === Cross-thread queries ======================================

    /// Look up a loaded nanoapp's instance id. Takes the registry lock;
    /// safe from any thread.
    pub fn find_instance_id_by_app_id(&self, app_id: AppId) -> Option<InstanceId> {
        self.lock_registry()
            .iter()
            .find(|summary| summary.app_id == app_id)
            .map(|summary| summary.instance_id)
    }

    pub fn nanoapp_summaries(&self) -> Vec<NanoappSummary> {
        self.lock_registry().clone()
    }

    // === Loop-internal plumbing ====================================

    pub(crate) fn shared(&self) -> &Arc<LoopShared> {
        self.sender.shared()
    }

    pub(crate) fn pool(&self) -> &SharedEventPool {
        self.sender.pool()
    }

    pub(crate) fn allocate_instance_id(&self) -> InstanceId {
        InstanceId(self.next_instance_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn registry_insert(&self, summary: NanoappSummary) {
        self.lock_registry().push(summary);
    }

    pub(crate) fn registry_remove(&self, instance_id: InstanceId) {
        self.lock_registry()
            .retain(|summary| summary.instance_id != instance_id);
    }

    pub(crate) fn take_subscription_ops(&self) -> Vec<SubscriptionOp> {
        std::mem::take(
            &mut *self
                .subscription_ops
                .lock()
                .unwrap_or_else(|err| err.into_inner()),
        )
    }

    pub(crate) fn flush_host_messages_for(&self, app_id: AppId) {
        self.host
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .flush_messages_sent_by(app_id);
    }

    /// Release everything a nanoapp still holds at unload: timers, sensor
    /// requests, scan-monitor subscription.
    pub(crate) fn release_resources_for(&self, instance_id: InstanceId) {
        self.lock_timers().cancel_all_for(instance_id);
        self.sensors
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove_all_requests_for(instance_id);
        self.wifi
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove_requests_for(instance_id);
    }

    fn current_app(&self) -> Option<InstanceId> {
        self.sender.shared().current_app()
    }

    fn app_id_of(&self, instance_id: InstanceId) -> Option<AppId> {
        self.lock_registry()
            .iter()
            .find(|summary| summary.instance_id == instance_id)
            .map(|summary| summary.app_id)
    }

    fn queue_subscription_op(&self, event_type: EventType, register: bool) -> bool {
        let Some(instance_id) = self.current_app() else {
            warn!(%event_type, "subscription change outside a nanoapp hook");
            return false;
        };
        self.subscription_ops
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(SubscriptionOp {
                instance_id,
                event_type,
                register,
            });
        true
    }

    fn lock_timers(&self) -> MutexGuard<'_, TimerPool> {
        self.timers.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn lock_registry(&self) -> MutexGuard<'_, Vec<NanoappSummary>> {
        self.registry.lock().unwrap_or_else(|err| err.into_inner())
    }
}
