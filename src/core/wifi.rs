//! Wifi scan-monitor arbitration.
//!
//! The manager keeps the platform scan monitor enabled exactly while at
//! least one nanoapp subscribes, with at most one platform reconfiguration
//! in flight. Pending requests wait in a FIFO transition queue and are
//! answered strictly in order; a result delivered out of order is a bug.

use std::fmt;

use thiserror::Error;
use tracing::{error, warn};

use super::collections::{BoundedVec, RingQueue};
use super::event::{EventData, InstanceId, event_type};
use super::inbound::EventSender;
use super::timer::Cookie;

/// Platform seam for the scan monitor.
///
/// `configure_scan_monitor` submits an asynchronous change; the eventual
/// outcome arrives through the runtime's state-change entry point.
pub trait PlatformWifi: Send {
    fn configure_scan_monitor(&mut self, enable: bool) -> bool;
}

/// Outcome classification for async results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AsyncErrorCode {
    #[default]
    None,
    Failure,
}

impl AsyncErrorCode {
    pub fn as_u8(self) -> u8 {
        match self {
            AsyncErrorCode::None => 0,
            AsyncErrorCode::Failure => 1,
        }
    }
}

/// Payload of [`event_type::WIFI_ASYNC_RESULT`] events.
pub struct ScanMonitorResult {
    pub success: bool,
    /// The state the requester asked for.
    pub enabled: bool,
    pub error_code: AsyncErrorCode,
    pub cookie: Cookie,
}

impl fmt::Debug for ScanMonitorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanMonitorResult")
            .field("success", &self.success)
            .field("enabled", &self.enabled)
            .field("error_code", &self.error_code)
            .finish()
    }
}

struct Transition {
    instance_id: InstanceId,
    enable: bool,
    cookie: Cookie,
}

#[derive(Debug, Error)]
pub enum WifiError {
    #[error("scan monitor transition queue full ({capacity})")]
    TransitionQueueFull { capacity: usize },
    #[error("platform rejected scan monitor change")]
    PlatformFailure,
}

pub struct WifiScanManager {
    active_nanoapps: BoundedVec<InstanceId>,
    transitions: RingQueue<Transition>,
    platform: Box<dyn PlatformWifi>,
    sender: EventSender,
}

impl WifiScanManager {
    pub fn new(
        sender: EventSender,
        platform: Box<dyn PlatformWifi>,
        max_subscribers: usize,
        max_transitions: usize,
    ) -> Self {
        Self {
            active_nanoapps: BoundedVec::new(max_subscribers),
            transitions: RingQueue::new(max_transitions),
            platform,
            sender,
        }
    }

    pub fn scan_monitor_is_enabled(&self) -> bool {
        !self.active_nanoapps.is_empty()
    }

    pub fn nanoapp_has_scan_monitor_request(&self, instance_id: InstanceId) -> bool {
        self.subscriber_index(instance_id).is_some()
    }

    /// Request the scan monitor on or off for one nanoapp.
    ///
    /// Success means the request was accepted; the outcome arrives later as
    /// an async-result event (immediately when no platform change is
    /// needed).
    pub fn configure(
        &mut self,
        instance_id: InstanceId,
        enable: bool,
        cookie: Cookie,
    ) -> Result<(), WifiError> {
        if !self.transitions.is_empty() {
            // A change is in flight: everything queues behind it.
            return self.enqueue(instance_id, enable, cookie);
        }

        let has_request = self.nanoapp_has_scan_monitor_request(instance_id);
        if self.in_requested_state(enable, has_request) {
            self.post_result_fatal(instance_id, true, enable, AsyncErrorCode::None, cookie);
            return Ok(());
        }

        debug_assert!(self.transition_required(enable, has_request));
        self.enqueue(instance_id, enable, cookie)?;
        if !self.platform.configure_scan_monitor(enable) {
            // The queue was empty, so the entry we just pushed is the head.
            self.transitions.pop();
            error!(%instance_id, enable, "platform rejected scan monitor submission");
            return Err(WifiError::PlatformFailure);
        }
        Ok(())
    }

    /// Platform outcome for the in-flight transition. Must run on the loop
    /// thread (the indication path defers here through a system callback).
    ///
    /// Answers the head of the queue, then drains: already-satisfied
    /// entries get immediate successes; the first entry needing another
    /// platform change submits it and becomes the new in-flight head.
    pub fn handle_scan_monitor_state_change(&mut self, enabled: bool, error_code: AsyncErrorCode) {
        let Some(head) = self.transitions.pop() else {
            warn!(enabled, "scan monitor state change with no transition in flight");
            return;
        };
        let success = error_code == AsyncErrorCode::None && head.enable == enabled;
        self.post_result_fatal(head.instance_id, success, head.enable, error_code, head.cookie);

        while let Some(front) = self.transitions.front() {
            let instance_id = front.instance_id;
            let enable = front.enable;
            let has_request = self.nanoapp_has_scan_monitor_request(instance_id);

            if self.in_requested_state(enable, has_request) {
                let entry = self.transitions.pop().expect("front was just observed");
                self.post_result_fatal(
                    entry.instance_id,
                    true,
                    entry.enable,
                    AsyncErrorCode::None,
                    entry.cookie,
                );
            } else if self.platform.configure_scan_monitor(enable) {
                // New change in flight; its entry stays at the head.
                break;
            } else {
                let entry = self.transitions.pop().expect("front was just observed");
                self.post_result_fatal(
                    entry.instance_id,
                    false,
                    entry.enable,
                    AsyncErrorCode::Failure,
                    entry.cookie,
                );
            }
        }
    }

    /// Drop a nanoapp's subscription without a platform round-trip; used at
    /// unload. Disables the platform when the last subscriber goes away.
    pub fn remove_requests_for(&mut self, instance_id: InstanceId) {
        let Some(index) = self.subscriber_index(instance_id) else {
            return;
        };
        self.active_nanoapps.remove(index);
        if self.active_nanoapps.is_empty() && !self.platform.configure_scan_monitor(false) {
            warn!(%instance_id, "platform rejected scan monitor teardown");
        }
    }

    fn subscriber_index(&self, instance_id: InstanceId) -> Option<usize> {
        self.active_nanoapps
            .iter()
            .position(|&id| id == instance_id)
    }

    /// Whether `requested` already holds from this nanoapp's point of view:
    /// the monitor is in that state globally, or disabling only means
    /// leaving a list that keeps the monitor alive for others.
    fn in_requested_state(&self, requested: bool, has_request: bool) -> bool {
        requested == self.scan_monitor_is_enabled()
            || (!requested && (!has_request || self.active_nanoapps.len() > 1))
    }

    /// Whether `requested` needs a platform change: first subscriber in, or
    /// last subscriber out.
    fn transition_required(&self, requested: bool, has_request: bool) -> bool {
        (requested && self.active_nanoapps.is_empty())
            || (!requested && has_request && self.active_nanoapps.len() == 1)
    }

    fn enqueue(
        &mut self,
        instance_id: InstanceId,
        enable: bool,
        cookie: Cookie,
    ) -> Result<(), WifiError> {
        self.transitions
            .push(Transition {
                instance_id,
                enable,
                cookie,
            })
            .map_err(|err| {
                warn!(%instance_id, "too many scan monitor state transitions");
                WifiError::TransitionQueueFull {
                    capacity: err.capacity,
                }
            })
    }

    fn update_subscriber_list(&mut self, enable: bool, instance_id: InstanceId) -> bool {
        let index = self.subscriber_index(instance_id);
        match (enable, index) {
            (true, Some(_)) => true,
            (true, None) => match self.active_nanoapps.push(instance_id) {
                Ok(()) => true,
                Err(_) => {
                    error!(%instance_id, "scan monitor subscriber list full");
                    false
                }
            },
            (false, Some(index)) => {
                self.active_nanoapps.remove(index);
                true
            }
            (false, None) => {
                error!(%instance_id, "scan monitor state change for a non-subscribed nanoapp");
                false
            }
        }
    }

    /// Deliver an async result, updating the subscriber list first on
    /// success. Failure to enqueue the result is fatal: the nanoapp would
    /// wait forever.
    fn post_result_fatal(
        &mut self,
        instance_id: InstanceId,
        success: bool,
        enable: bool,
        error_code: AsyncErrorCode,
        cookie: Cookie,
    ) {
        if success && !self.update_subscriber_list(enable, instance_id) {
            panic!("scan monitor subscriber list update failed for nanoapp {instance_id}");
        }
        let payload: EventData = Box::new(ScanMonitorResult {
            success,
            enabled: enable,
            error_code,
            cookie,
        });
        if let Err(err) = self.sender.post_event(
            event_type::WIFI_ASYNC_RESULT,
            Some(payload),
            None,
            InstanceId::SYSTEM,
            instance_id,
        ) {
            panic!("failed to post scan monitor async result: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::core::event::lock_pool;
    use crate::core::inbound::inbound_queue;

    #[derive(Clone, Default)]
    struct FakeWifi {
        calls: Arc<Mutex<Vec<bool>>>,
        reject: Arc<Mutex<bool>>,
    }

    impl PlatformWifi for FakeWifi {
        fn configure_scan_monitor(&mut self, enable: bool) -> bool {
            if *self.reject.lock().unwrap() {
                return false;
            }
            self.calls.lock().unwrap().push(enable);
            true
        }
    }

    struct Fixture {
        manager: WifiScanManager,
        wifi: FakeWifi,
        rx: crossbeam::channel::Receiver<crate::core::event::EventKey>,
        events: crate::core::event::SharedEventPool,
    }

    fn fixture() -> Fixture {
        let (sender, rx, events, _shared) = inbound_queue(32, 32);
        let wifi = FakeWifi::default();
        let manager = WifiScanManager::new(sender, Box::new(wifi.clone()), 8, 8);
        Fixture {
            manager,
            wifi,
            rx,
            events,
        }
    }

    fn cookie(tag: u32) -> Cookie {
        Arc::new(tag)
    }

    impl Fixture {
        /// Drain posted async results as (target, success, enabled) tuples.
        fn drain_results(&self) -> Vec<(InstanceId, bool, bool)> {
            let mut results = Vec::new();
            while let Ok(key) = self.rx.try_recv() {
                let mut events = lock_pool(&self.events);
                let target = events.get(key).target;
                let event = events.deallocate(key);
                let (_, _, payload, _) = event.into_free_parts();
                let result = payload.unwrap().downcast::<ScanMonitorResult>().unwrap();
                results.push((target, result.success, result.enabled));
            }
            results
        }

        fn platform_calls(&self) -> Vec<bool> {
            self.wifi.calls.lock().unwrap().clone()
        }
    }

    #[test]
    fn first_subscriber_submits_platform_enable() {
        let mut fx = fixture();
        let x = InstanceId(1);

        fx.manager.configure(x, true, cookie(0)).unwrap();
        assert_eq!(fx.platform_calls(), vec![true]);
        // Nothing resolved until the platform reports.
        assert!(fx.drain_results().is_empty());

        fx.manager
            .handle_scan_monitor_state_change(true, AsyncErrorCode::None);
        assert_eq!(fx.drain_results(), vec![(x, true, true)]);
        assert!(fx.manager.scan_monitor_is_enabled());
    }

    #[test]
    fn request_while_pending_queues_and_resolves_in_order() {
        let mut fx = fixture();
        let x = InstanceId(1);
        let y = InstanceId(2);

        fx.manager.configure(x, true, cookie(0)).unwrap();
        // Y's identical request queues behind the in-flight enable.
        fx.manager.configure(y, true, cookie(1)).unwrap();
        assert_eq!(fx.platform_calls(), vec![true]);

        fx.manager
            .handle_scan_monitor_state_change(true, AsyncErrorCode::None);
        // X resolves from the platform result; Y immediately after, with no
        // second platform call.
        assert_eq!(fx.drain_results(), vec![(x, true, true), (y, true, true)]);
        assert_eq!(fx.platform_calls(), vec![true]);
        assert!(fx.manager.nanoapp_has_scan_monitor_request(x));
        assert!(fx.manager.nanoapp_has_scan_monitor_request(y));
    }

    #[test]
    fn already_enabled_resolves_immediately() {
        let mut fx = fixture();
        let x = InstanceId(1);
        let y = InstanceId(2);

        fx.manager.configure(x, true, cookie(0)).unwrap();
        fx.manager
            .handle_scan_monitor_state_change(true, AsyncErrorCode::None);
        fx.drain_results();

        fx.manager.configure(y, true, cookie(1)).unwrap();
        assert_eq!(fx.drain_results(), vec![(y, true, true)]);
        assert_eq!(fx.platform_calls(), vec![true]);
    }

    #[test]
    fn removing_last_subscriber_disables_the_platform() {
        let mut fx = fixture();
        let x = InstanceId(1);

        fx.manager.configure(x, true, cookie(0)).unwrap();
        fx.manager
            .handle_scan_monitor_state_change(true, AsyncErrorCode::None);
        fx.drain_results();

        fx.manager.configure(x, false, cookie(1)).unwrap();
        assert_eq!(fx.platform_calls(), vec![true, false]);
        fx.manager
            .handle_scan_monitor_state_change(false, AsyncErrorCode::None);
        assert_eq!(fx.drain_results(), vec![(x, true, false)]);
        assert!(!fx.manager.scan_monitor_is_enabled());
    }

    #[test]
    fn non_last_disable_skips_the_platform() {
        let mut fx = fixture();
        let x = InstanceId(1);
        let y = InstanceId(2);

        for (app, tag) in [(x, 0), (y, 1)] {
            fx.manager.configure(app, true, cookie(tag)).unwrap();
            fx.manager
                .handle_scan_monitor_state_change(true, AsyncErrorCode::None);
        }
        fx.drain_results();

        fx.manager.configure(x, false, cookie(2)).unwrap();
        assert_eq!(fx.drain_results(), vec![(x, true, false)]);
        assert!(!fx.manager.nanoapp_has_scan_monitor_request(x));
        assert!(fx.manager.scan_monitor_is_enabled());
        assert_eq!(fx.platform_calls(), vec![true]);
    }

    #[test]
    fn platform_submission_failure_dequeues_and_errors() {
        let mut fx = fixture();
        *fx.wifi.reject.lock().unwrap() = true;

        let err = fx.manager.configure(InstanceId(1), true, cookie(0));
        assert!(matches!(err, Err(WifiError::PlatformFailure)));
        // Queue must be clear so later requests are not stuck behind a
        // transition that will never resolve.
        *fx.wifi.reject.lock().unwrap() = false;
        fx.manager.configure(InstanceId(2), true, cookie(1)).unwrap();
        assert_eq!(fx.platform_calls(), vec![true]);
    }

    #[test]
    fn platform_error_code_fails_the_head_request() {
        let mut fx = fixture();
        let x = InstanceId(1);

        fx.manager.configure(x, true, cookie(0)).unwrap();
        fx.manager
            .handle_scan_monitor_state_change(false, AsyncErrorCode::Failure);
        assert_eq!(fx.drain_results(), vec![(x, false, true)]);
        assert!(!fx.manager.scan_monitor_is_enabled());
    }

    #[test]
    fn drain_submits_next_required_transition_and_stops() {
        let mut fx = fixture();
        let x = InstanceId(1);
        let y = InstanceId(2);

        // X enables (in flight), then X queues a disable behind it; Y
        // queues an enable behind that.
        fx.manager.configure(x, true, cookie(0)).unwrap();
        fx.manager.configure(x, false, cookie(1)).unwrap();
        fx.manager.configure(y, true, cookie(2)).unwrap();

        fx.manager
            .handle_scan_monitor_state_change(true, AsyncErrorCode::None);
        // X's enable resolved; X's disable is now last-subscriber-out and
        // must submit a platform change, parking Y behind it.
        assert_eq!(fx.drain_results(), vec![(x, true, true)]);
        assert_eq!(fx.platform_calls(), vec![true, false]);

        fx.manager
            .handle_scan_monitor_state_change(false, AsyncErrorCode::None);
        // X's disable resolved; Y's enable is first-subscriber-in again.
        assert_eq!(fx.drain_results(), vec![(x, true, false)]);
        assert_eq!(fx.platform_calls(), vec![true, false, true]);

        fx.manager
            .handle_scan_monitor_state_change(true, AsyncErrorCode::None);
        assert_eq!(fx.drain_results(), vec![(y, true, true)]);
    }

    #[test]
    fn unload_cleanup_disables_when_last() {
        let mut fx = fixture();
        let x = InstanceId(1);

        fx.manager.configure(x, true, cookie(0)).unwrap();
        fx.manager
            .handle_scan_monitor_state_change(true, AsyncErrorCode::None);
        fx.drain_results();

        fx.manager.remove_requests_for(x);
        assert!(!fx.manager.scan_monitor_is_enabled());
        assert_eq!(fx.platform_calls(), vec![true, false]);
    }
}
