//! Shared fixtures for runtime integration tests.
#![allow(dead_code)] // each test binary uses a different slice of this module

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use contexthub::config::Config;
use contexthub::core::{
    ClockSource, EventLoop, EventType, InstanceId, Nanoapp, NanoappHooks, Nanoseconds, Platform,
    PlatformWifi, RuntimeContext, SystemTimer,
};
use contexthub::host::{HostError, HostLink};
use contexthub::AppId;

/// Manually stepped clock.
pub struct ManualClock(Mutex<u64>);

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualClock(Mutex::new(0)))
    }

    pub fn advance(&self, ns: u64) {
        *self.0.lock().unwrap() += ns;
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> Nanoseconds {
        Nanoseconds(*self.0.lock().unwrap())
    }
}

/// System timer that records programming instead of sleeping.
#[derive(Clone, Default)]
pub struct FakeSystemTimer {
    pub armed: Arc<Mutex<Option<Nanoseconds>>>,
}

impl SystemTimer for FakeSystemTimer {
    fn arm(&mut self, deadline: Nanoseconds) {
        *self.armed.lock().unwrap() = Some(deadline);
    }

    fn disarm(&mut self) {
        *self.armed.lock().unwrap() = None;
    }
}

/// Wifi platform that accepts every change and records it.
#[derive(Clone, Default)]
pub struct FakeWifi {
    pub calls: Arc<Mutex<Vec<bool>>>,
}

impl PlatformWifi for FakeWifi {
    fn configure_scan_monitor(&mut self, enable: bool) -> bool {
        self.calls.lock().unwrap().push(enable);
        true
    }
}

/// Host link recording frames; can simulate a dropped link.
#[derive(Clone, Default)]
pub struct RecordingLink {
    pub frames: Arc<Mutex<Vec<Vec<u8>>>>,
    pub down: Arc<Mutex<bool>>,
}

impl HostLink for RecordingLink {
    fn send_frame(&mut self, payload: &[u8]) -> Result<(), HostError> {
        if *self.down.lock().unwrap() {
            return Err(HostError::NotConnected);
        }
        self.frames.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

/// One delivered event as observed by a test nanoapp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    pub sender: InstanceId,
    pub event_type: EventType,
    /// `u32` payloads are decoded for convenience; anything else is None.
    pub payload: Option<u32>,
}

type EventHook = Box<
    dyn FnMut(&RuntimeContext, InstanceId, EventType, Option<&(dyn Any + Send)>) + Send,
>;

/// Scriptable nanoapp: subscribes during start, logs deliveries, and runs
/// optional start/event hooks.
pub struct TestApp {
    pub subscriptions: Vec<EventType>,
    pub start_ok: bool,
    pub log: Arc<Mutex<Vec<Delivered>>>,
    pub ended: Arc<AtomicBool>,
    pub on_start: Option<Box<dyn FnMut(&RuntimeContext) + Send>>,
    pub on_event: Option<EventHook>,
}

impl TestApp {
    pub fn new(subscriptions: Vec<EventType>) -> Self {
        Self {
            subscriptions,
            start_ok: true,
            log: Arc::new(Mutex::new(Vec::new())),
            ended: Arc::new(AtomicBool::new(false)),
            on_start: None,
            on_event: None,
        }
    }

    pub fn into_nanoapp(self, app_id: u64) -> Nanoapp {
        Nanoapp::new(AppId(app_id), 1, false, 16, Box::new(self))
    }

    pub fn into_system_nanoapp(self, app_id: u64) -> Nanoapp {
        Nanoapp::new(AppId(app_id), 1, true, 16, Box::new(self))
    }
}

impl NanoappHooks for TestApp {
    fn start(&mut self, ctx: &RuntimeContext) -> bool {
        for &event_type in &self.subscriptions {
            ctx.register_event_type(event_type);
        }
        if let Some(hook) = self.on_start.as_mut() {
            hook(ctx);
        }
        self.start_ok
    }

    fn handle_event(
        &mut self,
        ctx: &RuntimeContext,
        sender: InstanceId,
        event_type: EventType,
        payload: Option<&(dyn Any + Send)>,
    ) {
        self.log.lock().unwrap().push(Delivered {
            sender,
            event_type,
            payload: payload.and_then(|p| p.downcast_ref::<u32>().copied()),
        });
        if let Some(hook) = self.on_event.as_mut() {
            hook(ctx, sender, event_type, payload);
        }
    }

    fn end(&mut self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub ctx: RuntimeContext,
    pub event_loop: EventLoop,
    pub clock: Arc<ManualClock>,
    pub timer: FakeSystemTimer,
    pub wifi: FakeWifi,
    pub link: RecordingLink,
}

impl Harness {
    pub fn new() -> Harness {
        let clock = ManualClock::new();
        let timer = FakeSystemTimer::default();
        let wifi = FakeWifi::default();
        let link = RecordingLink::default();
        let (ctx, event_loop) = RuntimeContext::init(
            &Config::default(),
            Platform {
                wifi: Box::new(wifi.clone()),
                sensors: Vec::new(),
                host_link: Box::new(link.clone()),
                system_timer: Some(Box::new(timer.clone())),
                clock: Some(clock.clone()),
            },
        );
        Harness {
            ctx,
            event_loop,
            clock,
            timer,
            wifi,
            link,
        }
    }

    /// Iterate until the loop reports no pending work and the inbound
    /// queue has drained; bounded so a bug cannot hang the test.
    pub fn settle(&mut self) {
        for _ in 0..256 {
            self.event_loop.run_once();
            if self.event_loop.is_idle() {
                return;
            }
        }
        panic!("event loop failed to settle");
    }

    /// Drive expiry on the timer pool, as the platform one-shot would.
    pub fn fire_timers(&self) {
        self.ctx.timer_pool().lock().unwrap().handle_expiry();
    }
}
