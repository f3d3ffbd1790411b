//! Timer pool driven through the full loop: expiry posts events, the loop
//! dispatches them, unload cancels what is left.

mod common;

use std::sync::{Arc, Mutex};

use contexthub::core::{ClockSource, EventType, InstanceId, Nanoseconds, TimerFired, event_type};

use common::{Harness, TestApp};

const TIMER: EventType = event_type::TIMER;

/// Collects (cookie tag, fire time) pairs from delivered timer events.
type FireLog = Arc<Mutex<Vec<(&'static str, u64)>>>;

fn timer_app(h: &Harness, fires: &FireLog) -> TestApp {
    let fires = Arc::clone(fires);
    let clock = Arc::clone(&h.clock);
    let mut app = TestApp::new(vec![]);
    app.on_event = Some(Box::new(move |_ctx, _sender, event_type, payload| {
        assert_eq!(event_type, TIMER);
        let fired = payload
            .and_then(|p| p.downcast_ref::<TimerFired>())
            .expect("timer event payload");
        let tag = fired
            .cookie
            .downcast_ref::<&'static str>()
            .expect("cookie tag");
        fires.lock().unwrap().push((tag, clock.now().as_u64()));
    }));
    app
}

#[test]
fn timers_fire_in_expiration_order_through_the_loop() {
    let mut h = Harness::new();
    let fires: FireLog = Arc::new(Mutex::new(Vec::new()));

    let mut app = timer_app(&h, &fires);
    app.on_start = Some(Box::new(|ctx| {
        ctx.set_timer(Nanoseconds(50), Nanoseconds::ZERO, Arc::new("a"))
            .unwrap();
        ctx.set_timer(Nanoseconds(20), Nanoseconds::ZERO, Arc::new("b"))
            .unwrap();
        ctx.set_timer(Nanoseconds(30), Nanoseconds(10), Arc::new("c"))
            .unwrap();
    }));
    h.event_loop.start_nanoapp(app.into_nanoapp(0xA)).unwrap();

    // The hardware one-shot tracks the earliest expiration.
    assert_eq!(*h.timer.armed.lock().unwrap(), Some(Nanoseconds(20)));

    for step in [20u64, 10, 10, 10] {
        h.clock.advance(step);
        h.fire_timers();
        h.settle();
    }

    // The one-shot set first wins the t=50 tie against the reinserted
    // periodic timer.
    assert_eq!(
        *fires.lock().unwrap(),
        vec![("b", 20), ("c", 30), ("c", 40), ("a", 50), ("c", 50)]
    );
}

#[test]
fn cancelled_timer_never_fires() {
    let mut h = Harness::new();
    let fires: FireLog = Arc::new(Mutex::new(Vec::new()));

    let timer_id = Arc::new(Mutex::new(None));
    let timer_id_clone = Arc::clone(&timer_id);
    let mut app = timer_app(&h, &fires);
    app.on_start = Some(Box::new(move |ctx| {
        let id = ctx
            .set_timer(Nanoseconds(10), Nanoseconds::ZERO, Arc::new("doomed"))
            .unwrap();
        *timer_id_clone.lock().unwrap() = Some(id);
        ctx.set_timer(Nanoseconds(20), Nanoseconds::ZERO, Arc::new("kept"))
            .unwrap();
    }));
    const CANCEL: EventType = EventType(0x8030);
    let timer_id_for_cancel = Arc::clone(&timer_id);
    let mut record_fire = app.on_event.take().unwrap();
    app.on_event = Some(Box::new(move |ctx, sender, event_type, payload| {
        if event_type == CANCEL {
            let id = timer_id_for_cancel.lock().unwrap().unwrap();
            assert!(ctx.cancel_timer(id));
        } else {
            record_fire(ctx, sender, event_type, payload);
        }
    }));
    app.subscriptions.push(CANCEL);

    let id = h.event_loop.start_nanoapp(app.into_nanoapp(0xA)).unwrap();
    h.ctx
        .post_system_event(CANCEL, None, None, InstanceId::SYSTEM, id)
        .unwrap();
    h.settle();

    h.clock.advance(30);
    h.fire_timers();
    h.settle();

    assert_eq!(*fires.lock().unwrap(), vec![("kept", 20)]);
}

#[test]
fn unload_cancels_pending_periodic_timers() {
    let mut h = Harness::new();
    let fires: FireLog = Arc::new(Mutex::new(Vec::new()));

    let mut app = timer_app(&h, &fires);
    app.on_start = Some(Box::new(|ctx| {
        ctx.set_timer(Nanoseconds(10), Nanoseconds(10), Arc::new("tick"))
            .unwrap();
    }));
    let id = h.event_loop.start_nanoapp(app.into_nanoapp(0xA)).unwrap();

    h.clock.advance(10);
    h.fire_timers();
    h.settle();
    assert_eq!(fires.lock().unwrap().len(), 1);

    h.event_loop.unload_nanoapp(id, false).unwrap();
    assert_eq!(h.ctx.timer_pool().lock().unwrap().active_timers(), 0);
    assert_eq!(*h.timer.armed.lock().unwrap(), None);

    // A late expiry tick is harmless.
    h.clock.advance(10);
    h.fire_timers();
    h.settle();
    assert_eq!(fires.lock().unwrap().len(), 1);
}

#[test]
fn timer_for_a_dead_nanoapp_is_dropped_at_distribution() {
    let mut h = Harness::new();
    // A timer owned by the system with no receiving nanoapp: posting
    // succeeds, distribution frees the event silently.
    h.ctx
        .set_timer(Nanoseconds(5), Nanoseconds::ZERO, Arc::new("orphan"))
        .unwrap();
    h.clock.advance(5);
    h.fire_timers();
    h.settle();
    assert_eq!(h.ctx.timer_pool().lock().unwrap().active_timers(), 0);
}
