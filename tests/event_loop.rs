//! End-to-end event loop behaviour: distribution, delivery order,
//! lifecycle, and shutdown.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use contexthub::core::{EventType, InstanceId};
use contexthub::{AppId, LifecycleError};

use common::{Delivered, Harness, TestApp};

const USER_EVENT: EventType = EventType(0x8064);

fn counting_free(counter: &Arc<AtomicU32>) -> contexthub::FreeCallback {
    let counter = Arc::clone(counter);
    Box::new(move |_event_type, _payload| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn broadcast_reaches_subscriber_and_frees_exactly_once() {
    let mut h = Harness::new();
    let app = TestApp::new(vec![USER_EVENT]);
    let log = Arc::clone(&app.log);

    let instance = h
        .event_loop
        .start_nanoapp(app.into_nanoapp(0xA))
        .unwrap();
    assert_eq!(instance, InstanceId(1));

    let frees = Arc::new(AtomicU32::new(0));
    h.ctx
        .post_system_event(
            USER_EVENT,
            Some(Box::new(7u32)),
            Some(counting_free(&frees)),
            InstanceId::SYSTEM,
            InstanceId::BROADCAST,
        )
        .unwrap();
    h.settle();

    assert_eq!(
        *log.lock().unwrap(),
        vec![Delivered {
            sender: InstanceId::SYSTEM,
            event_type: USER_EVENT,
            payload: Some(7),
        }]
    );
    assert_eq!(frees.load(Ordering::SeqCst), 1);
}

#[test]
fn directed_event_skips_other_nanoapps() {
    let mut h = Harness::new();
    let a = TestApp::new(vec![USER_EVENT]);
    let b = TestApp::new(vec![USER_EVENT]);
    let a_log = Arc::clone(&a.log);
    let b_log = Arc::clone(&b.log);

    let a_id = h.event_loop.start_nanoapp(a.into_nanoapp(0xA)).unwrap();
    let _b_id = h.event_loop.start_nanoapp(b.into_nanoapp(0xB)).unwrap();

    h.ctx
        .post_system_event(USER_EVENT, None, None, InstanceId::SYSTEM, a_id)
        .unwrap();
    h.settle();

    assert_eq!(a_log.lock().unwrap().len(), 1);
    assert!(b_log.lock().unwrap().is_empty());
}

#[test]
fn broadcast_with_no_subscribers_frees_synchronously() {
    let mut h = Harness::new();
    let app = TestApp::new(vec![]);
    let log = Arc::clone(&app.log);
    h.event_loop.start_nanoapp(app.into_nanoapp(0xA)).unwrap();

    let frees = Arc::new(AtomicU32::new(0));
    h.ctx
        .post_system_event(
            USER_EVENT,
            Some(Box::new(1u32)),
            Some(counting_free(&frees)),
            InstanceId::SYSTEM,
            InstanceId::BROADCAST,
        )
        .unwrap();
    h.settle();

    assert_eq!(frees.load(Ordering::SeqCst), 1);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn posting_to_a_stopped_loop_fails_without_running_callbacks() {
    let h = Harness::new();
    h.ctx.stop();

    let frees = Arc::new(AtomicU32::new(0));
    let err = h.ctx.post_system_event(
        USER_EVENT,
        Some(Box::new(1u32)),
        Some(counting_free(&frees)),
        InstanceId::SYSTEM,
        InstanceId::BROADCAST,
    );
    assert!(err.is_err());
    // No event was created, so the free callback must not have run; the
    // payload itself is released by ownership.
    assert_eq!(frees.load(Ordering::SeqCst), 0);
}

#[test]
fn events_from_one_sender_arrive_in_post_order() {
    let mut h = Harness::new();
    let app = TestApp::new(vec![]);
    let log = Arc::clone(&app.log);
    let target = h.event_loop.start_nanoapp(app.into_nanoapp(0xA)).unwrap();

    for value in 0..5u32 {
        h.ctx
            .post_system_event(
                USER_EVENT,
                Some(Box::new(value)),
                None,
                InstanceId::SYSTEM,
                target,
            )
            .unwrap();
    }
    h.settle();

    let values: Vec<_> = log.lock().unwrap().iter().map(|d| d.payload).collect();
    assert_eq!(values, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
}

#[test]
fn delivery_interleaves_one_event_per_nanoapp_per_pass() {
    let mut h = Harness::new();
    let a = TestApp::new(vec![USER_EVENT]);
    let b = TestApp::new(vec![USER_EVENT]);
    let a_log = Arc::clone(&a.log);
    let b_log = Arc::clone(&b.log);
    h.event_loop.start_nanoapp(a.into_nanoapp(0xA)).unwrap();
    h.event_loop.start_nanoapp(b.into_nanoapp(0xB)).unwrap();

    for value in [1u32, 2] {
        h.ctx
            .post_system_event(
                USER_EVENT,
                Some(Box::new(value)),
                None,
                InstanceId::SYSTEM,
                InstanceId::BROADCAST,
            )
            .unwrap();
    }
    h.settle();

    for log in [a_log, b_log] {
        let values: Vec<_> = log.lock().unwrap().iter().map(|d| d.payload).collect();
        assert_eq!(values, vec![Some(1), Some(2)]);
    }
}

#[test]
fn reentrant_posts_attribute_the_sending_nanoapp() {
    let mut h = Harness::new();
    const PING: EventType = EventType(0x8001);
    const PONG: EventType = EventType(0x8002);

    let mut a = TestApp::new(vec![PING]);
    a.on_event = Some(Box::new(|ctx, _sender, event_type, _payload| {
        if event_type == PING {
            ctx.post_event(PONG, None, None, InstanceId::BROADCAST).unwrap();
        }
    }));
    let b = TestApp::new(vec![PONG]);
    let b_log = Arc::clone(&b.log);

    let a_id = h.event_loop.start_nanoapp(a.into_nanoapp(0xA)).unwrap();
    h.event_loop.start_nanoapp(b.into_nanoapp(0xB)).unwrap();

    h.ctx
        .post_system_event(PING, None, None, InstanceId::SYSTEM, InstanceId::BROADCAST)
        .unwrap();
    h.settle();

    assert_eq!(
        *b_log.lock().unwrap(),
        vec![Delivered {
            sender: a_id,
            event_type: PONG,
            payload: None,
        }]
    );
}

#[test]
fn duplicate_app_id_is_rejected() {
    let mut h = Harness::new();
    h.event_loop
        .start_nanoapp(TestApp::new(vec![]).into_nanoapp(0xA))
        .unwrap();
    let err = h
        .event_loop
        .start_nanoapp(TestApp::new(vec![]).into_nanoapp(0xA));
    assert!(matches!(err, Err(LifecycleError::AlreadyExists(AppId(0xA)))));
    assert_eq!(h.event_loop.nanoapp_count(), 1);
}

#[test]
fn failed_start_flushes_posts_and_destroys_without_end() {
    let mut h = Harness::new();
    let frees = Arc::new(AtomicU32::new(0));
    let frees_clone = Arc::clone(&frees);

    let mut app = TestApp::new(vec![]);
    app.start_ok = false;
    app.on_start = Some(Box::new(move |ctx| {
        let counter = Arc::clone(&frees_clone);
        ctx.post_event(
            USER_EVENT,
            None,
            Some(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            InstanceId::BROADCAST,
        )
        .unwrap();
    }));
    let ended = Arc::clone(&app.ended);

    let err = h.event_loop.start_nanoapp(app.into_nanoapp(0xBAD));
    assert!(matches!(err, Err(LifecycleError::StartFailed(_))));
    assert_eq!(h.event_loop.nanoapp_count(), 0);
    // The event posted during the failed start was flushed and freed.
    assert_eq!(frees.load(Ordering::SeqCst), 1);
    // `end` never runs for an app that failed to start.
    assert!(!ended.load(Ordering::SeqCst));
    assert!(h.ctx.find_instance_id_by_app_id(AppId(0xBAD)).is_none());
}

#[test]
fn unload_flushes_self_events_and_host_messages_then_destroys() {
    let mut h = Harness::new();
    const GO: EventType = EventType(0x8010);
    *h.link.down.lock().unwrap() = true;

    let host_frees = Arc::new(AtomicU32::new(0));
    let host_frees_clone = Arc::clone(&host_frees);
    let mut z = TestApp::new(vec![GO]);
    z.on_event = Some(Box::new(move |ctx, _sender, event_type, _payload| {
        if event_type != GO {
            return;
        }
        let me = ctx.find_instance_id_by_app_id(AppId(0x5A)).unwrap();
        for value in 0..3u32 {
            ctx.post_event(USER_EVENT, Some(Box::new(value)), None, me)
                .unwrap();
        }
        for _ in 0..2 {
            let counter = Arc::clone(&host_frees_clone);
            ctx.send_host_message(
                1,
                contexthub::host::HOST_ENDPOINT_UNSPECIFIED,
                vec![1, 2, 3],
                Some(Box::new(move |_payload| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        }
    }));
    let log = Arc::clone(&z.log);
    let ended = Arc::clone(&z.ended);

    let z_id = h.event_loop.start_nanoapp(z.into_nanoapp(0x5A)).unwrap();
    h.ctx
        .post_system_event(GO, None, None, InstanceId::SYSTEM, z_id)
        .unwrap();
    // Deliver GO so the self-events and host messages are in flight, then
    // unload immediately with them pending.
    h.event_loop.run_once();
    h.event_loop.unload_nanoapp(z_id, false).unwrap();

    // All three self-addressed events were delivered before teardown.
    let delivered: Vec<_> = log.lock().unwrap().iter().map(|d| d.payload).collect();
    assert_eq!(delivered, vec![None, Some(0), Some(1), Some(2)]);
    assert_eq!(host_frees.load(Ordering::SeqCst), 2);
    assert!(ended.load(Ordering::SeqCst));
    assert_eq!(h.event_loop.nanoapp_count(), 0);

    // Posting to the dead instance id succeeds but the event is dropped
    // (and freed) at distribution.
    let frees = Arc::new(AtomicU32::new(0));
    h.ctx
        .post_system_event(
            USER_EVENT,
            None,
            Some(counting_free(&frees)),
            InstanceId::SYSTEM,
            z_id,
        )
        .unwrap();
    h.settle();
    assert_eq!(frees.load(Ordering::SeqCst), 1);
}

#[test]
fn system_nanoapps_cannot_be_unloaded_without_override() {
    let mut h = Harness::new();
    let app = TestApp::new(vec![]);
    let ended = Arc::clone(&app.ended);
    let id = h
        .event_loop
        .start_nanoapp(app.into_system_nanoapp(0x51))
        .unwrap();

    let err = h.event_loop.unload_nanoapp(id, false);
    assert!(matches!(err, Err(LifecycleError::SystemNanoapp(_))));
    assert_eq!(h.event_loop.nanoapp_count(), 1);

    h.event_loop.unload_nanoapp(id, true).unwrap();
    assert!(ended.load(Ordering::SeqCst));
    assert_eq!(h.event_loop.nanoapp_count(), 0);
}

#[test]
fn unloading_an_unknown_instance_errors() {
    let mut h = Harness::new();
    let err = h.event_loop.unload_nanoapp(InstanceId(42), true);
    assert!(matches!(err, Err(LifecycleError::UnknownInstance(_))));
}

#[test]
fn instance_ids_are_not_reused() {
    let mut h = Harness::new();
    let first = h
        .event_loop
        .start_nanoapp(TestApp::new(vec![]).into_nanoapp(0xA))
        .unwrap();
    h.event_loop.unload_nanoapp(first, false).unwrap();
    let second = h
        .event_loop
        .start_nanoapp(TestApp::new(vec![]).into_nanoapp(0xA))
        .unwrap();
    assert_ne!(first, second);
}

#[test]
fn stop_unblocks_a_running_loop_and_shuts_down() {
    let mut h = Harness::new();
    let app = TestApp::new(vec![USER_EVENT]);
    let ended = Arc::clone(&app.ended);
    let log = Arc::clone(&app.log);
    let ctx = h.ctx.clone();
    let handle = h.ctx.loop_handle();

    let loop_thread = std::thread::spawn(move || {
        h.event_loop.run();
        h.event_loop.nanoapp_count()
    });

    // Lifecycle requests round-trip through the control channel while the
    // loop blocks on its queue.
    handle
        .start_nanoapp(TestApp::new(vec![]).into_nanoapp(0xB))
        .unwrap();
    let a_id = handle.start_nanoapp(app.into_nanoapp(0xA)).unwrap();
    ctx.post_system_event(USER_EVENT, None, None, InstanceId::SYSTEM, a_id)
        .unwrap();

    // Give the loop a moment to deliver, then stop it.
    for _ in 0..200 {
        if !log.lock().unwrap().is_empty() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    ctx.stop();

    let remaining = loop_thread.join().expect("loop thread panicked");
    assert_eq!(remaining, 0);
    assert!(ended.load(Ordering::SeqCst));
    assert!(ctx.post_system_event(USER_EVENT, None, None, InstanceId::SYSTEM, a_id).is_err());
}

#[test]
fn subscriptions_can_change_at_runtime() {
    let mut h = Harness::new();
    const SUB: EventType = EventType(0x8020);
    const UNSUB: EventType = EventType(0x8021);

    let mut app = TestApp::new(vec![USER_EVENT, SUB, UNSUB]);
    app.on_event = Some(Box::new(|ctx, _sender, event_type, _payload| {
        if event_type == UNSUB {
            ctx.unregister_event_type(USER_EVENT);
        }
    }));
    let log = Arc::clone(&app.log);
    h.event_loop.start_nanoapp(app.into_nanoapp(0xA)).unwrap();

    let broadcast = |h: &Harness, event_type| {
        h.ctx
            .post_system_event(event_type, None, None, InstanceId::SYSTEM, InstanceId::BROADCAST)
            .unwrap();
    };

    broadcast(&h, USER_EVENT);
    h.settle();
    broadcast(&h, UNSUB);
    h.settle();
    broadcast(&h, USER_EVENT);
    h.settle();

    let types: Vec<_> = log.lock().unwrap().iter().map(|d| d.event_type).collect();
    // The second USER_EVENT broadcast arrived after unsubscription.
    assert_eq!(types, vec![USER_EVENT, UNSUB]);
}

#[test]
fn pool_slots_recycle_across_many_events() {
    let mut h = Harness::new();
    let app = TestApp::new(vec![USER_EVENT]);
    let log = Arc::clone(&app.log);
    h.event_loop.start_nanoapp(app.into_nanoapp(0xA)).unwrap();

    // Far more events than the pool holds, drained in batches.
    for _round in 0..8 {
        for value in 0..50u32 {
            h.ctx
                .post_system_event(
                    USER_EVENT,
                    Some(Box::new(value)),
                    None,
                    InstanceId::SYSTEM,
                    InstanceId::BROADCAST,
                )
                .unwrap();
        }
        h.settle();
    }
    assert_eq!(log.lock().unwrap().len(), 400);
}

#[test]
fn mutex_protected_lookup_works_from_other_threads() {
    let mut h = Harness::new();
    let id = h
        .event_loop
        .start_nanoapp(TestApp::new(vec![]).into_nanoapp(0xCAFE))
        .unwrap();

    let ctx = h.ctx.clone();
    let found = std::thread::spawn(move || ctx.find_instance_id_by_app_id(AppId(0xCAFE)))
        .join()
        .unwrap();
    assert_eq!(found, Some(id));
}
