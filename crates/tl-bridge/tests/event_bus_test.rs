use std::thread;

use tl_bridge::event_bus::EventBus;
use tl_bridge::protocol::{EventKind, LifecycleEvent};
use uuid::Uuid;

#[test]
fn test_new_bus_has_no_subscribers() {
    let bus = EventBus::new();
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn test_publish_without_subscribers_is_silent() {
    let bus = EventBus::new();
    bus.emit(Uuid::new_v4(), EventKind::TaskCreated, "nobody listening");
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn test_publish_delivers_to_multiple_subscribers() {
    let bus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();
    let id = Uuid::new_v4();

    bus.emit(id, EventKind::TaskClaimed, "claimed");

    for rx in [rx1, rx2] {
        let event = rx.try_recv().expect("should receive event");
        assert_eq!(event.task_id, id);
        assert_eq!(event.kind, EventKind::TaskClaimed);
    }
}

#[test]
fn test_subscriber_only_sees_later_events() {
    let bus = EventBus::new();
    bus.emit(Uuid::new_v4(), EventKind::TaskCreated, "before");
    let rx = bus.subscribe();
    bus.emit(Uuid::new_v4(), EventKind::TaskDone, "after");

    let event = rx.try_recv().expect("should receive event");
    assert_eq!(event.kind, EventKind::TaskDone);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_dropped_receiver_is_pruned() {
    let bus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 2);

    drop(rx1);
    // Publish triggers pruning of disconnected senders.
    bus.publish(LifecycleEvent::new(
        Uuid::new_v4(),
        EventKind::TaskBlocked {
            reason: "boom".into(),
        },
        "blocked",
    ));
    assert_eq!(bus.subscriber_count(), 1);
    assert!(rx2.try_recv().is_ok());
}

#[test]
fn test_events_preserve_publish_order() {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let id = Uuid::new_v4();
    for step in ["plan", "implement", "verify"] {
        bus.emit(id, EventKind::StepStarted { step: step.into() }, step);
    }
    let steps: Vec<String> = rx
        .drain()
        .map(|e| match e.kind {
            EventKind::StepStarted { step } => step,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(steps, vec!["plan", "implement", "verify"]);
}

#[test]
fn test_clones_share_subscribers_across_threads() {
    let bus = EventBus::new();
    let rx = bus.subscribe();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let bus = bus.clone();
            thread::spawn(move || bus.emit(Uuid::new_v4(), EventKind::TaskDone, "done"))
        })
        .collect();
    for h in handles {
        h.join().expect("publisher thread");
    }
    assert_eq!(rx.drain().count(), 4);
}
