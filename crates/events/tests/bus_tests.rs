//! Event bus behavior over the in-memory broker: fan-out, ordering,
//! backpressure, and lifecycle.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use wayfarer_common::{BusSettings, Event, EventKind, TripId, UserId};
use wayfarer_events::{BusMetrics, EventBus, FailingBroker, MemoryBroker};

fn bus_with_buffer(buffer_size: usize) -> EventBus {
    let settings = BusSettings {
        buffer_size,
        ..BusSettings::default()
    };
    EventBus::new(
        Arc::new(MemoryBroker::new()),
        settings,
        Arc::new(BusMetrics::new()),
    )
}

fn event(trip: &str, user: &str, kind: EventKind, index: usize) -> Event {
    Event::new(
        kind,
        TripId::from(trip),
        UserId::from(user),
        serde_json::json!({ "index": index }),
    )
}

async fn recv_one(sub: &mut wayfarer_events::EventSubscription) -> Event {
    timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("sequence closed unexpectedly")
}

#[tokio::test]
async fn fan_out_delivers_to_every_admitting_subscriber() {
    let bus = bus_with_buffer(16);
    let trip = TripId::from("t1");

    let mut sub_a = bus
        .subscribe(&trip, &UserId::from("a"), vec![EventKind::LocationUpdated])
        .await
        .unwrap();
    let mut sub_b = bus
        .subscribe(&trip, &UserId::from("b"), vec![])
        .await
        .unwrap();
    let mut sub_other_trip = bus
        .subscribe(&TripId::from("t2"), &UserId::from("a"), vec![])
        .await
        .unwrap();

    bus.publish(event("t1", "a", EventKind::LocationUpdated, 0))
        .await
        .unwrap();

    let got_a = recv_one(&mut sub_a).await;
    let got_b = recv_one(&mut sub_b).await;
    assert_eq!(got_a.id, got_b.id);
    assert_eq!(got_a.kind, EventKind::LocationUpdated);

    // Exactly once: nothing further queued for either subscriber, and the
    // other trip's channel saw nothing at all.
    assert!(timeout(Duration::from_millis(100), sub_a.recv()).await.is_err());
    assert!(timeout(Duration::from_millis(100), sub_b.recv()).await.is_err());
    assert!(timeout(Duration::from_millis(100), sub_other_trip.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn type_filters_discard_without_buffering() {
    let bus = bus_with_buffer(2);
    let trip = TripId::from("t1");
    let mut sub = bus
        .subscribe(&trip, &UserId::from("u"), vec![EventKind::WeatherUpdated])
        .await
        .unwrap();

    // Filtered-out events must not consume the two buffer slots.
    for i in 0..10 {
        bus.publish(event("t1", "u", EventKind::LocationUpdated, i))
            .await
            .unwrap();
    }
    bus.publish(event("t1", "u", EventKind::WeatherUpdated, 99))
        .await
        .unwrap();

    let got = recv_one(&mut sub).await;
    assert_eq!(got.kind, EventKind::WeatherUpdated);
    assert_eq!(bus.metrics().dropped_events(), 0);
}

#[tokio::test]
async fn delivery_order_matches_publish_order() {
    let bus = bus_with_buffer(64);
    let trip = TripId::from("t1");
    let mut sub = bus.subscribe(&trip, &UserId::from("u"), vec![]).await.unwrap();

    for i in 0..20 {
        bus.publish(event("t1", "u", EventKind::ChatReadUpdated, i))
            .await
            .unwrap();
    }

    for expected in 0..20 {
        let got = recv_one(&mut sub).await;
        assert_eq!(got.payload["index"], expected);
    }
}

#[tokio::test]
async fn resubscribe_replaces_previous_sequence() {
    let bus = bus_with_buffer(16);
    let trip = TripId::from("t1");
    let user = UserId::from("u");

    let mut first = bus.subscribe(&trip, &user, vec![]).await.unwrap();
    let mut second = bus.subscribe(&trip, &user, vec![]).await.unwrap();

    // The first sequence is closed by the replacement.
    assert!(
        timeout(Duration::from_secs(1), first.recv())
            .await
            .expect("first sequence should close promptly")
            .is_none()
    );

    bus.publish(event("t1", "u", EventKind::TripUpdated, 1))
        .await
        .unwrap();
    assert_eq!(recv_one(&mut second).await.payload["index"], 1);
    assert_eq!(bus.subscription_count().await, 1);
}

#[tokio::test]
async fn slow_consumer_never_stalls_publish() {
    let bus = bus_with_buffer(2);
    let trip = TripId::from("t1");
    let mut sub = bus.subscribe(&trip, &UserId::from("u"), vec![]).await.unwrap();

    let started = std::time::Instant::now();
    for i in 0..10 {
        bus.publish(event("t1", "u", EventKind::LocationUpdated, i))
            .await
            .unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    // The consumer never reads: buffer holds 2, the rest are dropped.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while bus.metrics().dropped_events() < 8 {
        assert!(
            std::time::Instant::now() < deadline,
            "expected >= 8 dropped events, saw {}",
            bus.metrics().dropped_events()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The buffered head of the stream is still intact and ordered.
    assert_eq!(recv_one(&mut sub).await.payload["index"], 0);
    assert_eq!(recv_one(&mut sub).await.payload["index"], 1);
}

#[tokio::test]
async fn poison_messages_are_counted_and_skipped() {
    let broker = Arc::new(MemoryBroker::new());
    let metrics = Arc::new(BusMetrics::new());
    let bus = EventBus::new(broker.clone(), BusSettings::default(), metrics.clone());
    let trip = TripId::from("t1");
    let mut sub = bus.subscribe(&trip, &UserId::from("u"), vec![]).await.unwrap();

    use wayfarer_events::Broker;
    broker
        .publish("trip-events:t1", b"not json at all".to_vec())
        .await
        .unwrap();
    bus.publish(event("t1", "u", EventKind::TripUpdated, 7))
        .await
        .unwrap();

    let got = recv_one(&mut sub).await;
    assert_eq!(got.payload["index"], 7);
    assert_eq!(metrics.snapshot().decode_errors, 1);
}

#[tokio::test]
async fn invalid_event_fails_whole_batch() {
    let bus = bus_with_buffer(16);
    let trip = TripId::from("t1");
    let mut sub = bus.subscribe(&trip, &UserId::from("u"), vec![]).await.unwrap();

    let bad = Event::new(
        EventKind::Other(String::new()),
        trip.clone(),
        UserId::from("u"),
        serde_json::Value::Null,
    );
    let batch = vec![event("t1", "u", EventKind::TripUpdated, 0), bad];

    let err = bus.publish_batch(&trip, batch).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert!(timeout(Duration::from_millis(100), sub.recv()).await.is_err());
}

#[tokio::test]
async fn batch_rejects_foreign_trip_events() {
    let bus = bus_with_buffer(16);
    let trip = TripId::from("t1");
    let batch = vec![event("t2", "u", EventKind::TripUpdated, 0)];
    let err = bus.publish_batch(&trip, batch).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn batch_publishes_in_order() {
    let bus = bus_with_buffer(16);
    let trip = TripId::from("t1");
    let mut sub = bus.subscribe(&trip, &UserId::from("u"), vec![]).await.unwrap();

    let batch = (0..5)
        .map(|i| event("t1", "u", EventKind::MemberAdded, i))
        .collect();
    bus.publish_batch(&trip, batch).await.unwrap();

    for expected in 0..5 {
        assert_eq!(recv_one(&mut sub).await.payload["index"], expected);
    }
}

#[tokio::test]
async fn subscribe_failure_creates_no_sequence() {
    let bus = EventBus::new(
        Arc::new(FailingBroker),
        BusSettings::default(),
        Arc::new(BusMetrics::new()),
    );
    let err = bus
        .subscribe(&TripId::from("t1"), &UserId::from("u"), vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "transport");
    assert_eq!(bus.subscription_count().await, 0);
}

#[tokio::test]
async fn publish_failure_is_reported_and_counted() {
    let metrics = Arc::new(BusMetrics::new());
    let bus = EventBus::new(Arc::new(FailingBroker), BusSettings::default(), metrics.clone());
    let err = bus
        .publish(event("t1", "u", EventKind::TripUpdated, 0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "transport");
    assert_eq!(metrics.snapshot().publish_errors, 1);
}

#[tokio::test]
async fn shutdown_closes_all_sequences_and_is_idempotent() {
    let bus = bus_with_buffer(16);
    let mut sub_a = bus
        .subscribe(&TripId::from("t1"), &UserId::from("a"), vec![])
        .await
        .unwrap();
    let mut sub_b = bus
        .subscribe(&TripId::from("t2"), &UserId::from("b"), vec![])
        .await
        .unwrap();

    bus.shutdown().await;
    bus.shutdown().await;

    assert!(timeout(Duration::from_secs(1), sub_a.recv()).await.unwrap().is_none());
    assert!(timeout(Duration::from_secs(1), sub_b.recv()).await.unwrap().is_none());
    assert_eq!(bus.subscription_count().await, 0);

    let err = bus
        .subscribe(&TripId::from("t3"), &UserId::from("c"), vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "transport");
}

#[tokio::test]
async fn cancel_closes_the_sequence() {
    let bus = bus_with_buffer(16);
    let mut sub = bus
        .subscribe(&TripId::from("t1"), &UserId::from("u"), vec![])
        .await
        .unwrap();
    sub.cancel();
    assert!(timeout(Duration::from_secs(1), sub.recv()).await.unwrap().is_none());
}
