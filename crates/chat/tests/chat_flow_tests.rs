//! End-to-end chat scenarios over two simulated processes sharing one
//! broker and one set of stores.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use wayfarer_common::{ContentType, EventKind, GroupId, MessageId, TripId, UserId};
use wayfarer_events::MemoryBroker;
use wayfarer_storage::{ChatStore, MemoryChatStore, MemoryTripStore};

struct Fixture {
    chat_store: Arc<MemoryChatStore>,
    trip_store: Arc<MemoryTripStore>,
    broker: Arc<MemoryBroker>,
}

async fn fixture() -> Fixture {
    let trip_store = Arc::new(MemoryTripStore::new());
    seed_trip(&trip_store).await;
    Fixture {
        chat_store: Arc::new(MemoryChatStore::new()),
        trip_store,
        broker: Arc::new(MemoryBroker::new()),
    }
}

fn trip() -> TripId {
    TripId::from(TRIP)
}

#[tokio::test]
async fn chat_echo_reaches_other_process_and_excludes_sender() {
    let f = fixture().await;
    let process_a = process(f.broker.clone(), f.chat_store.clone(), f.trip_store.clone());
    let process_b = process(f.broker.clone(), f.chat_store.clone(), f.trip_store.clone());

    // U1 connected on process A, U2 on process B.
    let (u1_conn, mut u1_rx) = MockConnection::pair();
    process_a.hub.register(&trip(), &UserId::from("u1"), u1_conn).await;
    process_a.relay.attach(&trip()).await.unwrap();
    recv_frame(&mut u1_rx).await; // welcome

    let (u2_conn, mut u2_rx) = MockConnection::pair();
    process_b.hub.register(&trip(), &UserId::from("u2"), u2_conn).await;
    process_b.relay.attach(&trip()).await.unwrap();
    recv_frame(&mut u2_rx).await; // welcome

    process_b
        .service
        .send_message(&trip(), None, &UserId::from("u2"), "hi", ContentType::Text)
        .await
        .unwrap();

    // U1 receives the message across the bus.
    let frame = recv_frame(&mut u1_rx).await;
    assert_eq!(frame["type"], "chat");
    assert_eq!(frame["tripId"], TRIP);
    assert_eq!(frame["content"], "hi");
    assert_eq!(frame["user"]["id"], "u2");

    // U2 receives exactly one frame: the direct sender echo, nothing from
    // the bus.
    let echo = recv_frame(&mut u2_rx).await;
    assert_eq!(echo["type"], "chat");
    assert_eq!(echo["content"], "hi");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_no_frame(&mut u2_rx);
}

#[tokio::test]
async fn edit_requires_sender_and_delete_allows_admin() {
    let f = fixture().await;
    let p = process(f.broker.clone(), f.chat_store.clone(), f.trip_store.clone());

    let message = p
        .service
        .send_message(&trip(), None, &UserId::from("u2"), "draft", ContentType::Text)
        .await
        .unwrap();

    // Edit by someone other than the sender is forbidden and not persisted.
    let err = p
        .service
        .edit_message(&message.id, &UserId::from("u1"), "hijacked")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");
    let stored = f.chat_store.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.content, "draft");
    assert!(!stored.is_edited);

    // Edit by the sender succeeds.
    let edited = p
        .service
        .edit_message(&message.id, &UserId::from("u2"), "final")
        .await
        .unwrap();
    assert!(edited.is_edited);

    // Delete by a plain member who is not the sender is forbidden.
    let err = p
        .service
        .delete_message(&message.id, &UserId::from("u1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    // Delete by an admin succeeds and publishes the event.
    let mut deleted_events = p
        .bus
        .subscribe(
            &trip(),
            &UserId::from("observer"),
            vec![EventKind::ChatMessageDeleted],
        )
        .await
        .unwrap();
    p.service
        .delete_message(&message.id, &UserId::from("admin"))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(1), deleted_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::ChatMessageDeleted);
    assert_eq!(event.payload["messageId"], message.id.as_str());

    let stored = f.chat_store.get_message(&message.id).await.unwrap().unwrap();
    assert!(stored.is_deleted);
    assert!(stored.content.is_empty());
}

#[tokio::test]
async fn duplicate_reaction_is_idempotent_and_set_matches_store() {
    let f = fixture().await;
    let p = process(f.broker.clone(), f.chat_store.clone(), f.trip_store.clone());

    let message = p
        .service
        .send_message(&trip(), None, &UserId::from("u1"), "react to me", ContentType::Text)
        .await
        .unwrap();

    let mut reaction_events = p
        .bus
        .subscribe(
            &trip(),
            &UserId::from("observer"),
            vec![EventKind::ChatReactionAdded],
        )
        .await
        .unwrap();

    let first = p
        .service
        .add_reaction(&message.id, &UserId::from("u2"), "👍")
        .await
        .unwrap();
    let second = p
        .service
        .add_reaction(&message.id, &UserId::from("u2"), "👍")
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);

    // One persisted row; each call published an event whose set matches.
    let persisted = f.chat_store.list_reactions(&message.id).await.unwrap();
    assert_eq!(persisted.len(), 1);
    for _ in 0..2 {
        let event = timeout(Duration::from_secs(1), reaction_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["reactions"].as_array().unwrap().len(), 1);
    }

    // Removing twice is equally idempotent.
    let removed = p
        .service
        .remove_reaction(&message.id, &UserId::from("u2"), "👍")
        .await
        .unwrap();
    assert!(removed.is_empty());
    let removed_again = p
        .service
        .remove_reaction(&message.id, &UserId::from("u2"), "👍")
        .await
        .unwrap();
    assert!(removed_again.is_empty());
}

#[tokio::test]
async fn non_members_are_rejected_everywhere() {
    let f = fixture().await;
    let p = process(f.broker.clone(), f.chat_store.clone(), f.trip_store.clone());
    let stranger = UserId::from("stranger");

    let err = p
        .service
        .send_message(&trip(), None, &stranger, "hello?", ContentType::Text)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    let message = p
        .service
        .send_message(&trip(), None, &UserId::from("u1"), "members only", ContentType::Text)
        .await
        .unwrap();

    let err = p
        .service
        .add_reaction(&message.id, &stranger, "👀")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");
    assert!(f.chat_store.list_reactions(&message.id).await.unwrap().is_empty());

    let err = p
        .service
        .update_last_read(&message.group_id, &stranger, &message.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    let err = p
        .service
        .create_group(&trip(), &stranger, "splinter group")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");
}

#[tokio::test]
async fn read_cursor_never_regresses() {
    let f = fixture().await;
    let p = process(f.broker.clone(), f.chat_store.clone(), f.trip_store.clone());
    let reader = UserId::from("u1");

    let older = p
        .service
        .send_message(&trip(), None, &UserId::from("u2"), "first", ContentType::Text)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = p
        .service
        .send_message(&trip(), None, &UserId::from("u2"), "second", ContentType::Text)
        .await
        .unwrap();

    let group = older.group_id.clone();
    let advanced = p
        .service
        .update_last_read(&group, &reader, &newer.id)
        .await
        .unwrap();
    assert!(advanced.is_some());

    // Regressing to the older message is a silent no-op.
    let regressed = p
        .service
        .update_last_read(&group, &reader, &older.id)
        .await
        .unwrap();
    assert!(regressed.is_none());
    let cursor = f.chat_store.get_read_cursor(&group, &reader).await.unwrap().unwrap();
    assert_eq!(cursor.message_id, newer.id);
}

#[tokio::test]
async fn read_update_rejects_message_from_another_group() {
    let f = fixture().await;
    let p = process(f.broker.clone(), f.chat_store.clone(), f.trip_store.clone());

    let message = p
        .service
        .send_message(&trip(), None, &UserId::from("u1"), "main group", ContentType::Text)
        .await
        .unwrap();

    let err = p
        .service
        .update_last_read(&GroupId::from("some-other-group"), &UserId::from("u1"), &message.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn missing_message_is_not_found() {
    let f = fixture().await;
    let p = process(f.broker.clone(), f.chat_store.clone(), f.trip_store.clone());

    let ghost = MessageId::from("no-such-message");
    assert_eq!(
        p.service
            .edit_message(&ghost, &UserId::from("u1"), "x")
            .await
            .unwrap_err()
            .kind(),
        "not_found"
    );
    assert_eq!(
        p.service
            .delete_message(&ghost, &UserId::from("u1"))
            .await
            .unwrap_err()
            .kind(),
        "not_found"
    );
    assert_eq!(
        p.service
            .add_reaction(&ghost, &UserId::from("u1"), "👍")
            .await
            .unwrap_err()
            .kind(),
        "not_found"
    );
}

#[tokio::test]
async fn local_delete_and_reaction_frames_arrive_exactly_once() {
    let f = fixture().await;
    let p = process(f.broker.clone(), f.chat_store.clone(), f.trip_store.clone());

    // Two locally connected members, relay attached: the relay must skip
    // same-process reaction/delete events the service already broadcast.
    let (u1_conn, mut u1_rx) = MockConnection::pair();
    p.hub.register(&trip(), &UserId::from("u1"), u1_conn).await;
    let (u2_conn, mut u2_rx) = MockConnection::pair();
    p.hub.register(&trip(), &UserId::from("u2"), u2_conn).await;
    p.relay.attach(&trip()).await.unwrap();
    p.relay.attach(&trip()).await.unwrap();
    recv_frame(&mut u1_rx).await;
    recv_frame(&mut u2_rx).await;

    let message = p
        .service
        .send_message(&trip(), None, &UserId::from("u2"), "reactive", ContentType::Text)
        .await
        .unwrap();
    // u2: sender echo; u1: relay broadcast.
    assert_eq!(recv_frame(&mut u2_rx).await["type"], "chat");
    assert_eq!(recv_frame(&mut u1_rx).await["type"], "chat");

    p.service
        .add_reaction(&message.id, &UserId::from("u1"), "🔥")
        .await
        .unwrap();
    assert_eq!(recv_frame(&mut u1_rx).await["type"], "reaction.update");
    assert_eq!(recv_frame(&mut u2_rx).await["type"], "reaction.update");

    p.service
        .delete_message(&message.id, &UserId::from("u2"))
        .await
        .unwrap();
    assert_eq!(recv_frame(&mut u1_rx).await["type"], "chat.delete");
    assert_eq!(recv_frame(&mut u2_rx).await["type"], "chat.delete");

    // Give any buggy duplicate path time to show up.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_no_frame(&mut u1_rx);
    assert_no_frame(&mut u2_rx);
}

#[tokio::test]
async fn group_creation_validates_and_announces() {
    let f = fixture().await;
    let p = process(f.broker.clone(), f.chat_store.clone(), f.trip_store.clone());

    assert_eq!(
        p.service
            .create_group(&trip(), &UserId::from("u1"), "  ")
            .await
            .unwrap_err()
            .kind(),
        "validation"
    );
    assert_eq!(
        p.service
            .create_group(&TripId::from("missing-trip"), &UserId::from("u1"), "hikers")
            .await
            .unwrap_err()
            .kind(),
        "not_found"
    );

    let mut group_events = p
        .bus
        .subscribe(
            &trip(),
            &UserId::from("observer"),
            vec![EventKind::ChatGroupCreated],
        )
        .await
        .unwrap();

    let group = p
        .service
        .create_group(&trip(), &UserId::from("u1"), "hikers")
        .await
        .unwrap();
    assert_eq!(group.name, "hikers");
    assert!(f.chat_store.get_group(&group.id).await.unwrap().is_some());

    let event = timeout(Duration::from_secs(1), group_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.payload["group"]["name"], "hikers");
}

#[tokio::test]
async fn forwarder_delivers_read_receipts_to_connected_user() {
    let f = fixture().await;
    let p = process(f.broker.clone(), f.chat_store.clone(), f.trip_store.clone());

    let (u1_conn, mut u1_rx) = MockConnection::pair();
    p.hub.register(&trip(), &UserId::from("u1"), u1_conn).await;
    recv_frame(&mut u1_rx).await;

    let subscription = p
        .bus
        .subscribe(
            &trip(),
            &UserId::from("u1"),
            wayfarer_realtime::forwarded_kinds(),
        )
        .await
        .unwrap();
    tokio::spawn(wayfarer_realtime::forward_events(
        subscription,
        p.hub.clone(),
        trip(),
        UserId::from("u1"),
    ));

    let message = p
        .service
        .send_message(&trip(), None, &UserId::from("u1"), "read me", ContentType::Text)
        .await
        .unwrap();
    recv_frame(&mut u1_rx).await; // sender echo

    p.service
        .update_last_read(&message.group_id, &UserId::from("u2"), &message.id)
        .await
        .unwrap();

    let frame = recv_frame(&mut u1_rx).await;
    assert_eq!(frame["type"], "chat.read.updated");
    assert_eq!(frame["messageId"], message.id.as_str());
    assert_eq!(frame["payload"]["userId"], "u2");
}
