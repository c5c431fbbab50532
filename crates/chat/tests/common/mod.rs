//! Shared fixtures: mock connections, seeded stores, simulated processes.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use wayfarer_chat::{ChatEventRelay, ChatService};
use wayfarer_common::{
    BusSettings, CoreError, Destination, MemberProfile, MemberRole, MembershipStatus, Result,
    Trip, TripId, TripMembership, TripStatus, UserId,
};
use wayfarer_events::{BusMetrics, EventBus, MemoryBroker};
use wayfarer_realtime::{ClientConnection, ConnectionHub};
use wayfarer_storage::{MemoryChatStore, MemoryTripStore};

pub struct MockConnection {
    tx: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
}

impl MockConnection {
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }
}

#[async_trait]
impl ClientConnection for MockConnection {
    async fn send_text(&self, text: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::transport("connection closed"));
        }
        let _ = self.tx.send(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Next frame as JSON, failing the test after one second.
pub async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
    let text = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("connection channel closed");
    serde_json::from_str(&text).expect("frame is not valid JSON")
}

pub fn assert_no_frame(rx: &mut mpsc::UnboundedReceiver<String>) {
    if let Ok(frame) = rx.try_recv() {
        panic!("unexpected frame: {}", frame);
    }
}

/// One simulated backend process sharing the broker and stores with its
/// peers.
pub struct TestProcess {
    pub bus: Arc<EventBus>,
    pub hub: Arc<ConnectionHub>,
    pub relay: Arc<ChatEventRelay>,
    pub service: Arc<ChatService>,
}

pub fn process(
    broker: Arc<MemoryBroker>,
    chat_store: Arc<MemoryChatStore>,
    trip_store: Arc<MemoryTripStore>,
) -> TestProcess {
    let bus = Arc::new(EventBus::new(
        broker,
        BusSettings::default(),
        Arc::new(BusMetrics::new()),
    ));
    let hub = Arc::new(ConnectionHub::new());
    let relay = Arc::new(ChatEventRelay::new(bus.clone(), hub.clone()));
    let service = Arc::new(ChatService::new(
        chat_store,
        trip_store,
        bus.clone(),
        hub.clone(),
    ));
    TestProcess {
        bus,
        hub,
        relay,
        service,
    }
}

pub const TRIP: &str = "trip-1";

/// Trip with an owner, an admin, and two plain members, all profiled.
pub async fn seed_trip(trip_store: &MemoryTripStore) {
    let trip_id = TripId::from(TRIP);
    trip_store
        .insert_trip(Trip {
            id: trip_id.clone(),
            name: "Alps 2026".to_string(),
            owner_id: UserId::from("owner"),
            destination: Some(Destination {
                address: "Zermatt".to_string(),
                coordinates: None,
            }),
            status: TripStatus::Active,
            created_at: chrono::Utc::now(),
        })
        .await;

    for (user, role) in [
        ("owner", MemberRole::Owner),
        ("admin", MemberRole::Admin),
        ("u1", MemberRole::Member),
        ("u2", MemberRole::Member),
    ] {
        trip_store
            .upsert_membership(TripMembership {
                trip_id: trip_id.clone(),
                user_id: UserId::from(user),
                role,
                status: MembershipStatus::Active,
                joined_at: chrono::Utc::now(),
            })
            .await;
        trip_store
            .insert_profile(MemberProfile {
                id: UserId::from(user),
                name: user.to_uppercase(),
                avatar_url: None,
            })
            .await;
    }
}
