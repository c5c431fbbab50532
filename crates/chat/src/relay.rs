//! Per-process bus consumer that turns chat events into hub broadcasts.
//!
//! One relay subscription exists per trip with at least one local
//! connection, held under a reserved relay user id. Sent messages are
//! broadcast excluding the sender; edits are broadcast to everyone.
//! Deletes and reactions from this same process are skipped because the
//! service already broadcast them directly; only foreign-origin copies are
//! replayed here.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use wayfarer_common::{
    ChatMessagePayload, Event, EventKind, MessageDeletedPayload, ReactionPayload, Result, TripId,
    UserId,
};
use wayfarer_events::{EventBus, EventSubscription};
use wayfarer_realtime::{ConnectionHub, WsFrame};

/// Reserved user id the relay subscribes under; never a real principal.
const RELAY_USER: &str = "__chat-relay";

struct RelayEntry {
    refs: usize,
    task: tokio::task::JoinHandle<()>,
}

pub struct ChatEventRelay {
    bus: Arc<EventBus>,
    hub: Arc<ConnectionHub>,
    trips: Mutex<HashMap<TripId, RelayEntry>>,
}

impl ChatEventRelay {
    pub fn new(bus: Arc<EventBus>, hub: Arc<ConnectionHub>) -> Self {
        Self {
            bus,
            hub,
            trips: Mutex::new(HashMap::new()),
        }
    }

    fn relay_user() -> UserId {
        UserId::from(RELAY_USER)
    }

    /// Reference the relay for a trip, starting its consumer on the first
    /// local connection.
    pub async fn attach(&self, trip_id: &TripId) -> Result<()> {
        let mut trips = self.trips.lock().await;
        if let Some(entry) = trips.get_mut(trip_id) {
            entry.refs += 1;
            return Ok(());
        }

        let subscription = self
            .bus
            .subscribe(
                trip_id,
                &Self::relay_user(),
                vec![
                    EventKind::ChatMessageSent,
                    EventKind::ChatMessageEdited,
                    EventKind::ChatMessageDeleted,
                    EventKind::ChatReactionAdded,
                    EventKind::ChatReactionRemoved,
                ],
            )
            .await?;

        let hub = self.hub.clone();
        let local_source = self.bus.instance_id().to_string();
        let trip = trip_id.clone();
        let task = tokio::spawn(async move {
            run_relay(subscription, hub, local_source, trip).await;
        });

        trips.insert(trip_id.clone(), RelayEntry { refs: 1, task });
        debug!(trip_id = %trip_id, "chat relay attached");
        Ok(())
    }

    /// Drop one reference; the consumer stops when the last local
    /// connection for the trip goes away.
    pub async fn detach(&self, trip_id: &TripId) {
        let stop = {
            let mut trips = self.trips.lock().await;
            match trips.get_mut(trip_id) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs == 0 {
                        trips.remove(trip_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if stop {
            self.bus.unsubscribe(trip_id, &Self::relay_user()).await;
            debug!(trip_id = %trip_id, "chat relay detached");
        }
    }

    /// Stop every relay consumer.
    pub async fn shutdown(&self) {
        let drained: Vec<(TripId, RelayEntry)> = self.trips.lock().await.drain().collect();
        for (trip_id, entry) in drained {
            self.bus.unsubscribe(&trip_id, &Self::relay_user()).await;
            entry.task.abort();
        }
    }
}

async fn run_relay(
    mut subscription: EventSubscription,
    hub: Arc<ConnectionHub>,
    local_source: String,
    trip_id: TripId,
) {
    while let Some(event) = subscription.recv().await {
        let frame = match relay_frame(&event, &local_source) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                warn!(trip_id = %trip_id, kind = %event.kind, error = %e,
                      "skipping chat event with unexpected payload");
                continue;
            }
        };

        let exclude = match event.kind {
            // The sender already received a direct echo from the service.
            EventKind::ChatMessageSent => Some(event.user_id.clone()),
            _ => None,
        };

        match frame.to_json() {
            Ok(json) => {
                hub.broadcast(&trip_id, &json, exclude.as_ref()).await;
            }
            Err(e) => warn!(trip_id = %trip_id, error = %e, "failed to serialize relay frame"),
        }
    }
    debug!(trip_id = %trip_id, "chat relay consumer stopped");
}

fn relay_frame(event: &Event, local_source: &str) -> Result<Option<WsFrame>> {
    match event.kind {
        EventKind::ChatMessageSent => {
            let payload: ChatMessagePayload = event.payload_as()?;
            Ok(Some(WsFrame::chat(&payload.message, payload.sender)))
        }
        EventKind::ChatMessageEdited => {
            let payload: ChatMessagePayload = event.payload_as()?;
            Ok(Some(WsFrame::chat_update(&payload.message, payload.sender)))
        }
        EventKind::ChatMessageDeleted => {
            // The origin process broadcast the delete frame directly.
            if event.metadata.source == local_source {
                return Ok(None);
            }
            let payload: MessageDeletedPayload = event.payload_as()?;
            Ok(Some(WsFrame::chat_delete(
                event.trip_id.clone(),
                payload.message_id,
            )))
        }
        EventKind::ChatReactionAdded | EventKind::ChatReactionRemoved => {
            if event.metadata.source == local_source {
                return Ok(None);
            }
            let payload: ReactionPayload = event.payload_as()?;
            Ok(Some(WsFrame::reaction_update(
                event.trip_id.clone(),
                payload.message_id,
                &payload.reactions,
            )))
        }
        _ => Ok(None),
    }
}
