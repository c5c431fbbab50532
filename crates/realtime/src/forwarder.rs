//! Bridges one (trip, user) bus subscription to that user's connection.
//!
//! Chat message sent/edited traffic is intentionally absent here: the chat
//! relay broadcasts those trip-wide. The forwarder carries everything a
//! single client consumes individually.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::frame::WsFrame;
use crate::hub::ConnectionHub;
use wayfarer_common::{Event, EventKind, ReadUpdatedPayload, TripId, UserId};
use wayfarer_events::EventSubscription;

/// Event types a per-connection subscription admits.
pub fn forwarded_kinds() -> Vec<EventKind> {
    vec![
        EventKind::LocationUpdated,
        EventKind::WeatherUpdated,
        EventKind::ChatReadUpdated,
        EventKind::ChatGroupCreated,
        EventKind::MemberAdded,
        EventKind::MemberRemoved,
        EventKind::TripUpdated,
    ]
}

/// Consume the subscription until it closes, writing matching frames to the
/// one connection this task serves. Runs as its own task per connection.
pub async fn forward_events(
    mut subscription: EventSubscription,
    hub: Arc<ConnectionHub>,
    trip_id: TripId,
    user_id: UserId,
) {
    while let Some(event) = subscription.recv().await {
        let Some(frame) = frame_for_event(&event) else {
            continue;
        };
        match frame.to_json() {
            Ok(json) => {
                hub.send_to_user(&trip_id, &user_id, &json).await;
            }
            Err(e) => warn!(trip_id = %trip_id, error = %e, "failed to serialize event frame"),
        }
    }
    debug!(trip_id = %trip_id, user_id = %user_id, "event forwarder stopped");
}

fn frame_for_event(event: &Event) -> Option<WsFrame> {
    match event.kind {
        EventKind::ChatReadUpdated => {
            let payload: ReadUpdatedPayload = event.payload_as().ok()?;
            let mut frame = WsFrame::event_payload(
                event.kind.as_str(),
                event.trip_id.clone(),
                event.payload.clone(),
            );
            frame.message_id = Some(payload.message_id);
            Some(frame)
        }
        EventKind::LocationUpdated
        | EventKind::WeatherUpdated
        | EventKind::ChatGroupCreated
        | EventKind::MemberAdded
        | EventKind::MemberRemoved
        | EventKind::TripUpdated => Some(WsFrame::event_payload(
            event.kind.as_str(),
            event.trip_id.clone(),
            event.payload.clone(),
        )),
        // Chat message traffic is broadcast by the relay; anything else is
        // not client-facing.
        _ => None,
    }
}
