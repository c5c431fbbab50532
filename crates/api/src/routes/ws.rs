//! Websocket ingress: one connection per (trip, user).
//!
//! The principal id arrives pre-verified from the auth gateway in the
//! `x-user-id` header (or `user_id` query param for browser clients that
//! cannot set headers on upgrade). Membership is checked before the
//! upgrade completes.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use wayfarer_common::{Destination, TripId, UserId};
use wayfarer_realtime::{forward_events, forwarded_kinds, SharedConnection};

use crate::connection::WebSocketConnection;
use crate::routes::error_response;
use crate::state::AppState;

fn principal_id(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<UserId> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| params.get("user_id").cloned())
        .filter(|id| !id.is_empty())
        .map(UserId::from)
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(trip_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let trip_id = TripId::from(trip_id);
    let Some(user_id) = principal_id(&headers, &params) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let role = match state.trips.get_user_role(&trip_id, &user_id).await {
        Ok(role) => role,
        Err(e) => return error_response(&e).into_response(),
    };
    if !role.is_member() {
        return StatusCode::FORBIDDEN.into_response();
    }

    // The destination (when set) drives the weather loop for this trip.
    let destination = match state.trips.get_trip(&trip_id).await {
        Ok(Some(trip)) => trip.destination,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return error_response(&e).into_response(),
    };

    info!(trip_id = %trip_id, user_id = %user_id, "websocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, state, trip_id, user_id, destination))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    trip_id: TripId,
    user_id: UserId,
    destination: Option<Destination>,
) {
    let (sink, mut stream) = socket.split();
    let conn: SharedConnection = Arc::new(WebSocketConnection::new(sink));

    state.hub.register(&trip_id, &user_id, conn).await;

    // Trip-level presence: the relay and weather loop run while any local
    // connection for the trip exists.
    if let Err(e) = state.relay.attach(&trip_id).await {
        warn!(trip_id = %trip_id, error = %e, "chat relay attach failed");
    }
    if let Some(destination) = destination.clone() {
        state.weather.increment_subscribers(&trip_id, destination);
    }

    // Per-user fan-in from the bus.
    match state
        .bus
        .subscribe(&trip_id, &user_id, forwarded_kinds())
        .await
    {
        Ok(subscription) => {
            tokio::spawn(forward_events(
                subscription,
                state.hub.clone(),
                trip_id.clone(),
                user_id.clone(),
            ));
        }
        Err(e) => {
            // Chat still works through the relay; the connection just
            // misses individual event frames.
            warn!(trip_id = %trip_id, user_id = %user_id, error = %e, "bus subscribe failed");
        }
    }

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                state.ingress.dispatch(&trip_id, &user_id, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(trip_id = %trip_id, user_id = %user_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    // Teardown mirrors setup.
    state.bus.unsubscribe(&trip_id, &user_id).await;
    if destination.is_some() {
        state.weather.decrement_subscribers(&trip_id);
    }
    state.relay.detach(&trip_id).await;
    state.hub.unregister(&trip_id, &user_id).await;
    info!(trip_id = %trip_id, user_id = %user_id, "websocket closed");
}
