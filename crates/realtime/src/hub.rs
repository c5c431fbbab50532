//! Registry and broadcaster of live websocket connections.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::frame::WsFrame;
use wayfarer_common::{Result, TripId, UserId};

/// Seam between the hub and the concrete socket type. Production wraps an
/// axum websocket sink; tests use channel-backed mocks.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<()>;
    async fn close(&self);
}

pub type SharedConnection = Arc<dyn ClientConnection>;

/// Maps `tripId → userId → connection` behind one reader-writer lock.
///
/// No network I/O happens while the lock is held: mutations capture the
/// affected connection and write/close outside the lock, broadcasts snapshot
/// the target set first. A connection removed mid-broadcast may still
/// receive the in-flight frame.
#[derive(Default)]
pub struct ConnectionHub {
    connections: RwLock<HashMap<TripId, HashMap<UserId, SharedConnection>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing (and closing) any previous one for
    /// the same pair. A failed welcome frame is logged but does not undo
    /// the registration.
    pub async fn register(&self, trip_id: &TripId, user_id: &UserId, conn: SharedConnection) {
        let previous = {
            let mut connections = self.connections.write().await;
            connections
                .entry(trip_id.clone())
                .or_default()
                .insert(user_id.clone(), conn.clone())
        };

        if let Some(previous) = previous {
            previous.close().await;
        }

        let welcome = WsFrame::info(trip_id.clone(), "connected");
        match welcome.to_json() {
            Ok(json) => {
                if let Err(e) = conn.send_text(&json).await {
                    warn!(trip_id = %trip_id, user_id = %user_id, error = %e, "welcome frame failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize welcome frame"),
        }
        debug!(trip_id = %trip_id, user_id = %user_id, "connection registered");
    }

    /// Remove and close the connection for (trip, user), pruning the trip
    /// bucket when it empties.
    pub async fn unregister(&self, trip_id: &TripId, user_id: &UserId) {
        let removed = {
            let mut connections = self.connections.write().await;
            let removed = connections
                .get_mut(trip_id)
                .and_then(|bucket| bucket.remove(user_id));
            if connections.get(trip_id).is_some_and(|bucket| bucket.is_empty()) {
                connections.remove(trip_id);
            }
            removed
        };

        if let Some(conn) = removed {
            conn.close().await;
            debug!(trip_id = %trip_id, user_id = %user_id, "connection unregistered");
        }
    }

    /// Fan a pre-serialized frame to every connection under the trip,
    /// optionally excluding one user. Returns once all concurrent writes
    /// have completed or failed; per-connection failures are logged and
    /// never abort the others.
    pub async fn broadcast(
        &self,
        trip_id: &TripId,
        payload: &str,
        exclude_user: Option<&UserId>,
    ) -> usize {
        let targets: Vec<(UserId, SharedConnection)> = {
            let connections = self.connections.read().await;
            match connections.get(trip_id) {
                Some(bucket) => bucket
                    .iter()
                    .filter(|(user_id, _)| Some(*user_id) != exclude_user)
                    .map(|(user_id, conn)| (user_id.clone(), conn.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut handles = Vec::with_capacity(targets.len());
        for (user_id, conn) in targets {
            let payload = payload.to_string();
            let trip_id = trip_id.clone();
            handles.push(tokio::spawn(async move {
                match conn.send_text(&payload).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(trip_id = %trip_id, user_id = %user_id, error = %e, "broadcast write failed");
                        false
                    }
                }
            }));
        }

        let mut delivered = 0;
        for handle in handles {
            if matches!(handle.await, Ok(true)) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Write a frame to one specific connection; no-op when absent.
    pub async fn send_to_user(&self, trip_id: &TripId, user_id: &UserId, payload: &str) -> bool {
        let conn = {
            let connections = self.connections.read().await;
            connections
                .get(trip_id)
                .and_then(|bucket| bucket.get(user_id))
                .cloned()
        };

        match conn {
            Some(conn) => match conn.send_text(payload).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(trip_id = %trip_id, user_id = %user_id, error = %e, "direct write failed");
                    false
                }
            },
            None => false,
        }
    }

    pub async fn has_connection(&self, trip_id: &TripId, user_id: &UserId) -> bool {
        let connections = self.connections.read().await;
        connections
            .get(trip_id)
            .is_some_and(|bucket| bucket.contains_key(user_id))
    }

    pub async fn connection_count(&self, trip_id: &TripId) -> usize {
        let connections = self.connections.read().await;
        connections.get(trip_id).map_or(0, |bucket| bucket.len())
    }

    /// Users with a live connection under the trip; the complement of the
    /// push-notification recipient set.
    pub async fn connected_users(&self, trip_id: &TripId) -> Vec<UserId> {
        let connections = self.connections.read().await;
        connections
            .get(trip_id)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default()
    }
}
