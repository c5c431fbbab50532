//! Dispatches authenticated inbound websocket frames to the chat service.
//!
//! All failures are reported back on the same connection as `error` frames;
//! transport-level errors are the owning I/O loop's problem.

use std::sync::Arc;
use tracing::debug;

use wayfarer_common::{ContentType, CoreError, Result, TripId, UserId};
use wayfarer_realtime::{ConnectionHub, WsFrame};

use crate::service::ChatService;

pub struct ChatIngress {
    service: Arc<ChatService>,
    hub: Arc<ConnectionHub>,
}

impl ChatIngress {
    pub fn new(service: Arc<ChatService>, hub: Arc<ConnectionHub>) -> Self {
        Self { service, hub }
    }

    /// Handle one inbound text frame from an authenticated connection.
    /// The trip and user come from the connection context, not the frame.
    pub async fn dispatch(&self, trip_id: &TripId, user_id: &UserId, text: &str) {
        let frame: WsFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.send_error(trip_id, user_id, format!("malformed frame: {}", e))
                    .await;
                return;
            }
        };

        if let Err(e) = self.handle(trip_id, user_id, frame).await {
            self.send_error(trip_id, user_id, e.to_string()).await;
        }
    }

    async fn handle(&self, trip_id: &TripId, user_id: &UserId, frame: WsFrame) -> Result<()> {
        match frame.kind.as_str() {
            "chat" => {
                let content = required(frame.content, "content")?;
                self.service
                    .send_message(trip_id, None, user_id, &content, ContentType::Text)
                    .await?;
            }
            "chat.update" => {
                let message_id = required(frame.message_id, "messageId")?;
                let content = required(frame.content, "content")?;
                self.service
                    .edit_message(&message_id, user_id, &content)
                    .await?;
            }
            "chat.delete" => {
                let message_id = required(frame.message_id, "messageId")?;
                self.service.delete_message(&message_id, user_id).await?;
            }
            "reaction.add" => {
                let message_id = required(frame.message_id, "messageId")?;
                let token = required(frame.reaction, "reaction")?;
                self.service
                    .add_reaction(&message_id, user_id, &token)
                    .await?;
            }
            "reaction.remove" => {
                let message_id = required(frame.message_id, "messageId")?;
                let token = required(frame.reaction, "reaction")?;
                self.service
                    .remove_reaction(&message_id, user_id, &token)
                    .await?;
            }
            "read.update" => {
                let message_id = required(frame.message_id, "messageId")?;
                self.service
                    .update_last_read_from_message(user_id, &message_id)
                    .await?;
            }
            "typing" => {
                // Ephemeral: local broadcast only, nothing persisted.
                let profile = self.service.member_profile(user_id).await;
                let typing = WsFrame::typing(trip_id.clone(), profile);
                if let Ok(json) = typing.to_json() {
                    self.hub.broadcast(trip_id, &json, Some(user_id)).await;
                }
            }
            other => {
                return Err(CoreError::validation(format!(
                    "unrecognized frame type '{}'",
                    other
                )));
            }
        }
        Ok(())
    }

    async fn send_error(&self, trip_id: &TripId, user_id: &UserId, message: String) {
        debug!(trip_id = %trip_id, user_id = %user_id, error = %message, "frame rejected");
        if let Ok(json) = WsFrame::error(trip_id.clone(), message).to_json() {
            self.hub.send_to_user(trip_id, user_id, &json).await;
        }
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| CoreError::validation(format!("missing required field '{}'", field)))
}
