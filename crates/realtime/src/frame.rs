//! Websocket frame envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wayfarer_common::{ChatMessage, MemberProfile, MessageId, Reaction, Result, TripId, UserId};

/// Reaction entry as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionEntry {
    pub user_id: UserId,
    pub token: String,
}

impl From<&Reaction> for ReactionEntry {
    fn from(r: &Reaction) -> Self {
        Self {
            user_id: r.user_id.clone(),
            token: r.token.clone(),
        }
    }
}

/// The frame envelope shared by both directions.
///
/// Inbound `type` values: `chat`, `chat.update`, `chat.delete`,
/// `reaction.add`, `reaction.remove`, `read.update`, `typing`. Outbound adds
/// `info`, `error`, `reaction.update`, and event-derived frames whose
/// `payload` carries the bus payload verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub trip_id: TripId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<String>,
    /// Server→client informational or error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<MemberProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Vec<ReactionEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Escape hatch for event-derived frames (location, weather, members).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl WsFrame {
    fn base(kind: &str, trip_id: TripId) -> Self {
        Self {
            kind: kind.to_string(),
            trip_id,
            message_id: None,
            content: None,
            reaction: None,
            message: None,
            user: None,
            reactions: None,
            timestamp: None,
            payload: None,
        }
    }

    pub fn info(trip_id: TripId, text: impl Into<String>) -> Self {
        let mut frame = Self::base("info", trip_id);
        frame.message = Some(text.into());
        frame.timestamp = Some(Utc::now());
        frame
    }

    pub fn error(trip_id: TripId, text: impl Into<String>) -> Self {
        let mut frame = Self::base("error", trip_id);
        frame.message = Some(text.into());
        frame.timestamp = Some(Utc::now());
        frame
    }

    pub fn chat(message: &ChatMessage, sender: MemberProfile) -> Self {
        let mut frame = Self::base("chat", message.trip_id.clone());
        frame.message_id = Some(message.id.clone());
        frame.content = Some(message.content.clone());
        frame.user = Some(sender);
        frame.timestamp = Some(message.created_at);
        frame
    }

    pub fn chat_update(message: &ChatMessage, sender: MemberProfile) -> Self {
        let mut frame = Self::base("chat.update", message.trip_id.clone());
        frame.message_id = Some(message.id.clone());
        frame.content = Some(message.content.clone());
        frame.user = Some(sender);
        frame.timestamp = Some(message.updated_at);
        frame
    }

    pub fn chat_delete(trip_id: TripId, message_id: MessageId) -> Self {
        let mut frame = Self::base("chat.delete", trip_id);
        frame.message_id = Some(message_id);
        frame.timestamp = Some(Utc::now());
        frame
    }

    pub fn reaction_update(trip_id: TripId, message_id: MessageId, reactions: &[Reaction]) -> Self {
        let mut frame = Self::base("reaction.update", trip_id);
        frame.message_id = Some(message_id);
        frame.reactions = Some(reactions.iter().map(ReactionEntry::from).collect());
        frame.timestamp = Some(Utc::now());
        frame
    }

    pub fn typing(trip_id: TripId, user: MemberProfile) -> Self {
        let mut frame = Self::base("typing", trip_id);
        frame.user = Some(user);
        frame.timestamp = Some(Utc::now());
        frame
    }

    /// Frame carrying a bus event payload verbatim, typed by the event kind.
    pub fn event_payload(kind: &str, trip_id: TripId, payload: serde_json::Value) -> Self {
        let mut frame = Self::base(kind, trip_id);
        frame.payload = Some(payload);
        frame.timestamp = Some(Utc::now());
        frame
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted() {
        let frame = WsFrame::chat_delete(TripId::from("t1"), MessageId::from("m1"));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "chat.delete");
        assert_eq!(value["tripId"], "t1");
        assert_eq!(value["messageId"], "m1");
        assert!(value.get("content").is_none());
        assert!(value.get("user").is_none());
    }

    #[test]
    fn inbound_frame_parses_with_sparse_fields() {
        let frame: WsFrame = serde_json::from_str(
            r#"{"type":"reaction.add","tripId":"t1","messageId":"m1","reaction":"👍"}"#,
        )
        .unwrap();
        assert_eq!(frame.kind, "reaction.add");
        assert_eq!(frame.reaction.as_deref(), Some("👍"));
        assert!(frame.timestamp.is_none());
    }
}
