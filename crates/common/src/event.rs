//! Bus event envelope and typed payloads.
//!
//! Every event published on the trip channel is wrapped in [`Event`]: a
//! self-describing envelope with a string `type`, origin metadata, and an
//! opaque JSON payload. Known payload shapes are defined here; unknown event
//! types are still carried and forwarded, just never decoded.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

use crate::types::*;

/// Event type discriminator. Unrecognized strings survive a round trip via
/// [`EventKind::Other`] so newer producers don't break older consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChatMessageSent,
    ChatMessageEdited,
    ChatMessageDeleted,
    ChatReactionAdded,
    ChatReactionRemoved,
    ChatReadUpdated,
    ChatGroupCreated,
    LocationUpdated,
    WeatherUpdated,
    TripUpdated,
    MemberAdded,
    MemberRemoved,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ChatMessageSent => "chat.message.sent",
            Self::ChatMessageEdited => "chat.message.edited",
            Self::ChatMessageDeleted => "chat.message.deleted",
            Self::ChatReactionAdded => "chat.reaction.added",
            Self::ChatReactionRemoved => "chat.reaction.removed",
            Self::ChatReadUpdated => "chat.read.updated",
            Self::ChatGroupCreated => "chat.group.created",
            Self::LocationUpdated => "location.updated",
            Self::WeatherUpdated => "weather.updated",
            Self::TripUpdated => "trip.updated",
            Self::MemberAdded => "member.added",
            Self::MemberRemoved => "member.removed",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "chat.message.sent" => Self::ChatMessageSent,
            "chat.message.edited" => Self::ChatMessageEdited,
            "chat.message.deleted" => Self::ChatMessageDeleted,
            "chat.reaction.added" => Self::ChatReactionAdded,
            "chat.reaction.removed" => Self::ChatReactionRemoved,
            "chat.read.updated" => Self::ChatReadUpdated,
            "chat.group.created" => Self::ChatGroupCreated,
            "location.updated" => Self::LocationUpdated,
            "weather.updated" => Self::WeatherUpdated,
            "trip.updated" => Self::TripUpdated,
            "member.added" => Self::MemberAdded,
            "member.removed" => Self::MemberRemoved,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Err(D::Error::custom("event type must not be empty"));
        }
        Ok(Self::from(s.as_str()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Identity of the publishing process (bus instance id).
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// The bus event envelope. Immutable after publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub trip_id: TripId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    #[serde(default)]
    pub metadata: EventMetadata,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, trip_id: TripId, user_id: UserId, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            trip_id,
            user_id,
            timestamp: Utc::now(),
            version: 1,
            metadata: EventMetadata::default(),
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    /// Decode the payload into a known shape. Consumers that hit an
    /// unexpected shape should skip the event rather than fail the stream.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub message: ChatMessage,
    pub sender: MemberProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedPayload {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub deleted_by: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub token: String,
    /// Full reaction set after the change, so consumers need no read-back.
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadUpdatedPayload {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCreatedPayload {
    pub group: ChatGroup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberChangePayload {
    pub user: MemberProfile,
    pub role: MemberRole,
}
