use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier for trips
    TripId
);
string_id!(
    /// Unique identifier for users (verified principal id, issued upstream)
    UserId
);
string_id!(
    /// Unique identifier for chat groups
    GroupId
);
string_id!(
    /// Unique identifier for chat messages
    MessageId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TripStatus {
    Planning,
    Active,
    Completed,
    Cancelled,
}

/// Role of a user within a trip. `None` is the absence of membership and is
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
    None,
}

impl MemberRole {
    /// Whether this role holds any membership at all.
    pub fn is_member(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether this role may act on other members' content (delete messages).
    pub fn can_moderate(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Trip destination; coordinates are filled in lazily by geocoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: TripId,
    pub name: String,
    pub owner_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    pub status: TripStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripMembership {
    pub trip_id: TripId,
    pub user_id: UserId,
    pub role: MemberRole,
    pub status: MembershipStatus,
    pub joined_at: DateTime<Utc>,
}

/// Denormalized user snapshot carried inside events and frames so consumers
/// never need a back-reference to a user record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberProfile {
    pub id: UserId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatGroup {
    pub id: GroupId,
    pub trip_id: TripId,
    pub name: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Location,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    /// Opaque reaction token, e.g. an emoji glyph.
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub group_id: GroupId,
    pub trip_id: TripId,
    pub sender_id: UserId,
    pub content: String,
    pub content_type: ContentType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_edited: bool,
    pub is_deleted: bool,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

/// Last-read marker per (group, user). Monotonic: never regresses to an
/// older message within the same group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadCursor {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub message_id: MessageId,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationFix {
    pub id: String,
    pub trip_id: TripId,
    pub user_id: UserId,
    pub latitude: f64,
    pub longitude: f64,
    /// Reported accuracy radius in meters.
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

/// Client-supplied location update, validated before persisting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

/// Device push token registered by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushToken {
    pub user_id: UserId,
    pub token: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyForecast {
    pub time: DateTime<Utc>,
    pub temperature: f64,
    pub weather_code: i32,
}

/// Point-in-time weather for a trip destination. Lives only on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherSnapshot {
    pub trip_id: TripId,
    pub current_temp: f64,
    pub weather_code: i32,
    pub updated_at: DateTime<Utc>,
    /// 48-hour hourly forecast.
    pub hourly: Vec<HourlyForecast>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_permissions() {
        assert!(MemberRole::Owner.can_moderate());
        assert!(MemberRole::Admin.can_moderate());
        assert!(!MemberRole::Member.can_moderate());
        assert!(!MemberRole::None.is_member());
        assert!(MemberRole::Member.is_member());
    }

    #[test]
    fn ids_are_distinct() {
        assert_ne!(TripId::new(), TripId::new());
        assert_eq!(UserId::from("u1").as_str(), "u1");
    }
}
