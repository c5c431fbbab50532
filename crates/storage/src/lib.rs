//! Store contracts consumed by the event fabric.
//!
//! The core never talks to a database directly; it goes through these narrow
//! traits. [`memory`] provides complete in-process implementations used by
//! tests and local runs, [`postgres`] the production implementations.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use wayfarer_common::{
    ChatGroup, ChatMessage, GroupId, LocationFix, MemberProfile, MemberRole, MessageId, PushToken,
    Reaction, ReadCursor, Result, Trip, TripId, TripMembership, UserId,
};

pub use memory::{MemoryChatStore, MemoryLocationStore, MemoryPushTokenStore, MemoryTripStore};
pub use postgres::{PgChatStore, PgLocationStore, PgPushTokenStore, PgTripStore};

/// CRUD over chat groups, messages, reactions, and read cursors.
///
/// Implementations are externally concurrent-safe; callers never hold their
/// own locks across these calls.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_group(&self, group: &ChatGroup) -> Result<()>;
    async fn get_group(&self, group_id: &GroupId) -> Result<Option<ChatGroup>>;
    async fn add_group_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<()>;

    async fn insert_message(&self, message: &ChatMessage) -> Result<()>;
    /// Fetch a message including its current reaction set.
    async fn get_message(&self, message_id: &MessageId) -> Result<Option<ChatMessage>>;
    async fn update_message(&self, message: &ChatMessage) -> Result<()>;
    async fn list_messages(&self, group_id: &GroupId, limit: i64, offset: i64)
        -> Result<Vec<ChatMessage>>;

    /// Insert a reaction row. Returns `Conflict` when the
    /// (message, user, token) row already exists.
    async fn add_reaction(&self, reaction: &Reaction) -> Result<()>;
    /// Remove a reaction row; `false` when it was already absent.
    async fn remove_reaction(&self, reaction: &Reaction) -> Result<bool>;
    async fn list_reactions(&self, message_id: &MessageId) -> Result<Vec<Reaction>>;

    async fn get_read_cursor(&self, group_id: &GroupId, user_id: &UserId)
        -> Result<Option<ReadCursor>>;
    async fn upsert_read_cursor(&self, cursor: &ReadCursor) -> Result<()>;
}

/// Read access to trips, memberships, and member profiles.
#[async_trait]
pub trait TripStore: Send + Sync {
    async fn get_trip(&self, trip_id: &TripId) -> Result<Option<Trip>>;
    /// Role of the user in the trip; `MemberRole::None` when not a member.
    async fn get_user_role(&self, trip_id: &TripId, user_id: &UserId) -> Result<MemberRole>;
    async fn list_members(&self, trip_id: &TripId) -> Result<Vec<TripMembership>>;
    async fn get_profile(&self, user_id: &UserId) -> Result<Option<MemberProfile>>;
}

/// Latest-known location per trip member.
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Replace the stored fix for (trip, user) with a newer one.
    async fn upsert_latest(&self, fix: &LocationFix) -> Result<()>;
    async fn list_latest(&self, trip_id: &TripId) -> Result<Vec<LocationFix>>;
}

/// Device push tokens for outbound notifications.
#[async_trait]
pub trait PushTokenStore: Send + Sync {
    async fn list_active_tokens(&self, user_ids: &[UserId]) -> Result<Vec<PushToken>>;
    async fn mark_token_used(&self, token: &str) -> Result<()>;
    async fn invalidate_token(&self, token: &str) -> Result<()>;
}
