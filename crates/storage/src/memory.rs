//! In-memory store implementations for tests and local runs.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use wayfarer_common::{
    ChatGroup, ChatMessage, CoreError, GroupId, LocationFix, MemberProfile, MemberRole,
    MembershipStatus, MessageId, PushToken, Reaction, ReadCursor, Result, Trip, TripId,
    TripMembership, UserId,
};

use crate::{ChatStore, LocationStore, PushTokenStore, TripStore};

#[derive(Default)]
pub struct MemoryChatStore {
    groups: RwLock<HashMap<GroupId, ChatGroup>>,
    group_members: RwLock<HashMap<GroupId, Vec<UserId>>>,
    messages: RwLock<HashMap<MessageId, ChatMessage>>,
    reactions: RwLock<Vec<Reaction>>,
    cursors: RwLock<HashMap<(GroupId, UserId), ReadCursor>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_group(&self, group: &ChatGroup) -> Result<()> {
        self.groups.write().await.insert(group.id.clone(), group.clone());
        Ok(())
    }

    async fn get_group(&self, group_id: &GroupId) -> Result<Option<ChatGroup>> {
        Ok(self.groups.read().await.get(group_id).cloned())
    }

    async fn add_group_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<()> {
        let mut members = self.group_members.write().await;
        let entry = members.entry(group_id.clone()).or_default();
        if !entry.contains(user_id) {
            entry.push(user_id.clone());
        }
        Ok(())
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<()> {
        self.messages.write().await.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get_message(&self, message_id: &MessageId) -> Result<Option<ChatMessage>> {
        let message = self.messages.read().await.get(message_id).cloned();
        let Some(mut message) = message else {
            return Ok(None);
        };
        message.reactions = self.list_reactions(message_id).await?;
        Ok(Some(message))
    }

    async fn update_message(&self, message: &ChatMessage) -> Result<()> {
        let mut messages = self.messages.write().await;
        if !messages.contains_key(&message.id) {
            return Err(CoreError::not_found(format!("message {}", message.id)));
        }
        messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn list_messages(
        &self,
        group_id: &GroupId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>> {
        let messages = self.messages.read().await;
        let mut in_group: Vec<ChatMessage> = messages
            .values()
            .filter(|m| &m.group_id == group_id)
            .cloned()
            .collect();
        in_group.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(in_group
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn add_reaction(&self, reaction: &Reaction) -> Result<()> {
        let mut reactions = self.reactions.write().await;
        if reactions.iter().any(|r| r == reaction) {
            return Err(CoreError::conflict(format!(
                "reaction {} by {} on {}",
                reaction.token, reaction.user_id, reaction.message_id
            )));
        }
        reactions.push(reaction.clone());
        Ok(())
    }

    async fn remove_reaction(&self, reaction: &Reaction) -> Result<bool> {
        let mut reactions = self.reactions.write().await;
        let before = reactions.len();
        reactions.retain(|r| r != reaction);
        Ok(reactions.len() < before)
    }

    async fn list_reactions(&self, message_id: &MessageId) -> Result<Vec<Reaction>> {
        Ok(self
            .reactions
            .read()
            .await
            .iter()
            .filter(|r| &r.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn get_read_cursor(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<Option<ReadCursor>> {
        Ok(self
            .cursors
            .read()
            .await
            .get(&(group_id.clone(), user_id.clone()))
            .cloned())
    }

    async fn upsert_read_cursor(&self, cursor: &ReadCursor) -> Result<()> {
        self.cursors
            .write()
            .await
            .insert((cursor.group_id.clone(), cursor.user_id.clone()), cursor.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTripStore {
    trips: RwLock<HashMap<TripId, Trip>>,
    memberships: RwLock<HashMap<(TripId, UserId), TripMembership>>,
    profiles: RwLock<HashMap<UserId, MemberProfile>>,
}

impl MemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_trip(&self, trip: Trip) {
        self.trips.write().await.insert(trip.id.clone(), trip);
    }

    pub async fn upsert_membership(&self, membership: TripMembership) {
        self.memberships.write().await.insert(
            (membership.trip_id.clone(), membership.user_id.clone()),
            membership,
        );
    }

    pub async fn insert_profile(&self, profile: MemberProfile) {
        self.profiles.write().await.insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl TripStore for MemoryTripStore {
    async fn get_trip(&self, trip_id: &TripId) -> Result<Option<Trip>> {
        Ok(self.trips.read().await.get(trip_id).cloned())
    }

    async fn get_user_role(&self, trip_id: &TripId, user_id: &UserId) -> Result<MemberRole> {
        let memberships = self.memberships.read().await;
        Ok(memberships
            .get(&(trip_id.clone(), user_id.clone()))
            .filter(|m| m.status == MembershipStatus::Active)
            .map(|m| m.role)
            .unwrap_or(MemberRole::None))
    }

    async fn list_members(&self, trip_id: &TripId) -> Result<Vec<TripMembership>> {
        Ok(self
            .memberships
            .read()
            .await
            .values()
            .filter(|m| &m.trip_id == trip_id && m.status == MembershipStatus::Active)
            .cloned()
            .collect())
    }

    async fn get_profile(&self, user_id: &UserId) -> Result<Option<MemberProfile>> {
        Ok(self.profiles.read().await.get(user_id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryLocationStore {
    latest: RwLock<HashMap<(TripId, UserId), LocationFix>>,
}

impl MemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocationStore for MemoryLocationStore {
    async fn upsert_latest(&self, fix: &LocationFix) -> Result<()> {
        self.latest
            .write()
            .await
            .insert((fix.trip_id.clone(), fix.user_id.clone()), fix.clone());
        Ok(())
    }

    async fn list_latest(&self, trip_id: &TripId) -> Result<Vec<LocationFix>> {
        Ok(self
            .latest
            .read()
            .await
            .values()
            .filter(|f| &f.trip_id == trip_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryPushTokenStore {
    tokens: RwLock<Vec<PushToken>>,
}

impl MemoryPushTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, token: PushToken) {
        self.tokens.write().await.push(token);
    }
}

#[async_trait]
impl PushTokenStore for MemoryPushTokenStore {
    async fn list_active_tokens(&self, user_ids: &[UserId]) -> Result<Vec<PushToken>> {
        Ok(self
            .tokens
            .read()
            .await
            .iter()
            .filter(|t| t.active && user_ids.contains(&t.user_id))
            .cloned()
            .collect())
    }

    async fn mark_token_used(&self, token: &str) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        for t in tokens.iter_mut().filter(|t| t.token == token) {
            t.last_used_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn invalidate_token(&self, token: &str) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        for t in tokens.iter_mut().filter(|t| t.token == token) {
            t.active = false;
        }
        Ok(())
    }
}
