//! Postgres-backed store implementations.
//!
//! Queries are runtime-checked (`sqlx::query_as`) so the crate builds
//! without a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use wayfarer_common::{
    ChatGroup, ChatMessage, ContentType, CoreError, GroupId, LocationFix, MemberProfile,
    MemberRole, MembershipStatus, MessageId, PushToken, Reaction, ReadCursor, Result, Trip,
    TripId, TripMembership, TripStatus, UserId,
};

use crate::{ChatStore, LocationStore, PushTokenStore, TripStore};

fn storage_err(e: sqlx::Error) -> CoreError {
    match e {
        sqlx::Error::RowNotFound => CoreError::not_found("row not found"),
        other => CoreError::transport(format!("postgres: {}", other)),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn parse_role(s: &str) -> MemberRole {
    match s {
        "owner" => MemberRole::Owner,
        "admin" => MemberRole::Admin,
        "member" => MemberRole::Member,
        _ => MemberRole::None,
    }
}

fn parse_content_type(s: &str) -> ContentType {
    match s {
        "image" => ContentType::Image,
        "location" => ContentType::Location,
        _ => ContentType::Text,
    }
}

fn content_type_str(ct: ContentType) -> &'static str {
    match ct {
        ContentType::Text => "text",
        ContentType::Image => "image",
        ContentType::Location => "location",
    }
}

fn parse_trip_status(s: &str) -> TripStatus {
    match s {
        "active" => TripStatus::Active,
        "completed" => TripStatus::Completed,
        "cancelled" => TripStatus::Cancelled,
        _ => TripStatus::Planning,
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: String,
    group_id: String,
    trip_id: String,
    sender_id: String,
    content: String,
    content_type: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    is_edited: bool,
    is_deleted: bool,
}

impl MessageRow {
    fn into_message(self, reactions: Vec<Reaction>) -> ChatMessage {
        ChatMessage {
            id: MessageId(self.id),
            group_id: GroupId(self.group_id),
            trip_id: TripId(self.trip_id),
            sender_id: UserId(self.sender_id),
            content: self.content,
            content_type: parse_content_type(&self.content_type),
            created_at: self.created_at,
            updated_at: self.updated_at,
            is_edited: self.is_edited,
            is_deleted: self.is_deleted,
            reactions,
        }
    }
}

#[derive(FromRow)]
struct ReactionRow {
    message_id: String,
    user_id: String,
    token: String,
}

impl From<ReactionRow> for Reaction {
    fn from(row: ReactionRow) -> Self {
        Reaction {
            message_id: MessageId(row.message_id),
            user_id: UserId(row.user_id),
            token: row.token,
        }
    }
}

pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn reactions_for(&self, message_id: &MessageId) -> Result<Vec<Reaction>> {
        let rows = sqlx::query_as::<_, ReactionRow>(
            "SELECT message_id, user_id, token FROM chat_reactions WHERE message_id = $1",
        )
        .bind(message_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.into_iter().map(Reaction::from).collect())
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn create_group(&self, group: &ChatGroup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_groups (id, trip_id, name, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(group.id.as_str())
        .bind(group.trip_id.as_str())
        .bind(&group.name)
        .bind(group.created_by.as_str())
        .bind(group.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get_group(&self, group_id: &GroupId) -> Result<Option<ChatGroup>> {
        #[derive(FromRow)]
        struct GroupRow {
            id: String,
            trip_id: String,
            name: String,
            created_by: String,
            created_at: DateTime<Utc>,
        }

        let row = sqlx::query_as::<_, GroupRow>(
            "SELECT id, trip_id, name, created_by, created_at FROM chat_groups WHERE id = $1",
        )
        .bind(group_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| ChatGroup {
            id: GroupId(r.id),
            trip_id: TripId(r.trip_id),
            name: r.name,
            created_by: UserId(r.created_by),
            created_at: r.created_at,
        }))
    }

    async fn add_group_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_group_members (group_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (group_id, user_id) DO NOTHING
            "#,
        )
        .bind(group_id.as_str())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_messages
                (id, group_id, trip_id, sender_id, content, content_type,
                 created_at, updated_at, is_edited, is_deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(message.id.as_str())
        .bind(message.group_id.as_str())
        .bind(message.trip_id.as_str())
        .bind(message.sender_id.as_str())
        .bind(&message.content)
        .bind(content_type_str(message.content_type))
        .bind(message.created_at)
        .bind(message.updated_at)
        .bind(message.is_edited)
        .bind(message.is_deleted)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get_message(&self, message_id: &MessageId) -> Result<Option<ChatMessage>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, group_id, trip_id, sender_id, content, content_type,
                   created_at, updated_at, is_edited, is_deleted
            FROM chat_messages WHERE id = $1
            "#,
        )
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(r) => {
                let reactions = self.reactions_for(message_id).await?;
                Ok(Some(r.into_message(reactions)))
            }
            None => Ok(None),
        }
    }

    async fn update_message(&self, message: &ChatMessage) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE chat_messages
            SET content = $2, updated_at = $3, is_edited = $4, is_deleted = $5
            WHERE id = $1
            "#,
        )
        .bind(message.id.as_str())
        .bind(&message.content)
        .bind(message.updated_at)
        .bind(message.is_edited)
        .bind(message.is_deleted)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("message {}", message.id)));
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        group_id: &GroupId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, group_id, trip_id, sender_id, content, content_type,
                   created_at, updated_at, is_edited, is_deleted
            FROM chat_messages
            WHERE group_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(group_id.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let reactions = self.reactions_for(&MessageId(row.id.clone())).await?;
            messages.push(row.into_message(reactions));
        }
        Ok(messages)
    }

    async fn add_reaction(&self, reaction: &Reaction) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO chat_reactions (message_id, user_id, token) VALUES ($1, $2, $3)",
        )
        .bind(reaction.message_id.as_str())
        .bind(reaction.user_id.as_str())
        .bind(&reaction.token)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CoreError::conflict(format!(
                "reaction {} by {} on {}",
                reaction.token, reaction.user_id, reaction.message_id
            ))),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn remove_reaction(&self, reaction: &Reaction) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM chat_reactions WHERE message_id = $1 AND user_id = $2 AND token = $3",
        )
        .bind(reaction.message_id.as_str())
        .bind(reaction.user_id.as_str())
        .bind(&reaction.token)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_reactions(&self, message_id: &MessageId) -> Result<Vec<Reaction>> {
        self.reactions_for(message_id).await
    }

    async fn get_read_cursor(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<Option<ReadCursor>> {
        #[derive(FromRow)]
        struct CursorRow {
            group_id: String,
            user_id: String,
            message_id: String,
            updated_at: DateTime<Utc>,
        }

        let row = sqlx::query_as::<_, CursorRow>(
            r#"
            SELECT group_id, user_id, message_id, updated_at
            FROM chat_read_cursors WHERE group_id = $1 AND user_id = $2
            "#,
        )
        .bind(group_id.as_str())
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| ReadCursor {
            group_id: GroupId(r.group_id),
            user_id: UserId(r.user_id),
            message_id: MessageId(r.message_id),
            updated_at: r.updated_at,
        }))
    }

    async fn upsert_read_cursor(&self, cursor: &ReadCursor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_read_cursors (group_id, user_id, message_id, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (group_id, user_id)
            DO UPDATE SET message_id = $3, updated_at = $4
            "#,
        )
        .bind(cursor.group_id.as_str())
        .bind(cursor.user_id.as_str())
        .bind(cursor.message_id.as_str())
        .bind(cursor.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

pub struct PgTripStore {
    pool: PgPool,
}

impl PgTripStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TripStore for PgTripStore {
    async fn get_trip(&self, trip_id: &TripId) -> Result<Option<Trip>> {
        #[derive(FromRow)]
        struct TripRow {
            id: String,
            name: String,
            owner_id: String,
            destination: Option<serde_json::Value>,
            status: String,
            created_at: DateTime<Utc>,
        }

        let row = sqlx::query_as::<_, TripRow>(
            r#"
            SELECT id, name, owner_id, destination, status, created_at
            FROM trips WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(trip_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| Trip {
            id: TripId(r.id),
            name: r.name,
            owner_id: UserId(r.owner_id),
            destination: r.destination.and_then(|v| serde_json::from_value(v).ok()),
            status: parse_trip_status(&r.status),
            created_at: r.created_at,
        }))
    }

    async fn get_user_role(&self, trip_id: &TripId, user_id: &UserId) -> Result<MemberRole> {
        #[derive(FromRow)]
        struct RoleRow {
            role: String,
        }

        let row = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT role FROM trip_memberships
            WHERE trip_id = $1 AND user_id = $2 AND status = 'active'
            "#,
        )
        .bind(trip_id.as_str())
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| parse_role(&r.role)).unwrap_or(MemberRole::None))
    }

    async fn list_members(&self, trip_id: &TripId) -> Result<Vec<TripMembership>> {
        #[derive(FromRow)]
        struct MembershipRow {
            trip_id: String,
            user_id: String,
            role: String,
            joined_at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT trip_id, user_id, role, joined_at
            FROM trip_memberships WHERE trip_id = $1 AND status = 'active'
            "#,
        )
        .bind(trip_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|r| TripMembership {
                trip_id: TripId(r.trip_id),
                user_id: UserId(r.user_id),
                role: parse_role(&r.role),
                status: MembershipStatus::Active,
                joined_at: r.joined_at,
            })
            .collect())
    }

    async fn get_profile(&self, user_id: &UserId) -> Result<Option<MemberProfile>> {
        #[derive(FromRow)]
        struct ProfileRow {
            id: String,
            name: String,
            avatar_url: Option<String>,
        }

        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT id, name, avatar_url FROM user_profiles WHERE id = $1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| MemberProfile {
            id: UserId(r.id),
            name: r.name,
            avatar_url: r.avatar_url,
        }))
    }
}

pub struct PgLocationStore {
    pool: PgPool,
}

impl PgLocationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LocationStore for PgLocationStore {
    async fn upsert_latest(&self, fix: &LocationFix) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO location_fixes
                (id, trip_id, user_id, latitude, longitude, accuracy, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (trip_id, user_id)
            DO UPDATE SET id = $1, latitude = $4, longitude = $5,
                          accuracy = $6, recorded_at = $7
            "#,
        )
        .bind(&fix.id)
        .bind(fix.trip_id.as_str())
        .bind(fix.user_id.as_str())
        .bind(fix.latitude)
        .bind(fix.longitude)
        .bind(fix.accuracy)
        .bind(fix.timestamp)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn list_latest(&self, trip_id: &TripId) -> Result<Vec<LocationFix>> {
        #[derive(FromRow)]
        struct FixRow {
            id: String,
            trip_id: String,
            user_id: String,
            latitude: f64,
            longitude: f64,
            accuracy: f64,
            recorded_at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, FixRow>(
            r#"
            SELECT id, trip_id, user_id, latitude, longitude, accuracy, recorded_at
            FROM location_fixes WHERE trip_id = $1
            "#,
        )
        .bind(trip_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|r| LocationFix {
                id: r.id,
                trip_id: TripId(r.trip_id),
                user_id: UserId(r.user_id),
                latitude: r.latitude,
                longitude: r.longitude,
                accuracy: r.accuracy,
                timestamp: r.recorded_at,
            })
            .collect())
    }
}

pub struct PgPushTokenStore {
    pool: PgPool,
}

impl PgPushTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PushTokenStore for PgPushTokenStore {
    async fn list_active_tokens(&self, user_ids: &[UserId]) -> Result<Vec<PushToken>> {
        #[derive(FromRow)]
        struct TokenRow {
            user_id: String,
            token: String,
            last_used_at: Option<DateTime<Utc>>,
        }

        let ids: Vec<String> = user_ids.iter().map(|u| u.0.clone()).collect();
        let rows = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT user_id, token, last_used_at
            FROM push_tokens WHERE active AND user_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|r| PushToken {
                user_id: UserId(r.user_id),
                token: r.token,
                active: true,
                last_used_at: r.last_used_at,
            })
            .collect())
    }

    async fn mark_token_used(&self, token: &str) -> Result<()> {
        sqlx::query("UPDATE push_tokens SET last_used_at = NOW() WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn invalidate_token(&self, token: &str) -> Result<()> {
        sqlx::query("UPDATE push_tokens SET active = FALSE WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
