//! Authoritative chat state machine.
//!
//! Every mutation validates membership and ownership against the trip
//! store, persists through the chat store, then emits a bus event. Event
//! publish failures after a successful persist are logged and swallowed;
//! the persisted state is the source of truth and broadcast delivery is
//! retried by nobody.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use wayfarer_common::{
    ChatGroup, ChatMessage, ChatMessagePayload, ContentType, CoreError, Event, EventKind,
    GroupId, GroupCreatedPayload, MemberProfile, MemberRole, MessageDeletedPayload, MessageId,
    Reaction, ReactionPayload, ReadCursor, ReadUpdatedPayload, Result, TripId, UserId,
};
use wayfarer_events::EventBus;
use wayfarer_realtime::{ConnectionHub, WsFrame};
use wayfarer_storage::{ChatStore, TripStore};
use wayfarer_workers::{PushNotification, PushNotifier};

/// Id of the implicit main group every trip carries.
pub fn main_group_id(trip_id: &TripId) -> GroupId {
    GroupId(trip_id.0.clone())
}

pub struct ChatService {
    chat_store: Arc<dyn ChatStore>,
    trip_store: Arc<dyn TripStore>,
    bus: Arc<EventBus>,
    hub: Arc<ConnectionHub>,
    push: Option<Arc<PushNotifier>>,
}

impl ChatService {
    pub fn new(
        chat_store: Arc<dyn ChatStore>,
        trip_store: Arc<dyn TripStore>,
        bus: Arc<EventBus>,
        hub: Arc<ConnectionHub>,
    ) -> Self {
        Self {
            chat_store,
            trip_store,
            bus,
            hub,
            push: None,
        }
    }

    /// Enable outbound push to offline recipients.
    pub fn with_push(mut self, push: Arc<PushNotifier>) -> Self {
        self.push = Some(push);
        self
    }

    async fn require_member(&self, trip_id: &TripId, user_id: &UserId) -> Result<MemberRole> {
        let role = self.trip_store.get_user_role(trip_id, user_id).await?;
        if !role.is_member() {
            return Err(CoreError::forbidden(format!(
                "user {} is not a member of trip {}",
                user_id, trip_id
            )));
        }
        Ok(role)
    }

    /// Denormalized profile snapshot; falls back to a bare id when the
    /// profile store has nothing.
    pub async fn member_profile(&self, user_id: &UserId) -> MemberProfile {
        match self.trip_store.get_profile(user_id).await {
            Ok(Some(profile)) => profile,
            _ => MemberProfile {
                id: user_id.clone(),
                name: user_id.to_string(),
                avatar_url: None,
            },
        }
    }

    /// Publish after a successful persist: failures are logged, never
    /// surfaced to the caller.
    async fn publish_or_log(&self, event: Event) {
        let kind = event.kind.clone();
        if let Err(e) = self.bus.publish(event).await {
            warn!(kind = %kind, error = %e, "event publish failed after persist");
        }
    }

    /// Create a chat group and auto-join every current trip member.
    pub async fn create_group(
        &self,
        trip_id: &TripId,
        creator_id: &UserId,
        name: &str,
    ) -> Result<ChatGroup> {
        if trip_id.as_str().is_empty() || creator_id.as_str().is_empty() || name.trim().is_empty()
        {
            return Err(CoreError::validation("trip id, creator, and name are required"));
        }
        if self.trip_store.get_trip(trip_id).await?.is_none() {
            return Err(CoreError::not_found(format!("trip {}", trip_id)));
        }
        self.require_member(trip_id, creator_id).await?;

        let group = ChatGroup {
            id: GroupId::new(),
            trip_id: trip_id.clone(),
            name: name.trim().to_string(),
            created_by: creator_id.clone(),
            created_at: Utc::now(),
        };
        self.chat_store.create_group(&group).await?;

        // Partial join failures leave the group usable; log and move on.
        for member in self.trip_store.list_members(trip_id).await? {
            if let Err(e) = self
                .chat_store
                .add_group_member(&group.id, &member.user_id)
                .await
            {
                warn!(group_id = %group.id, user_id = %member.user_id, error = %e,
                      "failed to auto-join member to group");
            }
        }

        self.publish_or_log(Event::new(
            EventKind::ChatGroupCreated,
            trip_id.clone(),
            creator_id.clone(),
            serde_json::to_value(GroupCreatedPayload { group: group.clone() })?,
        ))
        .await;

        Ok(group)
    }

    /// Persist and announce a new message. The sender gets a direct echo on
    /// any local connection; everyone else receives it through the relay.
    /// Offline members are queued for push.
    pub async fn send_message(
        &self,
        trip_id: &TripId,
        group_id: Option<GroupId>,
        sender_id: &UserId,
        content: &str,
        content_type: ContentType,
    ) -> Result<ChatMessage> {
        self.require_member(trip_id, sender_id).await?;
        if content.trim().is_empty() {
            return Err(CoreError::validation("message content must not be empty"));
        }

        let now = Utc::now();
        let message = ChatMessage {
            id: MessageId::new(),
            group_id: group_id.unwrap_or_else(|| main_group_id(trip_id)),
            trip_id: trip_id.clone(),
            sender_id: sender_id.clone(),
            content: content.to_string(),
            content_type,
            created_at: now,
            updated_at: now,
            is_edited: false,
            is_deleted: false,
            reactions: vec![],
        };
        self.chat_store.insert_message(&message).await?;

        let sender = self.member_profile(sender_id).await;
        self.publish_or_log(Event::new(
            EventKind::ChatMessageSent,
            trip_id.clone(),
            sender_id.clone(),
            serde_json::to_value(ChatMessagePayload {
                message: message.clone(),
                sender: sender.clone(),
            })?,
        ))
        .await;

        // Sender echo, so the author sees the committed message without
        // waiting on the bus round trip.
        if let Ok(json) = WsFrame::chat(&message, sender.clone()).to_json() {
            self.hub.send_to_user(trip_id, sender_id, &json).await;
        }

        self.enqueue_push(trip_id, sender_id, &sender, &message.content).await;

        Ok(message)
    }

    async fn enqueue_push(
        &self,
        trip_id: &TripId,
        sender_id: &UserId,
        sender: &MemberProfile,
        content: &str,
    ) {
        let Some(push) = &self.push else {
            return;
        };
        let members = match self.trip_store.list_members(trip_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(trip_id = %trip_id, error = %e, "failed to list members for push");
                return;
            }
        };
        let connected = self.hub.connected_users(trip_id).await;
        let recipients: Vec<UserId> = members
            .into_iter()
            .map(|m| m.user_id)
            .filter(|u| u != sender_id && !connected.contains(u))
            .collect();
        if recipients.is_empty() {
            return;
        }
        debug!(trip_id = %trip_id, recipients = recipients.len(), "queueing push notification");
        push.enqueue(
            recipients,
            PushNotification {
                title: sender.name.clone(),
                body: content.to_string(),
                data: Some(serde_json::json!({ "tripId": trip_id })),
            },
        )
        .await;
    }

    /// Edit a message's content. Only the original sender may edit.
    pub async fn edit_message(
        &self,
        message_id: &MessageId,
        editor_id: &UserId,
        new_content: &str,
    ) -> Result<ChatMessage> {
        let mut message = self
            .chat_store
            .get_message(message_id)
            .await?
            .filter(|m| !m.is_deleted)
            .ok_or_else(|| CoreError::not_found(format!("message {}", message_id)))?;

        if &message.sender_id != editor_id {
            return Err(CoreError::forbidden("only the sender may edit a message"));
        }
        if new_content.trim().is_empty() {
            return Err(CoreError::validation("message content must not be empty"));
        }

        message.content = new_content.to_string();
        message.updated_at = Utc::now();
        message.is_edited = true;
        self.chat_store.update_message(&message).await?;

        let sender = self.member_profile(editor_id).await;
        self.publish_or_log(Event::new(
            EventKind::ChatMessageEdited,
            message.trip_id.clone(),
            editor_id.clone(),
            serde_json::to_value(ChatMessagePayload {
                message: message.clone(),
                sender,
            })?,
        ))
        .await;

        Ok(message)
    }

    /// Soft-delete a message. Allowed for the sender, or a trip owner/admin.
    pub async fn delete_message(&self, message_id: &MessageId, deleter_id: &UserId) -> Result<()> {
        let mut message = self
            .chat_store
            .get_message(message_id)
            .await?
            .filter(|m| !m.is_deleted)
            .ok_or_else(|| CoreError::not_found(format!("message {}", message_id)))?;

        if &message.sender_id != deleter_id {
            let role = self
                .trip_store
                .get_user_role(&message.trip_id, deleter_id)
                .await?;
            if !role.can_moderate() {
                return Err(CoreError::forbidden(
                    "delete requires the sender or a trip owner/admin",
                ));
            }
        }

        message.is_deleted = true;
        message.content.clear();
        message.updated_at = Utc::now();
        self.chat_store.update_message(&message).await?;

        self.publish_or_log(Event::new(
            EventKind::ChatMessageDeleted,
            message.trip_id.clone(),
            deleter_id.clone(),
            serde_json::to_value(MessageDeletedPayload {
                message_id: message.id.clone(),
                group_id: message.group_id.clone(),
                deleted_by: deleter_id.clone(),
            })?,
        ))
        .await;

        // Low-latency removal for locally connected clients; remote
        // processes pick the event up through their relay.
        if let Ok(json) = WsFrame::chat_delete(message.trip_id.clone(), message.id.clone()).to_json()
        {
            self.hub.broadcast(&message.trip_id, &json, None).await;
        }

        Ok(())
    }

    /// Add a reaction. Idempotent per (message, user, token); the returned
    /// set always reflects persisted state.
    pub async fn add_reaction(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
        token: &str,
    ) -> Result<Vec<Reaction>> {
        self.mutate_reaction(message_id, user_id, token, true).await
    }

    /// Remove a reaction; removing an absent reaction is a no-op.
    pub async fn remove_reaction(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
        token: &str,
    ) -> Result<Vec<Reaction>> {
        self.mutate_reaction(message_id, user_id, token, false).await
    }

    async fn mutate_reaction(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
        token: &str,
        add: bool,
    ) -> Result<Vec<Reaction>> {
        if token.is_empty() {
            return Err(CoreError::validation("reaction token must not be empty"));
        }
        let message = self
            .chat_store
            .get_message(message_id)
            .await?
            .filter(|m| !m.is_deleted)
            .ok_or_else(|| CoreError::not_found(format!("message {}", message_id)))?;
        self.require_member(&message.trip_id, user_id).await?;

        let reaction = Reaction {
            message_id: message_id.clone(),
            user_id: user_id.clone(),
            token: token.to_string(),
        };
        if add {
            match self.chat_store.add_reaction(&reaction).await {
                Ok(()) => {}
                // Duplicate add is success; the set below is authoritative.
                Err(CoreError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        } else {
            self.chat_store.remove_reaction(&reaction).await?;
        }

        let reactions = self.chat_store.list_reactions(message_id).await?;

        let kind = if add {
            EventKind::ChatReactionAdded
        } else {
            EventKind::ChatReactionRemoved
        };
        self.publish_or_log(Event::new(
            kind,
            message.trip_id.clone(),
            user_id.clone(),
            serde_json::to_value(ReactionPayload {
                message_id: message_id.clone(),
                group_id: message.group_id.clone(),
                user_id: user_id.clone(),
                token: token.to_string(),
                reactions: reactions.clone(),
            })?,
        ))
        .await;

        // Broadcast the full updated set to locally connected clients.
        if let Ok(json) =
            WsFrame::reaction_update(message.trip_id.clone(), message_id.clone(), &reactions)
                .to_json()
        {
            self.hub.broadcast(&message.trip_id, &json, None).await;
        }

        Ok(reactions)
    }

    /// Advance the (group, user) read cursor. Returns `None` when the
    /// update targets a message older than the current cursor (no-op).
    pub async fn update_last_read(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
        message_id: &MessageId,
    ) -> Result<Option<ReadCursor>> {
        let message = self
            .chat_store
            .get_message(message_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("message {}", message_id)))?;
        self.require_member(&message.trip_id, user_id).await?;
        if &message.group_id != group_id {
            return Err(CoreError::validation(format!(
                "message {} does not belong to group {}",
                message_id, group_id
            )));
        }

        if let Some(current) = self.chat_store.get_read_cursor(group_id, user_id).await? {
            if let Some(current_message) =
                self.chat_store.get_message(&current.message_id).await?
            {
                // Ordering is commit time, not arrival time.
                if message.created_at < current_message.created_at {
                    return Ok(None);
                }
            }
        }

        let cursor = ReadCursor {
            group_id: group_id.clone(),
            user_id: user_id.clone(),
            message_id: message_id.clone(),
            updated_at: Utc::now(),
        };
        self.chat_store.upsert_read_cursor(&cursor).await?;

        self.publish_or_log(Event::new(
            EventKind::ChatReadUpdated,
            message.trip_id.clone(),
            user_id.clone(),
            serde_json::to_value(ReadUpdatedPayload {
                group_id: group_id.clone(),
                user_id: user_id.clone(),
                message_id: message_id.clone(),
            })?,
        ))
        .await;

        Ok(Some(cursor))
    }

    /// Read-cursor update addressed by message alone; the group is derived
    /// from the message's own group field, which must be present.
    pub async fn update_last_read_from_message(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
    ) -> Result<Option<ReadCursor>> {
        let message = self
            .chat_store
            .get_message(message_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("message {}", message_id)))?;
        if message.group_id.as_str().is_empty() {
            return Err(CoreError::validation(format!(
                "message {} carries no group",
                message_id
            )));
        }
        let group_id = message.group_id.clone();
        self.update_last_read(&group_id, user_id, message_id).await
    }

    pub async fn list_messages(
        &self,
        requester_id: &UserId,
        trip_id: &TripId,
        group_id: &GroupId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>> {
        self.require_member(trip_id, requester_id).await?;
        self.chat_store.list_messages(group_id, limit, offset).await
    }
}
