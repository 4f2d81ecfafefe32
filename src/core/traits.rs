//! DI "Interfaces"

use crate::core::errors::ChatResult;
use crate::infrastructure::entities;
use crate::infrastructure::entities::NotificationKind;
use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

#[async_trait]
pub trait ConversationRegistry: Send + Sync {
    /// Returns the direct conversation between two users, creating it if needed.
    ///
    /// Safe to race from both sides: exactly one conversation is ever created
    /// for a pair, whatever the argument order.
    async fn get_or_create_direct(
        &self,
        user_id: Uuid,
        other_user_id: Uuid,
    ) -> ChatResult<entities::Conversation>;

    /// Creates a group. The creator is always a member (and its admin).
    async fn create_group(
        &self,
        creator_id: Uuid,
        member_ids: Vec<Uuid>,
        name: Option<String>,
        description: Option<String>,
    ) -> ChatResult<entities::Conversation>;

    async fn update_group(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        name: Option<String>,
        description: Option<String>,
    ) -> ChatResult<entities::Conversation>;

    /// Adds a member to a group. Returns `false` if the user already was one.
    async fn add_member(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<bool>;

    /// Removes a member from a group; removing someone else needs the admin role.
    async fn remove_member(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<()>;

    async fn list_members(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<Vec<entities::Membership>>;

    /// Conversations of the user with preview and unread counter, most recent first.
    async fn list_for_user(&self, user_id: Uuid) -> ChatResult<Vec<entities::ConversationSummary>>;

    async fn get_for_user(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<entities::ConversationSummary>;

    /// Deletes a direct conversation for one participant only.
    async fn hide_direct(&self, conversation_id: Uuid, user_id: Uuid) -> ChatResult<()>;

    /// Marks everything read for the user; returns the recomputed unread count.
    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> ChatResult<i64>;

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> ChatResult<i64>;

    /// Fails with `NotFound` / `NotMember` unless the user belongs to an active conversation.
    async fn require_member(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<(entities::Conversation, entities::Membership)>;
}

#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// Persists a message, then fans it out. Publishing never fails the send.
    async fn send(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: Option<String>,
        image_url: Option<String>,
    ) -> ChatResult<entities::Message>;

    /// One page of history in ascending order, ending before the `before` message.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        before: Option<Uuid>,
        limit: Option<u32>,
    ) -> ChatResult<Vec<entities::Message>>;

    /// Soft-deletes one of the sender's own messages.
    async fn delete_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<entities::Message>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NotificationCounts {
    pub unread: i64,
    pub unreceived: i64,
}

#[async_trait]
pub trait NotificationCenter: Send + Sync {
    /// Persists a notification with a snapshot of the actor, then pushes it to the
    /// recipient. Returns `None` when the actor is the recipient.
    async fn emit(
        &self,
        recipient_id: Uuid,
        actor_id: Uuid,
        kind: NotificationKind,
    ) -> ChatResult<Option<entities::Notification>>;

    /// Newest first, continuing after the `before` notification.
    async fn list(
        &self,
        user_id: Uuid,
        before: Option<Uuid>,
        limit: Option<u32>,
    ) -> ChatResult<Vec<entities::Notification>>;

    async fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> ChatResult<()>;

    async fn mark_all_read(&self, user_id: Uuid) -> ChatResult<u64>;

    /// Flags every unreceived notification as received. Leaves `is_read` alone.
    async fn mark_received(&self, user_id: Uuid) -> ChatResult<u64>;

    async fn unread_count(&self, user_id: Uuid) -> ChatResult<i64>;

    async fn unreceived_count(&self, user_id: Uuid) -> ChatResult<i64>;

    async fn counts(&self, user_id: Uuid) -> ChatResult<NotificationCounts> {
        Ok(NotificationCounts {
            unread: self.unread_count(user_id).await?,
            unreceived: self.unreceived_count(user_id).await?,
        })
    }
}
