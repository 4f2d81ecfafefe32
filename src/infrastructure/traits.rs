//! Infrastructure traits, used for DI on higher levels

use crate::infrastructure::entities;
use crate::infrastructure::entities::MemberRole;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// A unique constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(db.message().to_owned())
            }
            _ => RepositoryError::Database(e),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Outcome of a committed membership removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRemoval {
    /// Set when the group lost its last admin and the earliest-joined
    /// remaining member took over.
    pub promoted: Option<Uuid>,
}

/// Read access to the authentication service's user records.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Returns the user only if it exists and is active.
    async fn find_active_user(&self, user_id: Uuid) -> RepositoryResult<Option<entities::User>>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_conversation(
        &self,
        conversation_id: Uuid,
    ) -> RepositoryResult<Option<entities::Conversation>>;

    async fn find_direct_conversation(
        &self,
        direct_key: &str,
    ) -> RepositoryResult<Option<entities::Conversation>>;

    /// Inserts the conversation and its members in one transaction.
    ///
    /// Returns `RepositoryError::Conflict` if a direct conversation with the same
    /// key already exists.
    async fn create_conversation(
        &self,
        conversation: entities::Conversation,
        members: &[(Uuid, Option<MemberRole>)],
    ) -> RepositoryResult<entities::Conversation>;

    async fn update_group(
        &self,
        conversation_id: Uuid,
        name: Option<String>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<entities::Conversation>;

    async fn find_membership(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> RepositoryResult<Option<entities::Membership>>;

    /// Members ordered by join time.
    async fn list_members(
        &self,
        conversation_id: Uuid,
    ) -> RepositoryResult<Vec<entities::Membership>>;

    /// Returns `false` if the user already was a member.
    async fn add_member(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: Option<MemberRole>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool>;

    /// Removes the membership, hands the admin role on if it was the last
    /// admin and deactivates the conversation once nobody is left. Returns
    /// `None` if the user was not a member.
    async fn remove_member(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<MemberRemoval>>;

    async fn set_hidden(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        hidden_at: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()>;

    /// Marks everything read and hides the conversation up to the newest
    /// message, in one statement. Returns the `hidden_at` that was stored.
    async fn hide(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> RepositoryResult<Option<DateTime<Utc>>>;

    /// Moves the member's last-read marker to the newest message of the conversation.
    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> RepositoryResult<()>;

    /// Messages newer than the member's marker, excluding the member's own.
    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> RepositoryResult<i64>;

    /// Visible, active conversations of a user, most recent activity first.
    async fn list_summaries(
        &self,
        user_id: Uuid,
    ) -> RepositoryResult<Vec<entities::ConversationSummary>>;

    async fn find_summary(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> RepositoryResult<Option<entities::ConversationSummary>>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Persists the message and bumps the conversation's activity timestamp
    /// atomically. Returns `None`, writing nothing, if the sender is not a
    /// member when the insert runs.
    async fn create_message(
        &self,
        message: entities::Message,
    ) -> RepositoryResult<Option<entities::Message>>;

    async fn find_message(&self, message_id: Uuid) -> RepositoryResult<Option<entities::Message>>;

    /// Newest first. `after` hides history older than a timestamp, `before` is a
    /// `(created_at, id)` cursor.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        after: Option<DateTime<Utc>>,
        before: Option<(DateTime<Utc>, Uuid)>,
        limit: u32,
    ) -> RepositoryResult<Vec<entities::Message>>;

    /// Clears content and image. Returns `None` if the message was already deleted.
    async fn soft_delete_message(
        &self,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<entities::Message>>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create_notification(
        &self,
        notification: entities::Notification,
    ) -> RepositoryResult<entities::Notification>;

    async fn find_notification(
        &self,
        notification_id: Uuid,
    ) -> RepositoryResult<Option<entities::Notification>>;

    /// Newest first, `before` is a `(created_at, id)` cursor.
    async fn list_notifications(
        &self,
        user_id: Uuid,
        before: Option<(DateTime<Utc>, Uuid)>,
        limit: u32,
    ) -> RepositoryResult<Vec<entities::Notification>>;

    /// Returns `false` if no notification with that id belongs to the user.
    async fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> RepositoryResult<bool>;

    async fn mark_all_read(&self, user_id: Uuid) -> RepositoryResult<u64>;

    async fn mark_received(&self, user_id: Uuid) -> RepositoryResult<u64>;

    async fn count_unread(&self, user_id: Uuid) -> RepositoryResult<i64>;

    async fn count_unreceived(&self, user_id: Uuid) -> RepositoryResult<i64>;
}
