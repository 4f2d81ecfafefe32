//! Event names and payloads pushed through the broadcast gateway

use crate::infrastructure::entities;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub const MESSAGE_SENT: &str = "message.sent";
pub const MESSAGE_DELETED: &str = "message.deleted";
pub const CONVERSATION_MESSAGE: &str = "conversation.message";
pub const CONVERSATION_ADDED: &str = "conversation.added";
pub const CONVERSATION_REMOVED: &str = "conversation.removed";
pub const CONVERSATION_READ: &str = "conversation.read";
pub const MEMBERS_CHANGED: &str = "conversation.members_changed";
pub const NOTIFICATION_CREATED: &str = "notification.created";
pub const NOTIFICATION_COUNTS: &str = "notification.counts";

pub const IMAGE_PREVIEW: &str = "[image]";

/// Full message as delivered on a conversation channel. `sender_id` lets the
/// sender's own sessions drop a message they already rendered optimistically.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl From<&entities::Message> for MessagePayload {
    fn from(message: &entities::Message) -> Self {
        MessagePayload {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            image_url: message.image_url.clone(),
            created_at: message.created_at,
            is_deleted: message.deleted_at.is_some(),
        }
    }
}

/// Recipient-scoped summary sent on a member's private channel.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMessagePayload {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub preview: String,
    pub unread_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationRefPayload {
    pub conversation_id: Uuid,
    pub is_group: bool,
    pub name: Option<String>,
}

impl From<&entities::Conversation> for ConversationRefPayload {
    fn from(conversation: &entities::Conversation) -> Self {
        ConversationRefPayload {
            conversation_id: conversation.id,
            is_group: conversation.is_group,
            name: conversation.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationReadPayload {
    pub conversation_id: Uuid,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MembersChangedPayload {
    pub conversation_id: Uuid,
    pub added: Vec<Uuid>,
    pub removed: Vec<Uuid>,
    pub actor_id: Uuid,
    /// Member that inherited the admin role from a leaving admin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_admin: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub id: Uuid,
    pub user_id: Uuid,
    pub actor_id: Uuid,
    pub actor_name: String,
    pub actor_avatar: Option<String>,
    #[serde(flatten)]
    pub kind: entities::NotificationKind,
    pub is_read: bool,
    pub is_received: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&entities::Notification> for NotificationPayload {
    fn from(notification: &entities::Notification) -> Self {
        NotificationPayload {
            id: notification.id,
            user_id: notification.user_id,
            actor_id: notification.actor_id,
            actor_name: notification.actor_name.clone(),
            actor_avatar: notification.actor_avatar.clone(),
            kind: notification.context.0.clone(),
            is_read: notification.is_read,
            is_received: notification.is_received,
            created_at: notification.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationCreatedPayload {
    pub notification: NotificationPayload,
    pub unread_count: i64,
    pub unreceived_count: i64,
}

/// Short text for list rows and private events.
///
/// Cut to `max_chars` characters with an ellipsis; `[image]` for messages that
/// only carry an image.
pub fn message_preview(
    content: Option<&str>,
    image_url: Option<&str>,
    max_chars: usize,
) -> String {
    match content.map(str::trim).filter(|c| !c.is_empty()) {
        Some(text) => truncate(text, max_chars),
        None if image_url.is_some() => IMAGE_PREVIEW.to_owned(),
        None => String::new(),
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", text[..cut].trim_end()),
        None => text.to_owned(),
    }
}
