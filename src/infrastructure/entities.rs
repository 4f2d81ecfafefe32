//! Database entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

/// Row of the externally owned `users` table.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub is_group: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    pub creator_id: Uuid,
    pub direct_key: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Key shared by both orderings of a pair, so `(a, b)` and `(b, a)` collide
    /// on the unique index.
    pub fn direct_key(a: Uuid, b: Uuid) -> String {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        format!("{low}:{high}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, FromRow)]
pub struct Membership {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: Option<MemberRole>,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub last_read_message_id: Option<Uuid>,
    pub hidden_at: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn is_admin(&self) -> bool {
        self.role == Some(MemberRole::Admin)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A conversation seen from one member, with its derived counters.
#[derive(Debug, Clone, FromRow)]
pub struct ConversationSummary {
    #[sqlx(flatten)]
    pub conversation: Conversation,
    pub member_count: i64,
    pub unread_count: i64,
    pub last_message_id: Option<Uuid>,
    pub last_message_sender_id: Option<Uuid>,
    pub last_message_content: Option<String>,
    pub last_message_image_url: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
}

/// Context captured when a notification is created. The variant is the
/// notification type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NotificationKind {
    LikePost {
        post_id: Uuid,
        post_preview: String,
    },
    Comment {
        post_id: Uuid,
        post_preview: String,
        comment_preview: String,
    },
    Follow,
    LikePet {
        pet_id: Uuid,
        pet_name: String,
    },
    NewMessage {
        conversation_id: Uuid,
        message_preview: String,
    },
}

impl NotificationKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NotificationKind::LikePost { .. } => "like-post",
            NotificationKind::Comment { .. } => "comment",
            NotificationKind::Follow => "follow",
            NotificationKind::LikePet { .. } => "like-pet",
            NotificationKind::NewMessage { .. } => "new-message",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub actor_id: Uuid,
    pub actor_name: String,
    pub actor_avatar: Option<String>,
    pub context: Json<NotificationKind>,
    pub is_read: bool,
    pub is_received: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_key_ignores_argument_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(Conversation::direct_key(a, b), Conversation::direct_key(b, a));
        assert_ne!(Conversation::direct_key(a, b), Conversation::direct_key(a, a));
    }

    #[test]
    fn notification_kind_is_tagged_by_type() {
        let kind = NotificationKind::LikePet {
            pet_id: Uuid::nil(),
            pet_name: "Biscuit".to_owned(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "like-pet");
        assert_eq!(json["pet_name"], "Biscuit");
        assert_eq!(kind.type_name(), "like-pet");

        let follow: NotificationKind = serde_json::from_str(r#"{"type":"follow"}"#).unwrap();
        assert_eq!(follow, NotificationKind::Follow);
    }
}
