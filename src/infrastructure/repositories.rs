//! DB Repository abstractions

use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::entities::{
    Conversation, ConversationSummary, MemberRole, Membership, Message, Notification, User,
};
use crate::infrastructure::traits::{
    ConversationRepository, MemberRemoval, MessageRepository, NotificationRepository,
    RepositoryResult, UserDirectory,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use di::{Ref, injectable};
use log::debug;
use uuid::Uuid;

/// `cm` is the viewing member's row, `c` the conversation.
const SUMMARY_SELECT: &str = r#"
SELECT
    c.*,
    (SELECT COUNT(*) FROM conversation_members x WHERE x.conversation_id = c.id) AS member_count,
    (SELECT COUNT(*) FROM messages m
        WHERE m.conversation_id = c.id
          AND m.sender_id != cm.user_id
          AND (cm.last_read_at IS NULL
               OR m.created_at > cm.last_read_at
               OR (m.created_at = cm.last_read_at AND m.id > cm.last_read_message_id))
    ) AS unread_count,
    lm.id AS last_message_id,
    lm.sender_id AS last_message_sender_id,
    lm.content AS last_message_content,
    lm.image_url AS last_message_image_url,
    lm.created_at AS last_message_at,
    MAX(c.updated_at, COALESCE(lm.created_at, c.updated_at)) AS last_activity_at
FROM conversation_members cm
INNER JOIN conversations c ON c.id = cm.conversation_id
LEFT JOIN messages lm ON lm.id = (
    SELECT id FROM messages WHERE conversation_id = c.id ORDER BY created_at DESC, id DESC LIMIT 1
)
"#;

#[injectable(UserDirectory)]
pub struct DbUserDirectory {
    connection: Ref<DatabaseConnection>,
}

impl DbUserDirectory {
    pub fn new(connection: Ref<DatabaseConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl UserDirectory for DbUserDirectory {
    async fn find_active_user(&self, user_id: Uuid) -> RepositoryResult<Option<User>> {
        Ok(
            sqlx::query_as("SELECT * FROM users WHERE id = ? AND is_active = 1")
                .bind(user_id)
                .fetch_optional(&**self.connection)
                .await?,
        )
    }
}

#[injectable(ConversationRepository)]
pub struct DbConversationRepository {
    connection: Ref<DatabaseConnection>,
}

impl DbConversationRepository {
    pub fn new(connection: Ref<DatabaseConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ConversationRepository for DbConversationRepository {
    async fn find_conversation(&self, conversation_id: Uuid) -> RepositoryResult<Option<Conversation>> {
        Ok(sqlx::query_as("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&**self.connection)
            .await?)
    }

    async fn find_direct_conversation(
        &self,
        direct_key: &str,
    ) -> RepositoryResult<Option<Conversation>> {
        Ok(sqlx::query_as("SELECT * FROM conversations WHERE direct_key = ?")
            .bind(direct_key)
            .fetch_optional(&**self.connection)
            .await?)
    }

    async fn create_conversation(
        &self,
        conversation: Conversation,
        members: &[(Uuid, Option<MemberRole>)],
    ) -> RepositoryResult<Conversation> {
        let mut tx = self.connection.begin().await?;

        let created: Conversation = sqlx::query_as(
            "INSERT INTO conversations (id, is_group, name, description, creator_id, direct_key, is_active, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(conversation.id)
        .bind(conversation.is_group)
        .bind(conversation.name)
        .bind(conversation.description)
        .bind(conversation.creator_id)
        .bind(conversation.direct_key)
        .bind(conversation.is_active)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        for (user_id, role) in members {
            sqlx::query(
                "INSERT INTO conversation_members (conversation_id, user_id, role, joined_at) VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(created.id)
            .bind(*user_id)
            .bind(*role)
            .bind(created.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "created conversation {} with {} members",
            created.id,
            members.len()
        );

        Ok(created)
    }

    async fn update_group(
        &self,
        conversation_id: Uuid,
        name: Option<String>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Conversation> {
        Ok(sqlx::query_as(
            "UPDATE conversations SET name = COALESCE(?, name), description = COALESCE(?, description), updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(name)
        .bind(description)
        .bind(now)
        .bind(conversation_id)
        .fetch_one(&**self.connection)
        .await?)
    }

    async fn find_membership(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> RepositoryResult<Option<Membership>> {
        Ok(sqlx::query_as(
            "SELECT * FROM conversation_members WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&**self.connection)
        .await?)
    }

    async fn list_members(&self, conversation_id: Uuid) -> RepositoryResult<Vec<Membership>> {
        Ok(sqlx::query_as(
            "SELECT * FROM conversation_members WHERE conversation_id = ? ORDER BY joined_at ASC, rowid ASC",
        )
        .bind(conversation_id)
        .fetch_all(&**self.connection)
        .await?)
    }

    async fn add_member(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: Option<MemberRole>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let mut tx = self.connection.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id, role, joined_at) VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(role)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if inserted {
            sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn remove_member(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<MemberRemoval>> {
        let mut tx = self.connection.begin().await?;

        let removed = sqlx::query(
            "DELETE FROM conversation_members WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        if !removed {
            return Ok(None);
        }

        // a group never stays without an admin while it has members
        let promoted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE conversation_members SET role = 'admin'
            WHERE conversation_id = ?
              AND user_id = (
                  SELECT user_id FROM conversation_members
                  WHERE conversation_id = ?
                  ORDER BY joined_at ASC, rowid ASC
                  LIMIT 1
              )
              AND role IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM conversation_members
                  WHERE conversation_id = ? AND role = 'admin'
              )
            RETURNING user_id
            "#,
        )
        .bind(conversation_id)
        .bind(conversation_id)
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversations SET updated_at = ?, is_active = EXISTS (SELECT 1 FROM conversation_members WHERE conversation_id = ?) WHERE id = ?",
        )
        .bind(now)
        .bind(conversation_id)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(MemberRemoval {
            promoted: promoted.map(|(id,)| id),
        }))
    }

    async fn set_hidden(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        hidden_at: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()> {
        sqlx::query(
            "UPDATE conversation_members SET hidden_at = ? WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(hidden_at)
        .bind(conversation_id)
        .bind(user_id)
        .execute(&**self.connection)
        .await?;
        Ok(())
    }

    async fn hide(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> RepositoryResult<Option<DateTime<Utc>>> {
        // hidden_at is the read marker itself, so any message committed later
        // is both unread and newer than hidden_at. Without messages the
        // conversation's creation time stands in.
        let hidden: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            r#"
            UPDATE conversation_members
            SET last_read_at = COALESCE(latest.created_at, conversation_members.last_read_at),
                last_read_message_id = COALESCE(latest.id, conversation_members.last_read_message_id),
                hidden_at = COALESCE(latest.created_at, c.created_at)
            FROM conversations AS c
            LEFT JOIN (
                SELECT conversation_id, created_at, id FROM messages
                WHERE conversation_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT 1
            ) AS latest ON latest.conversation_id = c.id
            WHERE c.id = conversation_members.conversation_id
              AND conversation_members.conversation_id = ?
              AND conversation_members.user_id = ?
            RETURNING hidden_at
            "#,
        )
        .bind(conversation_id)
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&**self.connection)
        .await?;
        Ok(hidden.and_then(|(hidden_at,)| hidden_at))
    }

    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> RepositoryResult<()> {
        // Single statement: the marker lands on whatever message is newest at
        // execution time, never on a message that is not yet committed.
        sqlx::query(
            r#"
            UPDATE conversation_members
            SET last_read_at = latest.created_at, last_read_message_id = latest.id
            FROM (
                SELECT created_at, id FROM messages
                WHERE conversation_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT 1
            ) AS latest
            WHERE conversation_members.conversation_id = ? AND conversation_members.user_id = ?
            "#,
        )
        .bind(conversation_id)
        .bind(conversation_id)
        .bind(user_id)
        .execute(&**self.connection)
        .await?;
        Ok(())
    }

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> RepositoryResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages m
            INNER JOIN conversation_members cm
                ON cm.conversation_id = m.conversation_id AND cm.user_id = ?
            WHERE m.conversation_id = ?
              AND m.sender_id != cm.user_id
              AND (cm.last_read_at IS NULL
                   OR m.created_at > cm.last_read_at
                   OR (m.created_at = cm.last_read_at AND m.id > cm.last_read_message_id))
            "#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .fetch_one(&**self.connection)
        .await?;
        Ok(count)
    }

    async fn list_summaries(&self, user_id: Uuid) -> RepositoryResult<Vec<ConversationSummary>> {
        let query = format!(
            "{SUMMARY_SELECT} WHERE cm.user_id = ? AND c.is_active = 1 AND (cm.hidden_at IS NULL OR lm.created_at > cm.hidden_at) ORDER BY last_activity_at DESC, c.id DESC"
        );
        Ok(sqlx::query_as(&query)
            .bind(user_id)
            .fetch_all(&**self.connection)
            .await?)
    }

    async fn find_summary(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> RepositoryResult<Option<ConversationSummary>> {
        let query = format!("{SUMMARY_SELECT} WHERE cm.user_id = ? AND c.id = ?");
        Ok(sqlx::query_as(&query)
            .bind(user_id)
            .bind(conversation_id)
            .fetch_optional(&**self.connection)
            .await?)
    }
}

#[injectable(MessageRepository)]
pub struct DbMessageRepository {
    connection: Ref<DatabaseConnection>,
}

impl DbMessageRepository {
    pub fn new(connection: Ref<DatabaseConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn create_message(&self, mut message: Message) -> RepositoryResult<Option<Message>> {
        let mut tx = self.connection.begin().await?;

        // Take the write lock before reading the newest timestamp so that
        // created_at order within a conversation matches commit order.
        sqlx::query("UPDATE conversations SET updated_at = updated_at WHERE id = ?")
            .bind(message.conversation_id)
            .execute(&mut *tx)
            .await?;

        let latest: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT created_at FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(message.conversation_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((latest,)) = latest {
            if message.created_at <= latest {
                message.created_at = latest + Duration::microseconds(1);
            }
        }

        // Membership is re-checked under the write lock: a removal that
        // committed after the caller's check leaves nothing behind.
        let created: Option<Message> = sqlx::query_as(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, content, image_url, created_at)
            SELECT ?, ?, ?, ?, ?, ?
            WHERE EXISTS (
                SELECT 1 FROM conversation_members WHERE conversation_id = ? AND user_id = ?
            )
            RETURNING *
            "#,
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(message.content)
        .bind(message.image_url)
        .bind(message.created_at)
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(created) = created else {
            debug!(
                "{} is no longer a member of {}, message dropped",
                message.sender_id, message.conversation_id
            );
            return Ok(None);
        };

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(created.created_at)
            .bind(created.conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(created))
    }

    async fn find_message(&self, message_id: Uuid) -> RepositoryResult<Option<Message>> {
        Ok(sqlx::query_as("SELECT * FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&**self.connection)
            .await?)
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        after: Option<DateTime<Utc>>,
        before: Option<(DateTime<Utc>, Uuid)>,
        limit: u32,
    ) -> RepositoryResult<Vec<Message>> {
        let (before_at, before_id) = before.unzip();
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = ?
              AND (? IS NULL OR created_at > ?)
              AND (? IS NULL OR (created_at, id) < (?, ?))
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(conversation_id)
        .bind(after)
        .bind(after)
        .bind(before_at)
        .bind(before_at)
        .bind(before_id)
        .bind(limit)
        .fetch_all(&**self.connection)
        .await?)
    }

    async fn soft_delete_message(
        &self,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<Message>> {
        Ok(sqlx::query_as(
            "UPDATE messages SET content = NULL, image_url = NULL, deleted_at = ? WHERE id = ? AND deleted_at IS NULL RETURNING *",
        )
        .bind(now)
        .bind(message_id)
        .fetch_optional(&**self.connection)
        .await?)
    }
}

#[injectable(NotificationRepository)]
pub struct DbNotificationRepository {
    connection: Ref<DatabaseConnection>,
}

impl DbNotificationRepository {
    pub fn new(connection: Ref<DatabaseConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl NotificationRepository for DbNotificationRepository {
    async fn create_notification(&self, notification: Notification) -> RepositoryResult<Notification> {
        Ok(sqlx::query_as(
            "INSERT INTO notifications (id, user_id, kind, actor_id, actor_name, actor_avatar, context, is_read, is_received, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(notification.id)
        .bind(notification.user_id)
        .bind(notification.kind)
        .bind(notification.actor_id)
        .bind(notification.actor_name)
        .bind(notification.actor_avatar)
        .bind(notification.context)
        .bind(notification.is_read)
        .bind(notification.is_received)
        .bind(notification.created_at)
        .fetch_one(&**self.connection)
        .await?)
    }

    async fn find_notification(&self, notification_id: Uuid) -> RepositoryResult<Option<Notification>> {
        Ok(sqlx::query_as("SELECT * FROM notifications WHERE id = ?")
            .bind(notification_id)
            .fetch_optional(&**self.connection)
            .await?)
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        before: Option<(DateTime<Utc>, Uuid)>,
        limit: u32,
    ) -> RepositoryResult<Vec<Notification>> {
        let (before_at, before_id) = before.unzip();
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE user_id = ?
              AND (? IS NULL OR (created_at, id) < (?, ?))
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(before_at)
        .bind(before_at)
        .bind(before_id)
        .bind(limit)
        .fetch_all(&**self.connection)
        .await?)
    }

    async fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> RepositoryResult<bool> {
        let result = sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ? AND user_id = ?")
            .bind(notification_id)
            .bind(user_id)
            .execute(&**self.connection)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_read(&self, user_id: Uuid) -> RepositoryResult<u64> {
        let result =
            sqlx::query("UPDATE notifications SET is_read = 1 WHERE user_id = ? AND is_read = 0")
                .bind(user_id)
                .execute(&**self.connection)
                .await?;
        Ok(result.rows_affected())
    }

    async fn mark_received(&self, user_id: Uuid) -> RepositoryResult<u64> {
        let result = sqlx::query(
            "UPDATE notifications SET is_received = 1 WHERE user_id = ? AND is_received = 0",
        )
        .bind(user_id)
        .execute(&**self.connection)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_unread(&self, user_id: Uuid) -> RepositoryResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_read = 0")
                .bind(user_id)
                .fetch_one(&**self.connection)
                .await?;
        Ok(count)
    }

    async fn count_unreceived(&self, user_id: Uuid) -> RepositoryResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_received = 0",
        )
        .bind(user_id)
        .fetch_one(&**self.connection)
        .await?;
        Ok(count)
    }
}
