//! Notification center: persisted social notifications with independent
//! read / received flags.

use crate::config::Settings;
use crate::core::broadcast::{BroadcastGateway, Channel, deliver};
use crate::core::errors::{ChatError, ChatResult};
use crate::core::events::{
    NOTIFICATION_COUNTS, NOTIFICATION_CREATED, NotificationCreatedPayload, NotificationPayload,
    truncate,
};
use crate::core::traits::{NotificationCenter, NotificationCounts};
use crate::infrastructure::entities::{Notification, NotificationKind};
use crate::infrastructure::traits::{NotificationRepository, UserDirectory};
use async_trait::async_trait;
use chrono::Utc;
use di::{Ref, injectable};
use log::{debug, info};
use sqlx::types::Json;
use uuid::Uuid;

/// Upper bound for denormalized context text (post excerpts, comment excerpts).
const CONTEXT_TEXT_LIMIT: usize = 140;

#[injectable(NotificationCenter)]
pub struct NotificationService {
    repo: Ref<dyn NotificationRepository>,
    users: Ref<dyn UserDirectory>,
    gateway: Ref<dyn BroadcastGateway>,
    settings: Ref<Settings>,
}

impl NotificationService {
    pub fn new(
        repo: Ref<dyn NotificationRepository>,
        users: Ref<dyn UserDirectory>,
        gateway: Ref<dyn BroadcastGateway>,
        settings: Ref<Settings>,
    ) -> Self {
        Self {
            repo,
            users,
            gateway,
            settings,
        }
    }

    async fn publish_counts(&self, user_id: Uuid) -> ChatResult<NotificationCounts> {
        let counts = self.counts(user_id).await?;
        deliver(
            &*self.gateway,
            &Channel::User(user_id),
            NOTIFICATION_COUNTS,
            &counts,
            self.settings.publish_attempts,
        )
        .await;
        Ok(counts)
    }
}

fn required(field: &str, value: String) -> ChatResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ChatError::InvalidNotification(format!(
            "`{field}` must not be empty"
        )));
    }
    Ok(truncate(value, CONTEXT_TEXT_LIMIT))
}

/// Checks the per-type required fields and trims context text.
pub fn validate_kind(kind: NotificationKind) -> ChatResult<NotificationKind> {
    Ok(match kind {
        NotificationKind::LikePost {
            post_id,
            post_preview,
        } => NotificationKind::LikePost {
            post_id,
            post_preview: required("post_preview", post_preview)?,
        },
        NotificationKind::Comment {
            post_id,
            post_preview,
            comment_preview,
        } => NotificationKind::Comment {
            post_id,
            post_preview: required("post_preview", post_preview)?,
            comment_preview: required("comment_preview", comment_preview)?,
        },
        NotificationKind::Follow => NotificationKind::Follow,
        NotificationKind::LikePet { pet_id, pet_name } => NotificationKind::LikePet {
            pet_id,
            pet_name: required("pet_name", pet_name)?,
        },
        NotificationKind::NewMessage {
            conversation_id,
            message_preview,
        } => NotificationKind::NewMessage {
            conversation_id,
            message_preview: required("message_preview", message_preview)?,
        },
    })
}

#[async_trait]
impl NotificationCenter for NotificationService {
    async fn emit(
        &self,
        recipient_id: Uuid,
        actor_id: Uuid,
        kind: NotificationKind,
    ) -> ChatResult<Option<Notification>> {
        if recipient_id == actor_id {
            debug!("skipping self notification for {actor_id}");
            return Ok(None);
        }
        let kind = validate_kind(kind)?;

        self.users
            .find_active_user(recipient_id)
            .await?
            .ok_or(ChatError::InvalidParticipant(recipient_id))?;
        let actor = self
            .users
            .find_active_user(actor_id)
            .await?
            .ok_or(ChatError::InvalidParticipant(actor_id))?;

        let notification = self
            .repo
            .create_notification(Notification {
                id: Uuid::now_v7(),
                user_id: recipient_id,
                kind: kind.type_name().to_owned(),
                actor_id,
                actor_name: actor.display_name,
                actor_avatar: actor.avatar_url,
                context: Json(kind),
                is_read: false,
                is_received: false,
                created_at: Utc::now(),
            })
            .await?;
        info!(
            "{} notification {} for {recipient_id} from {actor_id}",
            notification.kind, notification.id
        );

        let counts = self.counts(recipient_id).await?;
        deliver(
            &*self.gateway,
            &Channel::User(recipient_id),
            NOTIFICATION_CREATED,
            &NotificationCreatedPayload {
                notification: NotificationPayload::from(&notification),
                unread_count: counts.unread,
                unreceived_count: counts.unreceived,
            },
            self.settings.publish_attempts,
        )
        .await;

        Ok(Some(notification))
    }

    async fn list(
        &self,
        user_id: Uuid,
        before: Option<Uuid>,
        limit: Option<u32>,
    ) -> ChatResult<Vec<Notification>> {
        let cursor = match before {
            Some(id) => {
                let anchor = self
                    .repo
                    .find_notification(id)
                    .await?
                    .filter(|n| n.user_id == user_id)
                    .ok_or(ChatError::NotFound("notification"))?;
                Some((anchor.created_at, anchor.id))
            }
            None => None,
        };

        Ok(self
            .repo
            .list_notifications(user_id, cursor, self.settings.page_size(limit))
            .await?)
    }

    async fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> ChatResult<()> {
        if !self.repo.mark_read(user_id, notification_id).await? {
            return Err(ChatError::NotFound("notification"));
        }
        self.publish_counts(user_id).await?;
        Ok(())
    }

    async fn mark_all_read(&self, user_id: Uuid) -> ChatResult<u64> {
        let updated = self.repo.mark_all_read(user_id).await?;
        debug!("{user_id} read {updated} notifications");
        self.publish_counts(user_id).await?;
        Ok(updated)
    }

    async fn mark_received(&self, user_id: Uuid) -> ChatResult<u64> {
        let updated = self.repo.mark_received(user_id).await?;
        debug!("{user_id} received {updated} notifications");
        if updated > 0 {
            self.publish_counts(user_id).await?;
        }
        Ok(updated)
    }

    async fn unread_count(&self, user_id: Uuid) -> ChatResult<i64> {
        Ok(self.repo.count_unread(user_id).await?)
    }

    async fn unreceived_count(&self, user_id: Uuid) -> ChatResult<i64> {
        Ok(self.repo.count_unreceived(user_id).await?)
    }
}
