//! Message dispatcher: persist first, then fan out.

use crate::config::Settings;
use crate::core::broadcast::{BroadcastGateway, Channel, deliver};
use crate::core::errors::{ChatError, ChatResult};
use crate::core::events::{
    CONVERSATION_MESSAGE, ConversationMessagePayload, MESSAGE_DELETED, MESSAGE_SENT,
    MessagePayload, message_preview,
};
use crate::core::presence::PresenceTracker;
use crate::core::traits::{ConversationRegistry, MessageDispatcher, NotificationCenter};
use crate::infrastructure::entities::{Message, NotificationKind};
use crate::infrastructure::traits::MessageRepository;
use async_trait::async_trait;
use chrono::Utc;
use di::{Ref, injectable};
use log::{debug, info, warn};
use uuid::Uuid;

#[injectable(MessageDispatcher)]
pub struct MessageDispatcherService {
    registry: Ref<dyn ConversationRegistry>,
    messages: Ref<dyn MessageRepository>,
    notifications: Ref<dyn NotificationCenter>,
    gateway: Ref<dyn BroadcastGateway>,
    presence: Ref<PresenceTracker>,
    settings: Ref<Settings>,
}

impl MessageDispatcherService {
    pub fn new(
        registry: Ref<dyn ConversationRegistry>,
        messages: Ref<dyn MessageRepository>,
        notifications: Ref<dyn NotificationCenter>,
        gateway: Ref<dyn BroadcastGateway>,
        presence: Ref<PresenceTracker>,
        settings: Ref<Settings>,
    ) -> Self {
        Self {
            registry,
            messages,
            notifications,
            gateway,
            presence,
            settings,
        }
    }

    /// Pushes the recipient-scoped summary to every member but the sender.
    ///
    /// Runs after the message is committed, so nothing in here may fail the send.
    async fn notify_members(&self, message: &Message) {
        let members = match self
            .registry
            .list_members(message.conversation_id, message.sender_id)
            .await
        {
            Ok(members) => members,
            Err(e) => {
                warn!(
                    "message {} stored but member fan-out skipped: {e}",
                    message.id
                );
                return;
            }
        };

        let preview = message_preview(
            message.content.as_deref(),
            message.image_url.as_deref(),
            self.settings.message_preview_length,
        );

        for member in members.iter().filter(|m| m.user_id != message.sender_id) {
            let unread_count = match self
                .registry
                .unread_count(message.conversation_id, member.user_id)
                .await
            {
                Ok(count) => count,
                Err(e) => {
                    warn!("unread count for {} unavailable: {e}", member.user_id);
                    continue;
                }
            };

            deliver(
                &*self.gateway,
                &Channel::User(member.user_id),
                CONVERSATION_MESSAGE,
                &ConversationMessagePayload {
                    conversation_id: message.conversation_id,
                    message_id: message.id,
                    sender_id: message.sender_id,
                    preview: preview.clone(),
                    unread_count,
                    created_at: message.created_at,
                },
                self.settings.publish_attempts,
            )
            .await;

            // One notification per unread burst, and only for users who are not
            // connected to see the live event.
            if unread_count == 1 && !self.presence.is_online(member.user_id).await {
                let kind = NotificationKind::NewMessage {
                    conversation_id: message.conversation_id,
                    message_preview: preview.clone(),
                };
                if let Err(e) = self
                    .notifications
                    .emit(member.user_id, message.sender_id, kind)
                    .await
                {
                    warn!(
                        "new-message notification for {} failed: {e}",
                        member.user_id
                    );
                }
            }
        }
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl MessageDispatcher for MessageDispatcherService {
    async fn send(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: Option<String>,
        image_url: Option<String>,
    ) -> ChatResult<Message> {
        self.registry
            .require_member(conversation_id, sender_id)
            .await?;

        let content = clean(content);
        let image_url = clean(image_url);
        if content.is_none() && image_url.is_none() {
            return Err(ChatError::EmptyMessage);
        }
        let max = self.settings.max_message_length;
        if content.as_ref().is_some_and(|c| c.chars().count() > max) {
            return Err(ChatError::MessageTooLong { max });
        }

        let message = self
            .messages
            .create_message(Message {
                id: Uuid::now_v7(),
                conversation_id,
                sender_id,
                content,
                image_url,
                created_at: Utc::now(),
                deleted_at: None,
            })
            .await?
            .ok_or(ChatError::NotMember)?;
        debug!(
            "message {} stored in conversation {conversation_id}",
            message.id
        );

        deliver(
            &*self.gateway,
            &Channel::Conversation(conversation_id),
            MESSAGE_SENT,
            &MessagePayload::from(&message),
            self.settings.publish_attempts,
        )
        .await;

        self.notify_members(&message).await;

        Ok(message)
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        before: Option<Uuid>,
        limit: Option<u32>,
    ) -> ChatResult<Vec<Message>> {
        let (_, membership) = self
            .registry
            .require_member(conversation_id, user_id)
            .await?;

        let cursor = match before {
            Some(id) => {
                let anchor = self
                    .messages
                    .find_message(id)
                    .await?
                    .filter(|m| m.conversation_id == conversation_id)
                    .ok_or(ChatError::NotFound("message"))?;
                Some((anchor.created_at, anchor.id))
            }
            None => None,
        };

        let mut page = self
            .messages
            .list_messages(
                conversation_id,
                membership.hidden_at,
                cursor,
                self.settings.page_size(limit),
            )
            .await?;
        page.reverse();
        Ok(page)
    }

    async fn delete_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<Message> {
        self.registry
            .require_member(conversation_id, user_id)
            .await?;

        let message = self
            .messages
            .find_message(message_id)
            .await?
            .filter(|m| m.conversation_id == conversation_id)
            .ok_or(ChatError::NotFound("message"))?;
        if message.sender_id != user_id {
            return Err(ChatError::NotSender);
        }

        match self
            .messages
            .soft_delete_message(message_id, Utc::now())
            .await?
        {
            Some(deleted) => {
                info!("message {message_id} deleted by {user_id}");
                deliver(
                    &*self.gateway,
                    &Channel::Conversation(conversation_id),
                    MESSAGE_DELETED,
                    &MessagePayload::from(&deleted),
                    self.settings.publish_attempts,
                )
                .await;
                Ok(deleted)
            }
            // already deleted
            None => Ok(message),
        }
    }
}
