//! Conversation registry: direct/group conversations, membership and unread counters.

use crate::config::Settings;
use crate::core::broadcast::{BroadcastGateway, Channel, deliver};
use crate::core::errors::{ChatError, ChatResult};
use crate::core::events::{
    CONVERSATION_ADDED, CONVERSATION_READ, CONVERSATION_REMOVED, ConversationReadPayload,
    ConversationRefPayload, MEMBERS_CHANGED, MembersChangedPayload,
};
use crate::core::traits::ConversationRegistry;
use crate::infrastructure::entities::{
    Conversation, ConversationSummary, MemberRole, Membership,
};
use crate::infrastructure::traits::{ConversationRepository, RepositoryError, UserDirectory};
use async_trait::async_trait;
use chrono::Utc;
use di::{Ref, injectable};
use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;

#[injectable(ConversationRegistry)]
pub struct ConversationRegistryService {
    repo: Ref<dyn ConversationRepository>,
    users: Ref<dyn UserDirectory>,
    gateway: Ref<dyn BroadcastGateway>,
    settings: Ref<Settings>,
}

impl ConversationRegistryService {
    pub fn new(
        repo: Ref<dyn ConversationRepository>,
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

    async fn require_active_user(&self, user_id: Uuid) -> ChatResult<()> {
        match self.users.find_active_user(user_id).await? {
            Some(_) => Ok(()),
            None => Err(ChatError::InvalidParticipant(user_id)),
        }
    }

    async fn require_conversation(&self, conversation_id: Uuid) -> ChatResult<Conversation> {
        self.repo
            .find_conversation(conversation_id)
            .await?
            .filter(|c| c.is_active)
            .ok_or(ChatError::NotFound("conversation"))
    }

    async fn require_group(&self, conversation_id: Uuid) -> ChatResult<Conversation> {
        let conversation = self.require_conversation(conversation_id).await?;
        if !conversation.is_group {
            return Err(ChatError::NotGroupConversation);
        }
        Ok(conversation)
    }

    async fn publish<T: Serialize + Sync>(&self, channel: Channel, event: &str, payload: &T) {
        deliver(
            &*self.gateway,
            &channel,
            event,
            payload,
            self.settings.publish_attempts,
        )
        .await;
    }

    async fn find_direct(&self, key: &str) -> ChatResult<Conversation> {
        self.repo
            .find_direct_conversation(key)
            .await?
            .ok_or(ChatError::NotFound("conversation"))
    }
}

fn clean_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl ConversationRegistry for ConversationRegistryService {
    async fn get_or_create_direct(
        &self,
        user_id: Uuid,
        other_user_id: Uuid,
    ) -> ChatResult<Conversation> {
        if user_id == other_user_id {
            return Err(ChatError::SelfConversation);
        }
        self.require_active_user(user_id).await?;
        self.require_active_user(other_user_id).await?;

        let key = Conversation::direct_key(user_id, other_user_id);

        let conversation = match self.repo.find_direct_conversation(&key).await? {
            Some(existing) => existing,
            None => {
                let now = Utc::now();
                let candidate = Conversation {
                    id: Uuid::new_v4(),
                    is_group: false,
                    name: None,
                    description: None,
                    creator_id: user_id,
                    direct_key: Some(key.clone()),
                    is_active: true,
                    created_at: now,
                    updated_at: now,
                };

                match self
                    .repo
                    .create_conversation(candidate, &[(user_id, None), (other_user_id, None)])
                    .await
                {
                    Ok(created) => {
                        info!(
                            "direct conversation {} created between {user_id} and {other_user_id}",
                            created.id
                        );
                        self.publish(
                            Channel::User(other_user_id),
                            CONVERSATION_ADDED,
                            &ConversationRefPayload::from(&created),
                        )
                        .await;
                        created
                    }
                    Err(RepositoryError::Conflict(_)) => {
                        // the other participant won the race
                        debug!("direct conversation {key} created concurrently, reusing it");
                        self.find_direct(&key).await?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        // Starting a conversation again undoes an earlier per-participant delete.
        if let Some(membership) = self.repo.find_membership(conversation.id, user_id).await? {
            if membership.hidden_at.is_some() {
                self.repo.set_hidden(conversation.id, user_id, None).await?;
            }
        }

        Ok(conversation)
    }

    async fn create_group(
        &self,
        creator_id: Uuid,
        member_ids: Vec<Uuid>,
        name: Option<String>,
        description: Option<String>,
    ) -> ChatResult<Conversation> {
        let mut members: Vec<Uuid> = vec![creator_id];
        for id in member_ids {
            if !members.contains(&id) {
                members.push(id);
            }
        }
        for id in &members {
            self.require_active_user(*id).await?;
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            is_group: true,
            name: clean_text(name),
            description: clean_text(description),
            creator_id,
            direct_key: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        let roles: Vec<(Uuid, Option<MemberRole>)> = members
            .iter()
            .map(|id| {
                let role = if *id == creator_id {
                    MemberRole::Admin
                } else {
                    MemberRole::Member
                };
                (*id, Some(role))
            })
            .collect();

        let created = self.repo.create_conversation(conversation, &roles).await?;
        info!(
            "group {} created by {creator_id} with {} members",
            created.id,
            members.len()
        );

        let payload = ConversationRefPayload::from(&created);
        for id in members.iter().filter(|id| **id != creator_id) {
            self.publish(Channel::User(*id), CONVERSATION_ADDED, &payload)
                .await;
        }

        Ok(created)
    }

    async fn update_group(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        name: Option<String>,
        description: Option<String>,
    ) -> ChatResult<Conversation> {
        self.require_group(conversation_id).await?;
        let membership = self
            .repo
            .find_membership(conversation_id, actor_id)
            .await?
            .ok_or(ChatError::NotMember)?;
        if !membership.is_admin() {
            return Err(ChatError::NotGroupAdmin);
        }

        let updated = self
            .repo
            .update_group(
                conversation_id,
                clean_text(name),
                clean_text(description),
                Utc::now(),
            )
            .await?;

        self.publish(
            Channel::Conversation(conversation_id),
            MEMBERS_CHANGED,
            &MembersChangedPayload {
                conversation_id,
                added: Vec::new(),
                removed: Vec::new(),
                actor_id,
                promoted_admin: None,
            },
        )
        .await;

        Ok(updated)
    }

    async fn add_member(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<bool> {
        let conversation = self.require_conversation(conversation_id).await?;
        self.repo
            .find_membership(conversation_id, actor_id)
            .await?
            .ok_or(ChatError::NotMember)?;

        if !conversation.is_group {
            return match self.repo.find_membership(conversation_id, user_id).await? {
                Some(_) => Err(ChatError::AlreadyMember),
                None => Err(ChatError::NotGroupConversation),
            };
        }

        self.require_active_user(user_id).await?;

        let added = self
            .repo
            .add_member(conversation_id, user_id, Some(MemberRole::Member), Utc::now())
            .await?;

        if added {
            info!("{actor_id} added {user_id} to group {conversation_id}");
            self.publish(
                Channel::Conversation(conversation_id),
                MEMBERS_CHANGED,
                &MembersChangedPayload {
                    conversation_id,
                    added: vec![user_id],
                    removed: Vec::new(),
                    actor_id,
                    promoted_admin: None,
                },
            )
            .await;
            self.publish(
                Channel::User(user_id),
                CONVERSATION_ADDED,
                &ConversationRefPayload::from(&conversation),
            )
            .await;
        } else {
            debug!("{user_id} already in group {conversation_id}, add is a no-op");
        }

        Ok(added)
    }

    async fn remove_member(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<()> {
        let conversation = self.require_group(conversation_id).await?;
        let actor = self
            .repo
            .find_membership(conversation_id, actor_id)
            .await?
            .ok_or(ChatError::NotMember)?;
        if actor_id != user_id && !actor.is_admin() {
            return Err(ChatError::NotGroupAdmin);
        }

        let removal = self
            .repo
            .remove_member(conversation_id, user_id, Utc::now())
            .await?
            .ok_or(ChatError::NotMember)?;
        info!("{actor_id} removed {user_id} from group {conversation_id}");
        if let Some(admin) = removal.promoted {
            info!("{admin} is now admin of group {conversation_id}");
        }

        // open streams of the removed user end before anything else is published
        let channel = Channel::Conversation(conversation_id);
        self.gateway.revoke(&channel, user_id).await;

        self.publish(
            channel,
            MEMBERS_CHANGED,
            &MembersChangedPayload {
                conversation_id,
                added: Vec::new(),
                removed: vec![user_id],
                actor_id,
                promoted_admin: removal.promoted,
            },
        )
        .await;
        self.publish(
            Channel::User(user_id),
            CONVERSATION_REMOVED,
            &ConversationRefPayload::from(&conversation),
        )
        .await;

        Ok(())
    }

    async fn list_members(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<Vec<Membership>> {
        self.require_member(conversation_id, user_id).await?;
        Ok(self.repo.list_members(conversation_id).await?)
    }

    async fn list_for_user(&self, user_id: Uuid) -> ChatResult<Vec<ConversationSummary>> {
        Ok(self.repo.list_summaries(user_id).await?)
    }

    async fn get_for_user(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<ConversationSummary> {
        self.require_conversation(conversation_id).await?;
        self.repo
            .find_summary(conversation_id, user_id)
            .await?
            .ok_or(ChatError::NotMember)
    }

    async fn hide_direct(&self, conversation_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        let (conversation, _) = self.require_member(conversation_id, user_id).await?;
        if conversation.is_group {
            return Err(ChatError::NotGroupConversation);
        }

        let hidden_at = self.repo.hide(conversation_id, user_id).await?;
        info!("{user_id} hid direct conversation {conversation_id} up to {hidden_at:?}");

        self.publish(
            Channel::User(user_id),
            CONVERSATION_REMOVED,
            &ConversationRefPayload::from(&conversation),
        )
        .await;
        Ok(())
    }

    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> ChatResult<i64> {
        self.require_member(conversation_id, user_id).await?;
        self.repo.mark_read(conversation_id, user_id).await?;
        let unread_count = self.repo.unread_count(conversation_id, user_id).await?;

        // other sessions of the same user clear their badge
        self.publish(
            Channel::User(user_id),
            CONVERSATION_READ,
            &ConversationReadPayload {
                conversation_id,
                unread_count,
            },
        )
        .await;

        Ok(unread_count)
    }

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> ChatResult<i64> {
        self.require_member(conversation_id, user_id).await?;
        Ok(self.repo.unread_count(conversation_id, user_id).await?)
    }

    async fn require_member(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<(Conversation, Membership)> {
        let conversation = self.require_conversation(conversation_id).await?;
        let membership = self
            .repo
            .find_membership(conversation_id, user_id)
            .await?
            .ok_or(ChatError::NotMember)?;
        Ok((conversation, membership))
    }
}
