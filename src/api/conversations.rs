//! Conversations endpoints

use crate::api::conversations::schemas::{
    AddMember, ConversationList, CreateDirect, CreateGroup, CreateMessage, MemberList,
    MessagesList, MessagesQuery, ReadReceipt, UpdateGroup,
};
use crate::api::{ApiResult, ExtractUser};
use crate::config::Settings;
use crate::core::errors::ChatError;
use crate::core::traits::{ConversationRegistry, MessageDispatcher};
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use di::Ref;
use di_axum::Inject;
use uuid::Uuid;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_conversations))
        .route("/direct", post(open_direct))
        .route("/groups", post(create_group))
        .route(
            "/:id",
            get(get_conversation)
                .patch(update_group)
                .delete(delete_conversation),
        )
        .route("/:id/members", get(list_members).post(add_member))
        .route("/:id/members/:user_id", delete(remove_member))
        .route("/:id/read", post(mark_read))
        .route("/:id/messages", get(list_messages).post(send_message))
        .route("/:id/messages/:message_id", delete(delete_message))
}

async fn summary(
    registry: &Ref<dyn ConversationRegistry>,
    settings: &Settings,
    conversation_id: Uuid,
    current_user: Uuid,
) -> ApiResult<schemas::Conversation> {
    let summary = registry.get_for_user(conversation_id, current_user).await?;
    Ok(schemas::Conversation::from_summary(
        summary,
        settings.message_preview_length,
    ))
}

async fn list_conversations(
    Inject(registry): Inject<dyn ConversationRegistry>,
    Inject(settings): Inject<Settings>,
    ExtractUser(current_user): ExtractUser,
) -> ApiResult<Json<ConversationList>> {
    let conversations = registry.list_for_user(current_user).await?;

    Ok(Json(ConversationList {
        conversations: conversations
            .into_iter()
            .map(|c| schemas::Conversation::from_summary(c, settings.message_preview_length))
            .collect(),
    }))
}

async fn open_direct(
    Inject(registry): Inject<dyn ConversationRegistry>,
    Inject(settings): Inject<Settings>,
    ExtractUser(current_user): ExtractUser,
    Json(body): Json<CreateDirect>,
) -> ApiResult<Json<schemas::Conversation>> {
    let conversation = registry
        .get_or_create_direct(current_user, body.user_id)
        .await?;

    Ok(Json(
        summary(&registry, &settings, conversation.id, current_user).await?,
    ))
}

async fn create_group(
    Inject(registry): Inject<dyn ConversationRegistry>,
    Inject(settings): Inject<Settings>,
    ExtractUser(current_user): ExtractUser,
    Json(body): Json<CreateGroup>,
) -> ApiResult<(StatusCode, Json<schemas::Conversation>)> {
    let conversation = registry
        .create_group(current_user, body.member_ids, body.name, body.description)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(summary(&registry, &settings, conversation.id, current_user).await?),
    ))
}

async fn get_conversation(
    Inject(registry): Inject<dyn ConversationRegistry>,
    Inject(settings): Inject<Settings>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<schemas::Conversation>> {
    Ok(Json(
        summary(&registry, &settings, conversation_id, current_user).await?,
    ))
}

async fn update_group(
    Inject(registry): Inject<dyn ConversationRegistry>,
    Inject(settings): Inject<Settings>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<UpdateGroup>,
) -> ApiResult<Json<schemas::Conversation>> {
    registry
        .update_group(conversation_id, current_user, body.name, body.description)
        .await?;

    Ok(Json(
        summary(&registry, &settings, conversation_id, current_user).await?,
    ))
}

/// Hides a direct conversation for the caller, or leaves a group.
async fn delete_conversation(
    Inject(registry): Inject<dyn ConversationRegistry>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    match registry.hide_direct(conversation_id, current_user).await {
        Ok(()) => {}
        Err(ChatError::NotGroupConversation) => {
            registry
                .remove_member(conversation_id, current_user, current_user)
                .await?
        }
        Err(e) => return Err(e.into()),
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn list_members(
    Inject(registry): Inject<dyn ConversationRegistry>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<MemberList>> {
    let members = registry.list_members(conversation_id, current_user).await?;

    Ok(Json(MemberList {
        members: members.into_iter().map(schemas::Member::from).collect(),
    }))
}

async fn add_member(
    Inject(registry): Inject<dyn ConversationRegistry>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<AddMember>,
) -> ApiResult<Json<schemas::MemberAdded>> {
    let added = registry
        .add_member(conversation_id, current_user, body.user_id)
        .await?;

    Ok(Json(schemas::MemberAdded {
        user_id: body.user_id,
        added,
    }))
}

async fn remove_member(
    Inject(registry): Inject<dyn ConversationRegistry>,
    ExtractUser(current_user): ExtractUser,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    registry
        .remove_member(conversation_id, current_user, user_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn mark_read(
    Inject(registry): Inject<dyn ConversationRegistry>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<ReadReceipt>> {
    let unread_count = registry.mark_read(conversation_id, current_user).await?;

    Ok(Json(ReadReceipt {
        conversation_id,
        unread_count,
    }))
}

async fn list_messages(
    Inject(dispatcher): Inject<dyn MessageDispatcher>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<MessagesList>> {
    let messages = dispatcher
        .list_messages(conversation_id, current_user, query.before, query.limit)
        .await?;

    Ok(Json(MessagesList {
        messages: messages.into_iter().map(schemas::Message::from).collect(),
    }))
}

async fn send_message(
    Inject(dispatcher): Inject<dyn MessageDispatcher>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
    Json(message): Json<CreateMessage>,
) -> ApiResult<(StatusCode, Json<schemas::Message>)> {
    let message = dispatcher
        .send(conversation_id, current_user, message.content, message.image_url)
        .await?;

    Ok((StatusCode::CREATED, Json(schemas::Message::from(message))))
}

async fn delete_message(
    Inject(dispatcher): Inject<dyn MessageDispatcher>,
    ExtractUser(current_user): ExtractUser,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<schemas::Message>> {
    let message = dispatcher
        .delete_message(conversation_id, message_id, current_user)
        .await?;

    Ok(Json(schemas::Message::from(message)))
}

pub mod schemas {
    use crate::core::events::message_preview;
    use crate::infrastructure::entities;
    use crate::infrastructure::entities::MemberRole;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Deserialize, Debug)]
    pub struct CreateDirect {
        pub user_id: Uuid,
    }

    #[derive(Deserialize, Debug)]
    pub struct CreateGroup {
        #[serde(default)]
        pub member_ids: Vec<Uuid>,
        pub name: Option<String>,
        pub description: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    pub struct UpdateGroup {
        pub name: Option<String>,
        pub description: Option<String>,
    }

    #[derive(Serialize, Debug)]
    pub struct LastMessage {
        pub id: Uuid,
        pub sender_id: Uuid,
        pub preview: String,
        pub created_at: DateTime<Utc>,
    }

    #[derive(Serialize, Debug)]
    pub struct Conversation {
        pub id: Uuid,
        pub is_group: bool,
        pub name: Option<String>,
        pub description: Option<String>,
        pub creator_id: Uuid,
        pub member_count: i64,
        pub unread_count: i64,
        pub last_message: Option<LastMessage>,
        pub created_at: DateTime<Utc>,
        pub last_activity_at: DateTime<Utc>,
    }

    impl Conversation {
        pub fn from_summary(summary: entities::ConversationSummary, preview_length: usize) -> Self {
            let last_message = match (
                summary.last_message_id,
                summary.last_message_sender_id,
                summary.last_message_at,
            ) {
                (Some(id), Some(sender_id), Some(created_at)) => Some(LastMessage {
                    id,
                    sender_id,
                    preview: message_preview(
                        summary.last_message_content.as_deref(),
                        summary.last_message_image_url.as_deref(),
                        preview_length,
                    ),
                    created_at,
                }),
                _ => None,
            };

            let conversation = summary.conversation;
            Conversation {
                id: conversation.id,
                is_group: conversation.is_group,
                name: conversation.name,
                description: conversation.description,
                creator_id: conversation.creator_id,
                member_count: summary.member_count,
                unread_count: summary.unread_count,
                last_message,
                created_at: conversation.created_at,
                last_activity_at: summary.last_activity_at,
            }
        }
    }

    #[derive(Serialize, Debug)]
    pub struct ConversationList {
        pub conversations: Vec<Conversation>,
    }

    #[derive(Deserialize, Debug)]
    pub struct AddMember {
        pub user_id: Uuid,
    }

    #[derive(Serialize, Debug)]
    pub struct MemberAdded {
        pub user_id: Uuid,
        pub added: bool,
    }

    #[derive(Serialize, Debug)]
    pub struct Member {
        pub user_id: Uuid,
        pub role: Option<MemberRole>,
        pub joined_at: DateTime<Utc>,
    }

    impl From<entities::Membership> for Member {
        fn from(membership: entities::Membership) -> Self {
            Member {
                user_id: membership.user_id,
                role: membership.role,
                joined_at: membership.joined_at,
            }
        }
    }

    #[derive(Serialize, Debug)]
    pub struct MemberList {
        pub members: Vec<Member>,
    }

    #[derive(Serialize, Debug)]
    pub struct ReadReceipt {
        pub conversation_id: Uuid,
        pub unread_count: i64,
    }

    #[derive(Deserialize, Debug, Default)]
    pub struct MessagesQuery {
        pub before: Option<Uuid>,
        pub limit: Option<u32>,
    }

    #[derive(Serialize, Debug, Default)]
    pub struct MessagesList {
        pub messages: Vec<Message>,
    }

    #[derive(Serialize, Debug)]
    pub struct Message {
        pub id: Uuid,
        pub conversation_id: Uuid,
        pub sender_id: Uuid,
        pub content: Option<String>,
        pub image_url: Option<String>,
        pub created_at: DateTime<Utc>,
        pub is_deleted: bool,
    }

    impl From<entities::Message> for Message {
        fn from(message: entities::Message) -> Self {
            Message {
                id: message.id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                content: message.content,
                image_url: message.image_url,
                created_at: message.created_at,
                is_deleted: message.deleted_at.is_some(),
            }
        }
    }

    #[derive(Deserialize, Debug)]
    pub struct CreateMessage {
        pub content: Option<String>,
        pub image_url: Option<String>,
    }
}
