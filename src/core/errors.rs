//! Errors surfaced by the messaging and notification services

use crate::infrastructure::traits::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("user is not a member of this conversation")]
    NotMember,

    #[error("operation is only allowed on group conversations")]
    NotGroupConversation,

    #[error("only group admins can do that")]
    NotGroupAdmin,

    #[error("user {0} cannot take part in a conversation")]
    InvalidParticipant(Uuid),

    #[error("cannot start a conversation with yourself")]
    SelfConversation,

    #[error("only the sender can delete a message")]
    NotSender,

    #[error("message needs text or an image")]
    EmptyMessage,

    #[error("message is longer than {max} characters")]
    MessageTooLong { max: usize },

    #[error("user is already a member of this conversation")]
    AlreadyMember,

    #[error("private channels can only be joined by their owner")]
    ForeignChannel,

    #[error("invalid notification: {0}")]
    InvalidNotification(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Persistence(#[from] RepositoryError),
}

impl ChatError {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::NotMember => "not_member",
            ChatError::NotGroupConversation => "not_group_conversation",
            ChatError::NotGroupAdmin => "not_group_admin",
            ChatError::InvalidParticipant(_) => "invalid_participant",
            ChatError::SelfConversation => "self_conversation",
            ChatError::NotSender => "not_sender",
            ChatError::EmptyMessage => "empty_message",
            ChatError::MessageTooLong { .. } => "message_too_long",
            ChatError::AlreadyMember => "already_member",
            ChatError::ForeignChannel => "foreign_channel",
            ChatError::InvalidNotification(_) => "invalid_notification",
            ChatError::NotFound(_) => "not_found",
            ChatError::Persistence(_) => "server_error",
        }
    }
}
