use crate::core::errors::ChatError;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use log::error;
use serde::Serialize;
use std::str::FromStr;
use uuid::Uuid;

pub mod conversations;
pub mod notifications;
pub mod realtime;

const X_USER_ID: &str = "X-User-ID";

/// All client-facing routes. Services come from the DI provider attached with
/// `with_provider`.
pub fn router() -> Router {
    Router::new()
        .nest("/conversations", conversations::router())
        .nest("/notifications", notifications::router())
        .nest("/realtime", realtime::router())
}

/// Current user as resolved by the authentication layer in front of this service.
#[derive(Debug)]
pub struct ExtractUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for ExtractUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, (StatusCode, &'static str)> {
        if let Some(user_id) = parts.headers.get(X_USER_ID) {
            let user_id = user_id
                .to_str()
                .map_err(|_| (StatusCode::BAD_REQUEST, "invalid user id"))?;
            let user_id = Uuid::from_str(user_id)
                .map_err(|_| (StatusCode::BAD_REQUEST, "invalid user id"))?;
            Ok(ExtractUser(user_id))
        } else {
            Err((StatusCode::BAD_REQUEST, "`X-User-ID` header is missing"))
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ChatError::NotMember
            | ChatError::NotGroupAdmin
            | ChatError::ForeignChannel
            | ChatError::NotSender => StatusCode::FORBIDDEN,
            ChatError::NotGroupConversation
            | ChatError::InvalidParticipant(_)
            | ChatError::SelfConversation
            | ChatError::EmptyMessage
            | ChatError::MessageTooLong { .. }
            | ChatError::InvalidNotification(_) => StatusCode::BAD_REQUEST,
            ChatError::AlreadyMember => StatusCode::CONFLICT,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            ChatError::Persistence(e) => {
                error!("request failed: {e}");
                "internal server error".to_owned()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorBody {
                error: self.0.code(),
                message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
