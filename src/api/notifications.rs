//! Notifications endpoints

use crate::api::notifications::schemas::{
    EmitNotification, NotificationList, NotificationsQuery, Updated,
};
use crate::api::{ApiResult, ExtractUser};
use crate::core::events::NotificationPayload;
use crate::core::traits::{NotificationCenter, NotificationCounts};
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use di_axum::Inject;
use uuid::Uuid;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_notifications))
        .route("/counts", get(counts))
        .route("/read-all", post(mark_all_read))
        .route("/received", post(mark_received))
        .route("/events", post(emit))
        .route("/:id/read", post(mark_read))
}

/// Opening the notification list with `mark_received=true` clears the
/// "new" badge before the page is read, so the page reflects it.
async fn list_notifications(
    Inject(center): Inject<dyn NotificationCenter>,
    ExtractUser(current_user): ExtractUser,
    Query(query): Query<NotificationsQuery>,
) -> ApiResult<Json<NotificationList>> {
    if query.mark_received {
        center.mark_received(current_user).await?;
    }

    let notifications = center.list(current_user, query.before, query.limit).await?;
    let counts = center.counts(current_user).await?;

    Ok(Json(NotificationList {
        notifications: notifications
            .iter()
            .map(NotificationPayload::from)
            .collect(),
        unread_count: counts.unread,
        unreceived_count: counts.unreceived,
    }))
}

async fn counts(
    Inject(center): Inject<dyn NotificationCenter>,
    ExtractUser(current_user): ExtractUser,
) -> ApiResult<Json<NotificationCounts>> {
    Ok(Json(center.counts(current_user).await?))
}

async fn mark_read(
    Inject(center): Inject<dyn NotificationCenter>,
    ExtractUser(current_user): ExtractUser,
    Path(notification_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    center.mark_read(current_user, notification_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_all_read(
    Inject(center): Inject<dyn NotificationCenter>,
    ExtractUser(current_user): ExtractUser,
) -> ApiResult<Json<Updated>> {
    let updated = center.mark_all_read(current_user).await?;
    Ok(Json(Updated { updated }))
}

async fn mark_received(
    Inject(center): Inject<dyn NotificationCenter>,
    ExtractUser(current_user): ExtractUser,
) -> ApiResult<Json<Updated>> {
    let updated = center.mark_received(current_user).await?;
    Ok(Json(Updated { updated }))
}

/// Entry point for the social producers (likes, comments, follows). The caller
/// is the actor.
async fn emit(
    Inject(center): Inject<dyn NotificationCenter>,
    ExtractUser(current_user): ExtractUser,
    Json(body): Json<EmitNotification>,
) -> ApiResult<(StatusCode, Json<Option<NotificationPayload>>)> {
    let notification = center
        .emit(body.recipient_id, current_user, body.kind)
        .await?;

    Ok(match notification {
        Some(notification) => (
            StatusCode::CREATED,
            Json(Some(NotificationPayload::from(&notification))),
        ),
        None => (StatusCode::OK, Json(None)),
    })
}

pub mod schemas {
    use crate::core::events::NotificationPayload;
    use crate::infrastructure::entities::NotificationKind;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Deserialize, Debug, Default)]
    pub struct NotificationsQuery {
        pub before: Option<Uuid>,
        pub limit: Option<u32>,
        #[serde(default)]
        pub mark_received: bool,
    }

    /// Same item shape as the `notification.created` push, so clients merge
    /// fetched pages and live events without translation.
    #[derive(Serialize, Debug)]
    pub struct NotificationList {
        pub notifications: Vec<NotificationPayload>,
        pub unread_count: i64,
        pub unreceived_count: i64,
    }

    #[derive(Serialize, Debug)]
    pub struct Updated {
        pub updated: u64,
    }

    #[derive(Deserialize, Debug)]
    pub struct EmitNotification {
        pub recipient_id: Uuid,
        #[serde(flatten)]
        pub kind: NotificationKind,
    }
}
