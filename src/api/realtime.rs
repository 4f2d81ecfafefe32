//! Server-sent event streams over the broadcast channels

use crate::api::{ApiError, ExtractUser};
use crate::core::broadcast::{BroadcastEvent, BroadcastGateway, Channel, EventStream, authorize};
use crate::core::presence::PresenceTracker;
use crate::infrastructure::traits::ConversationRepository;
use async_stream::stream;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::get;
use axum::Router;
use di::Ref;
use di_axum::Inject;
use futures_util::{Stream, StreamExt};
use log::{debug, error, warn};
use serde::Serialize;
use std::convert::Infallible;
use uuid::Uuid;

/// First frame of a `/realtime/me` stream: who is online right now. Later
/// `presence.changed` events are deltas against this snapshot.
pub const SESSION_READY: &str = "session.ready";

pub fn router() -> Router {
    Router::new()
        .route("/me", get(my_events))
        .route("/conversations/:id", get(conversation_events))
        .route("/presence", get(presence_events))
}

#[derive(Serialize, Debug)]
struct SessionReady {
    user_id: Uuid,
    online_users: Vec<Uuid>,
}

/// Holds one presence session open; dropping the stream closes it.
struct PresenceSession {
    presence: Ref<PresenceTracker>,
    user_id: Uuid,
}

impl Drop for PresenceSession {
    fn drop(&mut self) {
        let presence = self.presence.clone();
        let user_id = self.user_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    presence.set_offline(user_id).await;
                });
            }
            Err(_) => warn!("no runtime to close presence session of {user_id}"),
        }
    }
}

fn to_sse(event: &BroadcastEvent) -> Option<Event> {
    match Event::default().event(&event.event).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            error!("failed to encode `{}` for {}: {e}", event.event, event.channel);
            None
        }
    }
}

/// Opens `channel`; with a subscriber the stream ends when that user's access
/// is revoked.
async fn open(
    gateway: &Ref<dyn BroadcastGateway>,
    channel: Channel,
    subscriber: Option<Uuid>,
) -> Result<EventStream, Response> {
    let subscription = match subscriber {
        Some(user_id) => gateway.subscribe_as(&channel, user_id).await,
        None => gateway.subscribe(&channel).await,
    };
    match subscription {
        Ok(subscription) => Ok(subscription.into_stream()),
        Err(e) => {
            error!("subscription to {channel} failed: {e}");
            Err((StatusCode::SERVICE_UNAVAILABLE, "realtime channel unavailable").into_response())
        }
    }
}

fn channel_stream(events: EventStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream! {
        let mut events = events;
        while let Some(event) = events.next().await {
            if let Some(sse) = to_sse(&event) {
                yield Ok(sse);
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Private channel plus presence for the current user. The user counts as
/// online while the stream is open.
async fn my_events(
    Inject(gateway): Inject<dyn BroadcastGateway>,
    Inject(presence): Inject<PresenceTracker>,
    ExtractUser(current_user): ExtractUser,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let private = open(&gateway, Channel::User(current_user), None).await?;
    let public = open(&gateway, Channel::Presence, None).await?;

    presence.set_online(current_user).await;
    let session = PresenceSession {
        presence: presence.clone(),
        user_id: current_user,
    };
    let ready = SessionReady {
        user_id: current_user,
        online_users: presence.online_users().await,
    };
    debug!("{current_user} connected to realtime");

    let stream = stream! {
        let _session = session;

        match Event::default().event(SESSION_READY).json_data(&ready) {
            Ok(sse) => yield Ok(sse),
            Err(e) => error!("failed to encode session snapshot: {e}"),
        }

        let mut events = futures_util::stream::select(private, public);
        while let Some(event) = events.next().await {
            if let Some(sse) = to_sse(&event) {
                yield Ok(sse);
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn conversation_events(
    Inject(gateway): Inject<dyn BroadcastGateway>,
    Inject(conversations): Inject<dyn ConversationRepository>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let channel = Channel::Conversation(conversation_id);
    // Subscribe before the membership check: a removal committed after the
    // check revokes this subscription.
    let events = open(&gateway, channel, Some(current_user)).await?;
    authorize(&*conversations, &channel, current_user)
        .await
        .map_err(|e| ApiError(e).into_response())?;

    Ok(channel_stream(events))
}

async fn presence_events(
    Inject(gateway): Inject<dyn BroadcastGateway>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    Ok(channel_stream(open(&gateway, Channel::Presence, None).await?))
}
