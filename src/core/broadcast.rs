//! Broadcast gateway: channel fan-out to connected clients.
//!
//! Delivery is at-most-once per subscriber that is connected when the event is
//! published. There is no replay: a client that was away re-fetches state over
//! HTTP. Subscribers that fall more than the channel capacity behind skip the
//! events they missed.

use crate::config::Settings;
use crate::core::errors::{ChatError, ChatResult};
use crate::infrastructure::traits::ConversationRepository;
use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use di::{Ref, inject, injectable};
use futures_util::{Stream, StreamExt};
use log::{debug, error, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

pub const PRESENCE_CHANNEL: &str = "presence";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Messages of one conversation, members only.
    Conversation(Uuid),
    /// Private per-user channel: notifications and cross-conversation updates.
    User(Uuid),
    /// Public online/offline changes.
    Presence,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Conversation(id) => write!(f, "conversation.{id}"),
            Channel::User(id) => write!(f, "user.{id}"),
            Channel::Presence => f.write_str(PRESENCE_CHANNEL),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown channel {0:?}")]
pub struct UnknownChannel(String);

impl FromStr for Channel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == PRESENCE_CHANNEL {
            return Ok(Channel::Presence);
        }
        let parse_id = |id: &str| Uuid::parse_str(id).map_err(|_| UnknownChannel(s.to_owned()));
        match s.split_once('.') {
            Some(("conversation", id)) => Ok(Channel::Conversation(parse_id(id)?)),
            Some(("user", id)) => Ok(Channel::User(parse_id(id)?)),
            _ => Err(UnknownChannel(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastEvent {
    pub channel: String,
    pub event: String,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("failed to encode `{event}` payload: {source}")]
    Encode {
        event: String,
        source: serde_json::Error,
    },

    #[error("broadcast transport unavailable: {0}")]
    Transport(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Arc<BroadcastEvent>> + Send>>;

/// A live subscription; dropping it releases the channel slot.
pub struct Subscription {
    pub channel: Channel,
    events: EventStream,
}

impl Subscription {
    pub fn new(channel: Channel, events: EventStream) -> Self {
        Self { channel, events }
    }

    pub async fn next(&mut self) -> Option<Arc<BroadcastEvent>> {
        self.events.next().await
    }

    pub fn into_stream(self) -> EventStream {
        self.events
    }
}

/// Pub/sub transport. Business code only publishes after a successful write;
/// swapping the transport does not touch the services.
#[async_trait]
pub trait BroadcastGateway: Send + Sync {
    /// Returns how many subscribers the event was handed to.
    async fn publish(
        &self,
        channel: &Channel,
        event: &str,
        payload: Value,
    ) -> Result<usize, BroadcastError>;

    async fn subscribe(&self, channel: &Channel) -> Result<Subscription, BroadcastError>;

    /// Like `subscribe`, but the subscription belongs to `subscriber` and ends
    /// as soon as `revoke` is called for that user and channel.
    async fn subscribe_as(
        &self,
        channel: &Channel,
        subscriber: Uuid,
    ) -> Result<Subscription, BroadcastError>;

    /// Ends every subscription `subscriber` holds on `channel`. Events that are
    /// still buffered for those subscriptions are dropped.
    async fn revoke(&self, channel: &Channel, subscriber: Uuid) -> usize;

    async fn subscriber_count(&self, channel: &Channel) -> usize;
}

type Sender = broadcast::Sender<Arc<BroadcastEvent>>;

#[derive(Default)]
struct Hub {
    channels: Mutex<HashMap<Channel, Sender>>,
    /// One watch sender per (channel, user); dropping it ends that user's feeds.
    grants: Mutex<HashMap<(Channel, Uuid), watch::Sender<()>>>,
}

// Critical sections never panic, a poisoned map is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Hub {
    fn release_if_idle(&self, channel: &Channel) {
        let mut channels = lock(&self.channels);
        if channels
            .get(channel)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(channel);
            debug!("released idle channel {channel}");
        }
    }
}

/// Receiving end of one subscription. Dropping it removes map entries that
/// no other subscription uses.
struct Feed {
    hub: Arc<Hub>,
    channel: Channel,
    receiver: Option<broadcast::Receiver<Arc<BroadcastEvent>>>,
    grant: Option<(Uuid, watch::Receiver<()>)>,
}

impl Feed {
    async fn next(&mut self) -> Option<Arc<BroadcastEvent>> {
        let receiver = self.receiver.as_mut()?;
        loop {
            let received = match self.grant.as_mut() {
                Some((subscriber, revoked)) => tokio::select! {
                    biased;
                    _ = revoked.changed() => {
                        debug!("subscription of {subscriber} to {} revoked", self.channel);
                        return None;
                    }
                    received = receiver.recv() => received,
                },
                None => receiver.recv().await,
            };

            match received {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "subscriber on {} lagged, skipped {skipped} events",
                        self.channel
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        drop(self.receiver.take());
        self.hub.release_if_idle(&self.channel);

        if let Some((subscriber, revoked)) = self.grant.take() {
            let key = (self.channel, subscriber);
            let mut grants = lock(&self.hub.grants);
            // a closed watch means the grant was revoked and may have been
            // replaced by a newer one that is not ours to remove
            let current = revoked.has_changed().is_ok();
            drop(revoked);
            if current
                && grants
                    .get(&key)
                    .is_some_and(|grant| grant.receiver_count() == 0)
            {
                grants.remove(&key);
            }
        }
    }
}

/// Single-process gateway over `tokio::sync::broadcast`, one sender per channel.
pub struct InProcessBroadcastGateway {
    capacity: usize,
    hub: Arc<Hub>,
}

#[injectable(BroadcastGateway)]
impl InProcessBroadcastGateway {
    #[inject]
    pub fn create(settings: Ref<Settings>) -> InProcessBroadcastGateway {
        InProcessBroadcastGateway::new(settings.broadcast_capacity)
    }
}

impl InProcessBroadcastGateway {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            hub: Arc::new(Hub::default()),
        }
    }

    /// Number of channels that currently hold a sender.
    pub fn open_channels(&self) -> usize {
        lock(&self.hub.channels).len()
    }

    fn open_feed(&self, channel: &Channel, subscriber: Option<Uuid>) -> Subscription {
        let receiver = lock(&self.hub.channels)
            .entry(*channel)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let grant = subscriber.map(|subscriber| {
            let revoked = lock(&self.hub.grants)
                .entry((*channel, subscriber))
                .or_insert_with(|| watch::channel(()).0)
                .subscribe();
            (subscriber, revoked)
        });

        let mut feed = Feed {
            hub: self.hub.clone(),
            channel: *channel,
            receiver: Some(receiver),
            grant,
        };
        let events = stream! {
            while let Some(event) = feed.next().await {
                yield event;
            }
        };

        Subscription::new(*channel, Box::pin(events))
    }
}

#[async_trait]
impl BroadcastGateway for InProcessBroadcastGateway {
    async fn publish(
        &self,
        channel: &Channel,
        event: &str,
        payload: Value,
    ) -> Result<usize, BroadcastError> {
        let sender = match lock(&self.hub.channels).get(channel) {
            Some(sender) => sender.clone(),
            None => return Ok(0),
        };

        let event = Arc::new(BroadcastEvent {
            channel: channel.to_string(),
            event: event.to_owned(),
            payload,
            published_at: Utc::now(),
        });

        match sender.send(event) {
            Ok(delivered) => Ok(delivered),
            Err(_) => {
                // every receiver went away since the lookup
                self.hub.release_if_idle(channel);
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channel: &Channel) -> Result<Subscription, BroadcastError> {
        Ok(self.open_feed(channel, None))
    }

    async fn subscribe_as(
        &self,
        channel: &Channel,
        subscriber: Uuid,
    ) -> Result<Subscription, BroadcastError> {
        Ok(self.open_feed(channel, Some(subscriber)))
    }

    async fn revoke(&self, channel: &Channel, subscriber: Uuid) -> usize {
        match lock(&self.hub.grants).remove(&(*channel, subscriber)) {
            Some(grant) => {
                let ended = grant.receiver_count();
                debug!("revoked {ended} subscriptions of {subscriber} to {channel}");
                ended
            }
            None => 0,
        }
    }

    async fn subscriber_count(&self, channel: &Channel) -> usize {
        lock(&self.hub.channels)
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

/// Publishes `payload`, retrying transport failures up to `attempts` times.
///
/// Never fails the caller: the write that triggered the event already
/// succeeded and clients can re-fetch. Returns whether the event went out.
pub async fn deliver<T: Serialize + ?Sized>(
    gateway: &dyn BroadcastGateway,
    channel: &Channel,
    event: &str,
    payload: &T,
    attempts: u32,
) -> bool {
    let payload = match serde_json::to_value(payload) {
        Ok(payload) => payload,
        Err(source) => {
            let e = BroadcastError::Encode {
                event: event.to_owned(),
                source,
            };
            error!("dropping event on {channel}: {e}");
            return false;
        }
    };

    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match gateway.publish(channel, event, payload.clone()).await {
            Ok(delivered) => {
                debug!("published {event} on {channel} to {delivered} subscribers");
                return true;
            }
            Err(e) if attempt < attempts => {
                warn!("publish of {event} on {channel} failed (attempt {attempt}/{attempts}): {e}");
            }
            Err(e) => {
                error!("giving up on {event} for {channel}: {e}");
            }
        }
    }
    false
}

/// Checks that `user_id` may subscribe to `channel`.
pub async fn authorize(
    conversations: &dyn ConversationRepository,
    channel: &Channel,
    user_id: Uuid,
) -> ChatResult<()> {
    match channel {
        Channel::Presence => Ok(()),
        Channel::User(owner) if *owner == user_id => Ok(()),
        Channel::User(_) => Err(ChatError::ForeignChannel),
        Channel::Conversation(conversation_id) => {
            let conversation = conversations
                .find_conversation(*conversation_id)
                .await?
                .ok_or(ChatError::NotFound("conversation"))?;
            let membership = conversations
                .find_membership(*conversation_id, user_id)
                .await?;
            if conversation.is_active && membership.is_some() {
                Ok(())
            } else {
                Err(ChatError::NotMember)
            }
        }
    }
}
