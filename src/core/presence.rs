//! Presence tracking.
//!
//! Advisory, in-memory only: the map starts empty and a restart clears it, so
//! every user reads as offline until they reconnect.

use crate::config::Settings;
use crate::core::broadcast::{BroadcastGateway, Channel, deliver};
use di::{Ref, inject, injectable};
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const PRESENCE_CHANGED: &str = "presence.changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresenceChanged {
    pub user_id: Uuid,
    pub is_online: bool,
}

/// Counts live sessions per user. A user is online while at least one session
/// is open.
pub struct PresenceTracker {
    sessions: Mutex<HashMap<Uuid, usize>>,
    gateway: Ref<dyn BroadcastGateway>,
    publish_attempts: u32,
}

#[injectable]
impl PresenceTracker {
    #[inject]
    pub fn create(gateway: Ref<dyn BroadcastGateway>, settings: Ref<Settings>) -> PresenceTracker {
        PresenceTracker::new(gateway, settings.publish_attempts)
    }
}

impl PresenceTracker {
    pub fn new(gateway: Ref<dyn BroadcastGateway>, publish_attempts: u32) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            gateway,
            publish_attempts,
        }
    }

    /// Registers one more session for the user. Returns `true` if this made the
    /// user go online.
    pub async fn set_online(&self, user_id: Uuid) -> bool {
        // The lock is held across the publish so transitions for one user go
        // out in the order they happened.
        let mut sessions = self.sessions.lock().await;
        let count = sessions.entry(user_id).or_insert(0);
        *count += 1;
        debug!("user {user_id} has {} open sessions", *count);

        if *count == 1 {
            self.announce(user_id, true).await;
            true
        } else {
            false
        }
    }

    /// Closes one session. Returns `true` if this was the last one. Calls for a
    /// user with no open sessions are no-ops.
    pub async fn set_offline(&self, user_id: Uuid) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(count) = sessions.get_mut(&user_id) else {
            return false;
        };
        *count -= 1;
        debug!("user {user_id} has {} open sessions", *count);

        if *count == 0 {
            sessions.remove(&user_id);
            self.announce(user_id, false).await;
            true
        } else {
            false
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.sessions.lock().await.contains_key(&user_id)
    }

    pub async fn session_count(&self, user_id: Uuid) -> usize {
        self.sessions
            .lock()
            .await
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn online_users(&self) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self.sessions.lock().await.keys().copied().collect();
        users.sort();
        users
    }

    async fn announce(&self, user_id: Uuid, is_online: bool) {
        deliver(
            &*self.gateway,
            &Channel::Presence,
            PRESENCE_CHANGED,
            &PresenceChanged { user_id, is_online },
            self.publish_attempts,
        )
        .await;
    }
}
