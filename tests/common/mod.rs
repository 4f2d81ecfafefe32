//! Shared setup for the integration tests: an in-memory database with
//! migrations applied and the services wired by hand.

#![allow(dead_code)]

use di::Ref;
use petnet_realtime::config::Settings;
use petnet_realtime::core::broadcast::{
    BroadcastEvent, BroadcastGateway, Channel, InProcessBroadcastGateway, Subscription,
};
use petnet_realtime::core::dispatcher::MessageDispatcherService;
use petnet_realtime::core::notifications::NotificationService;
use petnet_realtime::core::presence::PresenceTracker;
use petnet_realtime::core::registry::ConversationRegistryService;
use petnet_realtime::core::traits::{ConversationRegistry, MessageDispatcher, NotificationCenter};
use petnet_realtime::infrastructure::database::DatabaseConnection;
use petnet_realtime::infrastructure::repositories::{
    DbConversationRepository, DbMessageRepository, DbNotificationRepository, DbUserDirectory,
};
use petnet_realtime::infrastructure::traits::{
    ConversationRepository, MessageRepository, NotificationRepository, UserDirectory,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

pub struct TestContext {
    pub pool: SqlitePool,
    pub settings: Ref<Settings>,
    pub gateway: Ref<dyn BroadcastGateway>,
    pub presence: Ref<PresenceTracker>,
    pub conversations: Ref<dyn ConversationRepository>,
    pub messages: Ref<dyn MessageRepository>,
    pub registry: Ref<dyn ConversationRegistry>,
    pub notifications: Ref<dyn NotificationCenter>,
    pub dispatcher: Ref<dyn MessageDispatcher>,
}

impl TestContext {
    pub async fn new() -> TestContext {
        TestContext::with_settings(Settings::default()).await
    }

    pub async fn with_settings(settings: Settings) -> TestContext {
        let pool = DatabaseConnection::in_memory().await.unwrap();
        let connection = Ref::new(DatabaseConnection::from_pool(pool.clone()));
        let settings = Ref::new(settings);

        let gateway: Ref<dyn BroadcastGateway> =
            Ref::new(InProcessBroadcastGateway::new(settings.broadcast_capacity));
        let presence = Ref::new(PresenceTracker::new(
            gateway.clone(),
            settings.publish_attempts,
        ));

        let users: Ref<dyn UserDirectory> = Ref::new(DbUserDirectory::new(connection.clone()));
        let conversations: Ref<dyn ConversationRepository> =
            Ref::new(DbConversationRepository::new(connection.clone()));
        let messages: Ref<dyn MessageRepository> =
            Ref::new(DbMessageRepository::new(connection.clone()));
        let notification_repo: Ref<dyn NotificationRepository> =
            Ref::new(DbNotificationRepository::new(connection));

        let registry: Ref<dyn ConversationRegistry> = Ref::new(ConversationRegistryService::new(
            conversations.clone(),
            users.clone(),
            gateway.clone(),
            settings.clone(),
        ));
        let notifications: Ref<dyn NotificationCenter> = Ref::new(NotificationService::new(
            notification_repo,
            users,
            gateway.clone(),
            settings.clone(),
        ));
        let dispatcher: Ref<dyn MessageDispatcher> = Ref::new(MessageDispatcherService::new(
            registry.clone(),
            messages.clone(),
            notifications.clone(),
            gateway.clone(),
            presence.clone(),
            settings.clone(),
        ));

        TestContext {
            pool,
            settings,
            gateway,
            presence,
            conversations,
            messages,
            registry,
            notifications,
            dispatcher,
        }
    }

    pub async fn user(&self, name: &str) -> Uuid {
        insert_user(&self.pool, name).await
    }

    pub async fn subscribe(&self, channel: Channel) -> Subscription {
        self.gateway.subscribe(&channel).await.unwrap()
    }

    /// Subscription owned by `user`, ended when the user's access is revoked.
    pub async fn subscribe_as(&self, channel: Channel, user: Uuid) -> Subscription {
        self.gateway.subscribe_as(&channel, user).await.unwrap()
    }

    pub async fn count(&self, sql: &str) -> i64 {
        let (count,): (i64,) = sqlx::query_as(sql).fetch_one(&self.pool).await.unwrap();
        count
    }
}

pub async fn insert_user(pool: &SqlitePool, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, display_name, avatar_url, is_active) VALUES (?, ?, ?, 1)")
        .bind(id)
        .bind(name)
        .bind(format!("https://cdn.example/avatars/{name}.png"))
        .execute(pool)
        .await
        .unwrap();
    id
}

pub async fn deactivate_user(pool: &SqlitePool, id: Uuid) {
    sqlx::query("UPDATE users SET is_active = 0 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

/// Next event on the subscription, failing the test after one second.
pub async fn next_event(subscription: &mut Subscription) -> Arc<BroadcastEvent> {
    timeout(Duration::from_secs(1), subscription.next())
        .await
        .expect("timed out waiting for an event")
        .expect("subscription closed")
}

/// Everything already published on the subscription.
pub async fn drain(subscription: &mut Subscription) -> Vec<Arc<BroadcastEvent>> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(50), subscription.next()).await {
        events.push(event);
    }
    events
}
