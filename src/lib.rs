//! Real-time conversations, notifications and presence for the pet network -
//! library exports for the server binary and tests

pub mod api;
pub mod config;
pub mod core;
pub mod infrastructure;

use crate::config::Settings;
use crate::core::broadcast::InProcessBroadcastGateway;
use crate::core::dispatcher::MessageDispatcherService;
use crate::core::notifications::NotificationService;
use crate::core::presence::PresenceTracker;
use crate::core::registry::ConversationRegistryService;
use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::repositories::{
    DbConversationRepository, DbMessageRepository, DbNotificationRepository, DbUserDirectory,
};
use di::{Injectable, ServiceCollection};

/// Registers every service the API resolves.
///
/// Shared state (settings, pool, broadcast channels, presence sessions) lives in
/// singletons; repositories and services are created per request scope.
pub fn add_services(services: &mut ServiceCollection) -> &mut ServiceCollection {
    services
        .add(Settings::singleton())
        .add(DatabaseConnection::singleton())
        .add(InProcessBroadcastGateway::singleton())
        .add(PresenceTracker::singleton())
        .add(DbUserDirectory::scoped())
        .add(DbConversationRepository::scoped())
        .add(DbMessageRepository::scoped())
        .add(DbNotificationRepository::scoped())
        .add(ConversationRegistryService::scoped())
        .add(NotificationService::scoped())
        .add(MessageDispatcherService::scoped())
}
