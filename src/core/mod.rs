pub mod broadcast;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod notifications;
pub mod presence;
pub mod registry;
pub mod traits;
