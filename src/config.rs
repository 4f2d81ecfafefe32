//! Runtime settings read from the environment (and `.env` via dotenvy)

use anyhow::{Context, anyhow};
use di::{inject, injectable};
use log::warn;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_address: String,
    pub cors_origins: Vec<String>,
    /// Length (in characters) of message previews sent on private channels.
    pub message_preview_length: usize,
    pub max_message_length: usize,
    /// Per-channel buffer; subscribers lagging further behind skip events.
    pub broadcast_capacity: usize,
    pub publish_attempts: u32,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: "sqlite::memory:".to_owned(),
            bind_address: "0.0.0.0:3000".to_owned(),
            cors_origins: vec![
                "http://localhost:3000".to_owned(),
                "http://localhost:5173".to_owned(),
            ],
            message_preview_length: 50,
            max_message_length: 5000,
            broadcast_capacity: 256,
            publish_attempts: 2,
            default_page_size: 30,
            max_page_size: 100,
        }
    }
}

#[injectable]
impl Settings {
    #[inject]
    pub fn create() -> Settings {
        Settings::from_env().unwrap_or_else(|e| {
            warn!("invalid settings, falling back to defaults: {e:#}");
            Settings::default()
        })
    }
}

impl Settings {
    /// Reads settings from the process environment.
    ///
    /// `DATABASE_URL` is required; everything else has a default.
    pub fn from_env() -> anyhow::Result<Settings> {
        dotenvy::dotenv().ok();
        let defaults = Settings::default();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let cors_origins = match env::var("CORS_ORIGINS") {
            Ok(origins) => origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_owned)
                .collect(),
            Err(_) => defaults.cors_origins,
        };

        let settings = Settings {
            database_url,
            bind_address: env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            cors_origins,
            message_preview_length: parse_var(
                "MESSAGE_PREVIEW_LENGTH",
                defaults.message_preview_length,
            )?,
            max_message_length: parse_var("MAX_MESSAGE_LENGTH", defaults.max_message_length)?,
            broadcast_capacity: parse_var("BROADCAST_CAPACITY", defaults.broadcast_capacity)?,
            publish_attempts: parse_var("PUBLISH_ATTEMPTS", defaults.publish_attempts)?,
            default_page_size: parse_var("DEFAULT_PAGE_SIZE", defaults.default_page_size)?,
            max_page_size: parse_var("MAX_PAGE_SIZE", defaults.max_page_size)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.message_preview_length == 0 {
            return Err(anyhow!("MESSAGE_PREVIEW_LENGTH must be positive"));
        }
        if self.broadcast_capacity == 0 {
            return Err(anyhow!("BROADCAST_CAPACITY must be positive"));
        }
        if self.publish_attempts == 0 {
            return Err(anyhow!("PUBLISH_ATTEMPTS must be at least 1"));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(anyhow!(
                "DEFAULT_PAGE_SIZE must be between 1 and MAX_PAGE_SIZE ({})",
                self.max_page_size
            ));
        }
        Ok(())
    }

    /// Clamps a client-supplied page size into `1..=max_page_size`.
    pub fn page_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value: {value:?}")),
        Err(_) => Ok(default),
    }
}
