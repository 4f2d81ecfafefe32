//! Pooled SQLite connection

use crate::config::Settings;
use di::{Ref, inject, injectable};
use log::{error, info};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

const MAX_CONNECTIONS: u32 = 5;

/// Pool installed by `main` after migrations ran, or by tests.
static INSTALLED_POOL: OnceLock<Mutex<Option<SqlitePool>>> = OnceLock::new();

fn installed_pool() -> &'static Mutex<Option<SqlitePool>> {
    INSTALLED_POOL.get_or_init(|| Mutex::new(None))
}

pub struct DatabaseConnection {
    connection: SqlitePool,
}

#[injectable]
impl DatabaseConnection {
    #[inject]
    pub fn create(settings: Ref<Settings>) -> DatabaseConnection {
        if let Some(pool) = DatabaseConnection::current_pool() {
            return DatabaseConnection { connection: pool };
        }

        let options = SqliteConnectOptions::from_str(&settings.database_url).unwrap_or_else(|e| {
            error!("invalid DATABASE_URL {:?}: {e}", settings.database_url);
            SqliteConnectOptions::new()
        });

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_lazy_with(options);

        DatabaseConnection { connection: pool }
    }
}

impl DatabaseConnection {
    pub fn from_pool(pool: SqlitePool) -> DatabaseConnection {
        DatabaseConnection { connection: pool }
    }

    /// Opens the database, creating the file if needed, and runs the embedded migrations.
    pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::migrate!().run(&pool).await?;
        info!("database ready at {database_url}");

        Ok(pool)
    }

    /// Single-connection in-memory database with migrations applied.
    ///
    /// One connection keeps concurrent writers queued on the pool instead of
    /// racing for SQLite's shared-cache table locks.
    pub async fn in_memory() -> anyhow::Result<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;

        sqlx::migrate!().run(&pool).await?;

        Ok(pool)
    }

    /// Makes every DI-created connection share `pool`.
    pub fn install_pool(pool: SqlitePool) {
        if let Ok(mut guard) = installed_pool().lock() {
            *guard = Some(pool);
        }
    }

    pub fn set_test_pool(pool: SqlitePool) {
        DatabaseConnection::install_pool(pool);
    }

    pub fn clear_test_pool() {
        if let Ok(mut guard) = installed_pool().lock() {
            *guard = None;
        }
    }

    fn current_pool() -> Option<SqlitePool> {
        installed_pool().lock().ok().and_then(|guard| guard.clone())
    }
}

impl Deref for DatabaseConnection {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for DatabaseConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}
