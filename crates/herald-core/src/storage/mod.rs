//! SQLite persistence for repository settings.
//!
//! The repository layer translates between domain models and the database
//! schema. All SQL lives in this module.

use std::{str::FromStr, sync::Arc, time::Duration};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tracing::info;

pub mod slack_settings;

pub use slack_settings::Repository as SqliteSettingsStore;

use crate::error::Result;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS slack_settings (
    project_key      TEXT    NOT NULL,
    slug             TEXT    NOT NULL,
    enabled          BOOLEAN NOT NULL DEFAULT 0,
    enabled_for_push BOOLEAN NOT NULL DEFAULT 0,
    webhook_url      TEXT,
    updated_at       TEXT    NOT NULL,
    PRIMARY KEY (project_key, slug)
)
";

/// Container for repository instances sharing one connection pool.
#[derive(Debug, Clone)]
pub struct Storage {
    /// Per-repository Slack settings.
    pub slack_settings: Arc<slack_settings::Repository>,
    pool: Arc<SqlitePool>,
}

impl Storage {
    /// Creates storage over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        let pool = Arc::new(pool);
        Self { slack_settings: Arc::new(slack_settings::Repository::new(pool.clone())), pool }
    }

    /// Opens a pool for `database_url`, creating the database file if needed.
    ///
    /// In-memory databases are limited to one connection since every
    /// connection would otherwise see its own empty database.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let mut pool_options =
            SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(5));
        if database_url.contains(":memory:") {
            pool_options =
                pool_options.max_connections(1).idle_timeout(None).max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(max_connections.max(1));
        }

        let pool = pool_options.connect_with(options).await?;

        Ok(Self::new(pool))
    }

    /// Creates the schema if it does not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&*self.pool).await?;
        info!("settings schema ready");
        Ok(())
    }

    /// Executes a trivial query to verify connectivity.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }

    /// Shared pool handle.
    pub fn pool(&self) -> Arc<SqlitePool> {
        self.pool.clone()
    }
}
