//! Repository for per-repository Slack settings.
//!
//! One row per repository keyed by `(project_key, slug)`. Writes are a
//! single upsert statement, so a `put` either replaces the whole row or
//! leaves it untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::{
    error::{CoreError, Result},
    models::{RepositoryId, SlackSettings},
    settings::SettingsStore,
};

#[derive(Debug, sqlx::FromRow)]
struct SettingsRow {
    enabled: bool,
    enabled_for_push: bool,
    webhook_url: Option<String>,
}

impl TryFrom<SettingsRow> for SlackSettings {
    type Error = CoreError;

    fn try_from(row: SettingsRow) -> Result<Self> {
        Self::new(row.enabled, row.enabled_for_push, row.webhook_url).map_err(|e| {
            CoreError::Serialization(format!("stored settings violate invariants: {e}"))
        })
    }
}

/// SQLite-backed settings store.
#[derive(Debug)]
pub struct Repository {
    pool: Arc<SqlitePool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Finds stored settings, `None` if the repository was never configured.
    pub async fn find(&self, repository: &RepositoryId) -> Result<Option<SlackSettings>> {
        let row: Option<SettingsRow> = sqlx::query_as(
            r"
            SELECT enabled, enabled_for_push, webhook_url
            FROM slack_settings
            WHERE project_key = ? AND slug = ?
            ",
        )
        .bind(repository.project_key())
        .bind(repository.slug())
        .fetch_optional(&*self.pool)
        .await?;

        row.map(SlackSettings::try_from).transpose()
    }

    async fn upsert(
        &self,
        repository: &RepositoryId,
        settings: &SlackSettings,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO slack_settings (
                project_key, slug, enabled, enabled_for_push, webhook_url, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (project_key, slug) DO UPDATE SET
                enabled = excluded.enabled,
                enabled_for_push = excluded.enabled_for_push,
                webhook_url = excluded.webhook_url,
                updated_at = excluded.updated_at
            ",
        )
        .bind(repository.project_key())
        .bind(repository.slug())
        .bind(settings.is_enabled())
        .bind(settings.is_enabled_for_push())
        .bind(settings.webhook_url())
        .bind(updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl SettingsStore for Repository {
    async fn get(&self, repository: &RepositoryId) -> Result<SlackSettings> {
        Ok(self.find(repository).await?.unwrap_or_default())
    }

    async fn put(&self, repository: &RepositoryId, settings: SlackSettings) -> Result<()> {
        settings.validate()?;
        self.upsert(repository, &settings, Utc::now()).await?;
        debug!(
            repository = %repository,
            enabled = settings.is_enabled(),
            enabled_for_push = settings.is_enabled_for_push(),
            "settings stored"
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}
