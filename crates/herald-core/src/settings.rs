//! Settings store abstraction.
//!
//! The notifier reads settings before every dispatch decision, so reads
//! must be cheap and always return a value: repositories that were never
//! configured read as [`SlackSettings::disabled`]. Writes replace the whole
//! value and are validated first; a rejected write leaves the stored value
//! untouched.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    error::Result,
    models::{RepositoryId, SettingsRecord, SlackSettings},
};

/// Durable mapping from repository to its Slack settings.
///
/// A successful `put` is visible to every subsequent `get` for the same
/// key. Keys are independent; concurrent writers to one key resolve as last
/// writer wins.
#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync + std::fmt::Debug {
    /// Current settings, or the disabled default if never configured.
    async fn get(&self, repository: &RepositoryId) -> Result<SlackSettings>;

    /// Replaces the settings for a repository.
    ///
    /// Fails with `CoreError::InvalidSettings` if the value violates the
    /// write-time invariant.
    async fn put(&self, repository: &RepositoryId, settings: SlackSettings) -> Result<()>;

    /// Validates an unchecked record and stores it.
    ///
    /// Returns the stored value. On validation failure nothing is written.
    async fn put_record(
        &self,
        repository: &RepositoryId,
        record: SettingsRecord,
    ) -> Result<SlackSettings> {
        let settings = SlackSettings::try_from(record)?;
        self.put(repository, settings.clone()).await?;
        Ok(settings)
    }

    /// Confirms the backing storage is reachable.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: SettingsStore + ?Sized> SettingsStore for Arc<S> {
    async fn get(&self, repository: &RepositoryId) -> Result<SlackSettings> {
        (**self).get(repository).await
    }

    async fn put(&self, repository: &RepositoryId, settings: SlackSettings) -> Result<()> {
        (**self).put(repository, settings).await
    }

    async fn health_check(&self) -> Result<()> {
        (**self).health_check().await
    }
}

/// Process-local settings store.
#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    settings: RwLock<HashMap<RepositoryId, SlackSettings>>,
}

impl InMemorySettingsStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of configured repositories.
    pub async fn len(&self) -> usize {
        self.settings.read().await.len()
    }

    /// Whether no repository has been configured.
    pub async fn is_empty(&self) -> bool {
        self.settings.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self, repository: &RepositoryId) -> Result<SlackSettings> {
        Ok(self.settings.read().await.get(repository).cloned().unwrap_or_default())
    }

    async fn put(&self, repository: &RepositoryId, settings: SlackSettings) -> Result<()> {
        settings.validate()?;
        debug!(repository = %repository, enabled = settings.is_enabled(), "storing settings");
        self.settings.write().await.insert(repository.clone(), settings);
        Ok(())
    }
}
