//! Administrative endpoints for per-repository Slack settings.
//!
//! Settings can be written as JSON (`PUT`) or with the form encoding used
//! by the repository settings page (`POST`), where a checkbox counts as
//! checked only when its value is exactly `on`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Form, Json,
};
use herald_core::{HeraldError, RepositoryId, SettingsRecord};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use super::{error_response, repository_from_path};
use crate::AppState;

/// Form fields posted by the settings page.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsForm {
    /// Master switch checkbox.
    #[serde(rename = "slackNotificationsEnabled", default)]
    pub enabled: Option<String>,
    /// Push notifications checkbox.
    #[serde(rename = "slackNotificationsEnabledForPush", default)]
    pub enabled_for_push: Option<String>,
    /// Incoming webhook URL text field.
    #[serde(rename = "slackWebHookUrl", default)]
    pub webhook_url: Option<String>,
}

impl From<SettingsForm> for SettingsRecord {
    fn from(form: SettingsForm) -> Self {
        Self {
            enabled: is_checked(form.enabled.as_deref()),
            enabled_for_push: is_checked(form.enabled_for_push.as_deref()),
            webhook_url: form.webhook_url,
        }
    }
}

fn is_checked(value: Option<&str>) -> bool {
    value == Some("on")
}

/// Returns the current settings, or the disabled default.
#[instrument(name = "get_settings", skip(state))]
pub async fn get_settings(
    State(state): State<AppState>,
    Path((project, slug)): Path<(String, String)>,
) -> Response {
    let repository = match repository_from_path(&project, &slug) {
        Ok(repository) => repository,
        Err(response) => return response,
    };

    match state.settings.get(&repository).await {
        Ok(settings) => (StatusCode::OK, Json(SettingsRecord::from(settings))).into_response(),
        Err(e) => {
            warn!(repository = %repository, error = %e, "failed to read settings");
            error_response(&HeraldError::from(e))
        },
    }
}

/// Replaces settings from a JSON body.
#[instrument(name = "put_settings", skip(state, record))]
pub async fn put_settings(
    State(state): State<AppState>,
    Path((project, slug)): Path<(String, String)>,
    Json(record): Json<SettingsRecord>,
) -> Response {
    match repository_from_path(&project, &slug) {
        Ok(repository) => store(&state, &repository, record).await,
        Err(response) => response,
    }
}

/// Replaces settings from the settings page form.
#[instrument(name = "submit_settings_form", skip(state, form))]
pub async fn submit_settings_form(
    State(state): State<AppState>,
    Path((project, slug)): Path<(String, String)>,
    Form(form): Form<SettingsForm>,
) -> Response {
    match repository_from_path(&project, &slug) {
        Ok(repository) => store(&state, &repository, form.into()).await,
        Err(response) => response,
    }
}

async fn store(state: &AppState, repository: &RepositoryId, record: SettingsRecord) -> Response {
    match state.settings.put_record(repository, record).await {
        Ok(settings) => {
            info!(
                repository = %repository,
                enabled = settings.is_enabled(),
                enabled_for_push = settings.is_enabled_for_push(),
                "settings updated"
            );
            (StatusCode::OK, Json(SettingsRecord::from(settings))).into_response()
        },
        Err(e) => {
            warn!(repository = %repository, error = %e, "settings rejected");
            error_response(&HeraldError::from(e))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_on_checks_a_checkbox() {
        let form = SettingsForm {
            enabled: Some("on".into()),
            enabled_for_push: Some("true".into()),
            webhook_url: Some("https://hooks.example/abc".into()),
        };
        let record = SettingsRecord::from(form);

        assert!(record.enabled);
        assert!(!record.enabled_for_push);
        assert_eq!(record.webhook_url.as_deref(), Some("https://hooks.example/abc"));
    }

    #[test]
    fn absent_fields_are_unchecked() {
        let record = SettingsRecord::from(SettingsForm::default());
        assert_eq!(record, SettingsRecord::default());
    }
}
