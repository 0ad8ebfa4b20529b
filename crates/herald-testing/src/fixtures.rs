//! Builders for repository events and settings.

use chrono::{DateTime, TimeZone, Utc};
use herald_core::{
    ChangeKind, EventPayload, EventType, PullRequestRef, RefChange, RepositoryEvent,
    RepositoryId, SlackSettings,
};

/// Repository id under the `PROJ` project.
///
/// # Panics
///
/// Panics if `slug` is not a valid slug.
pub fn repository(slug: &str) -> RepositoryId {
    RepositoryId::new("PROJ", slug).expect("valid test repository id")
}

/// Settings with every notification enabled.
///
/// # Panics
///
/// Panics if `url` is not a valid webhook URL.
pub fn enabled_settings(url: impl Into<String>) -> SlackSettings {
    SlackSettings::new(true, true, Some(url.into())).expect("valid test settings")
}

/// Settings with notifications enabled except for pushes.
///
/// # Panics
///
/// Panics if `url` is not a valid webhook URL.
pub fn push_muted_settings(url: impl Into<String>) -> SlackSettings {
    SlackSettings::new(true, false, Some(url.into())).expect("valid test settings")
}

/// Fixed timestamp so rendered output is reproducible.
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).single().unwrap_or_else(Utc::now)
}

/// Builder for [`RepositoryEvent`] test data.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    repository_id: RepositoryId,
    event_type: EventType,
    payload: EventPayload,
    sequence: u64,
    occurred_at: DateTime<Utc>,
}

impl EventBuilder {
    /// Push by `alice` updating `main`.
    pub fn push(repository_id: RepositoryId) -> Self {
        Self {
            repository_id,
            event_type: EventType::Push,
            payload: EventPayload {
                actor: "alice".into(),
                ref_changes: vec![RefChange {
                    ref_id: "refs/heads/main".into(),
                    from_hash: "1".repeat(40),
                    to_hash: "2".repeat(40),
                    kind: ChangeKind::Update,
                }],
                ..EventPayload::default()
            },
            sequence: 1,
            occurred_at: fixed_time(),
        }
    }

    /// Pull request event by `bob` for PR #42.
    pub fn pull_request(repository_id: RepositoryId, event_type: EventType) -> Self {
        let comment =
            (event_type == EventType::PullRequestCommented).then(|| "Looks good".to_string());
        Self {
            repository_id,
            event_type,
            payload: EventPayload {
                actor: "bob".into(),
                pull_request: Some(PullRequestRef {
                    id: 42,
                    title: "Add retry budget".into(),
                    from_branch: "feature/retry".into(),
                    to_branch: "main".into(),
                    link: None,
                }),
                comment,
                ..EventPayload::default()
            },
            sequence: 1,
            occurred_at: fixed_time(),
        }
    }

    /// Sets the acting user.
    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.payload.actor = actor.into();
        self
    }

    /// Replaces the ref changes with a single update of `branch`.
    #[must_use]
    pub fn branch(mut self, branch: &str) -> Self {
        self.payload.ref_changes = vec![RefChange {
            ref_id: format!("refs/heads/{branch}"),
            from_hash: "1".repeat(40),
            to_hash: "2".repeat(40),
            kind: ChangeKind::Update,
        }];
        self
    }

    /// Sets the source sequence number.
    #[must_use]
    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Replaces the whole payload.
    #[must_use]
    pub fn payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Builds the event with a fresh id.
    pub fn build(self) -> RepositoryEvent {
        RepositoryEvent::new(
            self.repository_id,
            self.event_type,
            self.payload,
            self.sequence,
            self.occurred_at,
        )
    }
}
