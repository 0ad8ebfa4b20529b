//! Rendering of repository events into Slack webhook messages.
//!
//! Formatting is a pure function of the event and the settings in force:
//! no I/O, no clock, no randomness. Rendering the same inputs twice gives
//! byte-identical bodies and the same message id, which lets duplicate
//! events from an at-least-once source be replayed safely.

use thiserror::Error;

use crate::models::{
    Attachment, AttachmentField, ChangeKind, EventType, MessageId, OutboundMessage, RefChange,
    RepositoryEvent, SlackMessage, SlackSettings, SuppressReason,
};

/// Default cap on ref changes listed in a push message.
pub const DEFAULT_MAX_REF_CHANGES: usize = 10;

const SHORT_HASH_LEN: usize = 7;

/// Formatter failures. These indicate a malformed event, not an
/// operational problem, and the event is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Pull request event without pull request data.
    #[error("{event_type} event has no pull request data")]
    MissingPullRequest {
        /// Offending event type
        event_type: EventType,
    },

    /// Comment event without comment text.
    #[error("pull_request_commented event has no comment text")]
    MissingComment,

    /// Enabled settings without a webhook URL.
    #[error("settings are enabled but carry no webhook url")]
    MissingWebhookUrl,
}

/// Result of formatting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    /// A message ready to enqueue.
    Message(OutboundMessage),
    /// Settings filter out this event. Not an error.
    Suppressed(SuppressReason),
}

impl Rendered {
    /// Returns the message, if one was produced.
    pub fn into_message(self) -> Option<OutboundMessage> {
        match self {
            Self::Message(message) => Some(message),
            Self::Suppressed(_) => None,
        }
    }

    /// Whether settings suppressed the event.
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::Suppressed(_))
    }
}

/// Stateless event formatter.
#[derive(Debug, Clone, Copy)]
pub struct NotificationFormatter {
    max_ref_changes: usize,
}

impl Default for NotificationFormatter {
    fn default() -> Self {
        Self { max_ref_changes: DEFAULT_MAX_REF_CHANGES }
    }
}

impl NotificationFormatter {
    /// Creates a formatter with the default ref change cap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many ref changes a push message lists before summarizing.
    #[must_use]
    pub fn with_max_ref_changes(mut self, max: usize) -> Self {
        self.max_ref_changes = max;
        self
    }

    /// Formats an event under the given settings.
    pub fn format(
        &self,
        event: &RepositoryEvent,
        settings: &SlackSettings,
    ) -> Result<Rendered, FormatError> {
        if let Some(reason) = settings.suppression(event.event_type) {
            return Ok(Rendered::Suppressed(reason));
        }

        let target_url = settings.webhook_url().ok_or(FormatError::MissingWebhookUrl)?;
        let body = self.render(event)?;

        Ok(Rendered::Message(OutboundMessage {
            id: MessageId::for_event(event.id),
            event_id: event.id,
            repository_id: event.repository_id.clone(),
            event_type: event.event_type,
            target_url: target_url.to_string(),
            body,
            attempt_count: 0,
            created_at: event.occurred_at,
        }))
    }

    /// Renders the Slack body for an event, ignoring settings.
    pub fn render(&self, event: &RepositoryEvent) -> Result<SlackMessage, FormatError> {
        match event.event_type {
            EventType::Push => Ok(self.render_push(event)),
            event_type => render_pull_request(event, event_type),
        }
    }

    fn render_push(&self, event: &RepositoryEvent) -> SlackMessage {
        let actor = escape(&event.payload.actor);
        let repository = event.repository_id.to_string();
        let changes = &event.payload.ref_changes;

        let text = match changes.as_slice() {
            [] => format!("{actor} pushed to {repository}"),
            [single] => {
                format!("{actor} pushed to `{}` in {repository}", escape(single.display_name()))
            },
            many => format!("{actor} pushed to {} refs in {repository}", many.len()),
        };

        let mut lines: Vec<String> =
            changes.iter().take(self.max_ref_changes).map(describe_ref_change).collect();
        if changes.len() > self.max_ref_changes {
            lines.push(format!("and {} more", changes.len() - self.max_ref_changes));
        }

        let attachment = Attachment {
            fallback: text.clone(),
            color: color_for(EventType::Push).to_string(),
            title: Some(repository),
            title_link: event.payload.repository_link.clone(),
            text: (!lines.is_empty()).then(|| lines.join("\n")),
            fields: Vec::new(),
        };

        SlackMessage { text, attachments: vec![attachment] }
    }
}

fn render_pull_request(
    event: &RepositoryEvent,
    event_type: EventType,
) -> Result<SlackMessage, FormatError> {
    let pr = event.payload.pull_request.as_ref().ok_or(FormatError::MissingPullRequest { event_type })?;

    let comment = if event_type == EventType::PullRequestCommented {
        Some(event.payload.comment.as_deref().ok_or(FormatError::MissingComment)?)
    } else {
        None
    };

    let text = format!(
        "{} {} pull request #{} in {}",
        escape(&event.payload.actor),
        verb_for(event_type),
        pr.id,
        event.repository_id
    );

    let attachment = Attachment {
        fallback: text.clone(),
        color: color_for(event_type).to_string(),
        title: Some(format!("#{}: {}", pr.id, escape(&pr.title))),
        title_link: pr.link.clone(),
        text: comment.map(escape),
        fields: vec![
            AttachmentField {
                title: "Source".to_string(),
                value: escape(&pr.from_branch),
                short: true,
            },
            AttachmentField {
                title: "Target".to_string(),
                value: escape(&pr.to_branch),
                short: true,
            },
        ],
    };

    Ok(SlackMessage { text, attachments: vec![attachment] })
}

fn describe_ref_change(change: &RefChange) -> String {
    let name = escape(change.display_name());
    match change.kind {
        ChangeKind::Add => format!("`{name}` created at {}", short_hash(&change.to_hash)),
        ChangeKind::Update => format!(
            "`{name}` updated {}..{}",
            short_hash(&change.from_hash),
            short_hash(&change.to_hash)
        ),
        ChangeKind::Delete => format!("`{name}` deleted"),
    }
}

fn short_hash(hash: &str) -> &str {
    hash.char_indices().nth(SHORT_HASH_LEN).map_or(hash, |(idx, _)| &hash[..idx])
}

const fn verb_for(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Push => "pushed",
        EventType::PullRequestOpened => "opened",
        EventType::PullRequestReopened => "reopened",
        EventType::PullRequestUpdated => "updated",
        EventType::PullRequestMerged => "merged",
        EventType::PullRequestDeclined => "declined",
        EventType::PullRequestCommented => "commented on",
    }
}

const fn color_for(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Push => "#439FE0",
        EventType::PullRequestOpened | EventType::PullRequestReopened => "#2684FF",
        EventType::PullRequestUpdated => "#6554C0",
        EventType::PullRequestMerged => "#36B37E",
        EventType::PullRequestDeclined => "#DE350B",
        EventType::PullRequestCommented => "#97A0AF",
    }
}

/// Escapes the three characters Slack treats as control sequences.
fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
