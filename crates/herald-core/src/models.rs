//! Core domain models and strongly-typed identifiers.
//!
//! Defines repository identifiers, the validated `SlackSettings` value,
//! repository events, outbound messages and delivery outcomes that flow
//! through the notification pipeline.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Strongly-typed event identifier.
///
/// Assigned by the event source. Duplicate deliveries of the same event
/// carry the same id.
///
/// # Example
///
/// ```
/// use herald_core::models::EventId;
/// let event_id = EventId::new();
/// println!("Processing event: {}", event_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Strongly-typed outbound message identifier.
///
/// Each event renders to at most one message, so the message id reuses the
/// event's UUID. Formatting the same event twice yields the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Derives the message id for an event.
    pub fn for_event(event_id: EventId) -> Self {
        Self(event_id.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Repository identifier: project key plus repository slug.
///
/// Used as the key for settings and delivery queues. Rendered as
/// `PROJECT/slug`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryId {
    project_key: String,
    slug: String,
}

impl RepositoryId {
    /// Creates a repository id, rejecting empty parts and embedded slashes.
    pub fn new(project_key: impl Into<String>, slug: impl Into<String>) -> Result<Self> {
        let project_key = project_key.into();
        let slug = slug.into();

        for (name, part) in [("project key", &project_key), ("slug", &slug)] {
            if part.trim().is_empty() {
                return Err(CoreError::InvalidRepositoryId(format!("{name} must not be empty")));
            }
            if part.contains('/') {
                return Err(CoreError::InvalidRepositoryId(format!(
                    "{name} must not contain '/': {part}"
                )));
            }
        }

        Ok(Self { project_key, slug })
    }

    /// Project key, e.g. `PROJ`.
    pub fn project_key(&self) -> &str {
        &self.project_key
    }

    /// Repository slug, e.g. `web-app`.
    pub fn slug(&self) -> &str {
        &self.slug
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_key, self.slug)
    }
}

impl FromStr for RepositoryId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (project_key, slug) = s
            .trim_matches('/')
            .split_once('/')
            .ok_or_else(|| CoreError::InvalidRepositoryId(format!("expected PROJECT/slug: {s}")))?;
        Self::new(project_key, slug)
    }
}

/// Why a rendered event produced no message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// Notifications are disabled for the repository.
    NotificationsDisabled,
    /// Push event while push notifications are disabled.
    PushNotificationsDisabled,
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotificationsDisabled => write!(f, "notifications_disabled"),
            Self::PushNotificationsDisabled => write!(f, "push_notifications_disabled"),
        }
    }
}

/// Unvalidated settings as submitted by an administrator or read from
/// storage. Converted into [`SlackSettings`] through validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsRecord {
    /// Master switch for the repository.
    #[serde(default)]
    pub enabled: bool,
    /// Whether push events are forwarded.
    #[serde(default, alias = "enabledForPush")]
    pub enabled_for_push: bool,
    /// Incoming webhook URL.
    #[serde(default, alias = "webhookUrl")]
    pub webhook_url: Option<String>,
}

/// Per-repository Slack notification settings.
///
/// Immutable once constructed. The constructor enforces the write-time
/// invariant: when `enabled` is true the webhook URL must be an absolute
/// `http` or `https` URL with a host. Empty URLs are normalized to `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SettingsRecord", into = "SettingsRecord")]
pub struct SlackSettings {
    enabled: bool,
    enabled_for_push: bool,
    webhook_url: Option<String>,
}

impl SlackSettings {
    /// Creates validated settings.
    pub fn new(enabled: bool, enabled_for_push: bool, webhook_url: Option<String>) -> Result<Self> {
        let webhook_url = webhook_url.map(|url| url.trim().to_string()).filter(|url| !url.is_empty());

        if enabled {
            match &webhook_url {
                None => {
                    return Err(CoreError::invalid_settings(
                        "webhook url is required when notifications are enabled",
                    ))
                },
                Some(url) => validate_webhook_url(url)?,
            }
        }

        Ok(Self { enabled, enabled_for_push, webhook_url })
    }

    /// Settings returned for repositories that were never configured.
    pub const fn disabled() -> Self {
        Self { enabled: false, enabled_for_push: false, webhook_url: None }
    }

    /// Whether notifications are enabled at all.
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether push events are forwarded.
    pub const fn is_enabled_for_push(&self) -> bool {
        self.enabled_for_push
    }

    /// Configured webhook URL.
    pub fn webhook_url(&self) -> Option<&str> {
        self.webhook_url.as_deref()
    }

    /// Re-checks the write-time invariant.
    pub fn validate(&self) -> Result<()> {
        Self::new(self.enabled, self.enabled_for_push, self.webhook_url.clone()).map(|_| ())
    }

    /// Returns the reason an event of this type must be suppressed, if any.
    pub fn suppression(&self, event_type: EventType) -> Option<SuppressReason> {
        if !self.enabled {
            Some(SuppressReason::NotificationsDisabled)
        } else if event_type.is_push() && !self.enabled_for_push {
            Some(SuppressReason::PushNotificationsDisabled)
        } else {
            None
        }
    }

    /// Whether an event of this type may be dispatched.
    pub fn permits(&self, event_type: EventType) -> bool {
        self.suppression(event_type).is_none()
    }
}

impl Default for SlackSettings {
    fn default() -> Self {
        Self::disabled()
    }
}

impl TryFrom<SettingsRecord> for SlackSettings {
    type Error = CoreError;

    fn try_from(record: SettingsRecord) -> Result<Self> {
        Self::new(record.enabled, record.enabled_for_push, record.webhook_url)
    }
}

impl From<SlackSettings> for SettingsRecord {
    fn from(settings: SlackSettings) -> Self {
        Self {
            enabled: settings.enabled,
            enabled_for_push: settings.enabled_for_push,
            webhook_url: settings.webhook_url,
        }
    }
}

fn validate_webhook_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| CoreError::invalid_settings(format!("webhook url is not valid: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(CoreError::invalid_settings(format!(
            "webhook url must use http or https, got {}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(CoreError::invalid_settings("webhook url must include a host"));
    }

    Ok(())
}

/// Kind of repository event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Commits pushed to one or more refs.
    Push,
    /// Pull request opened.
    PullRequestOpened,
    /// Previously declined pull request reopened.
    PullRequestReopened,
    /// New commits pushed to a pull request's source branch.
    PullRequestUpdated,
    /// Pull request merged.
    PullRequestMerged,
    /// Pull request declined.
    PullRequestDeclined,
    /// Comment added to a pull request.
    PullRequestCommented,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Push,
        Self::PullRequestOpened,
        Self::PullRequestReopened,
        Self::PullRequestUpdated,
        Self::PullRequestMerged,
        Self::PullRequestDeclined,
        Self::PullRequestCommented,
    ];

    /// Whether this is a push-type event governed by `enabled_for_push`.
    pub const fn is_push(self) -> bool {
        matches!(self, Self::Push)
    }

    /// Whether the event concerns a pull request.
    pub const fn is_pull_request(self) -> bool {
        !self.is_push()
    }

    /// Stable snake_case name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::PullRequestOpened => "pull_request_opened",
            Self::PullRequestReopened => "pull_request_reopened",
            Self::PullRequestUpdated => "pull_request_updated",
            Self::PullRequestMerged => "pull_request_merged",
            Self::PullRequestDeclined => "pull_request_declined",
            Self::PullRequestCommented => "pull_request_commented",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a ref moved in a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Ref created.
    Add,
    /// Ref moved to a new commit.
    Update,
    /// Ref deleted.
    Delete,
}

/// A single ref update carried by a push event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefChange {
    /// Fully qualified ref, e.g. `refs/heads/main`.
    pub ref_id: String,
    /// Commit before the change.
    #[serde(default)]
    pub from_hash: String,
    /// Commit after the change.
    #[serde(default)]
    pub to_hash: String,
    /// Kind of change.
    pub kind: ChangeKind,
}

impl RefChange {
    /// Ref name without the `refs/heads/` or `refs/tags/` prefix.
    pub fn display_name(&self) -> &str {
        self.ref_id
            .strip_prefix("refs/heads/")
            .or_else(|| self.ref_id.strip_prefix("refs/tags/"))
            .unwrap_or(&self.ref_id)
    }
}

/// Summary of the pull request an event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    /// Pull request number within the repository.
    pub id: u64,
    /// Title.
    pub title: String,
    /// Source branch.
    pub from_branch: String,
    /// Target branch.
    pub to_branch: String,
    /// Browser link.
    #[serde(default)]
    pub link: Option<String>,
}

/// Event body supplied by the event source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Display name of the user who caused the event.
    pub actor: String,
    /// Browser link to the repository.
    #[serde(default)]
    pub repository_link: Option<String>,
    /// Ref updates, for push events.
    #[serde(default)]
    pub ref_changes: Vec<RefChange>,
    /// Pull request summary, for pull request events.
    #[serde(default)]
    pub pull_request: Option<PullRequestRef>,
    /// Comment text, for comment events.
    #[serde(default)]
    pub comment: Option<String>,
}

/// A repository event as produced by the event source.
///
/// Immutable once produced. `sequence` increases monotonically per source
/// and breaks ties between events with equal timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryEvent {
    /// Source-assigned identifier.
    pub id: EventId,
    /// Repository the event belongs to.
    pub repository_id: RepositoryId,
    /// Kind of event.
    pub event_type: EventType,
    /// Event body.
    pub payload: EventPayload,
    /// Monotonic sequence number assigned by the source.
    pub sequence: u64,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
}

impl RepositoryEvent {
    /// Creates an event with a fresh id.
    pub fn new(
        repository_id: RepositoryId,
        event_type: EventType,
        payload: EventPayload,
        sequence: u64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self { id: EventId::new(), repository_id, event_type, payload, sequence, occurred_at }
    }
}

/// Slack incoming-webhook payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlackMessage {
    /// Headline text.
    pub text: String,
    /// Rich attachments, omitted from the wire when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// Slack message attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Plain-text summary for clients that cannot render attachments.
    pub fallback: String,
    /// Sidebar colour as a hex string.
    pub color: String,
    /// Attachment title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Link behind the title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_link: Option<String>,
    /// Body text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Short key/value fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<AttachmentField>,
}

/// Key/value pair shown in an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentField {
    /// Field label.
    pub title: String,
    /// Field value.
    pub value: String,
    /// Render side by side with other short fields.
    pub short: bool,
}

/// A formatted message waiting for delivery.
///
/// Created by the formatter and owned by the delivery queue until it
/// reaches a terminal outcome. The target URL is captured at format time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Message identifier, derived from the event id.
    pub id: MessageId,
    /// Event the message was rendered from.
    pub event_id: EventId,
    /// Owning repository.
    pub repository_id: RepositoryId,
    /// Event type, kept for re-filtering before dispatch.
    pub event_type: EventType,
    /// Webhook URL to POST to.
    pub target_url: String,
    /// JSON body.
    pub body: SlackMessage,
    /// Delivery attempts made so far.
    pub attempt_count: u32,
    /// Mirrors the event's `occurred_at`.
    pub created_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// Serializes the body exactly as it goes on the wire.
    pub fn body_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.body)
    }
}

/// Terminal status of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Webhook answered 2xx.
    Delivered,
    /// Transient failures exhausted the retry budget.
    Dropped,
    /// Webhook rejected the message with a non-429 4xx.
    DroppedPermanent,
    /// Circuit for the target was open, no request was made.
    CircuitOpen,
}

impl DeliveryStatus {
    /// Whether the message reached the webhook.
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Delivered)
    }

    /// Whether this outcome counts toward opening the target's circuit.
    pub const fn is_terminal_failure(self) -> bool {
        matches!(self, Self::Dropped | Self::DroppedPermanent)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Dropped => write!(f, "dropped"),
            Self::DroppedPermanent => write!(f, "dropped_permanent"),
            Self::CircuitOpen => write!(f, "circuit_open"),
        }
    }
}

/// Result of delivering one outbound message.
///
/// Reported for logging and statistics. Never feeds back into settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Delivered message.
    pub message_id: MessageId,
    /// Source event.
    pub event_id: EventId,
    /// Owning repository.
    pub repository_id: RepositoryId,
    /// Webhook URL.
    pub target_url: String,
    /// Terminal status.
    pub status: DeliveryStatus,
    /// Last HTTP status received, if any.
    pub http_status: Option<u16>,
    /// Last transport or HTTP error description.
    pub error: Option<String>,
    /// HTTP requests issued.
    pub attempts: u32,
    /// When the outcome was decided.
    pub completed_at: DateTime<Utc>,
}

impl DeliveryOutcome {
    /// Whether the message reached the webhook.
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Lifecycle of a single repository event inside the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationState {
    /// Emitted by the event source.
    Received,
    /// Suppressed by settings.
    Filtered,
    /// Rendered to an outbound message.
    Formatted,
    /// Waiting in the repository queue.
    Enqueued,
    /// HTTP delivery in progress, retries included.
    Delivering,
    /// Webhook accepted the message.
    Delivered,
    /// Dropped after transient failures, queue overflow or an open circuit.
    Dropped,
    /// Rejected by the webhook with a permanent error.
    DroppedPermanent,
}

impl NotificationState {
    /// Whether the event has left the pipeline.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filtered | Self::Delivered | Self::Dropped | Self::DroppedPermanent)
    }

    /// Checks whether moving to `next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::Filtered | Self::Formatted | Self::Dropped)
                | (Self::Formatted, Self::Enqueued | Self::Dropped)
                | (Self::Enqueued, Self::Delivering | Self::Filtered | Self::Dropped)
                | (Self::Delivering, Self::Delivered | Self::Dropped | Self::DroppedPermanent)
        )
    }
}

impl From<DeliveryStatus> for NotificationState {
    fn from(status: DeliveryStatus) -> Self {
        match status {
            DeliveryStatus::Delivered => Self::Delivered,
            DeliveryStatus::Dropped | DeliveryStatus::CircuitOpen => Self::Dropped,
            DeliveryStatus::DroppedPermanent => Self::DroppedPermanent,
        }
    }
}

impl fmt::Display for NotificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::Filtered => write!(f, "filtered"),
            Self::Formatted => write!(f, "formatted"),
            Self::Enqueued => write!(f, "enqueued"),
            Self::Delivering => write!(f, "delivering"),
            Self::Delivered => write!(f, "delivered"),
            Self::Dropped => write!(f, "dropped"),
            Self::DroppedPermanent => write!(f, "dropped_permanent"),
        }
    }
}
