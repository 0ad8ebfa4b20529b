//! Core domain models, settings and message formatting.
//!
//! Provides the strongly-typed primitives shared by every herald crate:
//! repository identifiers, validated Slack settings, repository events,
//! outbound messages and delivery outcomes. Also hosts the settings store
//! abstraction with in-memory and SQLite implementations, the pure
//! notification formatter, and the clock used for deterministic testing.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod formatter;
pub mod models;
pub mod settings;
pub mod storage;
pub mod time;

pub use error::{CoreError, HeraldError, Result};
pub use events::{
    MulticastOutcomeHandler, NoOpOutcomeHandler, NotificationEvent, OutcomeHandler,
};
pub use formatter::{FormatError, NotificationFormatter, Rendered};
pub use models::{
    Attachment, AttachmentField, ChangeKind, DeliveryOutcome, DeliveryStatus, EventId,
    EventPayload, EventType, MessageId, NotificationState, OutboundMessage, PullRequestRef,
    RefChange, RepositoryEvent, RepositoryId, SettingsRecord, SlackMessage, SlackSettings,
    SuppressReason,
};
pub use settings::{InMemorySettingsStore, SettingsStore};
pub use time::{Clock, RealClock, TestClock};
