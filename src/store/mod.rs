//! Durable notification queue.
//!
//! The [`Store`] trait is the only way the dispatch pipeline touches queued
//! messages: leasing batches, bulk-marking outcomes, and the metadata reads
//! the enqueuer needs. Two implementations are provided:
//!
//! - [`MemoryStore`]: in-process storage using DashMap (default, and used in tests)
//! - [`PostgresStore`]: persistent storage using `FOR UPDATE SKIP LOCKED` leasing
//!
//! Use [`create_store()`] to pick one from configuration.

mod factory;
mod memory;
mod postgres;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::notification::{NotificationMethod, TemplateAction};
use crate::postgres::PostgresPoolError;

pub use factory::create_store;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// PostgreSQL operation failed
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Row or parameter contents that cannot be interpreted
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<PostgresPoolError> for StoreError {
    fn from(err: PostgresPoolError) -> Self {
        match err {
            PostgresPoolError::Sqlx(e) => StoreError::Postgres(e),
        }
    }
}

/// Lifecycle state of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Leased,
    Sent,
    TemporaryFailure,
    PermanentFailure,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Leased => "leased",
            MessageStatus::Sent => "sent",
            MessageStatus::TemporaryFailure => "temporary_failure",
            MessageStatus::PermanentFailure => "permanent_failure",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "leased" => Ok(MessageStatus::Leased),
            "sent" => Ok(MessageStatus::Sent),
            "temporary_failure" => Ok(MessageStatus::TemporaryFailure),
            "permanent_failure" => Ok(MessageStatus::PermanentFailure),
            other => Err(StoreError::InvalidData(format!("unknown message status {other}"))),
        }
    }
}

/// Final status of a failed attempt.
///
/// `attempt_count` is the number of attempts recorded before this one. A
/// retryable failure stays temporary only while attempts remain; once the
/// cap is reached the message is failed permanently.
pub fn failure_status(attempt_count: u32, max_attempts: u32, retryable: bool) -> MessageStatus {
    if retryable && attempt_count.saturating_add(1) < max_attempts {
        MessageStatus::TemporaryFailure
    } else {
        MessageStatus::PermanentFailure
    }
}

/// A message row as held by the store.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub template_id: Uuid,
    pub user_id: Uuid,
    pub method: NotificationMethod,
    pub payload: serde_json::Value,
    pub targets: Vec<Uuid>,
    pub created_by: String,
    pub status: MessageStatus,
    pub status_reason: Option<String>,
    pub attempt_count: u32,
    pub leased_by: Option<Uuid>,
    pub leased_until: Option<DateTime<Utc>>,
    pub next_retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(
        template_id: Uuid,
        user_id: Uuid,
        method: NotificationMethod,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            template_id,
            user_id,
            method,
            payload,
            targets: Vec::new(),
            created_by: String::new(),
            status: MessageStatus::Pending,
            status_reason: None,
            attempt_count: 0,
            leased_by: None,
            leased_until: None,
            next_retry_after: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the message may be leased at `now`.
    pub fn is_leasable(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        if self.attempt_count >= max_attempts {
            return false;
        }
        match self.status {
            MessageStatus::Pending => true,
            MessageStatus::Leased => self.leased_until.is_some_and(|until| until < now),
            MessageStatus::TemporaryFailure => {
                self.next_retry_after.map_or(true, |after| after <= now)
            }
            MessageStatus::Sent | MessageStatus::PermanentFailure => false,
        }
    }

    /// When the message last became eligible for leasing.
    pub fn eligible_since(&self) -> DateTime<Utc> {
        match self.status {
            MessageStatus::Leased => self.leased_until.unwrap_or(self.updated_at),
            MessageStatus::TemporaryFailure => self.next_retry_after.unwrap_or(self.updated_at),
            _ => self.created_at,
        }
    }
}

/// A template as referenced by queued messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub id: Uuid,
    pub name: String,
    pub title_template: String,
    pub body_template: String,
    /// Action labels and URL templates, rendered at enqueue time
    #[serde(default)]
    pub actions: Vec<TemplateAction>,
}

/// Recipient details used to build a message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct AcquireParams {
    pub count: usize,
    pub lease_period: Duration,
    pub max_attempts: u32,
    pub notifier_id: Uuid,
}

/// A leased message, joined with its template.
#[derive(Debug, Clone)]
pub struct AcquiredMessage {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub method: NotificationMethod,
    pub attempt_count: u32,
    /// Seconds between the message becoming eligible and this lease
    pub queued_seconds: f64,
    pub template_id: Uuid,
    pub title_template: String,
    pub body_template: String,
}

#[derive(Debug, Clone, Default)]
pub struct BulkMarkSentParams {
    pub ids: Vec<Uuid>,
    pub sent_ats: Vec<DateTime<Utc>>,
}

/// `statuses` are hints: the store downgrades a temporary failure to a
/// permanent one when the message has no attempts left.
#[derive(Debug, Clone, Default)]
pub struct BulkMarkFailedParams {
    pub ids: Vec<Uuid>,
    pub failed_ats: Vec<DateTime<Utc>>,
    pub statuses: Vec<MessageStatus>,
    pub status_reasons: Vec<String>,
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

impl BulkMarkFailedParams {
    pub(crate) fn check_lengths(&self) -> Result<(), StoreError> {
        let n = self.ids.len();
        if self.failed_ats.len() != n || self.statuses.len() != n || self.status_reasons.len() != n
        {
            return Err(StoreError::InvalidData(
                "bulk failure parameters have mismatched lengths".to_string(),
            ));
        }
        Ok(())
    }
}

impl BulkMarkSentParams {
    pub(crate) fn check_lengths(&self) -> Result<(), StoreError> {
        if self.sent_ats.len() != self.ids.len() {
            return Err(StoreError::InvalidData(
                "bulk sent parameters have mismatched lengths".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueParams {
    pub id: Uuid,
    pub template_id: Uuid,
    pub user_id: Uuid,
    pub method: NotificationMethod,
    pub payload: serde_json::Value,
    pub targets: Vec<Uuid>,
    pub created_by: String,
}

/// Template and recipient details resolved for a new message.
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub notification_name: String,
    pub actions: Vec<TemplateAction>,
    pub user_id: Uuid,
    pub user_email: String,
    pub user_name: String,
    pub user_username: String,
}

/// A notification delivered to a user's in-app inbox.
#[derive(Debug, Clone, Serialize)]
pub struct InboxEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub template_id: Uuid,
    pub targets: Vec<Uuid>,
    pub title: String,
    pub content: String,
    pub actions: Vec<TemplateAction>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically lease up to `params.count` eligible messages.
    ///
    /// A message is eligible when it is pending, its previous lease has
    /// expired, or its retry delay has elapsed, and it has fewer than
    /// `params.max_attempts` attempts recorded. A message under a live lease
    /// is never returned.
    async fn acquire_messages(
        &self,
        params: AcquireParams,
    ) -> Result<Vec<AcquiredMessage>, StoreError>;

    /// Mark messages sent. Returns the number of rows updated.
    async fn bulk_mark_sent(&self, params: BulkMarkSentParams) -> Result<u64, StoreError>;

    /// Mark messages failed. Returns the number of rows updated.
    async fn bulk_mark_failed(&self, params: BulkMarkFailedParams) -> Result<u64, StoreError>;

    async fn enqueue_message(&self, params: EnqueueParams) -> Result<(), StoreError>;

    async fn fetch_new_message_metadata(
        &self,
        user_id: Uuid,
        template_id: Uuid,
    ) -> Result<MessageMetadata, StoreError>;

    /// Whether dispatch has been paused by an operator.
    async fn notifier_paused(&self) -> Result<bool, StoreError>;

    async fn insert_inbox_notification(&self, entry: InboxEntry) -> Result<(), StoreError>;

    /// Backend type identifier
    fn backend_type(&self) -> &'static str;
}
