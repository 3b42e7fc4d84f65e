//! In-memory notification store using DashMap.
//!
//! Implements the full lease, attempt-cap and retry-interval semantics of the
//! durable store. Messages are lost on service restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{
    failure_status, AcquireParams, AcquiredMessage, BulkMarkFailedParams, BulkMarkSentParams,
    EnqueueParams, InboxEntry, MessageMetadata, MessageStatus, NotificationTemplate,
    QueuedMessage, Store, StoreError, UserRecord,
};

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// In-memory notification store.
///
/// Each message lives in its own DashMap entry; a lease is claimed by
/// re-checking eligibility under the entry's write lock, so two notifiers
/// can never hold a live lease on the same message.
#[derive(Default)]
pub struct MemoryStore {
    messages: DashMap<Uuid, QueuedMessage>,
    templates: DashMap<Uuid, NotificationTemplate>,
    users: DashMap<Uuid, UserRecord>,
    inbox: Mutex<Vec<InboxEntry>>,
    paused: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_template(&self, template: NotificationTemplate) {
        self.templates.insert(template.id, template);
    }

    pub fn insert_user(&self, user: UserRecord) {
        self.users.insert(user.id, user);
    }

    /// Insert a message row as-is, bypassing metadata resolution.
    pub fn insert_message(&self, message: QueuedMessage) {
        self.messages.insert(message.id, message);
    }

    pub fn message(&self, id: Uuid) -> Option<QueuedMessage> {
        self.messages.get(&id).map(|m| m.clone())
    }

    pub fn count_by_status(&self, status: MessageStatus) -> usize {
        self.messages
            .iter()
            .filter(|entry| entry.status == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Expire every live lease so the leased messages can be claimed again.
    pub fn expire_leases(&self) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        for mut entry in self.messages.iter_mut() {
            if entry.status == MessageStatus::Leased {
                entry.leased_until = Some(past);
            }
        }
    }

    pub fn inbox(&self) -> Vec<InboxEntry> {
        self.inbox
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    fn lease(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        params: &AcquireParams,
    ) -> Option<AcquiredMessage> {
        let mut msg = self.messages.get_mut(&id)?;
        if !msg.is_leasable(now, params.max_attempts) {
            return None;
        }
        let template = self.templates.get(&msg.template_id)?;

        let queued_seconds = (now - msg.eligible_since())
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        msg.status = MessageStatus::Leased;
        msg.status_reason = Some(format!("Leased by notifier {}", params.notifier_id));
        msg.leased_by = Some(params.notifier_id);
        msg.leased_until = Some(now + chrono_duration(params.lease_period));
        msg.updated_at = now;

        Some(AcquiredMessage {
            id: msg.id,
            payload: msg.payload.clone(),
            method: msg.method,
            attempt_count: msg.attempt_count,
            queued_seconds,
            template_id: template.id,
            title_template: template.title_template.clone(),
            body_template: template.body_template.clone(),
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn acquire_messages(
        &self,
        params: AcquireParams,
    ) -> Result<Vec<AcquiredMessage>, StoreError> {
        if params.count == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();

        // Oldest first; eligibility is re-checked under the entry lock below
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = self
            .messages
            .iter()
            .filter(|entry| entry.is_leasable(now, params.max_attempts))
            .map(|entry| (entry.created_at, entry.id))
            .collect();
        candidates.sort();

        let mut acquired = Vec::with_capacity(params.count.min(candidates.len()));
        for (_, id) in candidates {
            if acquired.len() >= params.count {
                break;
            }
            if let Some(msg) = self.lease(id, now, &params) {
                acquired.push(msg);
            }
        }

        tracing::trace!(
            notifier_id = %params.notifier_id,
            count = acquired.len(),
            "Leased messages from memory store"
        );

        Ok(acquired)
    }

    async fn bulk_mark_sent(&self, params: BulkMarkSentParams) -> Result<u64, StoreError> {
        params.check_lengths()?;

        let mut updated = 0;
        for (id, sent_at) in params.ids.iter().zip(&params.sent_ats) {
            if let Some(mut msg) = self.messages.get_mut(id) {
                msg.attempt_count += 1;
                msg.status = MessageStatus::Sent;
                msg.status_reason = None;
                msg.leased_by = None;
                msg.leased_until = None;
                msg.next_retry_after = None;
                msg.updated_at = *sent_at;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn bulk_mark_failed(&self, params: BulkMarkFailedParams) -> Result<u64, StoreError> {
        params.check_lengths()?;

        let retry_interval = chrono_duration(params.retry_interval);
        let mut updated = 0;
        for (i, id) in params.ids.iter().enumerate() {
            let Some(mut msg) = self.messages.get_mut(id) else {
                continue;
            };
            let hint = params.statuses[i];
            let status = failure_status(
                msg.attempt_count,
                params.max_attempts,
                hint == MessageStatus::TemporaryFailure,
            );
            let failed_at = params.failed_ats[i];

            msg.attempt_count += 1;
            msg.status = status;
            msg.status_reason = Some(params.status_reasons[i].clone());
            msg.leased_by = None;
            msg.leased_until = None;
            msg.next_retry_after = (status == MessageStatus::TemporaryFailure)
                .then(|| Utc::now() + retry_interval);
            msg.updated_at = failed_at;
            updated += 1;
        }
        Ok(updated)
    }

    async fn enqueue_message(&self, params: EnqueueParams) -> Result<(), StoreError> {
        if !self.templates.contains_key(&params.template_id) {
            return Err(StoreError::NotFound(format!(
                "notification template {}",
                params.template_id
            )));
        }

        let mut msg = QueuedMessage::new(
            params.template_id,
            params.user_id,
            params.method,
            params.payload,
        );
        msg.id = params.id;
        msg.targets = params.targets;
        msg.created_by = params.created_by;
        self.messages.insert(msg.id, msg);
        Ok(())
    }

    async fn fetch_new_message_metadata(
        &self,
        user_id: Uuid,
        template_id: Uuid,
    ) -> Result<MessageMetadata, StoreError> {
        let template = self
            .templates
            .get(&template_id)
            .ok_or_else(|| StoreError::NotFound(format!("notification template {template_id}")))?;
        let user = self
            .users
            .get(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;

        Ok(MessageMetadata {
            notification_name: template.name.clone(),
            actions: template.actions.clone(),
            user_id: user.id,
            user_email: user.email.clone(),
            user_name: user.name.clone(),
            user_username: user.username.clone(),
        })
    }

    async fn notifier_paused(&self) -> Result<bool, StoreError> {
        Ok(self.paused.load(Ordering::SeqCst))
    }

    async fn insert_inbox_notification(&self, entry: InboxEntry) -> Result<(), StoreError> {
        let mut inbox = self
            .inbox
            .lock()
            .map_err(|_| StoreError::Unavailable("inbox lock poisoned".to_string()))?;
        // Redelivery after a lost result must not duplicate the entry
        if !inbox.iter().any(|existing| existing.id == entry.id) {
            inbox.push(entry);
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
