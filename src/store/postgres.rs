//! PostgreSQL-backed notification store.
//!
//! Table structure:
//! - `notification_messages` - queued messages with status, lease and retry columns
//! - `notification_templates` - title/body templates and action URL templates
//! - `users` - recipient details
//! - `inbox_notifications` - in-app inbox entries
//! - `notification_settings` - single-row operator switches (`notifier_paused`)
//!
//! The schema lives in `migrations/001_notifications.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::notification::{NotificationMethod, TemplateAction};

use super::{
    AcquireParams, AcquiredMessage, BulkMarkFailedParams, BulkMarkSentParams, EnqueueParams,
    InboxEntry, MessageMetadata, MessageStatus, Store, StoreError,
};

/// Leases up to `$4` eligible messages for notifier `$1`, oldest first.
///
/// `SKIP LOCKED` lets concurrent notifiers claim disjoint batches without
/// waiting on each other.
const ACQUIRE_MESSAGES: &str = r#"
WITH candidates AS (
    SELECT nm.id,
        CASE nm.status
            WHEN 'leased' THEN nm.leased_until
            WHEN 'temporary_failure' THEN COALESCE(nm.next_retry_after, nm.updated_at)
            ELSE nm.created_at
        END AS eligible_since
    FROM notification_messages nm
    WHERE (
            nm.status = 'pending'
            OR (nm.status = 'leased' AND nm.leased_until < NOW())
            OR (nm.status = 'temporary_failure'
                AND (nm.next_retry_after IS NULL OR nm.next_retry_after <= NOW()))
        )
        AND nm.attempt_count < $3
    ORDER BY nm.created_at ASC
    LIMIT $4
    FOR UPDATE SKIP LOCKED
),
acquired AS (
    UPDATE notification_messages nm
    SET updated_at = NOW(),
        status = 'leased',
        status_reason = 'Leased by notifier ' || $1::uuid::text,
        leased_by = $1::uuid,
        leased_until = NOW() + make_interval(secs => $2)
    FROM candidates c
    WHERE nm.id = c.id
    RETURNING nm.id, nm.payload, nm.method, nm.attempt_count,
        nm.notification_template_id, c.eligible_since
)
SELECT a.id, a.payload, a.method, a.attempt_count,
    GREATEST(EXTRACT(EPOCH FROM (NOW() - a.eligible_since)), 0)::float8 AS queued_seconds,
    t.id, t.title_template, t.body_template
FROM acquired a
JOIN notification_templates t ON t.id = a.notification_template_id
"#;

const BULK_MARK_SENT: &str = r#"
UPDATE notification_messages nm
SET updated_at = new_values.sent_at,
    attempt_count = nm.attempt_count + 1,
    status = 'sent',
    status_reason = NULL,
    leased_by = NULL,
    leased_until = NULL,
    next_retry_after = NULL
FROM (SELECT UNNEST($1::uuid[]) AS id, UNNEST($2::timestamptz[]) AS sent_at) AS new_values
WHERE nm.id = new_values.id
"#;

/// A temporary failure stays temporary only while attempts remain.
const BULK_MARK_FAILED: &str = r#"
UPDATE notification_messages nm
SET updated_at = subquery.failed_at,
    attempt_count = nm.attempt_count + 1,
    status = CASE
        WHEN subquery.status = 'temporary_failure' AND nm.attempt_count + 1 < $5
            THEN 'temporary_failure'
        ELSE 'permanent_failure'
    END,
    status_reason = subquery.status_reason,
    leased_by = NULL,
    leased_until = NULL,
    next_retry_after = CASE
        WHEN subquery.status = 'temporary_failure' AND nm.attempt_count + 1 < $5
            THEN NOW() + make_interval(secs => $6)
        ELSE NULL
    END
FROM (SELECT UNNEST($1::uuid[]) AS id,
             UNNEST($2::timestamptz[]) AS failed_at,
             UNNEST($3::text[]) AS status,
             UNNEST($4::text[]) AS status_reason) AS subquery
WHERE nm.id = subquery.id
"#;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_method(value: &str) -> Result<NotificationMethod, StoreError> {
    value
        .parse()
        .map_err(|e: crate::notification::UnknownMethod| StoreError::InvalidData(e.to_string()))
}

fn to_attempts(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

type AcquireRow = (
    Uuid,
    serde_json::Value,
    String,
    i32,
    f64,
    Uuid,
    String,
    String,
);

#[async_trait]
impl Store for PostgresStore {
    async fn acquire_messages(
        &self,
        params: AcquireParams,
    ) -> Result<Vec<AcquiredMessage>, StoreError> {
        let rows: Vec<AcquireRow> = sqlx::query_as(ACQUIRE_MESSAGES)
            .bind(params.notifier_id)
            .bind(params.lease_period.as_secs_f64())
            .bind(i32::try_from(params.max_attempts).unwrap_or(i32::MAX))
            .bind(i64::try_from(params.count).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(
                |(id, payload, method, attempts, queued_seconds, template_id, title, body)| {
                    Ok(AcquiredMessage {
                        id,
                        payload,
                        method: parse_method(&method)?,
                        attempt_count: to_attempts(attempts),
                        queued_seconds,
                        template_id,
                        title_template: title,
                        body_template: body,
                    })
                },
            )
            .collect()
    }

    async fn bulk_mark_sent(&self, params: BulkMarkSentParams) -> Result<u64, StoreError> {
        params.check_lengths()?;
        if params.ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(BULK_MARK_SENT)
            .bind(&params.ids)
            .bind(&params.sent_ats)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn bulk_mark_failed(&self, params: BulkMarkFailedParams) -> Result<u64, StoreError> {
        params.check_lengths()?;
        if params.ids.is_empty() {
            return Ok(0);
        }

        let statuses: Vec<&str> = params.statuses.iter().map(MessageStatus::as_str).collect();
        let result = sqlx::query(BULK_MARK_FAILED)
            .bind(&params.ids)
            .bind(&params.failed_ats)
            .bind(&statuses)
            .bind(&params.status_reasons)
            .bind(i32::try_from(params.max_attempts).unwrap_or(i32::MAX))
            .bind(params.retry_interval.as_secs_f64())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn enqueue_message(&self, params: EnqueueParams) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notification_messages
                (id, notification_template_id, user_id, method, payload, targets, created_by, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            "#,
        )
        .bind(params.id)
        .bind(params.template_id)
        .bind(params.user_id)
        .bind(params.method.as_str())
        .bind(&params.payload)
        .bind(&params.targets)
        .bind(&params.created_by)
        .execute(&self.pool)
        .await?;

        tracing::trace!(
            msg_id = %params.id,
            method = %params.method,
            "Message enqueued to PostgreSQL"
        );

        Ok(())
    }

    async fn fetch_new_message_metadata(
        &self,
        user_id: Uuid,
        template_id: Uuid,
    ) -> Result<MessageMetadata, StoreError> {
        let row: Option<(String, serde_json::Value, Uuid, String, String, String)> =
            sqlx::query_as(
                r#"
                SELECT t.name, t.actions, u.id, u.email, u.name, u.username
                FROM notification_templates t, users u
                WHERE t.id = $1 AND u.id = $2
                "#,
            )
            .bind(template_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let (name, actions, user_id, email, user_name, username) = row.ok_or_else(|| {
            StoreError::NotFound(format!("template {template_id} or user {user_id}"))
        })?;
        let actions: Vec<TemplateAction> = serde_json::from_value(actions)?;

        Ok(MessageMetadata {
            notification_name: name,
            actions,
            user_id,
            user_email: email,
            user_name,
            user_username: username,
        })
    }

    async fn notifier_paused(&self) -> Result<bool, StoreError> {
        let (paused,): (bool,) = sqlx::query_as(
            "SELECT COALESCE((SELECT notifier_paused FROM notification_settings LIMIT 1), false)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(paused)
    }

    async fn insert_inbox_notification(&self, entry: InboxEntry) -> Result<(), StoreError> {
        let actions = serde_json::to_value(&entry.actions)?;
        let created_at: DateTime<Utc> = entry.created_at;
        sqlx::query(
            r#"
            INSERT INTO inbox_notifications
                (id, user_id, template_id, targets, title, content, actions, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.template_id)
        .bind(&entry.targets)
        .bind(&entry.title)
        .bind(&entry.content)
        .bind(&actions)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
