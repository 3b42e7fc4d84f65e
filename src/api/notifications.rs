//! Notification enqueue endpoint.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::notification::EnqueueRequest;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct EnqueueNotificationResponse {
    /// Id of the queued message; absent when notifications are discarded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub enqueued: bool,
    pub timestamp: DateTime<Utc>,
}

/// POST /api/v1/notifications
#[tracing::instrument(skip_all)]
pub async fn enqueue_notification(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueNotificationResponse>)> {
    let template_id = request.template_id;
    let user_id = request.user_id;
    let message_id = state.enqueuer.enqueue(request).await?;

    tracing::info!(
        message_id = ?message_id,
        template_id = %template_id,
        user_id = %user_id,
        "Notification enqueued via HTTP API"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueNotificationResponse {
            message_id,
            enqueued: message_id.is_some(),
            timestamp: Utc::now(),
        }),
    ))
}
