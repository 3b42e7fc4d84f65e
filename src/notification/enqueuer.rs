//! The producer side of the queue: turns "tell this user about X" into a
//! queued message.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use super::types::{MessagePayload, NotificationMethod, TemplateAction, PAYLOAD_VERSION};
use crate::config::NotificationsConfig;
use crate::store::{EnqueueParams, Store, StoreError};
use crate::template::{self, RenderError};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("render action: {0}")]
    Render(#[from] RenderError),

    #[error("serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A request to notify one user using one template.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub user_id: Uuid,
    pub template_id: Uuid,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub targets: Vec<Uuid>,
    #[serde(default)]
    pub created_by: String,
}

#[async_trait]
pub trait Enqueuer: Send + Sync {
    /// Queue a notification. Returns the new message id, or `None` when the
    /// enqueuer discards notifications.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Option<Uuid>, EnqueueError>;
}

/// Enqueuer which writes messages to the store for the notifiers to pick up.
pub struct StoreEnqueuer {
    store: Arc<dyn Store>,
    method: NotificationMethod,
    helpers: Arc<HashMap<String, String>>,
}

impl StoreEnqueuer {
    pub fn new(store: Arc<dyn Store>, config: &NotificationsConfig) -> Self {
        Self {
            store,
            method: config.method,
            helpers: Arc::new(config.helpers.to_map()),
        }
    }

    async fn build_payload(&self, request: &EnqueueRequest) -> Result<MessagePayload, EnqueueError> {
        let metadata = self
            .store
            .fetch_new_message_metadata(request.user_id, request.template_id)
            .await?;

        let mut payload = MessagePayload {
            version: PAYLOAD_VERSION.to_string(),
            notification_name: metadata.notification_name,
            notification_template_id: Some(request.template_id.to_string()),
            user_id: metadata.user_id.to_string(),
            user_email: metadata.user_email,
            user_name: metadata.user_name,
            user_username: metadata.user_username,
            actions: Vec::new(),
            labels: request.labels.clone(),
        };

        let vars = payload.template_vars(&self.helpers);
        payload.actions = metadata
            .actions
            .iter()
            .map(|action| {
                Ok(TemplateAction {
                    label: template::render(&action.label, &vars)?,
                    url: template::render(&action.url, &vars)?,
                })
            })
            .collect::<Result<_, RenderError>>()?;

        Ok(payload)
    }
}

#[async_trait]
impl Enqueuer for StoreEnqueuer {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Option<Uuid>, EnqueueError> {
        let payload = self.build_payload(&request).await?;
        let id = Uuid::new_v4();

        self.store
            .enqueue_message(EnqueueParams {
                id,
                template_id: request.template_id,
                user_id: request.user_id,
                method: self.method,
                payload: serde_json::to_value(&payload)?,
                targets: request.targets,
                created_by: request.created_by,
            })
            .await?;

        tracing::debug!(
            msg_id = %id,
            template_id = %request.template_id,
            user_id = %request.user_id,
            method = %self.method,
            "Notification enqueued"
        );

        Ok(Some(id))
    }
}

/// Enqueuer which drops every notification.
pub struct NoopEnqueuer;

#[async_trait]
impl Enqueuer for NoopEnqueuer {
    async fn enqueue(&self, _request: EnqueueRequest) -> Result<Option<Uuid>, EnqueueError> {
        Ok(None)
    }
}
