//! Webhook delivery.
//!
//! Each message is POSTed as JSON to the configured endpoint. Any transport
//! error or non-2xx response is a temporary failure.

use reqwest::{Client, Url};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::notification::handler::{delivery_fn, DeliveryError, DeliveryFn, Handler, HandlerError};
use crate::notification::types::MessagePayload;

/// Version of the webhook request body.
pub const WEBHOOK_BODY_VERSION: &str = "1.1";

/// Longest response body excerpt kept in a failure reason.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct WebhookBody {
    #[serde(rename = "_version")]
    version: &'static str,
    msg_id: Uuid,
    payload: MessagePayload,
    title: String,
    body: String,
}

pub struct WebhookHandler {
    client: Client,
    endpoint: Option<Url>,
}

impl WebhookHandler {
    /// `endpoint` may be unset; every dispatch then fails permanently.
    pub fn new(client: Client, endpoint: Option<&str>) -> Result<Self, HandlerError> {
        let endpoint = endpoint
            .map(|raw| {
                Url::parse(raw).map_err(|e| {
                    HandlerError::NotConfigured(format!("invalid webhook endpoint {raw:?}: {e}"))
                })
            })
            .transpose()?;

        if endpoint.is_none() {
            tracing::warn!("Webhook endpoint not configured, webhook notifications will fail");
        }

        Ok(Self { client, endpoint })
    }
}

impl Handler for WebhookHandler {
    fn dispatcher(
        &self,
        payload: MessagePayload,
        title: String,
        body: String,
    ) -> Result<DeliveryFn, HandlerError> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| HandlerError::NotConfigured("webhook endpoint is not set".into()))?;
        let client = self.client.clone();

        Ok(delivery_fn(move |ctx: CancellationToken, msg_id: Uuid| async move {
            let request = client.post(endpoint).json(&WebhookBody {
                version: WEBHOOK_BODY_VERSION,
                msg_id,
                payload,
                title,
                body,
            });

            let response = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(DeliveryError::Cancelled),
                response = request.send() => response,
            };

            let response = response
                .map_err(|e| DeliveryError::Temporary(format!("webhook request failed: {e}")))?;
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let mut text = response.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            Err(DeliveryError::Temporary(format!(
                "webhook returned non-2xx status {status}: {text}"
            )))
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn payload() -> MessagePayload {
        MessagePayload {
            version: "1.0".into(),
            notification_name: "Workspace Deleted".into(),
            notification_template_id: None,
            user_id: Uuid::new_v4().to_string(),
            user_email: "bobby@example.com".into(),
            user_name: "Bobby".into(),
            user_username: "bobby".into(),
            actions: vec![],
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let result = WebhookHandler::new(Client::new(), Some("not a url"));
        assert!(matches!(result, Err(HandlerError::NotConfigured(_))));
    }

    #[test]
    fn test_missing_endpoint_is_construction_failure() {
        let handler = WebhookHandler::new(Client::new(), None).unwrap();
        let result = handler.dispatcher(payload(), "t".into(), "b".into());
        assert!(matches!(result, Err(HandlerError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let handler =
            WebhookHandler::new(Client::new(), Some("http://127.0.0.1:9/hook")).unwrap();
        let deliver = handler
            .dispatcher(payload(), "t".into(), "b".into())
            .unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        assert_eq!(deliver(ctx, Uuid::new_v4()).await, Err(DeliveryError::Cancelled));
    }

    #[test]
    fn test_body_shape() {
        let body = WebhookBody {
            version: WEBHOOK_BODY_VERSION,
            msg_id: Uuid::nil(),
            payload: payload(),
            title: "Title".into(),
            body: "Body".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["_version"], "1.1");
        assert_eq!(json["title"], "Title");
        assert_eq!(json["payload"]["user_email"], "bobby@example.com");
    }
}
