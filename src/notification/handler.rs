//! The delivery handler contract.
//!
//! A [`Handler`] turns a rendered message into a [`DeliveryFn`]. Building the
//! callable is where everything that can be checked without I/O is checked;
//! a [`HandlerError`] is never retried. The callable performs the send and
//! classifies its own failure as [`DeliveryError::Temporary`] or
//! [`DeliveryError::Permanent`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::types::{MessagePayload, NotificationMethod};
use crate::template::RenderError;

/// Failure to build a delivery callable. Always permanent.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("handler not configured: {0}")]
    NotConfigured(String),

    #[error("render: {0}")]
    Render(#[from] RenderError),

    #[error("no handler registered for method {0}")]
    UnknownMethod(NotificationMethod),
}

/// Outcome of a failed delivery attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Eligible for another attempt, subject to the attempt cap
    #[error("temporary failure: {0}")]
    Temporary(String),

    /// Never attempted again
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("delivery cancelled")]
    Cancelled,

    #[error("delivery deadline exceeded")]
    DeadlineExceeded,
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Temporary(_))
    }

    /// Cancellation and deadline errors describe the caller's context, not
    /// the message, and are never recorded as a message outcome.
    pub fn is_context_error(&self) -> bool {
        matches!(self, DeliveryError::Cancelled | DeliveryError::DeadlineExceeded)
    }
}

/// Performs one delivery attempt for the given message id.
pub type DeliveryFn =
    Box<dyn FnOnce(CancellationToken, Uuid) -> BoxFuture<'static, Result<(), DeliveryError>> + Send>;

/// Box an async closure as a [`DeliveryFn`].
pub fn delivery_fn<F, Fut>(f: F) -> DeliveryFn
where
    F: FnOnce(CancellationToken, Uuid) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), DeliveryError>> + Send + 'static,
{
    Box::new(move |ctx, msg_id| Box::pin(f(ctx, msg_id)))
}

pub trait Handler: Send + Sync {
    fn dispatcher(
        &self,
        payload: MessagePayload,
        title: String,
        body: String,
    ) -> Result<DeliveryFn, HandlerError>;
}

/// Immutable mapping from delivery method to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NotificationMethod, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, method: NotificationMethod, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(method, handler);
        self
    }

    pub fn get(&self, method: NotificationMethod) -> Result<Arc<dyn Handler>, HandlerError> {
        self.handlers
            .get(&method)
            .cloned()
            .ok_or(HandlerError::UnknownMethod(method))
    }

    pub fn contains(&self, method: NotificationMethod) -> bool {
        self.handlers.contains_key(&method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl FromIterator<(NotificationMethod, Arc<dyn Handler>)> for HandlerRegistry {
    fn from_iter<I: IntoIterator<Item = (NotificationMethod, Arc<dyn Handler>)>>(iter: I) -> Self {
        Self {
            handlers: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Handler for Echo {
        fn dispatcher(
            &self,
            _payload: MessagePayload,
            title: String,
            _body: String,
        ) -> Result<DeliveryFn, HandlerError> {
            Ok(delivery_fn(move |_ctx, _id| async move {
                if title.is_empty() {
                    Err(DeliveryError::Permanent("empty title".into()))
                } else {
                    Ok(())
                }
            }))
        }
    }

    fn payload() -> MessagePayload {
        MessagePayload {
            version: "1.0".into(),
            notification_name: "test".into(),
            notification_template_id: None,
            user_id: Uuid::nil().to_string(),
            user_email: String::new(),
            user_name: String::new(),
            user_username: String::new(),
            actions: vec![],
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_delivery_error_classification() {
        assert!(DeliveryError::Temporary("x".into()).is_retryable());
        assert!(!DeliveryError::Permanent("x".into()).is_retryable());
        assert!(DeliveryError::Cancelled.is_context_error());
        assert!(DeliveryError::DeadlineExceeded.is_context_error());
        assert!(!DeliveryError::Temporary("x".into()).is_context_error());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HandlerRegistry::new().with(NotificationMethod::Webhook, Arc::new(Echo));

        assert!(registry.get(NotificationMethod::Webhook).is_ok());
        assert!(matches!(
            registry.get(NotificationMethod::Smtp),
            Err(HandlerError::UnknownMethod(NotificationMethod::Smtp))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_fn_runs() {
        let handler = Echo;
        let deliver = handler
            .dispatcher(payload(), "hello".into(), String::new())
            .unwrap();
        assert_eq!(deliver(CancellationToken::new(), Uuid::new_v4()).await, Ok(()));

        let deliver = handler
            .dispatcher(payload(), String::new(), String::new())
            .unwrap();
        assert!(matches!(
            deliver(CancellationToken::new(), Uuid::new_v4()).await,
            Err(DeliveryError::Permanent(_))
        ));
    }
}
