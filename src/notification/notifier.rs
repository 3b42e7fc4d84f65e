//! A single lease, render, dispatch and report loop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use prometheus::IntGauge;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::handler::{DeliveryError, DeliveryFn, HandlerError, HandlerRegistry};
use super::types::{DispatchResult, MessagePayload};
use crate::config::NotificationsConfig;
use crate::metrics::Metrics;
use crate::store::{failure_status, AcquireParams, AcquiredMessage, MessageStatus, Store};
use crate::template;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("notifier cancelled")]
    Cancelled,

    #[error("dispatch of message {msg_id} exceeded its deadline")]
    DeadlineExceeded { msg_id: Uuid },

    #[error("result channel closed")]
    ChannelClosed,

    #[error("dispatch task failed: {0}")]
    Join(String),
}

/// Sending halves of the shared success and failure result buffers.
#[derive(Clone)]
pub(crate) struct ResultChannels {
    pub success: mpsc::Sender<DispatchResult>,
    pub failure: mpsc::Sender<DispatchResult>,
}

impl ResultChannels {
    pub fn success_pending(&self) -> usize {
        self.success.max_capacity() - self.success.capacity()
    }

    pub fn failure_pending(&self) -> usize {
        self.failure.max_capacity() - self.failure.capacity()
    }

    /// Blocks while the target buffer is full. A cancelled `ctx` abandons the
    /// result; the message lease then expires and the message is redelivered.
    async fn publish(
        &self,
        ctx: &CancellationToken,
        result: DispatchResult,
    ) -> Result<(), NotifierError> {
        let tx = if result.is_success() {
            &self.success
        } else {
            &self.failure
        };

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(NotifierError::Cancelled),
            sent = tx.send(result) => sent.map_err(|_| NotifierError::ChannelClosed),
        }
    }
}

pub struct Notifier {
    id: Uuid,
    config: Arc<NotificationsConfig>,
    store: Arc<dyn Store>,
    handlers: HandlerRegistry,
    metrics: Metrics,
    helpers: Arc<HashMap<String, String>>,
    quit: CancellationToken,
    done: CancellationToken,
    started: AtomicBool,
}

impl Notifier {
    pub(crate) fn new(
        config: Arc<NotificationsConfig>,
        store: Arc<dyn Store>,
        handlers: HandlerRegistry,
        metrics: Metrics,
        helpers: Arc<HashMap<String, String>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            store,
            handlers,
            metrics,
            helpers,
            quit: CancellationToken::new(),
            done: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Build the notifier's loop future.
    ///
    /// The done signal fires when the future completes or is dropped, so a
    /// pending [`Notifier::stop`] is released even if the task is aborted.
    pub(crate) fn run(
        self: Arc<Self>,
        ctx: CancellationToken,
        channels: ResultChannels,
    ) -> impl Future<Output = Result<(), NotifierError>> + Send + 'static {
        self.started.store(true, Ordering::SeqCst);
        let done = self.done.clone().drop_guard();

        async move {
            let _done = done;
            self.run_loop(ctx, channels).await
        }
    }

    async fn run_loop(
        self: Arc<Self>,
        ctx: CancellationToken,
        channels: ResultChannels,
    ) -> Result<(), NotifierError> {
        tracing::info!(notifier_id = %self.id, "Notifier started");

        // First tick completes immediately
        let mut ticker = time::interval(self.config.fetch_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.quit.cancelled() => {
                    tracing::info!(notifier_id = %self.id, "Notifier stopped");
                    return Ok(());
                }
                _ = ctx.cancelled() => {
                    tracing::warn!(notifier_id = %self.id, "Notifier context cancelled");
                    return Err(NotifierError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            match self.store.notifier_paused().await {
                Ok(false) => {}
                Ok(true) => {
                    tracing::debug!(notifier_id = %self.id, "Notifier paused, skipping fetch");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        notifier_id = %self.id,
                        error = %e,
                        "Failed to check whether notifier is paused, skipping fetch"
                    );
                    continue;
                }
            }

            if let Err(e) = self.process(&ctx, &channels).await {
                let fatal = matches!(e, NotifierError::Cancelled | NotifierError::ChannelClosed);
                if fatal || ctx.is_cancelled() {
                    return Err(e);
                }
                tracing::error!(notifier_id = %self.id, error = %e, "Failed to process messages");
            }
        }
    }

    /// Lease one batch and dispatch it, returning once every result in the
    /// batch has been published.
    #[tracing::instrument(skip_all, fields(notifier_id = %self.id))]
    async fn process(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        channels: &ResultChannels,
    ) -> Result<(), NotifierError> {
        let leased = self
            .store
            .acquire_messages(AcquireParams {
                count: self.config.lease_count,
                lease_period: self.config.lease_period(),
                max_attempts: self.config.max_send_attempts,
                notifier_id: self.id,
            })
            .await;

        let messages = match leased {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to acquire messages");
                return Ok(());
            }
        };

        if messages.is_empty() {
            tracing::trace!("No messages to dispatch");
            return Ok(());
        }
        tracing::debug!(count = messages.len(), "Dispatching leased messages");

        let mut tasks = JoinSet::new();
        for msg in messages {
            let deliver = match self.prepare(&msg) {
                Ok(deliver) => deliver,
                Err(e) => {
                    tracing::warn!(
                        msg_id = %msg.id,
                        method = %msg.method,
                        error = %e,
                        "Failed to prepare message"
                    );
                    self.metrics.record_permanent_failure(
                        msg.method.as_str(),
                        &msg.template_id.to_string(),
                    );
                    let result = DispatchResult::failure(self.id, msg.id, e.to_string(), false);
                    channels.publish(ctx, result).await?;
                    self.update_pending(channels);
                    continue;
                }
            };

            let this = Arc::clone(self);
            let ctx = ctx.clone();
            let channels = channels.clone();
            tasks.spawn(async move { this.deliver(ctx, channels, msg, deliver).await });
        }

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(NotifierError::Join(e.to_string())));
            if let Err(e) = outcome {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn prepare(&self, msg: &AcquiredMessage) -> Result<DeliveryFn, HandlerError> {
        let payload: MessagePayload = serde_json::from_value(msg.payload.clone())
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        let handler = self.handlers.get(msg.method)?;

        let vars = payload.template_vars(&self.helpers);
        let title = template::render(&msg.title_template, &vars)?;
        let body = template::render(&msg.body_template, &vars)?;

        handler.dispatcher(payload, title, body)
    }

    async fn deliver(
        &self,
        ctx: CancellationToken,
        channels: ResultChannels,
        msg: AcquiredMessage,
        deliver: DeliveryFn,
    ) -> Result<(), NotifierError> {
        let method = msg.method.as_str();
        let template_id = msg.template_id.to_string();

        if msg.attempt_count > 0 {
            self.metrics.record_retry(method, &template_id);
        }
        self.metrics.observe_queued(method, msg.queued_seconds);

        let inflight = InflightGuard::new(self.metrics.inflight(method, &template_id));
        let timer = self.metrics.send_timer(method).start_timer();

        let attempt_ctx = ctx.child_token();
        let outcome = match time::timeout(
            self.config.dispatch_timeout(),
            deliver(attempt_ctx.clone(), msg.id),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                attempt_ctx.cancel();
                Err(DeliveryError::DeadlineExceeded)
            }
        };

        timer.observe_duration();
        drop(inflight);

        let result = match outcome {
            Ok(()) => {
                tracing::debug!(msg_id = %msg.id, method, "Message dispatched");
                self.metrics.record_dispatched(method, &template_id);
                DispatchResult::success(self.id, msg.id)
            }
            Err(DeliveryError::Cancelled) => {
                tracing::warn!(msg_id = %msg.id, method, "Dispatch cancelled, lease will expire");
                return Err(NotifierError::Cancelled);
            }
            Err(DeliveryError::DeadlineExceeded) => {
                tracing::warn!(
                    msg_id = %msg.id,
                    method,
                    "Dispatch deadline exceeded, lease will expire"
                );
                return Err(NotifierError::DeadlineExceeded { msg_id: msg.id });
            }
            Err(e) => {
                let retryable = e.is_retryable();
                match failure_status(msg.attempt_count, self.config.max_send_attempts, retryable) {
                    MessageStatus::TemporaryFailure => {
                        self.metrics.record_temporary_failure(method, &template_id)
                    }
                    _ => self.metrics.record_permanent_failure(method, &template_id),
                }
                tracing::warn!(
                    msg_id = %msg.id,
                    method,
                    attempt = msg.attempt_count + 1,
                    retryable,
                    error = %e,
                    "Message dispatch failed"
                );
                DispatchResult::failure(self.id, msg.id, e.to_string(), retryable)
            }
        };

        channels.publish(&ctx, result).await?;
        self.update_pending(&channels);
        Ok(())
    }

    fn update_pending(&self, channels: &ResultChannels) {
        self.metrics
            .set_pending_updates(channels.success_pending() + channels.failure_pending());
    }

    /// Stop the loop and wait for it to exit. A stopped notifier cannot be
    /// restarted.
    pub async fn stop(&self) {
        self.quit.cancel();
        if self.started.load(Ordering::SeqCst) {
            self.done.cancelled().await;
        }
    }
}

/// Holds one unit of the in-flight gauge until dropped, including when the
/// delivery task unwinds.
struct InflightGuard(IntGauge);

impl InflightGuard {
    fn new(gauge: IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use prometheus::Registry;

    use super::*;
    use crate::notification::handler::{delivery_fn, Handler};
    use crate::notification::types::NotificationMethod;
    use crate::store::{MemoryStore, NotificationTemplate, QueuedMessage};

    struct Succeed;

    impl Handler for Succeed {
        fn dispatcher(
            &self,
            _payload: MessagePayload,
            _title: String,
            _body: String,
        ) -> Result<DeliveryFn, HandlerError> {
            Ok(delivery_fn(|_ctx, _id| async { Ok(()) }))
        }
    }

    struct Hang;

    impl Handler for Hang {
        fn dispatcher(
            &self,
            _payload: MessagePayload,
            _title: String,
            _body: String,
        ) -> Result<DeliveryFn, HandlerError> {
            Ok(delivery_fn(|_ctx, _id| async {
                time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }))
        }
    }

    struct Panic;

    impl Handler for Panic {
        fn dispatcher(
            &self,
            _payload: MessagePayload,
            _title: String,
            _body: String,
        ) -> Result<DeliveryFn, HandlerError> {
            Ok(delivery_fn(|_ctx, id| async move {
                assert!(id.is_nil(), "handler blew up on {id}");
                Ok(())
            }))
        }
    }

    fn payload_json() -> serde_json::Value {
        serde_json::json!({
            "_version": "1.0",
            "notification_name": "Test",
            "user_id": Uuid::new_v4().to_string(),
            "user_email": "bobby@example.com",
            "user_name": "Bobby",
            "user_username": "bobby",
        })
    }

    fn setup(
        handler: Arc<dyn Handler>,
        config: NotificationsConfig,
        count: usize,
    ) -> (Arc<MemoryStore>, Arc<Notifier>, Metrics, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let template_id = Uuid::new_v4();
        store.insert_template(NotificationTemplate {
            id: template_id,
            name: "Test".into(),
            title_template: "Hello {{user_name}}".into(),
            body_template: "Body".into(),
            actions: vec![],
        });
        for _ in 0..count {
            store.insert_message(QueuedMessage::new(
                template_id,
                Uuid::new_v4(),
                NotificationMethod::Webhook,
                payload_json(),
            ));
        }

        let metrics = Metrics::new(&Registry::new()).unwrap();
        let notifier = Arc::new(Notifier::new(
            Arc::new(config),
            store.clone(),
            HandlerRegistry::new().with(NotificationMethod::Webhook, handler),
            metrics.clone(),
            Arc::new(HashMap::new()),
        ));
        (store, notifier, metrics, template_id)
    }

    fn channels(size: usize) -> (
        ResultChannels,
        mpsc::Receiver<DispatchResult>,
        mpsc::Receiver<DispatchResult>,
    ) {
        let (success, success_rx) = mpsc::channel(size);
        let (failure, failure_rx) = mpsc::channel(size);
        (ResultChannels { success, failure }, success_rx, failure_rx)
    }

    #[tokio::test]
    async fn test_process_publishes_one_result_per_message() {
        let (_store, notifier, metrics, _) =
            setup(Arc::new(Succeed), NotificationsConfig::default(), 3);
        let (channels, mut success_rx, _failure_rx) = channels(10);

        notifier
            .process(&CancellationToken::new(), &channels)
            .await
            .unwrap();

        for _ in 0..3 {
            assert!(success_rx.try_recv().unwrap().is_success());
        }
        assert!(success_rx.try_recv().is_err());
        assert_eq!(metrics.pending_updates.get(), 3);
    }

    #[tokio::test]
    async fn test_unregistered_method_fails_without_dispatch() {
        let (store, notifier, metrics, template_id) =
            setup(Arc::new(Succeed), NotificationsConfig::default(), 0);
        store.insert_message(QueuedMessage::new(
            template_id,
            Uuid::new_v4(),
            NotificationMethod::Smtp,
            payload_json(),
        ));
        let (channels, mut success_rx, mut failure_rx) = channels(10);

        notifier
            .process(&CancellationToken::new(), &channels)
            .await
            .unwrap();

        let failed = failure_rx.try_recv().unwrap();
        assert!(!failed.retryable);
        assert!(success_rx.try_recv().is_err());
        assert_eq!(
            metrics
                .permanent_failures_count
                .with_label_values(&["smtp", &template_id.to_string()])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .dispatched_count
                .with_label_values(&["smtp", &template_id.to_string()])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_unknown_template_variable_fails_permanently() {
        let (store, notifier, _metrics, _template_id) =
            setup(Arc::new(Succeed), NotificationsConfig::default(), 0);
        let broken = Uuid::new_v4();
        store.insert_template(NotificationTemplate {
            id: broken,
            name: "Broken".into(),
            title_template: "{{missing}}".into(),
            body_template: "Body".into(),
            actions: vec![],
        });
        store.insert_message(QueuedMessage::new(
            broken,
            Uuid::new_v4(),
            NotificationMethod::Webhook,
            payload_json(),
        ));
        let (channels, _success_rx, mut failure_rx) = channels(10);

        notifier
            .process(&CancellationToken::new(), &channels)
            .await
            .unwrap();

        let failed = failure_rx.try_recv().unwrap();
        assert!(!failed.retryable);
        assert!(failed.error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_dispatch_deadline_abandons_message() {
        let config = NotificationsConfig {
            dispatch_timeout_ms: 50,
            ..Default::default()
        };
        let (store, notifier, _metrics, _) = setup(Arc::new(Hang), config, 1);
        let (channels, mut success_rx, mut failure_rx) = channels(10);

        let result = notifier.process(&CancellationToken::new(), &channels).await;

        assert!(matches!(result, Err(NotifierError::DeadlineExceeded { .. })));
        assert!(success_rx.try_recv().is_err());
        assert!(failure_rx.try_recv().is_err());
        assert_eq!(store.count_by_status(MessageStatus::Leased), 1);
    }

    #[tokio::test]
    async fn test_panicking_delivery_releases_inflight_gauge() {
        let (store, notifier, metrics, template_id) =
            setup(Arc::new(Panic), NotificationsConfig::default(), 1);
        let (channels, mut success_rx, mut failure_rx) = channels(10);

        let result = notifier.process(&CancellationToken::new(), &channels).await;

        assert!(matches!(result, Err(NotifierError::Join(_))));
        assert_eq!(
            metrics
                .inflight_dispatches
                .with_label_values(&["webhook", &template_id.to_string()])
                .get(),
            0
        );
        assert!(success_rx.try_recv().is_err());
        assert!(failure_rx.try_recv().is_err());
        assert_eq!(store.count_by_status(MessageStatus::Leased), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let (_store, notifier, _metrics, _) =
            setup(Arc::new(Succeed), NotificationsConfig::default(), 0);
        let (channels, _s, _f) = channels(1);

        let handle = tokio::spawn(notifier.clone().run(CancellationToken::new(), channels.clone()));
        notifier.stop().await;
        notifier.stop().await;
        assert!(handle.await.unwrap().is_ok());

        // A stopped notifier exits immediately
        let rerun = notifier.clone().run(CancellationToken::new(), channels).await;
        assert!(rerun.is_ok());
    }

    #[tokio::test]
    async fn test_stop_without_run_returns() {
        let (_store, notifier, _metrics, _) =
            setup(Arc::new(Succeed), NotificationsConfig::default(), 0);
        tokio::time::timeout(Duration::from_secs(1), notifier.stop())
            .await
            .expect("stop should not block");
    }

    #[tokio::test]
    async fn test_cancelled_context_is_fatal() {
        let (_store, notifier, _metrics, _) =
            setup(Arc::new(Succeed), NotificationsConfig::default(), 0);
        let (channels, _s, _f) = channels(1);
        let ctx = CancellationToken::new();

        let handle = tokio::spawn(notifier.clone().run(ctx.clone(), channels));
        ctx.cancel();

        assert!(matches!(handle.await.unwrap(), Err(NotifierError::Cancelled)));
    }
}
