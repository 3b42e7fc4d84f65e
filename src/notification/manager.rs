//! The dispatch coordinator.
//!
//! The [`Manager`] owns the notifier pool, the two bounded result buffers
//! and the loop that periodically writes buffered results back to the store.
//!
//! # Backpressure
//!
//! Notifiers publish every delivery outcome into a bounded channel. When the
//! store sync falls behind, the channels fill, dispatch tasks block on
//! publish, and because a notifier does not lease its next batch until every
//! task of the current batch has published, leasing slows down with them.
//!
//! # Shutdown
//!
//! - [`Manager::stop`] stops every notifier, writes back everything they
//!   produced, and then ends the sync loop. Nothing is lost.
//! - Cancelling the context passed to [`Manager::run`] ends the loops without
//!   a final sync. Results still buffered are dropped and their messages are
//!   redelivered once their leases expire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::dispatch::{InboxHandler, WebhookHandler};
use super::handler::{HandlerError, HandlerRegistry};
use super::notifier::{Notifier, NotifierError, ResultChannels};
use super::types::{DispatchResult, NotificationMethod};
use crate::config::{NotificationsConfig, SettingsError, TemplateHelpers};
use crate::metrics::Metrics;
use crate::store::{BulkMarkFailedParams, BulkMarkSentParams, MessageStatus, Store};

/// Upper bound on each bulk status update.
const STORE_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid notification config: {0}")]
    Config(#[from] SettingsError),

    #[error("failed to build handler: {0}")]
    Handler(#[from] HandlerError),

    #[error("manager cancelled")]
    Cancelled,

    #[error("manager already stopped")]
    AlreadyStopped,

    #[error("manager already running")]
    AlreadyRunning,

    #[error("manager did not stop before the deadline")]
    StopTimeout,

    #[error("notifier failed: {0}")]
    Notifier(NotifierError),

    #[error("task failed: {0}")]
    Join(String),
}

impl From<NotifierError> for ManagerError {
    fn from(err: NotifierError) -> Self {
        match err {
            NotifierError::Cancelled => ManagerError::Cancelled,
            other => ManagerError::Notifier(other),
        }
    }
}

struct ResultReceivers {
    success: mpsc::Receiver<DispatchResult>,
    failure: mpsc::Receiver<DispatchResult>,
}

#[derive(Default)]
struct ManagerState {
    notifiers: Vec<Arc<Notifier>>,
    running: bool,
    stopping: bool,
}

pub struct Manager {
    config: Arc<NotificationsConfig>,
    store: Arc<dyn Store>,
    handlers: HandlerRegistry,
    metrics: Metrics,
    helpers: Arc<HashMap<String, String>>,

    channels: ResultChannels,
    receivers: AsyncMutex<ResultReceivers>,
    state: Mutex<ManagerState>,
    stop_once: AtomicBool,

    stop: CancellationToken,
    done: CancellationToken,
    /// Fires once the first `stop` call has completed successfully
    stopped: CancellationToken,
}

impl Manager {
    /// Create a manager with the default handlers: webhook and inbox.
    pub fn new(
        config: NotificationsConfig,
        store: Arc<dyn Store>,
        metrics: Metrics,
    ) -> Result<Self, ManagerError> {
        config.validate()?;

        let webhook =
            WebhookHandler::new(reqwest::Client::new(), config.webhook.endpoint.as_deref())?;
        let handlers = HandlerRegistry::new()
            .with(NotificationMethod::Webhook, Arc::new(webhook))
            .with(NotificationMethod::Inbox, Arc::new(InboxHandler::new(store.clone())));

        let helpers = Arc::new(config.helpers.to_map());
        let (success, success_rx) = mpsc::channel(config.store_sync_buffer_size);
        let (failure, failure_rx) = mpsc::channel(config.store_sync_buffer_size);

        Ok(Self {
            config: Arc::new(config),
            store,
            handlers,
            metrics,
            helpers,
            channels: ResultChannels { success, failure },
            receivers: AsyncMutex::new(ResultReceivers {
                success: success_rx,
                failure: failure_rx,
            }),
            state: Mutex::new(ManagerState::default()),
            stop_once: AtomicBool::new(false),
            stop: CancellationToken::new(),
            done: CancellationToken::new(),
            stopped: CancellationToken::new(),
        })
    }

    /// Replace the handler registry wholesale. Must be called before `run`.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Replace the values templates can refer to as `{{access_url}}` etc.
    pub fn with_helpers(mut self, helpers: &TemplateHelpers) -> Self {
        self.helpers = Arc::new(helpers.to_map());
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Results buffered and not yet written to the store, as
    /// `(successes, failures)`.
    pub fn buffered_updates(&self) -> (usize, usize) {
        (
            self.channels.success_pending(),
            self.channels.failure_pending(),
        )
    }

    /// Spawn `notifiers` notifiers and the store sync loop, then wait for all
    /// of them. Returns the first error any of them produced.
    #[tracing::instrument(skip(self, ctx))]
    pub async fn run(
        self: Arc<Self>,
        ctx: CancellationToken,
        notifiers: usize,
    ) -> Result<(), ManagerError> {
        let mut tasks: JoinSet<Result<(), ManagerError>> = JoinSet::new();

        let _done = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ManagerError::Join("manager state lock poisoned".into()))?;
            if state.stopping {
                tracing::debug!("Manager already stopped, not starting notifiers");
                return Err(ManagerError::AlreadyStopped);
            }
            if state.running {
                return Err(ManagerError::AlreadyRunning);
            }
            state.running = true;

            for _ in 0..notifiers {
                let notifier = Arc::new(Notifier::new(
                    self.config.clone(),
                    self.store.clone(),
                    self.handlers.clone(),
                    self.metrics.clone(),
                    self.helpers.clone(),
                ));
                state.notifiers.push(notifier.clone());

                let run = notifier.run(ctx.clone(), self.channels.clone());
                tasks.spawn(async move { run.await.map_err(ManagerError::from) });
            }

            // Released when this call returns, however it returns
            self.done.clone().drop_guard()
        };

        let this = self.clone();
        let sync_ctx = ctx.clone();
        tasks.spawn(async move { this.sync_loop(sync_ctx).await });

        tracing::info!(notifiers, "Notification manager started");

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(ManagerError::Join(e.to_string())));
            if let Err(e) = outcome {
                tracing::debug!(error = %e, "Manager task exited with error");
                first_err.get_or_insert(e);
            }
        }

        tracing::info!("Notification manager exited");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn sync_loop(&self, ctx: CancellationToken) -> Result<(), ManagerError> {
        let period = self.config.store_sync_interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    let (success, failure) = self.buffered_updates();
                    tracing::warn!(
                        success_count = success,
                        failure_count = failure,
                        "Context cancelled, skipping final store sync; messages will be redelivered after their leases expire"
                    );
                    return Err(ManagerError::Cancelled);
                }
                _ = self.stop.cancelled() => {
                    self.bulk_update(Vec::new(), Vec::new()).await;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.bulk_update(Vec::new(), Vec::new()).await;
                }
            }
        }
    }

    /// Write buffered results back to the store.
    ///
    /// Only the results present when the call starts are drained, so an
    /// empty but open channel never blocks the sync. `sent` and `failed`
    /// carry results already taken off the channels.
    async fn bulk_update(&self, mut sent: Vec<DispatchResult>, mut failed: Vec<DispatchResult>) {
        {
            let mut rx = self.receivers.lock().await;
            for _ in 0..rx.success.len() {
                match rx.success.try_recv() {
                    Ok(result) => sent.push(result),
                    Err(_) => break,
                }
            }
            for _ in 0..rx.failure.len() {
                match rx.failure.try_recv() {
                    Ok(result) => failed.push(result),
                    Err(_) => break,
                }
            }
        }

        if sent.is_empty() && failed.is_empty() {
            self.update_pending();
            return;
        }

        let sent_params = BulkMarkSentParams {
            ids: sent.iter().map(|r| r.message_id).collect(),
            sent_ats: sent.iter().map(|r| r.timestamp).collect(),
        };
        let failed_params = BulkMarkFailedParams {
            ids: failed.iter().map(|r| r.message_id).collect(),
            failed_ats: failed.iter().map(|r| r.timestamp).collect(),
            statuses: failed
                .iter()
                .map(|r| {
                    if r.retryable {
                        MessageStatus::TemporaryFailure
                    } else {
                        MessageStatus::PermanentFailure
                    }
                })
                .collect(),
            status_reasons: failed
                .iter()
                .map(|r| r.error.clone().unwrap_or_default())
                .collect(),
            max_attempts: self.config.max_send_attempts,
            retry_interval: self.config.retry_interval(),
        };

        let mark_sent = async {
            if sent_params.ids.is_empty() {
                return Ok(Ok(0));
            }
            time::timeout(STORE_UPDATE_TIMEOUT, self.store.bulk_mark_sent(sent_params)).await
        };
        let mark_failed = async {
            if failed_params.ids.is_empty() {
                return Ok(Ok(0));
            }
            time::timeout(STORE_UPDATE_TIMEOUT, self.store.bulk_mark_failed(failed_params)).await
        };
        let (sent_outcome, failed_outcome) = tokio::join!(mark_sent, mark_failed);

        let mut synced = 0;
        match sent_outcome {
            Ok(Ok(updated)) => synced += updated,
            Ok(Err(e)) => {
                tracing::error!(count = sent.len(), error = %e, "Bulk update of sent messages failed")
            }
            Err(_) => {
                tracing::error!(count = sent.len(), "Bulk update of sent messages timed out")
            }
        }
        match failed_outcome {
            Ok(Ok(updated)) => synced += updated,
            Ok(Err(e)) => {
                tracing::error!(count = failed.len(), error = %e, "Bulk update of failed messages failed")
            }
            Err(_) => {
                tracing::error!(count = failed.len(), "Bulk update of failed messages timed out")
            }
        }

        self.metrics.record_synced(synced);
        self.update_pending();
        tracing::debug!(
            success_count = sent.len(),
            failure_count = failed.len(),
            synced,
            "Bulk updated notification statuses"
        );
    }

    fn update_pending(&self) {
        let (success, failure) = self.buffered_updates();
        self.metrics.set_pending_updates(success + failure);
    }

    /// Stop the notifiers, write back their results and end the sync loop.
    ///
    /// Idempotent. Returns immediately when `run` was never called. A call
    /// made while another is in progress waits for that one to finish.
    /// Returns [`ManagerError::StopTimeout`] if shutdown does not complete
    /// within `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ManagerError> {
        if self.stop_once.swap(true, Ordering::SeqCst) {
            tracing::debug!("Notification manager already stopping, waiting for it");
            return time::timeout(timeout, self.stopped.cancelled())
                .await
                .map_err(|_| ManagerError::StopTimeout);
        }
        let deadline = Instant::now() + timeout;

        let (notifiers, running) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ManagerError::Join("manager state lock poisoned".into()))?;
            state.stopping = true;
            (std::mem::take(&mut state.notifiers), state.running)
        };

        if !running {
            self.stop.cancel();
            self.stopped.cancel();
            tracing::info!("Notification manager stopped before it was started");
            return Ok(());
        }

        tracing::info!(notifiers = notifiers.len(), "Stopping notification manager");

        let shutdown = async {
            // Notifiers may be blocked publishing into full channels, so keep
            // draining while they stop.
            let stopped = join_all(notifiers.iter().map(|n| n.stop()));
            let (sent, failed) = self.drain_while(stopped).await;
            self.bulk_update(sent, failed).await;

            self.stop.cancel();
            self.done.cancelled().await;
        };

        match time::timeout_at(deadline, shutdown).await {
            Ok(()) => {
                self.stopped.cancel();
                tracing::info!("Notification manager stopped");
                Ok(())
            }
            Err(_) => {
                tracing::warn!("Notification manager did not stop before the deadline");
                Err(ManagerError::StopTimeout)
            }
        }
    }

    /// Receive results until `until` completes. Whatever is still buffered
    /// afterwards is left for the next `bulk_update`.
    async fn drain_while<F: std::future::Future>(
        &self,
        until: F,
    ) -> (Vec<DispatchResult>, Vec<DispatchResult>) {
        let mut sent = Vec::new();
        let mut failed = Vec::new();
        let mut guard = self.receivers.lock().await;
        let rx = &mut *guard;

        tokio::pin!(until);
        loop {
            tokio::select! {
                biased;
                _ = &mut until => break,
                Some(result) = rx.success.recv() => sent.push(result),
                Some(result) = rx.failure.recv() => failed.push(result),
            }
        }

        (sent, failed)
    }
}

#[cfg(test)]
mod tests {
    use prometheus::Registry;

    use super::*;
    use crate::store::MemoryStore;

    fn manager(config: NotificationsConfig) -> Result<Manager, ManagerError> {
        Manager::new(
            config,
            Arc::new(MemoryStore::new()),
            Metrics::new(&Registry::new()).unwrap(),
        )
    }

    #[test]
    fn test_rejects_dispatch_timeout_not_shorter_than_lease() {
        let result = manager(NotificationsConfig {
            lease_period_ms: 1_000,
            dispatch_timeout_ms: 5_000,
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(ManagerError::Config(SettingsError::InvalidDispatchTimeout { .. }))
        ));
    }

    #[test]
    fn test_default_handlers() {
        let manager = manager(NotificationsConfig::default()).unwrap();
        assert!(manager.handlers.contains(NotificationMethod::Webhook));
        assert!(manager.handlers.contains(NotificationMethod::Inbox));
        assert!(!manager.handlers.contains(NotificationMethod::Smtp));
        assert_eq!(manager.buffered_updates(), (0, 0));
    }

    #[tokio::test]
    async fn test_stop_before_run() {
        let manager = Arc::new(manager(NotificationsConfig::default()).unwrap());
        manager.stop(Duration::from_secs(1)).await.unwrap();
        manager.stop(Duration::from_secs(1)).await.unwrap();

        let result = manager.clone().run(CancellationToken::new(), 1).await;
        assert!(matches!(result, Err(ManagerError::AlreadyStopped)));
    }

    #[tokio::test]
    async fn test_notifier_cancellation_maps_to_cancelled() {
        let err: ManagerError = NotifierError::Cancelled.into();
        assert!(matches!(err, ManagerError::Cancelled));

        let err: ManagerError = NotifierError::ChannelClosed.into();
        assert!(matches!(err, ManagerError::Notifier(NotifierError::ChannelClosed)));
    }
}
