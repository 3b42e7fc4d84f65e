//! Prometheus metrics for the notification dispatcher.
//!
//! This module provides metrics for monitoring the dispatch pipeline:
//! - Dispatch outcome counters (dispatched, temporary/permanent failures, retries)
//! - Latency histograms (time spent queued, time spent in the delivery handler)
//! - Backpressure gauges (pending result updates, in-flight dispatches)
//!
//! Metrics are registered on an explicit [`Registry`] so that every manager
//! (and every test) can observe its own series.

mod helpers;

pub use helpers::encode_metrics;

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_notifications";

pub const LABEL_METHOD: &str = "method";
pub const LABEL_TEMPLATE_ID: &str = "template_id";

/// Metrics shared by the manager and its notifiers.
#[derive(Clone)]
pub struct Metrics {
    /// Messages delivered successfully
    pub dispatched_count: IntCounterVec,
    /// Failed deliveries which remain eligible for another attempt
    pub temporary_failures_count: IntCounterVec,
    /// Failed deliveries which will never be attempted again
    pub permanent_failures_count: IntCounterVec,
    /// Delivery attempts for messages which had been attempted before
    pub retry_count: IntCounterVec,

    /// Time between a message becoming eligible and being leased
    pub queued_seconds: HistogramVec,
    /// Time spent inside the delivery handler
    pub dispatcher_send_seconds: HistogramVec,

    /// Dispatches currently waiting on their delivery handler
    pub inflight_dispatches: IntGaugeVec,
    /// Results buffered in memory and not yet written back to the store
    pub pending_updates: IntGauge,
    /// Result updates written back to the store
    pub synced_updates_total: IntCounter,
}

impl Metrics {
    /// Create the dispatcher metrics and register them on `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let method_template = &[LABEL_METHOD, LABEL_TEMPLATE_ID];

        let dispatched_count = IntCounterVec::new(
            Opts::new(
                format!("{}_dispatched_count", METRIC_PREFIX),
                "Total notifications successfully dispatched",
            ),
            method_template,
        )?;
        let temporary_failures_count = IntCounterVec::new(
            Opts::new(
                format!("{}_temporary_failures_count", METRIC_PREFIX),
                "Total notifications which failed and will be retried",
            ),
            method_template,
        )?;
        let permanent_failures_count = IntCounterVec::new(
            Opts::new(
                format!("{}_permanent_failures_count", METRIC_PREFIX),
                "Total notifications which failed permanently",
            ),
            method_template,
        )?;
        let retry_count = IntCounterVec::new(
            Opts::new(
                format!("{}_retry_count", METRIC_PREFIX),
                "Total dispatch attempts for previously attempted notifications",
            ),
            method_template,
        )?;

        let queued_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_queued_seconds", METRIC_PREFIX),
                "Time between a notification becoming eligible for dispatch and being leased",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 3600.0]),
            &[LABEL_METHOD],
        )?;
        let dispatcher_send_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_dispatcher_send_seconds", METRIC_PREFIX),
                "Time spent dispatching a notification via its handler",
            )
            .buckets(vec![0.001, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
            &[LABEL_METHOD],
        )?;

        let inflight_dispatches = IntGaugeVec::new(
            Opts::new(
                format!("{}_inflight_dispatches", METRIC_PREFIX),
                "Notifications currently being dispatched",
            ),
            method_template,
        )?;
        let pending_updates = IntGauge::new(
            format!("{}_pending_updates", METRIC_PREFIX),
            "Dispatch results buffered in memory awaiting a store update",
        )?;
        let synced_updates_total = IntCounter::new(
            format!("{}_synced_updates_total", METRIC_PREFIX),
            "Dispatch results written back to the store",
        )?;

        registry.register(Box::new(dispatched_count.clone()))?;
        registry.register(Box::new(temporary_failures_count.clone()))?;
        registry.register(Box::new(permanent_failures_count.clone()))?;
        registry.register(Box::new(retry_count.clone()))?;
        registry.register(Box::new(queued_seconds.clone()))?;
        registry.register(Box::new(dispatcher_send_seconds.clone()))?;
        registry.register(Box::new(inflight_dispatches.clone()))?;
        registry.register(Box::new(pending_updates.clone()))?;
        registry.register(Box::new(synced_updates_total.clone()))?;

        Ok(Self {
            dispatched_count,
            temporary_failures_count,
            permanent_failures_count,
            retry_count,
            queued_seconds,
            dispatcher_send_seconds,
            inflight_dispatches,
            pending_updates,
            synced_updates_total,
        })
    }

    pub fn record_dispatched(&self, method: &str, template_id: &str) {
        self.dispatched_count
            .with_label_values(&[method, template_id])
            .inc();
    }

    pub fn record_temporary_failure(&self, method: &str, template_id: &str) {
        self.temporary_failures_count
            .with_label_values(&[method, template_id])
            .inc();
    }

    pub fn record_permanent_failure(&self, method: &str, template_id: &str) {
        self.permanent_failures_count
            .with_label_values(&[method, template_id])
            .inc();
    }

    pub fn record_retry(&self, method: &str, template_id: &str) {
        self.retry_count.with_label_values(&[method, template_id]).inc();
    }

    pub fn observe_queued(&self, method: &str, seconds: f64) {
        self.queued_seconds
            .with_label_values(&[method])
            .observe(seconds);
    }

    pub fn send_timer(&self, method: &str) -> Histogram {
        self.dispatcher_send_seconds.with_label_values(&[method])
    }

    pub fn inflight(&self, method: &str, template_id: &str) -> IntGauge {
        self.inflight_dispatches
            .with_label_values(&[method, template_id])
    }

    pub fn set_pending_updates(&self, count: usize) {
        self.pending_updates.set(count as i64);
    }

    pub fn record_synced(&self, count: u64) {
        self.synced_updates_total.inc_by(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        metrics.record_dispatched("webhook", "tmpl");
        metrics.set_pending_updates(3);

        let output = encode_metrics(&registry).unwrap();
        assert!(output.contains("ara_notifications_dispatched_count"));
        assert!(output.contains("ara_notifications_pending_updates 3"));
    }

    #[test]
    fn test_counters_are_labelled() {
        let metrics = Metrics::new(&Registry::new()).unwrap();
        metrics.record_retry("inbox", "a");
        metrics.record_retry("inbox", "a");
        metrics.record_retry("webhook", "a");

        assert_eq!(
            metrics.retry_count.with_label_values(&["inbox", "a"]).get(),
            2
        );
        assert_eq!(
            metrics.retry_count.with_label_values(&["webhook", "a"]).get(),
            1
        );
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let _first = Metrics::new(&registry).unwrap();
        assert!(Metrics::new(&registry).is_err());
    }
}
