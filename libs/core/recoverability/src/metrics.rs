//! Prometheus metrics for recoverability
//!
//! Counters are driven by [`Notification`]s, so every retry and every
//! faulted message is counted regardless of which stage raised it.

use crate::error::ErrorCategory;
use crate::notifications::{Notification, Notifications};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        describe_counter!(
            "recoverability_immediate_retries_total",
            "Messages retried in-process"
        );
        describe_counter!(
            "recoverability_delayed_retries_total",
            "Messages sent back to their queue with a delay"
        );
        describe_counter!(
            "recoverability_messages_faulted_total",
            "Messages moved to the error queue"
        );
        describe_counter!(
            "recoverability_critical_errors_total",
            "Failures the pipeline could not recover from"
        );
        describe_histogram!(
            "recoverability_message_duration_seconds",
            "Time to settle a message, including in-process retries"
        );

        info!("Prometheus metrics initialized");
        handle
    });
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Record a critical error
pub fn record_critical_error() {
    counter!("recoverability_critical_errors_total").increment(1);
}

/// Per-endpoint metrics helper
#[derive(Debug, Clone)]
pub struct RecoverabilityMetrics {
    endpoint: String,
}

impl RecoverabilityMetrics {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Count every notification raised on `notifications`.
    pub fn subscribe(&self, notifications: &Notifications) {
        let metrics = self.clone();
        notifications.subscribe(move |notification| metrics.record(notification));
    }

    pub fn record(&self, notification: &Notification) {
        let name = match notification {
            Notification::MessageToBeRetried { immediate: true, .. } => {
                "recoverability_immediate_retries_total"
            }
            Notification::MessageToBeRetried { immediate: false, .. } => {
                "recoverability_delayed_retries_total"
            }
            Notification::MessageFaulted { .. } => "recoverability_messages_faulted_total",
        };

        counter!(
            name,
            "endpoint" => self.endpoint.clone(),
            "category" => notification.error().category().to_string()
        )
        .increment(1);
    }

    /// Record a message settled by the pipeline
    pub fn message_processed(&self, duration: Duration) {
        counter!(
            "recoverability_messages_processed_total",
            "endpoint" => self.endpoint.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "recoverability_message_duration_seconds",
            "endpoint" => self.endpoint.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a message the pipeline returned an error for
    pub fn message_failed(&self, category: ErrorCategory) {
        counter!(
            "recoverability_messages_processed_total",
            "endpoint" => self.endpoint.clone(),
            "status" => "failed",
            "category" => category.to_string()
        )
        .increment(1);
    }
}
