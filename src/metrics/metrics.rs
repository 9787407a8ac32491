//! Metrics Module for the subtitle API
//!
//! A pluggable metrics system: the pipeline and the HTTP layer record through the
//! [`Metrics`] facade, which forwards to whichever [`MetricsExporter`] was configured
//! (Prometheus or a no-op exporter).
//!
//! Recording never fails the caller. Errors from the exporter are logged and dropped
//! so that a misbehaving backend cannot fail a task.
//!
//! # Examples
//!
//! ```rust,no_run
//! use subtitle_api::metrics::{create_metrics_exporter, Metrics};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let metrics = Metrics::new(create_metrics_exporter("prometheus", None)?);
//!     metrics.record_task_created("remote").await;
//!     let exported = metrics.export().await?;
//!     println!("{}", String::from_utf8_lossy(&exported));
//!     Ok(())
//! }
//! ```

use crate::metrics::error::MetricsError;
use crate::metrics::null::NullExporter;
use crate::metrics::prometheus::PrometheusExporter;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;

/// Metrics exporter trait for pluggable monitoring systems
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    /// Increment a counter metric by 1
    async fn increment(&self, name: &str, labels: &[(&str, &str)]) -> Result<(), MetricsError>;

    /// Set a gauge metric to a specific value
    async fn set_gauge(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError>;

    /// Observe a value in a histogram metric
    async fn observe_histogram(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError>;

    /// Export metrics in the format expected by the monitoring system
    async fn export(&self) -> Result<Vec<u8>, MetricsError>;
}

/// Metrics facade for the application
#[derive(Clone)]
pub struct Metrics {
    exporter: Arc<dyn MetricsExporter>,
}

impl Metrics {
    pub fn new(exporter: Arc<dyn MetricsExporter>) -> Self {
        Self { exporter }
    }

    /// Facade over the no-op exporter
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullExporter))
    }

    pub async fn export(&self) -> Result<Vec<u8>, MetricsError> {
        self.exporter.export().await
    }

    pub async fn record_http_request(&self, endpoint: &str, method: &str, status: &str, duration: f64) {
        let labels = [("endpoint", endpoint), ("method", method), ("status", status)];
        self.observe_histogram_internal("http_request_duration_seconds", duration, &labels)
            .await;
        self.increment_internal("http_requests_total", &labels).await;
    }

    /// `input` is the input descriptor label ("upload" or "remote")
    pub async fn record_task_created(&self, input: &str) {
        self.increment_internal("tasks_created_total", &[("input", input)])
            .await;
    }

    pub async fn record_stage_duration(&self, stage: &str, seconds: f64) {
        self.observe_histogram_internal("stage_duration_seconds", seconds, &[("stage", stage)])
            .await;
    }

    /// `kind` is the error kind for failed tasks, "none" for completed ones
    pub async fn record_task_finished(&self, outcome: &str, kind: &str) {
        self.increment_internal(
            "tasks_finished_total",
            &[("outcome", outcome), ("kind", kind)],
        )
        .await;
    }

    pub async fn set_active_tasks(&self, count: usize) {
        self.set_gauge_internal("active_tasks", count as f64, &[]).await;
    }

    pub async fn record_fetch_retry(&self) {
        self.increment_internal("fetch_retries_total", &[]).await;
    }

    pub async fn record_upload_size(&self, size_bytes: usize) {
        self.observe_histogram_internal("upload_size_bytes", size_bytes as f64, &[])
            .await;
    }

    async fn increment_internal(&self, name: &str, labels: &[(&str, &str)]) {
        if let Err(e) = self.exporter.increment(name, labels).await {
            warn!("Failed to increment metric '{}': {}", name, e);
        }
    }

    async fn set_gauge_internal(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if let Err(e) = self.exporter.set_gauge(name, value, labels).await {
            warn!("Failed to set gauge '{}': {}", name, e);
        }
    }

    async fn observe_histogram_internal(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if let Err(e) = self.exporter.observe_histogram(name, value, labels).await {
            warn!("Failed to observe histogram '{}': {}", name, e);
        }
    }
}

/// Factory function to create metrics exporter based on configuration.
///
/// `namespace` prefixes every Prometheus metric name.
pub fn create_metrics_exporter(
    exporter_type: &str,
    namespace: Option<&str>,
) -> Result<Arc<dyn MetricsExporter>, MetricsError> {
    match exporter_type.to_lowercase().as_str() {
        "prometheus" => {
            debug!("Initializing Prometheus metrics exporter");
            match namespace {
                Some(namespace) => Ok(Arc::new(PrometheusExporter::with_namespace(namespace)?)),
                None => Ok(Arc::new(PrometheusExporter::new())),
            }
        }
        "none" | "disabled" | "" => {
            debug!("Metrics disabled, using null exporter");
            Ok(Arc::new(NullExporter))
        }
        other => Err(MetricsError::configuration_error(format!(
            "Unknown metrics exporter type: {}",
            other
        ))),
    }
}
