// Subtitle API metrics for monitoring and observability
//
// Pipeline and HTTP recorders behind a pluggable exporter.

pub mod error;
pub mod metrics;
pub mod null;
pub mod prometheus;

pub use error::MetricsError;
pub use metrics::{create_metrics_exporter, Metrics, MetricsExporter};
