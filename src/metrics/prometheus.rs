use crate::metrics::error::{validation, MetricsError};
/// Prometheus metrics exporter implementation
///
/// Metric families are created lazily on first use and registered in a private
/// registry; `export` renders the text exposition format served at /metrics.
use crate::metrics::metrics::MetricsExporter;
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

pub struct PrometheusExporter {
    registry: Registry,
    counters: DashMap<String, CounterVec>,
    gauges: DashMap<String, GaugeVec>,
    histograms: DashMap<String, HistogramVec>,
    namespace: Option<String>,
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusExporter {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
            namespace: None,
        }
    }

    /// Prefix every metric name with `namespace_`
    pub fn with_namespace<S: Into<String>>(namespace: S) -> Result<Self, MetricsError> {
        let namespace = namespace.into();
        validation::validate_metric_name(&namespace)?;
        Ok(Self {
            namespace: Some(namespace),
            ..Self::new()
        })
    }

    fn apply_namespace(&self, name: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}_{}", ns, name),
            None => name.to_string(),
        }
    }

    fn help_text(name: &str) -> String {
        name.replace('_', " ")
    }

    /// Buckets in seconds for stage durations, which range from milliseconds
    /// (assembly) to hours (transcription)
    fn histogram_buckets(name: &str) -> Vec<f64> {
        if name.contains("duration") || name.contains("seconds") {
            vec![
                0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0,
            ]
        } else {
            prometheus::DEFAULT_BUCKETS.to_vec()
        }
    }

    fn check_type_conflict(&self, name: &str, kind: &str) -> Result<(), MetricsError> {
        let taken = match kind {
            "counter" => self.gauges.contains_key(name) || self.histograms.contains_key(name),
            "gauge" => self.counters.contains_key(name) || self.histograms.contains_key(name),
            _ => self.counters.contains_key(name) || self.gauges.contains_key(name),
        };
        if taken {
            return Err(MetricsError::registration_failed(
                name,
                format!("already registered with a type other than {}", kind),
            ));
        }
        Ok(())
    }

    fn register<C: prometheus::core::Collector + Clone + 'static>(
        &self,
        name: &str,
        collector: &C,
    ) -> Result<(), MetricsError> {
        self.registry
            .register(Box::new(collector.clone()))
            .map_err(|e| MetricsError::registration_failed(name, e.to_string()))
    }

    fn counter(&self, name: &str, label_names: &[&str]) -> Result<CounterVec, MetricsError> {
        let full_name = self.apply_namespace(name);
        if let Some(counter) = self.counters.get(&full_name) {
            return Ok(counter.clone());
        }
        self.check_type_conflict(&full_name, "counter")?;
        match self.counters.entry(full_name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let counter = CounterVec::new(Opts::new(&full_name, Self::help_text(name)), label_names)
                    .map_err(|err| MetricsError::registration_failed(name, err.to_string()))?;
                self.register(name, &counter)?;
                debug!("Registered counter {}", full_name);
                Ok(e.insert(counter).clone())
            }
        }
    }

    fn gauge(&self, name: &str, label_names: &[&str]) -> Result<GaugeVec, MetricsError> {
        let full_name = self.apply_namespace(name);
        if let Some(gauge) = self.gauges.get(&full_name) {
            return Ok(gauge.clone());
        }
        self.check_type_conflict(&full_name, "gauge")?;
        match self.gauges.entry(full_name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let gauge = GaugeVec::new(Opts::new(&full_name, Self::help_text(name)), label_names)
                    .map_err(|err| MetricsError::registration_failed(name, err.to_string()))?;
                self.register(name, &gauge)?;
                debug!("Registered gauge {}", full_name);
                Ok(e.insert(gauge).clone())
            }
        }
    }

    fn histogram(&self, name: &str, label_names: &[&str]) -> Result<HistogramVec, MetricsError> {
        let full_name = self.apply_namespace(name);
        if let Some(histogram) = self.histograms.get(&full_name) {
            return Ok(histogram.clone());
        }
        self.check_type_conflict(&full_name, "histogram")?;
        match self.histograms.entry(full_name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let opts = HistogramOpts::new(&full_name, Self::help_text(name))
                    .buckets(Self::histogram_buckets(name));
                let histogram = HistogramVec::new(opts, label_names)
                    .map_err(|err| MetricsError::registration_failed(name, err.to_string()))?;
                self.register(name, &histogram)?;
                debug!("Registered histogram {}", full_name);
                Ok(e.insert(histogram).clone())
            }
        }
    }

    /// Label names sorted so that the same labels in a different order hit the same series
    fn split_labels<'a>(labels: &'a [(&'a str, &'a str)]) -> (Vec<&'a str>, Vec<&'a str>) {
        let mut sorted: Vec<&(&str, &str)> = labels.iter().collect();
        sorted.sort_by_key(|(k, _)| *k);
        sorted.into_iter().map(|(k, v)| (*k, *v)).unzip()
    }
}

#[async_trait]
impl MetricsExporter for PrometheusExporter {
    async fn increment(&self, name: &str, labels: &[(&str, &str)]) -> Result<(), MetricsError> {
        validation::validate_metric_name(name)?;
        validation::validate_labels(labels)?;
        let (names, values) = Self::split_labels(labels);
        let counter = self.counter(name, &names)?;
        counter
            .get_metric_with_label_values(&values)
            .map_err(|e| MetricsError::invalid_label(name, e.to_string()))?
            .inc();
        Ok(())
    }

    async fn set_gauge(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError> {
        validation::validate_metric_name(name)?;
        validation::validate_labels(labels)?;
        let (names, values) = Self::split_labels(labels);
        let gauge = self.gauge(name, &names)?;
        gauge
            .get_metric_with_label_values(&values)
            .map_err(|e| MetricsError::invalid_label(name, e.to_string()))?
            .set(value);
        Ok(())
    }

    async fn observe_histogram(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<(), MetricsError> {
        validation::validate_metric_name(name)?;
        validation::validate_labels(labels)?;
        let (names, values) = Self::split_labels(labels);
        let histogram = self.histogram(name, &names)?;
        histogram
            .get_metric_with_label_values(&values)
            .map_err(|e| MetricsError::invalid_label(name, e.to_string()))?
            .observe(value);
        Ok(())
    }

    async fn export(&self) -> Result<Vec<u8>, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::export_failed(e.to_string()))?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_export_contains_recorded_series() {
        let exporter = PrometheusExporter::new();
        exporter
            .increment("tasks_created_total", &[("input", "remote")])
            .await
            .unwrap();
        exporter.set_gauge("active_tasks", 2.0, &[]).await.unwrap();
        exporter
            .observe_histogram("stage_duration_seconds", 1.5, &[("stage", "transcribing")])
            .await
            .unwrap();

        let text = String::from_utf8(exporter.export().await.unwrap()).unwrap();
        assert!(text.contains("tasks_created_total{input=\"remote\"} 1"));
        assert!(text.contains("active_tasks 2"));
        assert!(text.contains("stage_duration_seconds_bucket"));
    }

    #[tokio::test]
    async fn test_label_order_does_not_matter() {
        let exporter = PrometheusExporter::new();
        exporter
            .increment("tasks_finished_total", &[("outcome", "failed"), ("kind", "Cancelled")])
            .await
            .unwrap();
        exporter
            .increment("tasks_finished_total", &[("kind", "Cancelled"), ("outcome", "failed")])
            .await
            .unwrap();

        let text = String::from_utf8(exporter.export().await.unwrap()).unwrap();
        assert!(text.contains("tasks_finished_total{kind=\"Cancelled\",outcome=\"failed\"} 2"));
    }

    #[tokio::test]
    async fn test_type_conflict_is_rejected() {
        let exporter = PrometheusExporter::new();
        exporter.increment("shared_name", &[]).await.unwrap();
        let err = exporter.set_gauge("shared_name", 1.0, &[]).await.unwrap_err();
        assert!(matches!(err, MetricsError::RegistrationFailed { .. }));
    }

    #[tokio::test]
    async fn test_namespace_prefix() {
        let exporter = PrometheusExporter::with_namespace("subtitle_api").unwrap();
        exporter.increment("http_requests_total", &[]).await.unwrap();
        let text = String::from_utf8(exporter.export().await.unwrap()).unwrap();
        assert!(text.contains("subtitle_api_http_requests_total"));
        assert!(PrometheusExporter::with_namespace("bad name").is_err());
    }
}
