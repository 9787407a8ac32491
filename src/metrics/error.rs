//! Error types for the metrics system

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    /// Invalid metric name (empty, invalid characters, wrong format)
    #[error("Invalid metric name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Invalid label name or value
    #[error("Invalid label '{label}': {reason}")]
    InvalidLabel { label: String, reason: String },

    /// Metric registration failed (duplicate registration, type conflict)
    #[error("Failed to register metric '{name}': {reason}")]
    RegistrationFailed { name: String, reason: String },

    #[error("Failed to export metrics: {reason}")]
    ExportFailed { reason: String },

    #[error("Configuration error: {reason}")]
    ConfigurationError { reason: String },
}

impl MetricsError {
    pub fn invalid_name<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_label<L: Into<String>, R: Into<String>>(label: L, reason: R) -> Self {
        Self::InvalidLabel {
            label: label.into(),
            reason: reason.into(),
        }
    }

    pub fn registration_failed<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::RegistrationFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn export_failed<R: Into<String>>(reason: R) -> Self {
        Self::ExportFailed {
            reason: reason.into(),
        }
    }

    pub fn configuration_error<R: Into<String>>(reason: R) -> Self {
        Self::ConfigurationError {
            reason: reason.into(),
        }
    }
}

/// Validation of metric names and labels against Prometheus rules
pub mod validation {
    use super::MetricsError;

    const RESERVED_LABELS: &[&str] = &["__name__", "__value__"];
    const MAX_LABEL_VALUE_LENGTH: usize = 256;

    /// Names must be non-empty, start with a letter or underscore, and contain only
    /// letters, digits, underscores and colons
    pub fn validate_metric_name(name: &str) -> Result<(), MetricsError> {
        let mut chars = name.chars();
        match chars.next() {
            None => return Err(MetricsError::invalid_name(name, "Metric name cannot be empty")),
            Some(first) if !first.is_ascii_alphabetic() && first != '_' => {
                return Err(MetricsError::invalid_name(
                    name,
                    "Metric name must start with a letter or underscore",
                ))
            }
            Some(_) => {}
        }
        if let Some(bad) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != ':') {
            return Err(MetricsError::invalid_name(
                name,
                format!("Invalid character '{}'", bad),
            ));
        }
        Ok(())
    }

    pub fn validate_label_key(key: &str) -> Result<(), MetricsError> {
        if key.is_empty() {
            return Err(MetricsError::invalid_label(key, "Label key cannot be empty"));
        }
        if RESERVED_LABELS.contains(&key) {
            return Err(MetricsError::invalid_label(key, "Label key is reserved by Prometheus"));
        }
        if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            || key.starts_with(|c: char| c.is_ascii_digit())
        {
            return Err(MetricsError::invalid_label(key, "Invalid characters in label key"));
        }
        Ok(())
    }

    pub fn validate_labels(labels: &[(&str, &str)]) -> Result<(), MetricsError> {
        for (key, value) in labels {
            validate_label_key(key)?;
            if value.len() > MAX_LABEL_VALUE_LENGTH {
                return Err(MetricsError::invalid_label(*key, "Label value too long"));
            }
        }
        Ok(())
    }
}
