//! Error types for the capture engine
//!
//! Errors are classified so callers can tell configuration mistakes (rejected
//! synchronously) apart from runtime failures that are retried, counted, or
//! surfaced through health.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unknown/duplicate ids, invalid filters or processors, bad settings
    Configuration,
    /// Connector failures while capturing
    Capture,
    /// Queue overflow
    Backpressure,
    /// Downstream processor failures
    Processing,
    /// Position store failures
    Storage,
    /// Illegal lifecycle transitions
    State,
    /// JSON/YAML encoding errors
    Serialization,
}

/// Capture engine errors
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// No source registered under this id
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// A source with this id is already registered
    #[error("Source already registered: {0}")]
    DuplicateSource(String),

    /// Filter failed validation
    #[error("Invalid filter '{id}': {reason}")]
    InvalidFilter { id: String, reason: String },

    /// A filter with this id is already registered
    #[error("Filter already registered: {0}")]
    DuplicateFilter(String),

    /// No filter registered under this id
    #[error("Unknown filter: {0}")]
    UnknownFilter(String),

    /// Processor failed validation
    #[error("Invalid processor '{id}': {reason}")]
    InvalidProcessor { id: String, reason: String },

    /// A processor with this id is already registered
    #[error("Processor already registered: {0}")]
    DuplicateProcessor(String),

    /// No processor registered under this id
    #[error("Unknown processor: {0}")]
    UnknownProcessor(String),

    /// Capture connector failure
    #[error("Connector error for source '{source_id}': {message}")]
    Connector { source_id: String, message: String },

    /// Source queue is at capacity
    #[error("Queue full for source '{source_id}' (capacity {capacity})")]
    QueueFull { source_id: String, capacity: usize },

    /// Processor returned an error
    #[error("Processor '{id}' failed: {message}")]
    Processor { id: String, message: String },

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Position store failure
    #[error("Position store error: {0}")]
    PositionStore(String),

    /// Illegal lifecycle transition or operation for the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connector error
    pub fn connector(source_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connector {
            source_id: source_id.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid filter error
    pub fn invalid_filter(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFilter {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid processor error
    pub fn invalid_processor(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProcessor {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a processor error
    pub fn processor(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Processor {
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a position store error
    pub fn position_store(msg: impl Into<String>) -> Self {
        Self::PositionStore(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Connector, timeout and I/O failures are transient; configuration and
    /// state errors will fail the same way on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connector { .. } | Self::Timeout(_) | Self::PositionStore(_) => true,
            Self::QueueFull { .. } => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::Config(_)
            | Self::UnknownSource(_)
            | Self::DuplicateSource(_)
            | Self::InvalidFilter { .. }
            | Self::DuplicateFilter(_)
            | Self::UnknownFilter(_)
            | Self::InvalidProcessor { .. }
            | Self::DuplicateProcessor(_)
            | Self::UnknownProcessor(_)
            | Self::Processor { .. }
            | Self::InvalidState(_)
            | Self::Json(_)
            | Self::Yaml(_) => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_)
            | Self::UnknownSource(_)
            | Self::DuplicateSource(_)
            | Self::InvalidFilter { .. }
            | Self::DuplicateFilter(_)
            | Self::UnknownFilter(_)
            | Self::InvalidProcessor { .. }
            | Self::DuplicateProcessor(_)
            | Self::UnknownProcessor(_) => ErrorCategory::Configuration,
            Self::Connector { .. } | Self::Timeout(_) => ErrorCategory::Capture,
            Self::QueueFull { .. } => ErrorCategory::Backpressure,
            Self::Processor { .. } => ErrorCategory::Processing,
            Self::PositionStore(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::InvalidState(_) => ErrorCategory::State,
            Self::Json(_) | Self::Yaml(_) => ErrorCategory::Serialization,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::UnknownSource(_) => "unknown_source",
            Self::DuplicateSource(_) => "duplicate_source",
            Self::InvalidFilter { .. } => "invalid_filter",
            Self::DuplicateFilter(_) => "duplicate_filter",
            Self::UnknownFilter(_) => "unknown_filter",
            Self::InvalidProcessor { .. } => "invalid_processor",
            Self::DuplicateProcessor(_) => "duplicate_processor",
            Self::UnknownProcessor(_) => "unknown_processor",
            Self::Connector { .. } => "connector_error",
            Self::QueueFull { .. } => "queue_full",
            Self::Processor { .. } => "processor_error",
            Self::Timeout(_) => "timeout",
            Self::PositionStore(_) => "position_store_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// Result type for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaptureError::connector("orders-db", "connection reset");
        assert!(err.to_string().contains("orders-db"));
        assert!(err.to_string().contains("connection reset"));

        let err = CaptureError::QueueFull {
            source_id: "s1".into(),
            capacity: 10,
        };
        assert_eq!(err.to_string(), "Queue full for source 's1' (capacity 10)");
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(CaptureError::connector("s", "x").is_retriable());
        assert!(CaptureError::timeout("5s").is_retriable());
        assert!(CaptureError::position_store("disk full").is_retriable());

        assert!(!CaptureError::config("bad").is_retriable());
        assert!(!CaptureError::UnknownSource("s".into()).is_retriable());
        assert!(!CaptureError::invalid_state("running").is_retriable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            CaptureError::DuplicateFilter("f".into()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            CaptureError::connector("s", "x").category(),
            ErrorCategory::Capture
        );
        assert_eq!(
            CaptureError::QueueFull {
                source_id: "s".into(),
                capacity: 1
            }
            .category(),
            ErrorCategory::Backpressure
        );
        assert_eq!(
            CaptureError::processor("p", "x").category(),
            ErrorCategory::Processing
        );
        assert_eq!(
            CaptureError::invalid_state("x").category(),
            ErrorCategory::State
        );
    }

    #[test]
    fn test_error_code() {
        assert_eq!(CaptureError::config("x").error_code(), "config_error");
        assert_eq!(
            CaptureError::UnknownProcessor("p".into()).error_code(),
            "unknown_processor"
        );
        assert_eq!(CaptureError::timeout("x").error_code(), "timeout");
    }
}
