//! Error types for the correlation client

use apm_correlate_core::ConfigError;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Body of a 418 response: the correlation set of the dimension is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MaxEntries {
    /// Maximum number of distinct values the server accepts
    #[serde(rename = "max", default)]
    pub max_entries: i64,
}

impl fmt::Display for MaxEntries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "max entries {}", self.max_entries)
    }
}

/// Errors that can occur in the correlation client
#[derive(Debug, Error)]
pub enum CorrelateError {
    /// Dimension name or value is empty
    #[error("No dimension key or value to correlate to")]
    InvalidDimension,

    /// Submission queue is saturated
    #[error("request channel full")]
    QueueFull,

    /// Retry queue is saturated
    #[error("retry channel full")]
    RetryQueueFull,

    /// Request has used all of its attempts
    #[error("maximum attempts exceeded")]
    MaxAttempts,

    /// Request lifecycle ended before it could be queued
    #[error("request cancelled")]
    RequestCancelled,

    /// Client lifecycle has ended
    #[error("client is shut down")]
    Shutdown,

    /// Server refused the value because the correlation set is full
    #[error("{0}")]
    MaxEntries(MaxEntries),

    /// Non-retryable 4xx response
    #[error("Client error: {status}")]
    ClientError { status: u16 },

    /// Retryable non-2xx response
    #[error("Server error: {status}")]
    Server { status: u16 },

    /// Transport failure before a response was received
    #[error("Network error: {0}")]
    Network(String),

    /// Request could not be built
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Client configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CorrelateError {
    /// Check if a request failing with this error should be re-sent
    pub fn is_retryable(&self) -> bool {
        matches!(self, CorrelateError::Server { .. } | CorrelateError::Network(_))
    }

    /// Build the error matching a non-2xx status
    pub fn from_status(status: u16) -> Self {
        if (400..500).contains(&status) {
            CorrelateError::ClientError { status }
        } else {
            CorrelateError::Server { status }
        }
    }
}

/// Result type for correlation operations
pub type CorrelateResult<T> = Result<T, CorrelateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(CorrelateError::Server { status: 503 }.is_retryable());
        assert!(CorrelateError::Network("connection reset".to_string()).is_retryable());
        assert!(!CorrelateError::ClientError { status: 400 }.is_retryable());
        assert!(!CorrelateError::MaxEntries(MaxEntries { max_entries: 5 }).is_retryable());
        assert!(!CorrelateError::QueueFull.is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            CorrelateError::from_status(404),
            CorrelateError::ClientError { status: 404 }
        ));
        assert!(matches!(
            CorrelateError::from_status(502),
            CorrelateError::Server { status: 502 }
        ));
        assert!(matches!(
            CorrelateError::from_status(302),
            CorrelateError::Server { status: 302 }
        ));
    }

    #[test]
    fn test_max_entries_body() {
        let max: MaxEntries = serde_json::from_str(r#"{"max": 25}"#).unwrap();
        assert_eq!(max.max_entries, 25);
        assert_eq!(CorrelateError::MaxEntries(max).to_string(), "max entries 25");
    }
}
