//! Error types shared by the transport, retry and reconcile layers.
//!
//! Failures of remote calls are values (`ErrorInfo`), classified once at the
//! transport boundary from status codes. Everything that is a local mistake
//! (bad URI, bad configuration) is a `thiserror` enum returned before any
//! call is attempted.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// How a failure should be treated by the retry layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Rate limiting, backend unavailability, network failures.
    Transient,
    /// Bad request, forbidden, not found, conflict. Will not resolve without
    /// changing the request.
    Permanent,
    /// More than one resource matched a natural key.
    Ambiguous,
    Unknown,
}

impl Classification {
    /// Classify an HTTP error status.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 | 503 | 504 => Self::Transient,
            400 | 403 | 404 | 409 => Self::Permanent,
            _ => Self::Unknown,
        }
    }

    /// Whether another attempt of the same call may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Unknown)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Ambiguous => "ambiguous",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Structured description of a failed remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Upstream error code from the `error.code` envelope, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(classification: Classification, message: impl Into<String>) -> Self {
        Self {
            classification,
            http_status: None,
            code: None,
            message: message.into(),
        }
    }

    /// Error for an HTTP error status, classified from the status code.
    pub fn from_status(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            classification: Classification::from_status(status),
            http_status: Some(status),
            code,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(Classification::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(Classification::Permanent, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Classification::Unknown, message)
    }

    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::new(Classification::Ambiguous, message)
    }

    /// A 404 from the API.
    pub fn is_not_found(&self) -> bool {
        self.http_status == Some(404)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.http_status, &self.code) {
            (Some(status), Some(code)) => write!(f, "HTTP {} ({}): {}", status, code, self.message),
            (Some(status), None) => write!(f, "HTTP {}: {}", status, self.message),
            (None, _) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ErrorInfo {}

/// A request that cannot be sent as constructed.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("URI '{0}' must use http or https")]
    UnsupportedScheme(String),

    #[error("Invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Failed to serialize request body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Configuration rejected at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Resource kind is required")]
    EmptyKind,

    #[error("Natural key for kind '{0}' must not be empty")]
    EmptyNaturalKey(String),

    #[error("Retry policy needs at least one attempt")]
    ZeroAttempts,

    #[error("Poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("Poll interval ({interval_secs}s) exceeds max wait ({max_wait_secs}s)")]
    PollIntervalExceedsMaxWait {
        interval_secs: u64,
        max_wait_secs: u64,
    },

    #[error("Kind '{kind}' has an invalid collection URI: {source}")]
    InvalidCollection {
        kind: String,
        #[source]
        source: RequestError,
    },

    #[error("Kind '{0}' must name its key field")]
    EmptyKeyField(String),

    #[error("Kind '{kind}' has an invalid header: {source}")]
    InvalidHeader {
        kind: String,
        #[source]
        source: RequestError,
    },
}

/// The wait was aborted by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Operation cancelled")]
pub struct Cancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        for status in [429, 503, 504] {
            assert_eq!(Classification::from_status(status), Classification::Transient);
        }
        for status in [400, 403, 404, 409] {
            assert_eq!(Classification::from_status(status), Classification::Permanent);
        }
        for status in [401, 500, 502, 412] {
            assert_eq!(Classification::from_status(status), Classification::Unknown);
        }
    }

    #[test]
    fn test_retryable() {
        assert!(Classification::Transient.is_retryable());
        assert!(Classification::Unknown.is_retryable());
        assert!(!Classification::Permanent.is_retryable());
        assert!(!Classification::Ambiguous.is_retryable());
    }

    #[test]
    fn test_display_includes_status_and_code() {
        let err = ErrorInfo::from_status(
            409,
            Some("Request_MultipleObjectsWithSameKeyValue".to_string()),
            "Another object with the same value exists",
        );
        let s = err.to_string();
        assert!(s.contains("409"));
        assert!(s.contains("Request_MultipleObjectsWithSameKeyValue"));
        assert!(s.contains("same value"));
        assert_eq!(err.classification, Classification::Permanent);
    }

    #[test]
    fn test_not_found() {
        assert!(ErrorInfo::from_status(404, None, "gone").is_not_found());
        assert!(!ErrorInfo::transient("timeout").is_not_found());
    }
}
