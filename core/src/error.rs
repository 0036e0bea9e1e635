//! Error types for inferload-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Service-level error type
///
/// Per-request failures are *not* represented here; those are recorded as
/// [`ErrorDetails`] on the request record and flow through the metrics
/// pipeline like any other result.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (rejected before any service starts)
    #[error("configuration error: {0}")]
    Config(String),

    /// Dataset construction or lookup failure
    #[error("dataset error: {0}")]
    Dataset(String),

    /// A bus channel closed while the run was still in progress
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation or unexpected internal state
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Exit code for the process when this error terminates the run
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            _ => 2,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed request attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connect failure, read/write failure, TLS failure
    TransportError,
    /// Non-2xx HTTP status
    HTTPError,
    /// Malformed stream event or unparseable body
    ResponseParseError,
    /// Per-request timeout exceeded
    RequestTimeout,
    /// Cooperative cancel (injected or grace-period abort)
    RequestCancellationError,
    /// Lookup miss or malformed dataset entry
    DatasetError,
    /// Invariant violation inside the pipeline
    FatalInternalError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::TransportError => "TransportError",
            ErrorKind::HTTPError => "HTTPError",
            ErrorKind::ResponseParseError => "ResponseParseError",
            ErrorKind::RequestTimeout => "RequestTimeout",
            ErrorKind::RequestCancellationError => "RequestCancellationError",
            ErrorKind::DatasetError => "DatasetError",
            ErrorKind::FatalInternalError => "FatalInternalError",
        };
        write!(f, "{name}")
    }
}

/// Typed failure attached to a request record or control message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Status-like numeric code, when one applies (HTTP status, 499 for
    /// client-side cancellation)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,

    /// Error classification
    #[serde(rename = "type")]
    pub kind: ErrorKind,

    /// Human-readable description
    pub message: String,
}

/// HTTP-convention status for a client-side cancelled request
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

impl ErrorDetails {
    /// Create error details with a classification and message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: None,
            kind,
            message: message.into(),
        }
    }

    /// Create error details for a non-2xx HTTP response
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(status),
            kind: ErrorKind::HTTPError,
            message: message.into(),
        }
    }

    /// Create error details for a cooperatively cancelled request
    pub fn cancelled(after: std::time::Duration) -> Self {
        Self {
            code: Some(CLIENT_CLOSED_REQUEST),
            kind: ErrorKind::RequestCancellationError,
            message: format!("request was cancelled after {:.3} seconds", after.as_secs_f64()),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Config("bad".into()).exit_code(), 1);
        assert_eq!(Error::Internal("bad".into()).exit_code(), 2);
        assert_eq!(Error::ChannelClosed("records").exit_code(), 2);
    }

    #[test]
    fn test_cancelled_details() {
        let details = ErrorDetails::cancelled(std::time::Duration::from_millis(100));
        assert_eq!(details.code, Some(499));
        assert_eq!(details.kind, ErrorKind::RequestCancellationError);
        assert!(details.message.contains("0.100"));
    }

    #[test]
    fn test_error_kind_serializes_as_type() {
        let details = ErrorDetails::http(503, "busy");
        let json = serde_json::to_string(&details).unwrap();
        assert!(json.contains("\"type\":\"HTTPError\""));
        assert!(json.contains("\"code\":503"));
    }
}
