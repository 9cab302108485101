//! Error types for the request queue.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, BarrageError>;

/// Stable numeric codes for transport-level failures.
///
/// Retry policies match on these codes, so they form part of the public
/// contract and must not be renumbered.
pub mod transport_code {
    /// Transfer aborted by the caller.
    pub const CANCELLED: i32 = -999;
    /// The request URL (or method) could not be turned into a request.
    pub const BAD_URL: i32 = -1000;
    /// The transfer did not complete within the allotted time.
    pub const TIMED_OUT: i32 = -1001;
    /// The host name could not be resolved.
    pub const CANNOT_FIND_HOST: i32 = -1003;
    /// A connection to the host could not be established.
    pub const CANNOT_CONNECT: i32 = -1004;
    /// The connection dropped mid-transfer.
    pub const CONNECTION_LOST: i32 = -1005;
    /// DNS lookup failed.
    pub const DNS_LOOKUP_FAILED: i32 = -1006;
    /// No network connectivity.
    pub const NOT_CONNECTED: i32 = -1009;
    /// An authentication challenge was rejected by the challenge handler.
    pub const AUTH_REQUIRED: i32 = -1013;
    /// TLS negotiation failed.
    pub const SECURE_CONNECTION_FAILED: i32 = -1200;

    /// The set of codes that usually indicate a transient condition worth
    /// retrying: timeouts, resolution failures, and dropped connections.
    pub fn transient() -> std::collections::HashSet<i32> {
        [
            TIMED_OUT,
            CANNOT_FIND_HOST,
            CANNOT_CONNECT,
            CONNECTION_LOST,
            DNS_LOOKUP_FAILED,
            NOT_CONNECTED,
        ]
        .into_iter()
        .collect()
    }
}

/// A transport-level failure: the transfer produced no HTTP response.
///
/// HTTP responses with 4xx/5xx status codes are *not* transport errors;
/// they are delivered to the completion handler as ordinary responses.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("transport error {code}: {message}")]
pub struct TransportError {
    /// One of the [`transport_code`] constants (or a client-specific code).
    pub code: i32,
    /// Human-readable description of the failure.
    pub message: String,
}

impl TransportError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The error produced when a transfer is aborted by the caller.
    pub fn cancelled() -> Self {
        Self::new(transport_code::CANCELLED, "transfer cancelled")
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == transport_code::CANCELLED
    }

    /// Whether this code is in the given retry set.
    pub fn is_in(&self, codes: &HashSet<i32>) -> bool {
        codes.contains(&self.code)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let code = if e.is_timeout() {
            transport_code::TIMED_OUT
        } else if e.is_connect() {
            transport_code::CANNOT_CONNECT
        } else if e.is_builder() {
            transport_code::BAD_URL
        } else {
            transport_code::CONNECTION_LOST
        };
        Self::new(code, e.to_string())
    }
}

/// Errors that can surface through an operation's completion handler or the
/// queue's own API.
#[derive(Debug, Error)]
pub enum BarrageError {
    /// The transfer failed at the transport level (no response delivered).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The operation was cancelled by the caller. Never retried and never
    /// counted against the queue's success flag.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl BarrageError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BarrageError::Cancelled)
    }
}

/// Error for HTTP responses with a non-success status code.
///
/// The queue itself never converts responses into errors; this type exists
/// so callers that want to treat non-2xx responses as failures at a layer
/// above the queue share one error shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("HTTP response status {status}")]
pub struct HttpResponseError {
    pub status: u16,
}

impl HttpResponseError {
    /// `Some` for any status outside the 2xx range.
    pub fn from_status(status: u16) -> Option<Self> {
        if (200..300).contains(&status) {
            None
        } else {
            Some(Self { status })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_codes_cover_connectivity_failures() {
        let codes = transport_code::transient();
        assert!(codes.contains(&transport_code::NOT_CONNECTED));
        assert!(codes.contains(&transport_code::TIMED_OUT));
        assert!(!codes.contains(&transport_code::CANCELLED));
        assert!(!codes.contains(&transport_code::AUTH_REQUIRED));
    }

    #[test]
    fn test_cancellation_is_distinct_from_transport_failures() {
        let err = TransportError::cancelled();
        assert!(err.is_cancellation());
        assert!(!err.is_in(&transport_code::transient()));

        assert!(BarrageError::Cancelled.is_cancellation());
        assert!(!BarrageError::from(TransportError::new(transport_code::TIMED_OUT, "timed out"))
            .is_cancellation());
    }

    #[test]
    fn test_response_error_only_for_non_2xx() {
        assert!(HttpResponseError::from_status(200).is_none());
        assert!(HttpResponseError::from_status(204).is_none());
        assert_eq!(
            HttpResponseError::from_status(404),
            Some(HttpResponseError { status: 404 })
        );
        assert_eq!(
            HttpResponseError::from_status(500).unwrap().to_string(),
            "HTTP response status 500"
        );
    }
}
