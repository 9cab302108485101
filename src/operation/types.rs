//! Core types for queued operations.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{transport_code, BarrageError, TransportError};
use crate::http::{AuthChallenge, HttpResponse};

/// A unique identifier for an operation in the queue.
///
/// Uses a short, readable format like "op_abc123xy" instead of full UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new random operation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format.
    ///
    /// Takes the first 8 hex characters of the UUID and formats as "op_xxxxxxxx".
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("op_{}", &hex[..8])
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OperationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// An HTTP request descriptor: everything needed to issue one transfer.
///
/// Immutable once the owning operation is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    /// Full request URL (e.g., "https://api.example.com/v1/images/42")
    pub url: String,

    /// HTTP method (e.g., "GET", "POST")
    pub method: String,

    /// Request headers as (name, value) pairs
    pub headers: Vec<(String, String)>,

    /// Request body; empty for body-less methods
    pub body: Vec<u8>,
}

impl RequestData {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Shorthand for a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Configuration for how an operation responds to transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether failed transfers are retried at all
    pub auto_retry: bool,

    /// Transport codes considered transient (see [`transport_code`])
    pub retry_error_codes: HashSet<i32>,

    /// Delay between a failure and the next attempt
    pub retry_delay: Duration,

    /// Upper bound on total transfer attempts; `None` means unbounded
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            auto_retry: false,
            retry_error_codes: transport_code::transient(),
            retry_delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Decide whether a failed attempt should be retried.
    ///
    /// `attempts_made` counts the attempt that just failed.
    pub fn should_retry(&self, error: &TransportError, attempts_made: u32) -> bool {
        if !self.auto_retry || error.is_cancellation() {
            return false;
        }
        if !error.is_in(&self.retry_error_codes) {
            return false;
        }
        self.max_attempts.is_none_or(|max| attempts_made < max)
    }
}

/// The lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Waiting to be promoted by the scheduler (initial state)
    Ready,
    /// HTTP transfer in flight
    Running,
    /// Terminal: transfer succeeded or failed without (further) retry
    Finished,
    /// Terminal: cancelled by the caller
    Cancelled,
}

impl OperationState {
    /// Check if this state is terminal (finished or cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Finished | OperationState::Cancelled)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            OperationState::Ready => 0,
            OperationState::Running => 1,
            OperationState::Finished => 2,
            OperationState::Cancelled => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => OperationState::Ready,
            1 => OperationState::Running,
            2 => OperationState::Finished,
            _ => OperationState::Cancelled,
        }
    }
}

/// Live byte counters for an operation's current transfer attempt.
///
/// Written only by the progress relay while the operation is running;
/// readable from any thread. Totals are `-1` while unknown.
#[derive(Debug, Default)]
pub struct TransferCounters {
    upload_done: AtomicI64,
    upload_total: AtomicI64,
    download_done: AtomicI64,
    download_total: AtomicI64,
}

impl TransferCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_upload(&self, done: i64, total: i64) {
        self.upload_done.store(done, Ordering::Relaxed);
        self.upload_total.store(total, Ordering::Relaxed);
    }

    pub(crate) fn record_download(&self, done: i64, total: i64) {
        self.download_done.store(done, Ordering::Relaxed);
        self.download_total.store(total, Ordering::Relaxed);
    }

    /// Zero all counters. Used when a retry discards the previous attempt.
    pub(crate) fn reset(&self) {
        self.upload_done.store(0, Ordering::Relaxed);
        self.upload_total.store(0, Ordering::Relaxed);
        self.download_done.store(0, Ordering::Relaxed);
        self.download_total.store(0, Ordering::Relaxed);
    }

    /// Current (bytes_done, bytes_total) for the upload direction.
    pub fn upload(&self) -> (i64, i64) {
        (
            self.upload_done.load(Ordering::Relaxed),
            self.upload_total.load(Ordering::Relaxed),
        )
    }

    /// Current (bytes_done, bytes_total) for the download direction.
    pub fn download(&self) -> (i64, i64) {
        (
            self.download_done.load(Ordering::Relaxed),
            self.download_total.load(Ordering::Relaxed),
        )
    }
}

/// The terminal result delivered to an operation's completion handler.
pub type TransferOutcome = std::result::Result<HttpResponse, BarrageError>;

/// Completion callback: invoked exactly once when the operation reaches a
/// terminal state (except for operations removed silently from `ready`).
pub type CompletionHandler = Box<dyn FnOnce(TransferOutcome) + Send + 'static>;

/// Progress callback: `(fraction, bytes_done, bytes_total)`. Fraction is 0.0
/// while the total is unknown (`bytes_total == -1`).
pub type ProgressHandler = Box<dyn Fn(f64, i64, i64) + Send + Sync + 'static>;

/// Authentication challenge callback. The challenge carries its own reply
/// channel; dropping it without replying declines the challenge.
pub type AuthChallengeHandler = Box<dyn Fn(AuthChallenge) + Send + Sync + 'static>;
