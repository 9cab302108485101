//! Queued HTTP operations.
//!
//! An [`Operation`] is built and configured by the caller, then consumed by
//! [`Queue::enqueue`](crate::queue::Queue::enqueue). From that point the queue
//! owns the callback slots and drives the transfer; the caller keeps an
//! [`OperationHandle`] for inspection (state, byte counters) and targeted
//! cancellation through the queue.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::http::{AuthChallenge, TransferDelegate};

pub mod types;

pub use types::{
    AuthChallengeHandler, CompletionHandler, OperationId, OperationState, ProgressHandler,
    RequestData, RetryPolicy, TransferCounters, TransferOutcome,
};

/// A single retryable HTTP request, configured but not yet enqueued.
///
/// Because `enqueue` takes the operation by value, an operation cannot be
/// enqueued twice, and its callbacks and retry policy cannot change after
/// the queue takes ownership.
///
/// # Example
/// ```no_run
/// use barrage::{Operation, RequestData, RetryPolicy};
///
/// let operation = Operation::new(RequestData::get("https://example.com/image.png"))
///     .with_retry_policy(RetryPolicy {
///         auto_retry: true,
///         ..RetryPolicy::default()
///     })
///     .with_download_progress(|fraction, done, total| {
///         println!("{:.0}% ({done}/{total})", fraction * 100.0);
///     })
///     .with_completion(|outcome| match outcome {
///         Ok(response) => println!("{} bytes", response.body.len()),
///         Err(e) => eprintln!("failed: {e}"),
///     });
/// ```
pub struct Operation {
    request: RequestData,
    retry: RetryPolicy,
    handlers: HandlerSlots,
}

/// The caller-supplied callback slots, moved into the queue at enqueue time.
#[derive(Default)]
pub(crate) struct HandlerSlots {
    pub(crate) completion: Option<CompletionHandler>,
    pub(crate) upload: Option<ProgressHandler>,
    pub(crate) download: Option<ProgressHandler>,
    pub(crate) auth: Option<AuthChallengeHandler>,
}

impl Operation {
    pub fn new(request: RequestData) -> Self {
        Self {
            request,
            retry: RetryPolicy::default(),
            handlers: HandlerSlots::default(),
        }
    }

    /// Shorthand for an operation wrapping a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(RequestData::get(url))
    }

    pub fn request(&self) -> &RequestData {
        &self.request
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the completion callback, invoked exactly once at terminal state.
    pub fn with_completion(mut self, f: impl FnOnce(TransferOutcome) + Send + 'static) -> Self {
        self.handlers.completion = Some(Box::new(f));
        self
    }

    /// Set the upload progress callback `(fraction, bytes_done, bytes_total)`.
    pub fn with_upload_progress(
        mut self,
        f: impl Fn(f64, i64, i64) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.upload = Some(Box::new(f));
        self
    }

    /// Set the download progress callback `(fraction, bytes_done, bytes_total)`.
    pub fn with_download_progress(
        mut self,
        f: impl Fn(f64, i64, i64) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.download = Some(Box::new(f));
        self
    }

    /// Set the authentication challenge callback.
    ///
    /// Without one, challenges proceed without credentials and the server's
    /// response (typically 401) is delivered to the completion handler.
    pub fn with_auth_challenge(
        mut self,
        f: impl Fn(AuthChallenge) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.auth = Some(Box::new(f));
        self
    }

    pub(crate) fn into_parts(self, seq: u64) -> (Arc<OperationHandle>, HandlerSlots) {
        let handle = Arc::new(OperationHandle {
            id: OperationId::new(),
            request: self.request,
            retry: self.retry,
            seq,
            state: AtomicU8::new(OperationState::Ready.as_u8()),
            counters: TransferCounters::new(),
            cancel: CancellationToken::new(),
        });
        (handle, self.handlers)
    }
}

/// Shared, inspectable view of an enqueued operation.
///
/// Holds no reference back to the queue; the queue owns the operation until
/// it reaches a terminal state, after which the handle remains valid for
/// inspection.
pub struct OperationHandle {
    id: OperationId,
    request: RequestData,
    retry: RetryPolicy,
    seq: u64,
    state: AtomicU8,
    counters: TransferCounters,
    cancel: CancellationToken,
}

impl OperationHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn request(&self) -> &RequestData {
        &self.request
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OperationState {
        OperationState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Current `(bytes_done, bytes_total)` for the request body.
    pub fn upload_progress(&self) -> (i64, i64) {
        self.counters.upload()
    }

    /// Current `(bytes_done, bytes_total)` for the response body.
    pub fn download_progress(&self) -> (i64, i64) {
        self.counters.download()
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn set_state(&self, state: OperationState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Signal the in-flight transfer to abort.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn counters(&self) -> &TransferCounters {
        &self.counters
    }
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.id)
            .field("url", &self.request.url)
            .field("state", &self.state())
            .finish()
    }
}

/// Bridges [`TransferDelegate`] events from the HTTP client onto an
/// operation's counters and the caller's progress/auth callbacks.
///
/// Owned by the driver task, so delegate calls for one operation are
/// naturally serialized.
pub(crate) struct CallbackRelay {
    handle: Arc<OperationHandle>,
    upload: Option<ProgressHandler>,
    download: Option<ProgressHandler>,
    auth: Option<AuthChallengeHandler>,
}

impl CallbackRelay {
    pub(crate) fn new(handle: Arc<OperationHandle>, mut slots: HandlerSlots) -> Self {
        Self {
            handle,
            upload: slots.upload.take(),
            download: slots.download.take(),
            auth: slots.auth.take(),
        }
    }

    /// Recover the progress/auth slots for a further attempt.
    pub(crate) fn into_slots(self) -> HandlerSlots {
        HandlerSlots {
            completion: None,
            upload: self.upload,
            download: self.download,
            auth: self.auth,
        }
    }
}

fn fraction(done: i64, total: i64) -> f64 {
    if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[async_trait]
impl TransferDelegate for CallbackRelay {
    async fn upload_progress(&self, bytes_sent: i64, total_bytes: i64) {
        self.handle.counters().record_upload(bytes_sent, total_bytes);
        if let Some(f) = &self.upload {
            f(fraction(bytes_sent, total_bytes), bytes_sent, total_bytes);
        }
    }

    async fn download_progress(&self, bytes_received: i64, total_bytes: i64) {
        self.handle
            .counters()
            .record_download(bytes_received, total_bytes);
        if let Some(f) = &self.download {
            f(fraction(bytes_received, total_bytes), bytes_received, total_bytes);
        }
    }

    async fn challenge(&self, challenge: AuthChallenge) {
        match &self.auth {
            Some(f) => f(challenge),
            // No handler configured: proceed without credentials so the
            // server's response is delivered as-is.
            None => challenge.continue_without_credentials(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ChallengeAnswer, HttpResponse, UNKNOWN_TOTAL};
    use parking_lot::Mutex;

    fn handle_for(url: &str) -> Arc<OperationHandle> {
        let (handle, _) = Operation::get(url).into_parts(0);
        handle
    }

    #[test]
    fn test_enqueue_split_preserves_configuration() {
        let operation = Operation::new(
            RequestData::new("POST", "https://example.com/upload").with_body(b"data".to_vec()),
        )
        .with_retry_policy(RetryPolicy {
            auto_retry: true,
            max_attempts: Some(4),
            ..RetryPolicy::default()
        })
        .with_completion(|_| {});

        let (handle, slots) = operation.into_parts(7);
        assert_eq!(handle.request().method, "POST");
        assert_eq!(handle.retry_policy().max_attempts, Some(4));
        assert_eq!(handle.seq(), 7);
        assert_eq!(handle.state(), OperationState::Ready);
        assert!(slots.completion.is_some());
        assert!(slots.upload.is_none());
    }

    #[test]
    fn test_fraction_handles_unknown_total() {
        assert_eq!(fraction(512, 1024), 0.5);
        assert_eq!(fraction(512, UNKNOWN_TOTAL), 0.0);
        assert_eq!(fraction(0, 0), 0.0);
        assert_eq!(fraction(2048, 1024), 1.0);
    }

    #[tokio::test]
    async fn test_relay_updates_counters_and_invokes_handlers() {
        let seen: Arc<Mutex<Vec<(f64, i64, i64)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let operation = Operation::get("https://example.com/image.png")
            .with_download_progress(move |fraction, done, total| {
                seen2.lock().push((fraction, done, total));
            });

        let (handle, slots) = operation.into_parts(0);
        let relay = CallbackRelay::new(handle.clone(), slots);

        relay.download_progress(100, 400).await;
        relay.download_progress(400, 400).await;

        assert_eq!(handle.download_progress(), (400, 400));
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (0.25, 100, 400));
        assert_eq!(seen[1], (1.0, 400, 400));
    }

    #[tokio::test]
    async fn test_relay_without_auth_handler_continues() {
        let handle = handle_for("https://example.com/private");
        let relay = CallbackRelay::new(handle, HandlerSlots::default());

        let (challenge, reply) = AuthChallenge::new("example.com", None, None, 0);
        relay.challenge(challenge).await;
        assert_eq!(reply.await.unwrap(), ChallengeAnswer::Continue);
    }

    #[tokio::test]
    async fn test_relay_forwards_challenge_to_handler() {
        let operation = Operation::get("https://example.com/private").with_auth_challenge(|c| {
            assert_eq!(c.host, "example.com");
            c.use_credentials(crate::http::Credentials::new("user", "pass"));
        });
        let (handle, slots) = operation.into_parts(0);
        let relay = CallbackRelay::new(handle, slots);

        let (challenge, reply) = AuthChallenge::new("example.com", None, None, 0);
        relay.challenge(challenge).await;
        assert!(matches!(
            reply.await.unwrap(),
            ChallengeAnswer::UseCredentials(_)
        ));
    }

    #[tokio::test]
    async fn test_relay_slots_survive_round_trip() {
        let operation = Operation::get("https://example.com/a")
            .with_download_progress(|_, _, _| {})
            .with_completion(|outcome: TransferOutcome| {
                let _ = outcome.map(|r: HttpResponse| r.status);
            });
        let (handle, mut slots) = operation.into_parts(0);

        let completion = slots.completion.take();
        let relay = CallbackRelay::new(handle, slots);
        let mut recovered = relay.into_slots();
        recovered.completion = completion;

        assert!(recovered.completion.is_some());
        assert!(recovered.download.is_some());
        assert!(recovered.upload.is_none());
    }
}
