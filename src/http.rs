//! HTTP client abstraction for driving transfers.
//!
//! This module defines the `HttpClient` trait to abstract HTTP transfer
//! execution, enabling testability with mock implementations. Clients report
//! mid-transfer events (progress, authentication challenges) through a
//! `TransferDelegate` and deliver the terminal outcome as their return value.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{transport_code, HttpResponseError, TransportError};
use crate::operation::types::RequestData;

/// Sentinel for progress totals that are not known (chunked transfers).
pub const UNKNOWN_TOTAL: i64 = -1;

/// Chunk size used when streaming a request body for upload progress.
const UPLOAD_CHUNK_BYTES: usize = 16 * 1024;

/// Response from a completed HTTP transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers as (name, value) pairs
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Whether the status code is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The response body decoded as UTF-8 (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// For callers wrapping non-2xx responses as errors above this layer.
    pub fn response_error(&self) -> Option<HttpResponseError> {
        HttpResponseError::from_status(self.status)
    }
}

/// Credentials supplied in reply to an authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Reply to an authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeAnswer {
    /// Re-issue the request with these credentials.
    UseCredentials(Credentials),
    /// Proceed without credentials; the server's response is delivered as-is.
    Continue,
    /// Decline the challenge; the attempt fails with
    /// [`transport_code::AUTH_REQUIRED`].
    Reject,
}

/// Reply channel for an authentication challenge.
///
/// Dropping the responder without replying counts as [`ChallengeAnswer::Reject`].
#[derive(Debug)]
pub struct ChallengeResponder(oneshot::Sender<ChallengeAnswer>);

impl ChallengeResponder {
    pub fn answer(self, answer: ChallengeAnswer) {
        let _ = self.0.send(answer);
    }

    pub fn use_credentials(self, credentials: Credentials) {
        self.answer(ChallengeAnswer::UseCredentials(credentials));
    }

    pub fn continue_without_credentials(self) {
        self.answer(ChallengeAnswer::Continue);
    }

    pub fn reject(self) {
        self.answer(ChallengeAnswer::Reject);
    }
}

/// An authentication challenge raised by the server mid-transfer.
///
/// The challenge owns its reply channel: the handler may answer inline or
/// move the challenge elsewhere and answer later. There is no bound on how
/// many rounds a server may challenge; handlers should consult
/// `previous_failures` and eventually reject.
#[derive(Debug)]
pub struct AuthChallenge {
    /// Host that issued the challenge
    pub host: String,
    /// Authentication scheme advertised by the server (e.g., "Basic")
    pub scheme: Option<String>,
    /// Protection realm, if the server provided one
    pub realm: Option<String>,
    /// Number of credential replies the server has already refused
    pub previous_failures: u32,
    responder: ChallengeResponder,
}

impl AuthChallenge {
    /// Create a challenge and the receiver its answer arrives on.
    ///
    /// Exposed for `HttpClient` implementations outside this crate.
    pub fn new(
        host: impl Into<String>,
        scheme: Option<String>,
        realm: Option<String>,
        previous_failures: u32,
    ) -> (Self, oneshot::Receiver<ChallengeAnswer>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                host: host.into(),
                scheme,
                realm,
                previous_failures,
                responder: ChallengeResponder(tx),
            },
            rx,
        )
    }

    pub fn use_credentials(self, credentials: Credentials) {
        self.responder.use_credentials(credentials);
    }

    pub fn continue_without_credentials(self) {
        self.responder.continue_without_credentials();
    }

    pub fn reject(self) {
        self.responder.reject();
    }

    /// Split off the reply channel for an out-of-band answer.
    pub fn into_responder(self) -> ChallengeResponder {
        self.responder
    }
}

/// Receiver for mid-transfer events.
///
/// Implemented by the queue's callback relay; clients invoke these as the
/// transfer advances. Calls for one transfer are serialized: a client never
/// overlaps two delegate invocations.
#[async_trait]
pub trait TransferDelegate: Send + Sync {
    /// Bytes of the request body sent so far. `total_bytes` is
    /// [`UNKNOWN_TOTAL`] when the body length is unknown.
    async fn upload_progress(&self, bytes_sent: i64, total_bytes: i64);

    /// Bytes of the response body received so far. `total_bytes` is
    /// [`UNKNOWN_TOTAL`] when the server did not advertise a length.
    async fn download_progress(&self, bytes_received: i64, total_bytes: i64);

    /// The server demands credentials. The implementation replies through
    /// the challenge (or forwards it to whoever can).
    async fn challenge(&self, challenge: AuthChallenge);
}

/// Trait for executing HTTP transfers.
///
/// This abstraction allows for different implementations (production vs.
/// testing) and makes the queue's scheduling logic testable without making
/// real HTTP calls.
///
/// Contract: the terminal outcome is the return value; a cancelled transfer
/// returns a transport error with [`transport_code::CANCELLED`]; 4xx/5xx
/// responses are `Ok` (a response was delivered).
#[async_trait]
pub trait HttpClient: Send + Sync + Clone {
    /// Execute one transfer attempt.
    ///
    /// # Arguments
    /// * `request` - The request descriptor (URL, method, headers, body)
    /// * `delegate` - Receiver for progress and authentication events
    /// * `cancel` - Cooperative abort signal; implementations select on it
    ///   around every blocking step
    async fn execute(
        &self,
        request: &RequestData,
        delegate: &dyn TransferDelegate,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production HTTP client using reqwest.
///
/// Streams the response body to report download progress, wraps the request
/// body in a counting stream for upload progress, and surfaces 401 responses
/// as authentication challenges before finalizing the attempt.
#[derive(Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Create a new reqwest-based HTTP client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Wrap an existing reqwest client (custom TLS, proxies, timeouts).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn attempt(
        &self,
        request: &RequestData,
        delegate: &dyn TransferDelegate,
        cancel: &CancellationToken,
        credentials: Option<&Credentials>,
    ) -> Result<HttpResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            TransportError::new(
                transport_code::BAD_URL,
                format!("invalid HTTP method '{}': {e}", request.method),
            )
        })?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(c) = credentials {
            builder = builder.basic_auth(&c.username, Some(&c.password));
        }

        let response = if request.body.is_empty() {
            let send = builder.send();
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::cancelled()),
                result = send => result.map_err(TransportError::from)?,
            }
        } else {
            let total = request.body.len() as i64;
            let (tx, mut rx) = mpsc::unbounded_channel::<i64>();
            builder = builder.body(reqwest::Body::wrap_stream(counting_chunks(
                request.body.clone(),
                tx,
            )));

            let send = builder.send();
            tokio::pin!(send);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::cancelled()),
                    Some(sent) = rx.recv() => delegate.upload_progress(sent, total).await,
                    result = &mut send => {
                        let response = result.map_err(TransportError::from)?;
                        while let Ok(sent) = rx.try_recv() {
                            delegate.upload_progress(sent, total).await;
                        }
                        break response;
                    }
                }
            }
        };

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let total = response
            .content_length()
            .map(|len| len as i64)
            .unwrap_or(UNKNOWN_TOTAL);

        // A 401 body is challenge plumbing, not payload; its bytes are not
        // reported as download progress.
        let report = status != 401;
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::cancelled()),
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        body.extend_from_slice(&bytes);
                        if report {
                            delegate.download_progress(body.len() as i64, total).await;
                        }
                    }
                    Some(Err(e)) => return Err(TransportError::from(e)),
                    None => break,
                },
            }
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Split a request body into chunks, reporting the running byte count on
/// `tx` as each chunk is pulled by the transport.
fn counting_chunks(
    body: Vec<u8>,
    tx: mpsc::UnboundedSender<i64>,
) -> impl futures::Stream<Item = Result<Vec<u8>, std::io::Error>> {
    let chunks: Vec<Vec<u8>> = body
        .chunks(UPLOAD_CHUNK_BYTES)
        .map(|chunk| chunk.to_vec())
        .collect();
    let mut sent = 0i64;
    futures::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as i64;
        let _ = tx.send(sent);
        Ok(chunk)
    })
}

/// Extract the scheme and realm from a WWW-Authenticate header value, e.g.
/// `Basic realm="images"` -> (Some("Basic"), Some("images")).
fn parse_www_authenticate(value: &str) -> (Option<String>, Option<String>) {
    let mut parts = value.trim().splitn(2, ' ');
    let scheme = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let realm = parts.next().and_then(|rest| {
        rest.split(',').find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            key.eq_ignore_ascii_case("realm")
                .then(|| value.trim_matches('"').to_string())
        })
    });
    (scheme, realm)
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request, delegate, cancel), fields(method = %request.method, url = %request.url))]
    async fn execute(
        &self,
        request: &RequestData,
        delegate: &dyn TransferDelegate,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let mut previous_failures = 0u32;
        let mut credentials: Option<Credentials> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::cancelled());
            }

            let response = self
                .attempt(request, delegate, cancel, credentials.as_ref())
                .await?;

            if response.status != 401 {
                tracing::debug!(status = response.status, "transfer completed");
                return Ok(response);
            }

            let (scheme, realm) = response
                .headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("www-authenticate"))
                .map(|(_, value)| parse_www_authenticate(value))
                .unwrap_or((None, None));

            tracing::debug!(
                host = %host_of(&request.url),
                previous_failures,
                "server demanded authentication"
            );

            let (challenge, reply) = AuthChallenge::new(
                host_of(&request.url),
                scheme,
                realm,
                previous_failures,
            );
            delegate.challenge(challenge).await;

            match reply.await {
                Ok(ChallengeAnswer::UseCredentials(c)) => {
                    credentials = Some(c);
                    previous_failures += 1;
                }
                Ok(ChallengeAnswer::Continue) => return Ok(response),
                Ok(ChallengeAnswer::Reject) | Err(_) => {
                    return Err(TransportError::new(
                        transport_code::AUTH_REQUIRED,
                        "authentication challenge rejected",
                    ));
                }
            }
        }
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// A scripted reply for the mock HTTP client.
enum MockReply {
    /// Deliver this response (after emitting mock progress events).
    Respond(HttpResponse),
    /// Fail with this transport error.
    Fail(TransportError),
    /// Never complete; resolves only through cancellation.
    Hang,
    /// Wait for the trigger, then deliver the response.
    RespondWhenTriggered(oneshot::Receiver<()>, HttpResponse),
    /// Issue an authentication challenge; credentials get `authorized`,
    /// continuing without gets `denied`.
    Challenge {
        scheme: String,
        realm: String,
        authorized: HttpResponse,
        denied: HttpResponse,
    },
}

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub url: String,
}

/// Mock HTTP client for testing.
///
/// Allows configuring predetermined replies per URL without making actual
/// HTTP calls. Multiple replies for the same URL are consumed in FIFO order.
///
/// # Example
/// ```ignore
/// let mock = MockHttpClient::new();
/// mock.add_response("https://example.com/a", HttpResponse {
///     status: 200,
///     headers: vec![],
///     body: b"ok".to_vec(),
/// });
/// let trigger = mock.add_response_with_trigger("https://example.com/b", response);
/// // ... the /b transfer stays in flight until:
/// trigger.send(()).unwrap();
/// ```
#[derive(Clone, Default)]
pub struct MockHttpClient {
    replies: Arc<Mutex<HashMap<String, VecDeque<MockReply>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
}

impl MockHttpClient {
    /// Create a new mock HTTP client.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, url: &str, reply: MockReply) {
        self.replies
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Queue a successful response for a URL.
    pub fn add_response(&self, url: &str, response: HttpResponse) {
        self.push(url, MockReply::Respond(response));
    }

    /// Queue a transport failure for a URL.
    pub fn add_failure(&self, url: &str, error: TransportError) {
        self.push(url, MockReply::Fail(error));
    }

    /// Queue a transfer that never completes (until cancelled).
    pub fn add_hang(&self, url: &str) {
        self.push(url, MockReply::Hang);
    }

    /// Queue a response gated on a trigger; the transfer stays in flight
    /// until the returned sender fires.
    pub fn add_response_with_trigger(
        &self,
        url: &str,
        response: HttpResponse,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push(url, MockReply::RespondWhenTriggered(rx, response));
        tx
    }

    /// Queue an authentication challenge round for a URL.
    pub fn add_challenge(
        &self,
        url: &str,
        scheme: &str,
        realm: &str,
        authorized: HttpResponse,
        denied: HttpResponse,
    ) {
        self.push(
            url,
            MockReply::Challenge {
                scheme: scheme.to_string(),
                realm: realm.to_string(),
                authorized,
                denied,
            },
        );
    }

    /// Get all calls that have been made to this mock client.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Clear all recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of transfers currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(
        &self,
        request: &RequestData,
        delegate: &dyn TransferDelegate,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        self.calls.lock().push(MockCall {
            method: request.method.clone(),
            url: request.url.clone(),
        });

        let reply = self
            .replies
            .lock()
            .get_mut(&request.url)
            .and_then(VecDeque::pop_front);

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _gauge = scopeguard::guard(self.in_flight.clone(), |gauge| {
            gauge.fetch_sub(1, Ordering::SeqCst);
        });

        match reply {
            Some(MockReply::Respond(response)) => mock_respond(request, delegate, response).await,
            Some(MockReply::Fail(error)) => Err(error),
            Some(MockReply::Hang) => {
                cancel.cancelled().await;
                Err(TransportError::cancelled())
            }
            Some(MockReply::RespondWhenTriggered(trigger, response)) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(TransportError::cancelled()),
                    result = trigger => match result {
                        Ok(()) => mock_respond(request, delegate, response).await,
                        Err(_) => Err(TransportError::new(
                            transport_code::CONNECTION_LOST,
                            "mock trigger dropped",
                        )),
                    },
                }
            }
            Some(MockReply::Challenge {
                scheme,
                realm,
                authorized,
                denied,
            }) => {
                let (challenge, reply) = AuthChallenge::new(
                    host_of(&request.url),
                    Some(scheme),
                    Some(realm),
                    0,
                );
                delegate.challenge(challenge).await;
                match reply.await {
                    Ok(ChallengeAnswer::UseCredentials(_)) => {
                        mock_respond(request, delegate, authorized).await
                    }
                    Ok(ChallengeAnswer::Continue) => {
                        mock_respond(request, delegate, denied).await
                    }
                    Ok(ChallengeAnswer::Reject) | Err(_) => Err(TransportError::new(
                        transport_code::AUTH_REQUIRED,
                        "authentication challenge rejected",
                    )),
                }
            }
            None => Err(TransportError::new(
                transport_code::CANNOT_FIND_HOST,
                format!("no mock reply configured for {}", request.url),
            )),
        }
    }
}

/// Emit the mock's progress events (whole-body upload and download) and
/// deliver the response.
async fn mock_respond(
    request: &RequestData,
    delegate: &dyn TransferDelegate,
    response: HttpResponse,
) -> Result<HttpResponse, TransportError> {
    if !request.body.is_empty() {
        let len = request.body.len() as i64;
        delegate.upload_progress(len, len).await;
    }
    if !response.body.is_empty() {
        let len = response.body.len() as i64;
        delegate.download_progress(len, len).await;
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Delegate that records every event and answers challenges from a script.
    #[derive(Default)]
    struct RecordingDelegate {
        uploads: Mutex<Vec<(i64, i64)>>,
        downloads: Mutex<Vec<(i64, i64)>>,
        challenges: Mutex<Vec<(Option<String>, Option<String>, u32)>>,
        answer: Mutex<Option<ChallengeAnswer>>,
    }

    impl RecordingDelegate {
        fn answering(answer: ChallengeAnswer) -> Self {
            Self {
                answer: Mutex::new(Some(answer)),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl TransferDelegate for RecordingDelegate {
        async fn upload_progress(&self, bytes_sent: i64, total_bytes: i64) {
            self.uploads.lock().push((bytes_sent, total_bytes));
        }

        async fn download_progress(&self, bytes_received: i64, total_bytes: i64) {
            self.downloads.lock().push((bytes_received, total_bytes));
        }

        async fn challenge(&self, challenge: AuthChallenge) {
            self.challenges.lock().push((
                challenge.scheme.clone(),
                challenge.realm.clone(),
                challenge.previous_failures,
            ));
            match self.answer.lock().take() {
                Some(answer) => challenge.into_responder().answer(answer),
                None => challenge.continue_without_credentials(),
            }
        }
    }

    fn ok_response(body: &[u8]) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_parse_www_authenticate() {
        assert_eq!(
            parse_www_authenticate(r#"Basic realm="images""#),
            (Some("Basic".to_string()), Some("images".to_string()))
        );
        assert_eq!(
            parse_www_authenticate("Bearer"),
            (Some("Bearer".to_string()), None)
        );
        assert_eq!(
            parse_www_authenticate(r#"Digest qop="auth", realm="api""#),
            (Some("Digest".to_string()), Some("api".to_string()))
        );
    }

    #[tokio::test]
    async fn test_mock_client_scripted_replies_in_order() {
        let mock = MockHttpClient::new();
        mock.add_response("https://example.com/a", ok_response(b"first"));
        mock.add_response("https://example.com/a", ok_response(b"second"));

        let delegate = RecordingDelegate::default();
        let cancel = CancellationToken::new();
        let request = RequestData::get("https://example.com/a");

        let first = mock.execute(&request, &delegate, &cancel).await.unwrap();
        let second = mock.execute(&request, &delegate, &cancel).await.unwrap();
        assert_eq!(first.body, b"first");
        assert_eq!(second.body, b"second");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.get_calls()[0].method, "GET");
    }

    #[tokio::test]
    async fn test_mock_client_unconfigured_url_fails() {
        let mock = MockHttpClient::new();
        let delegate = RecordingDelegate::default();
        let cancel = CancellationToken::new();
        let request = RequestData::get("https://example.com/missing");

        let err = mock.execute(&request, &delegate, &cancel).await.unwrap_err();
        assert_eq!(err.code, transport_code::CANNOT_FIND_HOST);
    }

    #[tokio::test]
    async fn test_mock_client_hang_resolves_on_cancel() {
        let mock = MockHttpClient::new();
        mock.add_hang("https://example.com/slow");

        let cancel = CancellationToken::new();
        let request = RequestData::get("https://example.com/slow");

        let mock2 = mock.clone();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let delegate = RecordingDelegate::default();
                mock2.execute(&request, &delegate, &cancel).await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.in_flight_count(), 1);
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(mock.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_client_challenge_with_credentials() {
        let mock = MockHttpClient::new();
        mock.add_challenge(
            "https://example.com/private",
            "Basic",
            "images",
            ok_response(b"secret"),
            HttpResponse {
                status: 401,
                headers: Vec::new(),
                body: Vec::new(),
            },
        );

        let delegate = RecordingDelegate::answering(ChallengeAnswer::UseCredentials(
            Credentials::new("user", "pass"),
        ));
        let cancel = CancellationToken::new();
        let request = RequestData::get("https://example.com/private");

        let response = mock.execute(&request, &delegate, &cancel).await.unwrap();
        assert_eq!(response.body, b"secret");

        let challenges = delegate.challenges.lock();
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].0.as_deref(), Some("Basic"));
        assert_eq!(challenges[0].1.as_deref(), Some("images"));
    }

    #[tokio::test]
    async fn test_mock_client_challenge_rejected() {
        let mock = MockHttpClient::new();
        mock.add_challenge(
            "https://example.com/private",
            "Basic",
            "images",
            ok_response(b"secret"),
            ok_response(b"denied"),
        );

        let delegate = RecordingDelegate::answering(ChallengeAnswer::Reject);
        let cancel = CancellationToken::new();
        let request = RequestData::get("https://example.com/private");

        let err = mock.execute(&request, &delegate, &cancel).await.unwrap_err();
        assert_eq!(err.code, transport_code::AUTH_REQUIRED);
    }

    #[tokio::test]
    async fn test_reqwest_client_downloads_with_progress() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/image.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let client = ReqwestHttpClient::new();
        let delegate = RecordingDelegate::default();
        let cancel = CancellationToken::new();
        let request = RequestData::get(format!("{}/image.png", server.uri()));

        let response = client.execute(&request, &delegate, &cancel).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.len(), 4096);

        let downloads = delegate.downloads.lock();
        assert!(!downloads.is_empty());
        // Monotonic byte counts, ending at the full body length.
        for window in downloads.windows(2) {
            assert!(window[0].0 <= window[1].0);
        }
        assert_eq!(downloads.last().unwrap().0, 4096);
        assert_eq!(downloads.last().unwrap().1, 4096);
    }

    #[tokio::test]
    async fn test_reqwest_client_reports_upload_progress() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let body = vec![3u8; 40_000];
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let client = ReqwestHttpClient::new();
        let delegate = RecordingDelegate::default();
        let cancel = CancellationToken::new();
        let request =
            RequestData::new("POST", format!("{}/upload", server.uri())).with_body(body.clone());

        let response = client.execute(&request, &delegate, &cancel).await.unwrap();
        assert_eq!(response.status, 201);

        let uploads = delegate.uploads.lock();
        assert!(!uploads.is_empty());
        assert_eq!(uploads.last().unwrap().0, body.len() as i64);
        assert_eq!(uploads.last().unwrap().1, body.len() as i64);
    }

    #[tokio::test]
    async fn test_reqwest_client_cancellation() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let client = ReqwestHttpClient::new();
        let cancel = CancellationToken::new();
        let request = RequestData::get(format!("{}/slow", server.uri()));

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel2.cancel();
        });

        let delegate = RecordingDelegate::default();
        let err = client.execute(&request, &delegate, &cancel).await.unwrap_err();
        assert_eq!(err.code, transport_code::CANCELLED);
    }

    #[tokio::test]
    async fn test_reqwest_client_answers_basic_auth_challenge() {
        use wiremock::matchers::{header_exists, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"secret".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("WWW-Authenticate", r#"Basic realm="images""#),
            )
            .mount(&server)
            .await;

        let client = ReqwestHttpClient::new();
        let delegate = RecordingDelegate::answering(ChallengeAnswer::UseCredentials(
            Credentials::new("user", "pass"),
        ));
        let cancel = CancellationToken::new();
        let request = RequestData::get(format!("{}/private", server.uri()));

        let response = client.execute(&request, &delegate, &cancel).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"secret");

        let challenges = delegate.challenges.lock();
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].1.as_deref(), Some("images"));
    }

    #[tokio::test]
    async fn test_reqwest_client_delivers_401_when_continuing() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("WWW-Authenticate", r#"Basic realm="images""#),
            )
            .mount(&server)
            .await;

        let client = ReqwestHttpClient::new();
        // No scripted answer: the delegate continues without credentials.
        let delegate = RecordingDelegate::default();
        let cancel = CancellationToken::new();
        let request = RequestData::get(format!("{}/private", server.uri()));

        let response = client.execute(&request, &delegate, &cancel).await.unwrap();
        assert_eq!(response.status, 401);
        assert!(response.response_error().is_some());
    }
}
