//! The request queue: scheduling, concurrency control, and aggregate tracking.
//!
//! A [`Queue`] owns its operations from enqueue until they reach a terminal
//! state. The scheduler promotes ready operations to running whenever
//! capacity allows, honoring the concurrency cap, the FIFO/LIFO discipline,
//! suspension, and per-operation retry backoff windows. Each running
//! operation is driven by its own tokio task; queue state mutations appear
//! atomic behind a single mutex, and no caller callback is ever invoked
//! while that mutex is held.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::Stream;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::BarrageError;
use crate::http::{HttpClient, ReqwestHttpClient};
use crate::operation::{
    CallbackRelay, CompletionHandler, HandlerSlots, Operation, OperationHandle, OperationId,
    OperationState, RequestData, TransferOutcome,
};


/// Ordering discipline for promoting ready operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Oldest ready operation is promoted first.
    #[default]
    Fifo,
    /// Newest ready operation is promoted first. Running operations are
    /// never preempted.
    Lifo,
}

/// Configuration for a queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of operations in the running state
    pub max_concurrent: usize,

    /// Promotion order for ready operations
    pub mode: QueueMode,

    /// When false, an enqueue whose URL matches a pending operation is
    /// dropped silently
    pub allow_duplicates: bool,

    /// Start suspended; no operation runs until `set_suspended(false)`
    pub suspended: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            mode: QueueMode::Fifo,
            allow_duplicates: true,
            suspended: false,
        }
    }
}

/// A lifecycle event emitted on the queue's broadcast channel whenever an
/// operation changes state.
#[derive(Debug, Clone)]
pub struct OperationEvent {
    /// The operation that changed state
    pub id: OperationId,
    /// The state it entered
    pub state: OperationState,
}

type BatchCompletionHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// A ready operation waiting for promotion, with its callback slots and
/// retry bookkeeping.
struct ReadyEntry {
    op: Arc<OperationHandle>,
    handlers: HandlerSlots,
    /// Transfer attempts already made (0 before the first start)
    attempts_made: u32,
    /// Earliest promotion time; `None` means immediately eligible
    not_before: Option<Instant>,
}

struct QueueCore {
    /// Ready operations in enqueue order (front is oldest)
    ready: VecDeque<ReadyEntry>,
    /// Running operations in start order
    running: Vec<Arc<OperationHandle>>,
    suspended: bool,
    mode: QueueMode,
    max_concurrent: usize,
    allow_duplicates: bool,
    /// Cleared by any non-cancellation failure in the current batch
    success: bool,
    /// True from first enqueue until the drain that reports it
    batch_active: bool,
    batch_completion: Option<BatchCompletionHandler>,
}

impl QueueCore {
    fn contains_url(&self, url: &str) -> bool {
        self.running.iter().any(|op| op.request().url == url)
            || self.ready.iter().any(|entry| entry.op.request().url == url)
    }

    /// Index of the next ready operation to promote, honoring the mode and
    /// skipping operations still inside their retry backoff window.
    fn select_ready(&self, now: Instant) -> Option<usize> {
        let eligible = |entry: &ReadyEntry| entry.not_before.is_none_or(|t| t <= now);
        match self.mode {
            QueueMode::Fifo => self.ready.iter().position(eligible),
            QueueMode::Lifo => self.ready.iter().rposition(eligible),
        }
    }

    /// Re-insert a retrying operation at its original enqueue position.
    fn insert_ready(&mut self, entry: ReadyEntry) {
        let position = self
            .ready
            .iter()
            .position(|e| e.op.seq() > entry.op.seq())
            .unwrap_or(self.ready.len());
        self.ready.insert(position, entry);
    }

    fn remove_running(&mut self, id: OperationId) {
        if let Some(position) = self.running.iter().position(|op| op.id() == id) {
            self.running.remove(position);
        }
    }

    /// If the queue just drained an active batch, consume the batch and
    /// return the handler to invoke (outside the lock) with the flag value.
    fn take_drain(&mut self) -> Option<(Option<BatchCompletionHandler>, bool)> {
        if self.batch_active && self.ready.is_empty() && self.running.is_empty() {
            self.batch_active = false;
            Some((self.batch_completion.clone(), self.success))
        } else {
            None
        }
    }
}

struct QueueInner<H> {
    client: H,
    core: Mutex<QueueCore>,
    events_tx: broadcast::Sender<OperationEvent>,
    next_seq: AtomicU64,
}

/// A bounded scheduler over pending HTTP operations.
///
/// Cheap to clone (all clones share the same queue). Must be used from
/// within a tokio runtime: promotions spawn a driver task per running
/// operation.
///
/// # Example
/// ```no_run
/// use barrage::{Operation, Queue, RequestData};
///
/// # async fn example() {
/// let queue = Queue::new();
/// queue.on_batch_completion(|success| println!("batch done, success = {success}"));
///
/// queue.add_request(RequestData::get("https://example.com/a.png"), |outcome| {
///     match outcome {
///         Ok(response) => println!("got {} bytes", response.body.len()),
///         Err(e) => eprintln!("failed: {e}"),
///     }
/// });
/// # }
/// ```
pub struct Queue<H: HttpClient + 'static = ReqwestHttpClient> {
    inner: Arc<QueueInner<H>>,
}

impl<H: HttpClient + 'static> Clone for Queue<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Queue<ReqwestHttpClient> {
    /// Create a queue with default settings and the reqwest-backed client.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Create a queue with the reqwest-backed client and custom settings.
    pub fn with_config(config: QueueConfig) -> Self {
        Self::with_client(ReqwestHttpClient::new(), config)
    }
}

impl Default for Queue<ReqwestHttpClient> {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide default queue, lazily constructed with default settings.
static MAIN_QUEUE: Lazy<Queue> = Lazy::new(Queue::new);

/// The shared default queue. Callers wanting isolation construct their own
/// queues with [`Queue::new`].
pub fn main_queue() -> &'static Queue {
    &MAIN_QUEUE
}

impl<H: HttpClient + 'static> Queue<H> {
    /// Create a queue over any [`HttpClient`] implementation.
    pub fn with_client(client: H, config: QueueConfig) -> Self {
        // Each operation produces a handful of events; a drained receiver
        // lags rather than blocking the queue.
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(QueueInner {
                client,
                core: Mutex::new(QueueCore {
                    ready: VecDeque::new(),
                    running: Vec::new(),
                    suspended: config.suspended,
                    mode: config.mode,
                    max_concurrent: config.max_concurrent.max(1),
                    allow_duplicates: config.allow_duplicates,
                    success: true,
                    batch_active: false,
                    batch_completion: None,
                }),
                events_tx,
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Add an operation to the queue and attempt scheduling.
    ///
    /// Returns a handle for inspection, or `None` when duplicate suppression
    /// dropped the submission.
    pub fn enqueue(&self, operation: Operation) -> Option<Arc<OperationHandle>> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (handle, handlers) = operation.into_parts(seq);
        {
            let mut core = self.inner.core.lock();
            if !core.allow_duplicates && core.contains_url(&handle.request().url) {
                tracing::debug!(url = %handle.request().url, "dropping duplicate request");
                return None;
            }
            core.batch_active = true;
            core.ready.push_back(ReadyEntry {
                op: handle.clone(),
                handlers,
                attempts_made: 0,
                not_before: None,
            });
        }
        tracing::debug!(
            operation_id = %handle.id(),
            url = %handle.request().url,
            "operation enqueued"
        );
        schedule(&self.inner);
        Some(handle)
    }

    /// Wrap a raw request in a default operation and enqueue it.
    pub fn add_request(
        &self,
        request: RequestData,
        completion: impl FnOnce(TransferOutcome) + Send + 'static,
    ) -> Option<Arc<OperationHandle>> {
        self.enqueue(Operation::new(request).with_completion(completion))
    }

    /// Cancel the first pending operation (by enqueue order) whose request
    /// URL equals `url`.
    ///
    /// A ready operation is removed without invoking its completion handler;
    /// a running operation aborts its transfer and completes with the
    /// cancellation error.
    pub fn cancel_request(&self, url: &str) {
        enum Target {
            Ready(ReadyEntry),
            Running(Arc<OperationHandle>),
        }

        let (target, drained) = {
            let mut core = self.inner.core.lock();
            let ready_match = core
                .ready
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.op.request().url == url)
                .map(|(index, entry)| (index, entry.op.seq()))
                .min_by_key(|&(_, seq)| seq);
            let running_match = core
                .running
                .iter()
                .enumerate()
                .filter(|(_, op)| op.request().url == url)
                .map(|(index, op)| (index, op.seq()))
                .min_by_key(|&(_, seq)| seq);

            let ready_index = match (ready_match, running_match) {
                (Some((index, ready_seq)), Some((_, running_seq))) => {
                    (ready_seq < running_seq).then_some(index)
                }
                (Some((index, _)), None) => Some(index),
                _ => None,
            };

            if let Some(index) = ready_index {
                let entry = core.ready.remove(index).expect("ready index in bounds");
                entry.op.set_state(OperationState::Cancelled);
                let drained = core.take_drain();
                (Some(Target::Ready(entry)), drained)
            } else if let Some((index, _)) = running_match {
                (Some(Target::Running(core.running[index].clone())), None)
            } else {
                (None, None)
            }
        };

        match target {
            Some(Target::Ready(entry)) => {
                tracing::debug!(operation_id = %entry.op.id(), url, "removed ready operation");
                let _ = self.inner.events_tx.send(OperationEvent {
                    id: entry.op.id(),
                    state: OperationState::Cancelled,
                });
                // Never started: its completion handler is dropped unfired.
                drop(entry);
                fire_drain(drained);
            }
            Some(Target::Running(op)) => {
                tracing::debug!(operation_id = %op.id(), url, "cancelling running operation");
                op.cancel();
            }
            None => {}
        }
    }

    /// Cancel every pending operation.
    ///
    /// Every operation, ready or running, completes with the cancellation
    /// error. Cancellations do not clear the success flag, so a batch that
    /// saw no other failures still reports success when it drains.
    pub fn cancel_all(&self) {
        let (ready_entries, running_ops, drained) = {
            let mut core = self.inner.core.lock();
            let ready: Vec<ReadyEntry> = core.ready.drain(..).collect();
            for entry in &ready {
                entry.op.set_state(OperationState::Cancelled);
            }
            let running: Vec<Arc<OperationHandle>> = core.running.clone();
            let drained = core.take_drain();
            (ready, running, drained)
        };

        if ready_entries.is_empty() && running_ops.is_empty() {
            return;
        }
        tracing::info!(
            ready = ready_entries.len(),
            running = running_ops.len(),
            "cancelling all operations"
        );

        for entry in &ready_entries {
            let _ = self.inner.events_tx.send(OperationEvent {
                id: entry.op.id(),
                state: OperationState::Cancelled,
            });
        }
        for mut entry in ready_entries {
            if let Some(completion) = entry.handlers.completion.take() {
                completion(Err(BarrageError::Cancelled));
            }
        }
        for op in running_ops {
            op.cancel();
        }
        fire_drain(drained);
    }

    /// Reset the success flag to true, starting a new logical batch.
    pub fn clear_success_flag(&self) {
        self.inner.core.lock().success = true;
    }

    /// True unless some operation in the current batch failed with a
    /// non-cancellation error.
    pub fn success_flag(&self) -> bool {
        self.inner.core.lock().success
    }

    /// Install the aggregate completion handler, invoked with the success
    /// flag each time the queue drains.
    pub fn on_batch_completion(&self, f: impl Fn(bool) + Send + Sync + 'static) {
        self.inner.core.lock().batch_completion = Some(Arc::new(f));
    }

    /// Number of pending (ready or running) operations.
    pub fn request_count(&self) -> usize {
        let core = self.inner.core.lock();
        core.running.len() + core.ready.len()
    }

    /// Pending operations: running ones in start order, then ready ones in
    /// the order the current mode would promote them.
    pub fn requests(&self) -> Vec<Arc<OperationHandle>> {
        let core = self.inner.core.lock();
        let mut out = core.running.clone();
        match core.mode {
            QueueMode::Fifo => out.extend(core.ready.iter().map(|entry| entry.op.clone())),
            QueueMode::Lifo => out.extend(core.ready.iter().rev().map(|entry| entry.op.clone())),
        }
        out
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.core.lock().suspended
    }

    /// While suspended no operation is promoted; running operations continue.
    pub fn set_suspended(&self, suspended: bool) {
        {
            self.inner.core.lock().suspended = suspended;
        }
        if !suspended {
            tracing::debug!("queue resumed");
            schedule(&self.inner);
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.inner.core.lock().mode
    }

    pub fn set_mode(&self, mode: QueueMode) {
        self.inner.core.lock().mode = mode;
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.core.lock().max_concurrent
    }

    /// Change the concurrency cap. Raising it promotes immediately;
    /// lowering it below the running count lets running operations finish.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let max_concurrent = if max_concurrent == 0 {
            tracing::warn!("max_concurrent must be positive, clamping to 1");
            1
        } else {
            max_concurrent
        };
        {
            self.inner.core.lock().max_concurrent = max_concurrent;
        }
        schedule(&self.inner);
    }

    pub fn allows_duplicates(&self) -> bool {
        self.inner.core.lock().allow_duplicates
    }

    pub fn set_allow_duplicates(&self, allow_duplicates: bool) {
        self.inner.core.lock().allow_duplicates = allow_duplicates;
    }

    /// Subscribe to operation lifecycle events.
    ///
    /// # Arguments
    ///
    /// * `operation_ids` - If `Some(ids)`, only emit events for the
    ///   specified operations. If `None`, emit events for all operations
    ///   (useful for monitoring).
    pub fn subscribe(
        &self,
        operation_ids: Option<Vec<OperationId>>,
    ) -> Pin<Box<dyn Stream<Item = OperationEvent> + Send>> {
        let rx = self.inner.events_tx.subscribe();

        match operation_ids {
            Some(ids) => {
                let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
                    Ok(event) if ids.contains(&event.id) => Some(event),
                    _ => None,
                });
                Box::pin(stream)
            }
            None => {
                let stream = BroadcastStream::new(rx).filter_map(|result| result.ok());
                Box::pin(stream)
            }
        }
    }
}

/// Promote ready operations until the cap is saturated, the queue is
/// suspended, or no eligible operation remains. Invoked on enqueue, on
/// operation termination, on resume, and on cap changes.
fn schedule<H: HttpClient + 'static>(inner: &Arc<QueueInner<H>>) {
    let mut to_start = Vec::new();
    {
        let mut core = inner.core.lock();
        let now = Instant::now();
        while !core.suspended && core.running.len() < core.max_concurrent {
            let Some(index) = core.select_ready(now) else {
                break;
            };
            let entry = core.ready.remove(index).expect("ready index in bounds");
            entry.op.set_state(OperationState::Running);
            core.running.push(entry.op.clone());
            to_start.push(entry);
        }
    }

    for entry in to_start {
        let _ = inner.events_tx.send(OperationEvent {
            id: entry.op.id(),
            state: OperationState::Running,
        });
        tracing::debug!(
            operation_id = %entry.op.id(),
            url = %entry.op.request().url,
            attempt = entry.attempts_made + 1,
            "starting transfer"
        );
        tokio::spawn(drive(inner.clone(), entry));
    }
}

/// Drive one transfer attempt for a running operation and route the result:
/// terminal success/failure, cancellation, or retry re-queue.
async fn drive<H: HttpClient + 'static>(inner: Arc<QueueInner<H>>, entry: ReadyEntry) {
    let ReadyEntry {
        op,
        mut handlers,
        attempts_made,
        ..
    } = entry;
    let completion = handlers.completion.take();

    // Liveness guard: if a caller-supplied progress callback panics, the
    // running slot is still released and scheduling continues.
    let guard = scopeguard::guard((inner.clone(), op.clone()), |(inner, op)| {
        {
            let mut core = inner.core.lock();
            core.remove_running(op.id());
            op.set_state(OperationState::Finished);
            core.success = false;
        }
        schedule(&inner);
    });

    let relay = CallbackRelay::new(op.clone(), handlers);
    let result = inner
        .client
        .execute(op.request(), &relay, op.cancel_token())
        .await;
    let mut handlers = relay.into_slots();
    handlers.completion = completion;

    let _ = scopeguard::ScopeGuard::into_inner(guard);

    let attempts = attempts_made + 1;
    match result {
        Ok(response) => {
            tracing::debug!(
                operation_id = %op.id(),
                status = response.status,
                "operation finished"
            );
            finish(&inner, &op, handlers.completion.take(), Ok(response));
        }
        Err(error) if error.is_cancellation() || op.cancel_token().is_cancelled() => {
            tracing::debug!(operation_id = %op.id(), "operation cancelled");
            finish(
                &inner,
                &op,
                handlers.completion.take(),
                Err(BarrageError::Cancelled),
            );
        }
        Err(error) => {
            if op.retry_policy().should_retry(&error, attempts) {
                tracing::warn!(
                    operation_id = %op.id(),
                    code = error.code,
                    attempts,
                    "transfer failed, will retry"
                );
                requeue(inner, op, handlers, attempts);
            } else {
                tracing::error!(
                    operation_id = %op.id(),
                    code = error.code,
                    attempts,
                    "transfer failed"
                );
                finish(&inner, &op, handlers.completion.take(), Err(error.into()));
            }
        }
    }
}

/// Move a running operation to its terminal state, deliver the completion,
/// and report the batch if this drained the queue.
fn finish<H: HttpClient + 'static>(
    inner: &Arc<QueueInner<H>>,
    op: &Arc<OperationHandle>,
    completion: Option<CompletionHandler>,
    outcome: TransferOutcome,
) {
    let cancelled = matches!(outcome, Err(BarrageError::Cancelled));
    let state = if cancelled {
        OperationState::Cancelled
    } else {
        OperationState::Finished
    };

    let drained = {
        let mut core = inner.core.lock();
        core.remove_running(op.id());
        op.set_state(state);
        if outcome.is_err() && !cancelled {
            core.success = false;
        }
        core.take_drain()
    };

    let _ = inner.events_tx.send(OperationEvent { id: op.id(), state });
    if let Some(completion) = completion {
        completion(outcome);
    }
    fire_drain(drained);
    schedule(inner);
}

/// Return a failed operation to the ready list with its backoff window and
/// arrange a wake-up when the window elapses.
fn requeue<H: HttpClient + 'static>(
    inner: Arc<QueueInner<H>>,
    op: Arc<OperationHandle>,
    handlers: HandlerSlots,
    attempts_made: u32,
) {
    let wake = Instant::now() + op.retry_policy().retry_delay;
    {
        let mut core = inner.core.lock();
        core.remove_running(op.id());
        op.set_state(OperationState::Ready);
        op.counters().reset();
        core.insert_ready(ReadyEntry {
            op: op.clone(),
            handlers,
            attempts_made,
            not_before: Some(wake),
        });
    }
    let _ = inner.events_tx.send(OperationEvent {
        id: op.id(),
        state: OperationState::Ready,
    });
    // The freed slot may promote another operation right away.
    schedule(&inner);
    tokio::spawn(async move {
        tokio::time::sleep_until(wake).await;
        schedule(&inner);
    });
}

fn fire_drain(drained: Option<(Option<BatchCompletionHandler>, bool)>) {
    if let Some((handler, success)) = drained {
        tracing::info!(success, "queue drained");
        if let Some(handler) = handler {
            handler(success);
        }
    }
}
