//! Concurrent HTTP request queue with retry logic and progress reporting.
//!
//! This crate provides a [`Queue`] that accepts HTTP request descriptors
//! (wrapped in [`Operation`]s), schedules them under a configurable
//! concurrency cap and ordering discipline, and drives each to completion:
//! progress callbacks while bytes move, authentication challenge callbacks
//! when servers demand credentials, automatic retry on selected transport
//! failures, and a per-operation completion callback. An optional aggregate
//! handler reports whether the whole batch succeeded when the queue drains.
//!
//! # Example
//! ```no_run
//! use barrage::{Operation, Queue, QueueConfig, QueueMode, RequestData, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = Queue::with_config(QueueConfig {
//!         max_concurrent: 4,
//!         mode: QueueMode::Fifo,
//!         ..QueueConfig::default()
//!     });
//!     queue.on_batch_completion(|success| println!("batch finished, success = {success}"));
//!
//!     let operation = Operation::get("https://example.com/images/1.png")
//!         .with_retry_policy(RetryPolicy {
//!             auto_retry: true,
//!             ..RetryPolicy::default()
//!         })
//!         .with_download_progress(|fraction, done, total| {
//!             println!("{:.0}% ({done}/{total})", fraction * 100.0);
//!         })
//!         .with_completion(|outcome| match outcome {
//!             Ok(response) => println!("{} bytes", response.body.len()),
//!             Err(e) => eprintln!("failed: {e}"),
//!         });
//!     queue.enqueue(operation);
//!
//!     // Raw requests can skip the builder entirely:
//!     queue.add_request(RequestData::get("https://example.com/images/2.png"), |_| {});
//! }
//! ```

pub mod error;
pub mod http;
pub mod operation;
pub mod queue;

// Re-export commonly used types at the crate root for convenience.
// This allows users to write `use barrage::Queue` instead of
// `use barrage::queue::Queue`. These types form the public interface most
// users will interact with:
// - The queue and its configuration (Queue, QueueConfig, QueueMode)
// - Operations and their building blocks (Operation, RequestData, RetryPolicy)
// - The HTTP client seam (HttpClient, ReqwestHttpClient, MockHttpClient)
// - Error handling (BarrageError, TransportError, transport_code)
pub use error::{transport_code, BarrageError, HttpResponseError, Result, TransportError};
pub use http::{
    AuthChallenge, ChallengeAnswer, ChallengeResponder, Credentials, HttpClient, HttpResponse,
    MockHttpClient, ReqwestHttpClient, TransferDelegate, UNKNOWN_TOTAL,
};
pub use operation::{
    Operation, OperationHandle, OperationId, OperationState, RequestData, RetryPolicy,
    TransferCounters, TransferOutcome,
};
pub use queue::{main_queue, OperationEvent, Queue, QueueConfig, QueueMode};
