//! Client for following long-running workflow jobs over HTTP polling,
//! Server-Sent Events or WebSocket.
//!
//! A session reconnects with exponential backoff, drops duplicate frames,
//! gives up once its circuit breaker opens, and reports exactly one outcome.
//!
//! # Following a job
//!
//! ```no_run
//! use progress_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let client = StreamClient::builder()
//!     .config(StreamConfig::new("http://localhost:8000").transport(TransportKind::Sse))
//!     .build()?;
//!
//! let session = client.session("job-42")?;
//! let _events = session.subscribe(
//!     |event| println!("{}: {:?}", event.kind, event.message),
//!     |outcome| println!("finished: {outcome:?}"),
//! );
//!
//! let result = session.wait().await.into_result()?;
//! println!("{}", result.payload);
//! # Ok(())
//! # }
//! ```

/// Client entry point and builder.
pub mod client;
/// Terminal-event detection and the ready side-channel.
pub mod completion;
/// Client configuration and endpoint URLs.
pub mod config;
/// Public error types.
pub mod errors;
/// Progress events and session outcomes.
pub mod event;
/// Job ids, transport kinds and connection states.
pub mod model;
/// Logging setup.
pub mod observability;
/// Exponential backoff and circuit breaker.
pub mod policy;
/// Common imports for typical usage.
pub mod prelude;
/// Cursor tracking and de-duplication.
pub mod sequencer;
/// Per-job session and its driver task.
pub mod session;
/// Transport adapter contract and the poll, SSE and WebSocket adapters.
pub mod transport;

pub use client::{StreamClient, StreamClientBuilder};
pub use completion::{CompletionDetector, Detection};
pub use config::StreamConfig;
pub use errors::{SessionFailure, StreamError, TransportError};
pub use event::{EventKind, SessionOutcome, StreamEvent};
pub use model::{ConnectionState, JobId, TransportKind};
pub use observability::init_observability;
pub use policy::{
    PolicyState, ReconnectDecision, ReconnectSettings, ReconnectionPolicy, RetryState,
};
pub use sequencer::{EventSequencer, SequenceGap, SequencedBatch};
pub use session::{CancelHandle, StreamSession, Subscription};
pub use transport::{
    CloseReason, PollTransport, RawFrame, SocketTransport, SseTransport, TransportAdapter,
    TransportEvent, TransportHandle,
};
