//! Transport adapters that move raw progress frames from the server.
//!
//! Every variant implements [`TransportAdapter`], so sequencing, reconnection
//! and completion detection are written once on top of them.
pub mod poll;
pub mod socket;
pub mod sse;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::oneshot;

use crate::config::StreamConfig;
use crate::errors::{StreamError, TransportError};
use crate::model::{JobId, TransportKind};

pub use poll::PollTransport;
pub use socket::SocketTransport;
pub use sse::SseTransport;

/// How long a graceful close may take before the handle is simply dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Raw payload received from a transport, before sequencing.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    /// One JSON message from a cursorless transport (SSE, WebSocket).
    Text(String),
    /// The events a poll request returned for cursor `from`.
    Batch {
        from: u64,
        events: Vec<serde_json::Value>,
    },
}

/// Why a transport stopped producing frames.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Orderly close (WebSocket 1000, or requested by the session).
    Normal,
    Error(TransportError),
    /// No response within the allotted time.
    Timeout(Duration),
}

impl CloseReason {
    pub fn describe(&self) -> String {
        match self {
            Self::Normal => "closed normally".to_string(),
            Self::Error(err) => err.to_string(),
            Self::Timeout(after) => format!("timed out after {}ms", after.as_millis()),
        }
    }
}

/// Item yielded by an open transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(RawFrame),
    /// Liveness only; carries no event.
    Heartbeat,
    /// The job disappeared or is not registered yet (HTTP 404 mid-stream).
    NotYetAvailable,
    /// Last item of every handle.
    Closed(CloseReason),
}

pub type TransportStream = Pin<Box<dyn futures::Stream<Item = TransportEvent> + Send + 'static>>;

/// An open connection. Dropping it interrupts any in-flight request or read.
pub struct TransportHandle {
    events: TransportStream,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TransportHandle {
    pub fn new(events: TransportStream) -> Self {
        Self {
            events,
            shutdown: None,
        }
    }

    /// Attaches a signal the stream watches to perform a graceful close.
    pub fn with_shutdown(mut self, shutdown: oneshot::Sender<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Next frame, heartbeat or close. `None` after `Closed` was yielded.
    pub async fn next(&mut self) -> Option<TransportEvent> {
        self.events.next().await
    }

    /// Closes the connection on the session's behalf (reason `Normal`).
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take()
            && shutdown.send(()).is_ok()
        {
            let drain = async { while self.events.next().await.is_some() {} };
            let _ = tokio::time::timeout(CLOSE_GRACE, drain).await;
        }
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("graceful_close", &self.shutdown.is_some())
            .finish()
    }
}

/// Contract shared by the poll, SSE and WebSocket transports.
#[async_trait::async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Opens a connection for `job_id`, resuming from `cursor` when the
    /// transport supports one.
    ///
    /// Returns `TransportError::NotYetAvailable` when the server does not know
    /// the job yet.
    async fn open(&self, job_id: &JobId, cursor: u64) -> Result<TransportHandle, TransportError>;
}

/// Builds the adapter selected by `config.transport`.
pub fn build_adapter(config: &StreamConfig) -> Result<Arc<dyn TransportAdapter>, StreamError> {
    let adapter: Arc<dyn TransportAdapter> = match config.transport {
        TransportKind::Poll => Arc::new(PollTransport::new(config.clone())?),
        TransportKind::Sse => Arc::new(SseTransport::new(config.clone())?),
        TransportKind::Socket => Arc::new(SocketTransport::new(config.clone())?),
    };
    Ok(adapter)
}

pub(crate) fn http_client(config: &StreamConfig) -> Result<reqwest::Client, StreamError> {
    reqwest::Client::builder()
        .connect_timeout(config.request_timeout)
        .build()
        .map_err(|e| StreamError::Config(format!("failed to build HTTP client: {e}")))
}

pub(crate) fn map_reqwest_error(transport: TransportKind, err: reqwest::Error) -> TransportError {
    let status = err.status().map(|s| s.as_u16());
    if err.is_timeout() {
        return TransportError::transient(transport, format!("request timed out: {err}"), status);
    }
    TransportError::transient(transport, format!("request failed: {err}"), status)
}
