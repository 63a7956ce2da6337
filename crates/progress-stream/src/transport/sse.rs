//! Server-Sent Events transport: one `text/event-stream` response per open.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::config::StreamConfig;
use crate::errors::{StreamError, TransportError};
use crate::model::{JobId, TransportKind};

use super::{
    CloseReason, RawFrame, TransportAdapter, TransportEvent, TransportHandle, http_client,
    map_reqwest_error,
};

const KIND: TransportKind = TransportKind::Sse;

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Item decoded from the event-stream body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SseItem {
    /// Joined `data:` lines of one frame.
    Data(String),
    /// `:` comment line, used by servers as keep-alive.
    Comment,
}

/// Incremental line decoder for `text/event-stream` bodies.
///
/// Bytes are buffered until a full line is available, so a line (or a
/// multi-byte character) split across chunks is decoded only once complete.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.buf.extend_from_slice(chunk);
        let mut items = Vec::new();
        while let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&line_bytes[..idx]);
            let line = line.trim_end_matches('\r');
            if let Some(item) = self.process_line(line) {
                items.push(item);
            }
        }
        items
    }

    /// Flushes a frame left unterminated when the body ended.
    pub fn finish(&mut self) -> Option<SseItem> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(strip_leading_space(data).to_string());
            }
        }
        self.take_frame()
    }

    fn process_line(&mut self, line: &str) -> Option<SseItem> {
        if line.is_empty() {
            return self.take_frame();
        }
        if line.starts_with(':') {
            return Some(SseItem::Comment);
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data_lines.push(strip_leading_space(data).to_string());
        }
        // `event:`, `id:` and `retry:` carry nothing the client uses.
        None
    }

    fn take_frame(&mut self) -> Option<SseItem> {
        if self.data_lines.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(SseItem::Data(data))
    }
}

fn strip_leading_space(value: &str) -> &str {
    value.strip_prefix(' ').unwrap_or(value)
}

pub struct SseTransport {
    client: reqwest::Client,
    config: StreamConfig,
}

impl SseTransport {
    pub fn new(config: StreamConfig) -> Result<Self, StreamError> {
        let client = http_client(&config)?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl TransportAdapter for SseTransport {
    fn kind(&self) -> TransportKind {
        KIND
    }

    async fn open(&self, job_id: &JobId, _cursor: u64) -> Result<TransportHandle, TransportError> {
        let url = self
            .config
            .sse_url(job_id)
            .map_err(|e| TransportError::protocol(KIND, e.to_string()))?;
        debug!(job_id = %job_id, url = %url, "opening event stream");

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| map_reqwest_error(KIND, e))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TransportError::not_yet_available(job_id));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::transient(
                KIND,
                format!("event stream request failed with status {status}: {body}"),
                Some(status.as_u16()),
            ));
        }

        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        Ok(TransportHandle::new(Box::pin(sse_event_stream(bytes_stream))))
    }
}

fn sse_event_stream(bytes_stream: ByteStream) -> impl futures::Stream<Item = TransportEvent> + Send {
    struct State {
        bytes_stream: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<TransportEvent>,
        done: bool,
    }

    stream::unfold(
        State {
            bytes_stream,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.done {
                    return None;
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        for item in state.decoder.push_chunk(&chunk) {
                            state.pending.push_back(to_event(item));
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        let err = TransportError::transient(
                            KIND,
                            format!("event stream read failed: {e}"),
                            None,
                        );
                        state
                            .pending
                            .push_back(TransportEvent::Closed(CloseReason::Error(err)));
                    }
                    None => {
                        state.done = true;
                        if let Some(item) = state.decoder.finish() {
                            state.pending.push_back(to_event(item));
                        }
                        let err = TransportError::abnormal_close(
                            KIND,
                            "event stream ended without a terminal event",
                            None,
                        );
                        state
                            .pending
                            .push_back(TransportEvent::Closed(CloseReason::Error(err)));
                    }
                }
            }
        },
    )
}

fn to_event(item: SseItem) -> TransportEvent {
    match item {
        SseItem::Data(data) => TransportEvent::Frame(RawFrame::Text(data)),
        SseItem::Comment => TransportEvent::Heartbeat,
    }
}
