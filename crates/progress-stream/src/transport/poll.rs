//! HTTP polling transport: `GET /progress/{job}?from={cursor}` on a fixed
//! interval.
//!
//! Requests run one at a time inside the returned stream, so a new request
//! never starts while another is in flight. A request still unresolved when
//! the next tick fires is dropped and the handle closes with a timeout.

use std::time::Duration;

use futures::stream;
use serde::Deserialize;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::errors::{StreamError, TransportError};
use crate::model::{JobId, TransportKind};

use super::{
    CloseReason, RawFrame, TransportAdapter, TransportEvent, TransportHandle, http_client,
    map_reqwest_error,
};

const KIND: TransportKind = TransportKind::Poll;

#[derive(Debug, Deserialize)]
struct ProgressResponse {
    #[serde(default)]
    events: Vec<serde_json::Value>,
}

/// Outcome of one poll request.
#[derive(Debug)]
enum Fetched {
    Events(Vec<serde_json::Value>),
    NotYetAvailable,
}

pub struct PollTransport {
    client: reqwest::Client,
    config: StreamConfig,
}

impl PollTransport {
    pub fn new(config: StreamConfig) -> Result<Self, StreamError> {
        let client = http_client(&config)?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl TransportAdapter for PollTransport {
    fn kind(&self) -> TransportKind {
        KIND
    }

    async fn open(&self, job_id: &JobId, cursor: u64) -> Result<TransportHandle, TransportError> {
        debug!(job_id = %job_id, cursor, "opening poll stream");
        let first = match fetch(&self.client, &self.config, job_id, cursor).await {
            Ok(Fetched::Events(events)) => Some(events),
            Ok(Fetched::NotYetAvailable) => return Err(TransportError::not_yet_available(job_id)),
            Err(err @ TransportError::Protocol { .. }) => {
                warn!(job_id = %job_id, error = %err, "ignoring malformed poll response");
                None
            }
            Err(err) => return Err(err),
        };

        let interval = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let state = PollState {
            client: self.client.clone(),
            config: self.config.clone(),
            job_id: job_id.clone(),
            cursor,
            ticker,
            interval,
            pending: first,
            done: false,
        };
        Ok(TransportHandle::new(Box::pin(poll_stream(state))))
    }
}

struct PollState {
    client: reqwest::Client,
    config: StreamConfig,
    job_id: JobId,
    cursor: u64,
    ticker: Interval,
    interval: Duration,
    pending: Option<Vec<serde_json::Value>>,
    done: bool,
}

impl PollState {
    fn batch(&mut self, events: Vec<serde_json::Value>) -> TransportEvent {
        let from = self.cursor;
        self.cursor += events.len() as u64;
        TransportEvent::Frame(RawFrame::Batch { from, events })
    }
}

enum Cycle {
    Fetched(Result<Fetched, TransportError>),
    Overran,
}

fn poll_stream(state: PollState) -> impl futures::Stream<Item = TransportEvent> + Send {
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        if let Some(events) = state.pending.take() {
            let event = state.batch(events);
            return Some((event, state));
        }

        loop {
            state.ticker.tick().await;

            let cycle = {
                let PollState {
                    client,
                    config,
                    job_id,
                    cursor,
                    ticker,
                    ..
                } = &mut state;
                tokio::select! {
                    result = fetch(client, config, job_id, *cursor) => Cycle::Fetched(result),
                    _ = ticker.tick() => Cycle::Overran,
                }
            };

            match cycle {
                Cycle::Fetched(Ok(Fetched::Events(events))) => {
                    let event = state.batch(events);
                    return Some((event, state));
                }
                Cycle::Fetched(Ok(Fetched::NotYetAvailable)) => {
                    return Some((TransportEvent::NotYetAvailable, state));
                }
                Cycle::Fetched(Err(err @ TransportError::Protocol { .. })) => {
                    warn!(job_id = %state.job_id, error = %err, "skipping malformed poll response");
                    continue;
                }
                Cycle::Fetched(Err(err)) => {
                    state.done = true;
                    return Some((TransportEvent::Closed(CloseReason::Error(err)), state));
                }
                Cycle::Overran => {
                    warn!(
                        job_id = %state.job_id,
                        interval_ms = state.interval.as_millis() as u64,
                        "poll request outlived its interval; cancelled"
                    );
                    state.done = true;
                    let reason = CloseReason::Timeout(state.interval);
                    return Some((TransportEvent::Closed(reason), state));
                }
            }
        }
    })
}

async fn fetch(
    client: &reqwest::Client,
    config: &StreamConfig,
    job_id: &JobId,
    cursor: u64,
) -> Result<Fetched, TransportError> {
    let url = config
        .poll_url(job_id, cursor)
        .map_err(|e| TransportError::protocol(KIND, e.to_string()))?;
    debug!(job_id = %job_id, cursor, "polling progress");

    let response = client
        .get(url)
        .timeout(config.request_timeout)
        .send()
        .await
        .map_err(|e| map_reqwest_error(KIND, e))?;
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        debug!(job_id = %job_id, "job not registered yet");
        return Ok(Fetched::NotYetAvailable);
    }
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(TransportError::transient(
            KIND,
            format!("progress request failed with status {status}: {body}"),
            Some(status.as_u16()),
        ));
    }

    let bytes = response.bytes().await.map_err(|e| map_reqwest_error(KIND, e))?;
    let body: ProgressResponse = serde_json::from_slice(&bytes)
        .map_err(|e| TransportError::protocol(KIND, format!("invalid progress response: {e}")))?;
    debug!(job_id = %job_id, count = body.events.len(), "progress batch received");
    Ok(Fetched::Events(body.events))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use serde_json::json;

    use super::*;

    #[derive(Clone)]
    enum Reply {
        Status(StatusCode),
        Json(serde_json::Value),
        Raw(&'static str),
        Slow(Duration),
    }

    #[derive(Clone, Default)]
    struct Script {
        replies: Arc<Mutex<VecDeque<Reply>>>,
        seen_from: Arc<Mutex<Vec<u64>>>,
    }

    #[derive(Deserialize)]
    struct FromQuery {
        from: u64,
    }

    async fn progress(
        State(script): State<Script>,
        Path(_job): Path<String>,
        Query(query): Query<FromQuery>,
    ) -> Response {
        script.seen_from.lock().expect("lock").push(query.from);
        let reply = script.replies.lock().expect("lock").pop_front();
        match reply {
            Some(Reply::Status(code)) => code.into_response(),
            Some(Reply::Json(body)) => axum::Json(body).into_response(),
            Some(Reply::Raw(body)) => body.into_response(),
            Some(Reply::Slow(delay)) => {
                tokio::time::sleep(delay).await;
                axum::Json(json!({"events": []})).into_response()
            }
            None => axum::Json(json!({"events": []})).into_response(),
        }
    }

    async fn serve(replies: Vec<Reply>) -> (String, Script) {
        let script = Script {
            replies: Arc::new(Mutex::new(replies.into())),
            seen_from: Arc::default(),
        };
        let app = axum::Router::new()
            .route("/progress/:job", get(progress))
            .with_state(script.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), script)
    }

    fn transport(base_url: &str, interval_ms: u64) -> PollTransport {
        let config =
            StreamConfig::new(base_url).poll_interval(Duration::from_millis(interval_ms));
        PollTransport::new(config).expect("transport")
    }

    fn job() -> JobId {
        JobId::new("abc").expect("job")
    }

    #[tokio::test]
    async fn open_reports_not_yet_available_on_404() {
        let (base, _) = serve(vec![Reply::Status(StatusCode::NOT_FOUND)]).await;
        let err = transport(&base, 50)
            .open(&job(), 0)
            .await
            .expect_err("404 should not open");
        assert!(err.is_not_yet_available());
    }

    #[tokio::test]
    async fn open_fails_on_server_error() {
        let (base, _) = serve(vec![Reply::Status(StatusCode::SERVICE_UNAVAILABLE)]).await;
        let err = transport(&base, 50)
            .open(&job(), 0)
            .await
            .expect_err("503 should not open");
        assert!(matches!(
            err,
            TransportError::Transient {
                status_code: Some(503),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cursor_advances_by_events_received() {
        let (base, script) = serve(vec![
            Reply::Json(json!({"events": [{"kind": "agent_start"}, {"kind": "agent_complete"}]})),
            Reply::Json(json!({"events": []})),
            Reply::Json(json!({"events": [{"kind": "complete"}]})),
        ])
        .await;
        let mut handle = transport(&base, 20).open(&job(), 0).await.expect("open");

        let mut froms = Vec::new();
        for _ in 0..3 {
            match handle.next().await {
                Some(TransportEvent::Frame(RawFrame::Batch { from, .. })) => froms.push(from),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(froms, vec![0, 2, 2]);
        assert_eq!(*script.seen_from.lock().expect("lock"), vec![0, 2, 2]);
    }

    #[tokio::test]
    async fn malformed_body_is_skipped_not_fatal() {
        let (base, _) = serve(vec![
            Reply::Json(json!({"events": []})),
            Reply::Raw("<html>oops</html>"),
            Reply::Json(json!({"events": [{"kind": "refinement"}]})),
        ])
        .await;
        let mut handle = transport(&base, 20).open(&job(), 0).await.expect("open");
        assert!(matches!(
            handle.next().await,
            Some(TransportEvent::Frame(RawFrame::Batch { .. }))
        ));
        match handle.next().await {
            Some(TransportEvent::Frame(RawFrame::Batch { events, .. })) => {
                assert_eq!(events.len(), 1)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn not_found_mid_stream_keeps_polling_at_same_cursor() {
        let (base, script) = serve(vec![
            Reply::Json(json!({"events": [{"kind": "agent_start"}]})),
            Reply::Status(StatusCode::NOT_FOUND),
            Reply::Json(json!({"events": [{"kind": "complete"}]})),
        ])
        .await;
        let mut handle = transport(&base, 20).open(&job(), 0).await.expect("open");

        assert!(matches!(
            handle.next().await,
            Some(TransportEvent::Frame(RawFrame::Batch { from: 0, .. }))
        ));
        assert_eq!(handle.next().await, Some(TransportEvent::NotYetAvailable));
        match handle.next().await {
            Some(TransportEvent::Frame(RawFrame::Batch { from, events })) => {
                assert_eq!(from, 1);
                assert_eq!(events, vec![json!({"kind": "complete"})]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(*script.seen_from.lock().expect("lock"), vec![0, 1, 1]);
    }

    #[tokio::test]
    async fn server_error_mid_stream_closes_with_error() {
        let (base, _) = serve(vec![
            Reply::Json(json!({"events": []})),
            Reply::Status(StatusCode::INTERNAL_SERVER_ERROR),
        ])
        .await;
        let mut handle = transport(&base, 20).open(&job(), 0).await.expect("open");
        let _first = handle.next().await;
        assert!(matches!(
            handle.next().await,
            Some(TransportEvent::Closed(CloseReason::Error(
                TransportError::Transient { .. }
            )))
        ));
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn request_outliving_interval_is_cancelled() {
        let (base, script) = serve(vec![
            Reply::Json(json!({"events": []})),
            Reply::Slow(Duration::from_millis(500)),
        ])
        .await;
        let mut handle = transport(&base, 40).open(&job(), 0).await.expect("open");
        let _first = handle.next().await;
        assert!(matches!(
            handle.next().await,
            Some(TransportEvent::Closed(CloseReason::Timeout(_)))
        ));
        // The slow request was the only one started after the first.
        assert_eq!(script.seen_from.lock().expect("lock").len(), 2);
    }
}
