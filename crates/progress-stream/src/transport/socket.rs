//! WebSocket transport: one full-duplex connection per open.
//!
//! Close code 1000 is the server's signal that it has nothing more to send;
//! any other close (or none at all) is abnormal and triggers a reconnect.

use futures::StreamExt as _;
use futures::stream;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::errors::{StreamError, TransportError};
use crate::model::{JobId, TransportKind};

use super::{CloseReason, RawFrame, TransportAdapter, TransportEvent, TransportHandle};

const KIND: TransportKind = TransportKind::Socket;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct SocketTransport {
    config: StreamConfig,
}

impl SocketTransport {
    pub fn new(config: StreamConfig) -> Result<Self, StreamError> {
        config.socket_base()?;
        Ok(Self { config })
    }
}

#[async_trait::async_trait]
impl TransportAdapter for SocketTransport {
    fn kind(&self) -> TransportKind {
        KIND
    }

    async fn open(&self, job_id: &JobId, _cursor: u64) -> Result<TransportHandle, TransportError> {
        let url = self
            .config
            .socket_url_for(job_id)
            .map_err(|e| TransportError::protocol(KIND, e.to_string()))?;
        debug!(job_id = %job_id, url = %url, "opening progress socket");

        let connect = tokio_tungstenite::connect_async(url.as_str());
        let socket = match tokio::time::timeout(self.config.request_timeout, connect).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status().as_u16();
                if status == 404 {
                    return Err(TransportError::not_yet_available(job_id));
                }
                return Err(TransportError::transient(
                    KIND,
                    format!("socket handshake rejected with status {status}"),
                    Some(status),
                ));
            }
            Ok(Err(e)) => {
                return Err(TransportError::transient(
                    KIND,
                    format!("socket connect failed: {e}"),
                    None,
                ));
            }
            Err(_) => {
                return Err(TransportError::transient(
                    KIND,
                    format!(
                        "socket connect timed out after {}ms",
                        self.config.request_timeout.as_millis()
                    ),
                    None,
                ));
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let events = socket_event_stream(socket, shutdown_rx);
        Ok(TransportHandle::new(Box::pin(events)).with_shutdown(shutdown_tx))
    }
}

struct SocketState {
    socket: Socket,
    shutdown: Option<oneshot::Receiver<()>>,
    closing: bool,
    done: bool,
}

enum Step {
    Shutdown,
    Message(Option<Result<Message, tungstenite::Error>>),
}

fn socket_event_stream(
    socket: Socket,
    shutdown: oneshot::Receiver<()>,
) -> impl futures::Stream<Item = TransportEvent> + Send {
    let state = SocketState {
        socket,
        shutdown: Some(shutdown),
        closing: false,
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }

            let step = match state.shutdown.as_mut() {
                Some(shutdown) => tokio::select! {
                    _ = shutdown => Step::Shutdown,
                    msg = state.socket.next() => Step::Message(msg),
                },
                None => Step::Message(state.socket.next().await),
            };

            let msg = match step {
                Step::Shutdown => {
                    state.shutdown = None;
                    state.closing = true;
                    debug!("closing progress socket");
                    if state.socket.close(None).await.is_err() {
                        state.done = true;
                        return Some((TransportEvent::Closed(CloseReason::Normal), state));
                    }
                    continue;
                }
                Step::Message(msg) => msg,
            };

            if state.closing {
                // Draining until the server acknowledges our close frame.
                if matches!(msg, None | Some(Err(_)) | Some(Ok(Message::Close(_)))) {
                    state.done = true;
                    return Some((TransportEvent::Closed(CloseReason::Normal), state));
                }
                continue;
            }

            let event = match msg {
                Some(Ok(Message::Text(text))) => TransportEvent::Frame(RawFrame::Text(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => TransportEvent::Frame(RawFrame::Text(text)),
                    Err(err) => {
                        warn!(
                            len = err.as_bytes().len(),
                            "skipping non-UTF-8 binary socket message"
                        );
                        continue;
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => TransportEvent::Heartbeat,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    state.done = true;
                    // Flushes the close reply tungstenite queued for the peer.
                    let _ = state.socket.close(None).await;
                    TransportEvent::Closed(close_reason(frame.map(|f| (f.code, f.reason.to_string()))))
                }
                Some(Err(e)) => {
                    state.done = true;
                    let err = TransportError::transient(KIND, format!("socket read failed: {e}"), None);
                    TransportEvent::Closed(CloseReason::Error(err))
                }
                None => {
                    state.done = true;
                    let err = TransportError::abnormal_close(
                        KIND,
                        "socket ended without a close frame",
                        None,
                    );
                    TransportEvent::Closed(CloseReason::Error(err))
                }
            };
            return Some((event, state));
        }
    })
}

fn close_reason(frame: Option<(CloseCode, String)>) -> CloseReason {
    match frame {
        Some((CloseCode::Normal, _)) => CloseReason::Normal,
        Some((code, reason)) => {
            let code = u16::from(code);
            CloseReason::Error(TransportError::abnormal_close(
                KIND,
                format!("socket closed with code {code}: {reason}"),
                Some(code),
            ))
        }
        None => CloseReason::Error(TransportError::abnormal_close(
            KIND,
            "socket closed without a status code",
            None,
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt as _, StreamExt as _};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    use super::*;

    async fn serve_socket<F, Fut>(script: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
            script(ws).await;
        });
        format!("ws://{addr}")
    }

    fn transport(socket_base: String) -> SocketTransport {
        let config = StreamConfig::new("http://127.0.0.1:1").socket_url(socket_base);
        SocketTransport::new(config).expect("transport")
    }

    fn job() -> JobId {
        JobId::new("abc").expect("job")
    }

    fn close_frame(code: CloseCode) -> Message {
        Message::Close(Some(CloseFrame {
            code,
            reason: "bye".into(),
        }))
    }

    #[tokio::test]
    async fn text_frames_then_normal_close() {
        let base = serve_socket(|mut ws| async move {
            let _ = ws.send(Message::Text(r#"{"type":"heartbeat"}"#.into())).await;
            let _ = ws.send(Message::Text(r#"{"type":"complete"}"#.into())).await;
            let _ = ws.send(close_frame(CloseCode::Normal)).await;
            while ws.next().await.is_some() {}
        })
        .await;
        let mut handle = transport(base).open(&job(), 0).await.expect("open");

        let mut events = Vec::new();
        while let Some(event) = handle.next().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                TransportEvent::Frame(RawFrame::Text(r#"{"type":"heartbeat"}"#.into())),
                TransportEvent::Frame(RawFrame::Text(r#"{"type":"complete"}"#.into())),
                TransportEvent::Closed(CloseReason::Normal),
            ]
        );
    }

    #[tokio::test]
    async fn non_normal_close_code_is_abnormal() {
        let base = serve_socket(|mut ws| async move {
            let _ = ws.send(close_frame(CloseCode::Error)).await;
            while ws.next().await.is_some() {}
        })
        .await;
        let mut handle = transport(base).open(&job(), 0).await.expect("open");
        match handle.next().await {
            Some(TransportEvent::Closed(CloseReason::Error(TransportError::AbnormalClose {
                code, ..
            }))) => assert_eq!(code, Some(1011)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_connection_is_abnormal() {
        let base = serve_socket(|ws| async move {
            drop(ws);
        })
        .await;
        let mut handle = transport(base).open(&job(), 0).await.expect("open");
        assert!(matches!(
            handle.next().await,
            Some(TransportEvent::Closed(CloseReason::Error(_)))
        ));
    }

    #[tokio::test]
    async fn session_close_sends_close_frame() {
        let (seen_tx, seen_rx) = oneshot::channel();
        let base = serve_socket(|mut ws| async move {
            let mut saw_close = false;
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    saw_close = true;
                    break;
                }
            }
            let _ = seen_tx.send(saw_close);
        })
        .await;
        let handle = transport(base).open(&job(), 0).await.expect("open");
        handle.close().await;
        let saw_close = tokio::time::timeout(Duration::from_secs(2), seen_rx)
            .await
            .expect("server finished")
            .expect("report");
        assert!(saw_close);
    }

    #[tokio::test]
    async fn missing_job_is_not_yet_available() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, axum::Router::new()).await;
        });
        let err = transport(format!("ws://{addr}"))
            .open(&job(), 0)
            .await
            .expect_err("404");
        assert!(err.is_not_yet_available());
    }

    #[test]
    fn new_rejects_unparsable_socket_url() {
        let config = StreamConfig::new("http://localhost:8000").socket_url("::not a url::");
        assert!(matches!(
            SocketTransport::new(config),
            Err(StreamError::Config(_))
        ));
        let derived = SocketTransport::new(StreamConfig::new("https://api.example.com"));
        assert!(derived.is_ok());
    }

    #[test]
    fn close_reason_maps_codes() {
        assert_eq!(close_reason(Some((CloseCode::Normal, String::new()))), CloseReason::Normal);
        assert!(matches!(
            close_reason(None),
            CloseReason::Error(TransportError::AbnormalClose { code: None, .. })
        ));
        assert!(matches!(
            close_reason(Some((CloseCode::Away, "restart".into()))),
            CloseReason::Error(TransportError::AbnormalClose { code: Some(1001), .. })
        ));
    }
}
