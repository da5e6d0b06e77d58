//! The WebSocket conn: one packet per frame over a hyper-upgraded socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use async_tungstenite::tokio::TokioAdapter;
use async_tungstenite::tungstenite::protocol::Role;
use async_tungstenite::tungstenite::Message;
use async_tungstenite::WebSocketStream;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http::{HeaderMap, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Instant;

use trench_core::request::text_response;
use trench_core::{
    Conn, FrameKind, HttpRequest, Packet, PayloadError, TransportError, TransportKind,
};

use crate::handshake::{self, HandshakeError};

type WsStream = WebSocketStream<TokioAdapter<TokioIo<Upgraded>>>;

/// Deadline applied until the session installs a real one.
const IDLE_DEADLINE: Duration = Duration::from_secs(3600);

/// How long a close waits for the goodbye frame to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// The 101 response is out but the upgraded socket has not resolved.
    Connecting,
    /// Packet I/O is live.
    Ready,
    /// Torn down; every operation fails permanently.
    Closed,
}

struct Inner {
    uri: Uri,
    remote_addr: SocketAddr,
    remote_headers: HeaderMap,

    phase: watch::Sender<Phase>,
    reader: AsyncMutex<Option<SplitStream<WsStream>>>,
    writer: AsyncMutex<Option<SplitSink<WsStream, Message>>>,

    read_deadline: Mutex<Instant>,
    write_deadline: Mutex<Instant>,
}

/// One WebSocket connection, owned by a session.
#[derive(Clone)]
pub struct WebSocketConn {
    inner: Arc<Inner>,
}

impl fmt::Debug for WebSocketConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConn")
            .field("peer", &self.inner.remote_addr)
            .field("phase", &*self.inner.phase.borrow())
            .finish_non_exhaustive()
    }
}

impl WebSocketConn {
    /// Create a conn for the handshake request that opened it.
    #[must_use]
    pub fn new(uri: Uri, remote_addr: SocketAddr, remote_headers: HeaderMap) -> Self {
        let idle = Instant::now() + IDLE_DEADLINE;
        let (phase, _) = watch::channel(Phase::Connecting);
        Self {
            inner: Arc::new(Inner {
                uri,
                remote_addr,
                remote_headers,
                phase,
                reader: AsyncMutex::new(None),
                writer: AsyncMutex::new(None),
                read_deadline: Mutex::new(idle),
                write_deadline: Mutex::new(idle),
            }),
        }
    }

    /// Check that `req` is an acceptable opening handshake.
    ///
    /// # Errors
    ///
    /// The first [`HandshakeError`] the request violates.
    pub fn check(req: &HttpRequest) -> Result<(), HandshakeError> {
        handshake::check(req)
    }

    async fn wait_ready(&self) -> Result<(), TransportError> {
        let mut phase = self.inner.phase.subscribe();
        loop {
            match *phase.borrow_and_update() {
                Phase::Ready => return Ok(()),
                Phase::Closed => return Err(TransportError::Closed),
                Phase::Connecting => {}
            }
            if phase.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    async fn recv_frame(&self) -> Result<Packet, TransportError> {
        self.wait_ready().await?;
        let mut phase = self.inner.phase.subscribe();
        let mut guard = self.inner.reader.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::Closed)?;
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    None => return Err(TransportError::Closed),
                    Some(Err(err)) => return Err(TransportError::socket(err)),
                    Some(Ok(Message::Text(text))) => {
                        return Packet::decode_frame(FrameKind::Text, text.as_bytes())
                            .map_err(TransportError::from)
                    }
                    Some(Ok(Message::Binary(data))) => {
                        return Packet::decode_frame(FrameKind::Binary, &data)
                            .map_err(TransportError::from)
                    }
                    Some(Ok(Message::Close(_))) => return Err(TransportError::Closed),
                    // Protocol-level ping/pong; not packets.
                    Some(Ok(_)) => {}
                },
                changed = phase.changed() => {
                    if changed.is_err() || *phase.borrow() == Phase::Closed {
                        return Err(TransportError::Closed);
                    }
                }
            }
        }
    }

    async fn send_frame(&self, packet: Packet) -> Result<(), TransportError> {
        let (frame, bytes) = packet.encode_frame();
        let message = match frame {
            FrameKind::Text => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|_| TransportError::Payload(PayloadError::InvalidUtf8))?;
                Message::Text(text.into())
            }
            FrameKind::Binary => Message::Binary(bytes.to_vec().into()),
        };
        self.wait_ready().await?;
        let mut guard = self.inner.writer.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        sink.send(message).await.map_err(TransportError::socket)
    }
}

#[async_trait]
impl Conn for WebSocketConn {
    fn transport(&self) -> TransportKind {
        TransportKind::Websocket
    }

    async fn recv(&self) -> Result<Packet, TransportError> {
        let deadline = *self.inner.read_deadline.lock();
        match tokio::time::timeout_at(deadline, self.recv_frame()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        let deadline = *self.inner.write_deadline.lock();
        match tokio::time::timeout_at(deadline, self.send_frame(packet)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn set_read_deadline(&self, deadline: Instant) {
        *self.inner.read_deadline.lock() = deadline;
    }

    fn set_write_deadline(&self, deadline: Instant) {
        *self.inner.write_deadline.lock() = deadline;
    }

    fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    fn remote_headers(&self) -> &HeaderMap {
        &self.inner.remote_headers
    }

    /// Answer the opening handshake with `101 Switching Protocols` and
    /// resolve the upgraded socket in the background; packet I/O blocks
    /// until it is live.
    async fn serve(&self, mut req: HttpRequest) -> Response<Full<Bytes>> {
        let key = match handshake::validate(&req) {
            Ok(key) => key,
            Err(err) => return text_response(StatusCode::BAD_REQUEST, err.to_string()),
        };
        let Some(on_upgrade) = req.take_on_upgrade() else {
            return text_response(
                StatusCode::BAD_REQUEST,
                HandshakeError::UpgradeUnavailable.to_string(),
            );
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let io = TokioAdapter::new(TokioIo::new(upgraded));
                    let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                    let (sink, stream) = ws.split();
                    *inner.writer.lock().await = Some(sink);
                    *inner.reader.lock().await = Some(stream);
                    let went_live = inner.phase.send_if_modified(|phase| {
                        if *phase == Phase::Connecting {
                            *phase = Phase::Ready;
                            true
                        } else {
                            false
                        }
                    });
                    if went_live {
                        tracing::debug!(peer = %inner.remote_addr, "websocket established");
                    }
                }
                Err(err) => {
                    tracing::debug!(peer = %inner.remote_addr, %err, "websocket upgrade failed");
                    inner.phase.send_replace(Phase::Closed);
                }
            }
        });

        handshake::response(&key)
    }

    async fn close(&self) {
        let was_open = self.inner.phase.send_if_modified(|phase| {
            if *phase == Phase::Closed {
                false
            } else {
                *phase = Phase::Closed;
                true
            }
        });
        if !was_open {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let goodbye = async move {
            if let Some(mut sink) = inner.writer.lock().await.take() {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
        };
        let _ = tokio::time::timeout(CLOSE_GRACE, goodbye).await;
        tracing::debug!(peer = %self.inner.remote_addr, "websocket conn closed");
    }
}
