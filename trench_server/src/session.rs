//! The session: one logical connection spanning one or more conns.
//!
//! A session owns exactly one active conn at a time. Reads and writes go
//! through the active conn under the read side of an upgrade lock; a
//! transport upgrade takes the write side only for the atomic swap of the
//! `{conn, transport}` pair, so observers see the old pair or the new one,
//! never a torn mix. Temporary transport errors (a conn pausing for an
//! upgrade) are retried on a short back-off until the swap lands.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Response, Uri};
use http_body_util::Full;
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio::time::Instant;

use trench_core::error::UpgradeError;
use trench_core::{
    Conn, FrameKind, HttpRequest, Packet, PacketType, TransportError, TransportKind,
};

use crate::error::SessionError;
use crate::manager::Manager;

/// How many times a read or write retries a temporary transport error.
/// Long enough to ride out an in-progress upgrade.
const RETRY_ATTEMPTS: usize = 30;

/// Pause between retries.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// The conn currently carrying the session, with its transport name.
/// Swapped as one unit.
#[derive(Debug)]
struct Active {
    conn: Arc<dyn Conn>,
    transport: TransportKind,
}

struct SessionInner {
    id: String,
    manager: Manager,
    ping_timeout: Duration,

    active: RwLock<Active>,
    /// Serializes writers: application sends and heartbeat replies.
    write_lock: AsyncMutex<()>,

    closed: AtomicBool,
    /// Latched once the `OPEN` packet is on the wire; application sends
    /// wait for it so `OPEN` is always first.
    opened: watch::Sender<bool>,

    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// One logical connection, handed to the application by
/// [`Server::accept`](crate::Server::accept). Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        manager: Manager,
        transport: TransportKind,
        conn: Arc<dyn Conn>,
        id: String,
        ping_timeout: Duration,
    ) -> Self {
        let deadline = Instant::now() + ping_timeout;
        conn.set_read_deadline(deadline);
        conn.set_write_deadline(deadline);
        let (opened, _) = watch::channel(false);

        Self {
            inner: Arc::new(SessionInner {
                id,
                manager,
                ping_timeout,
                active: RwLock::new(Active { conn, transport }),
                write_lock: AsyncMutex::new(()),
                closed: AtomicBool::new(false),
                opened,
                context: Mutex::new(None),
            }),
        }
    }

    /// The session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The transport currently carrying the session.
    pub async fn transport(&self) -> TransportKind {
        self.inner.active.read().await.transport
    }

    /// The URI of the request that created the active conn.
    pub async fn uri(&self) -> Uri {
        self.inner.active.read().await.conn.uri().clone()
    }

    /// The peer address of the active conn.
    pub async fn remote_addr(&self) -> SocketAddr {
        self.inner.active.read().await.conn.remote_addr()
    }

    /// The headers of the request that created the active conn.
    pub async fn remote_headers(&self) -> HeaderMap {
        self.inner.active.read().await.conn.remote_headers().clone()
    }

    /// Attach an opaque application value to the session.
    pub fn set_context(&self, value: Arc<dyn Any + Send + Sync>) {
        *self.inner.context.lock() = Some(value);
    }

    /// The value attached with [`set_context`](Self::set_context).
    #[must_use]
    pub fn context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.context.lock().clone()
    }

    /// Receive the next application message.
    ///
    /// Heartbeats are answered, deadline extensions applied, and control
    /// packets swallowed along the way; only `MESSAGE` data reaches the
    /// caller.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`] at end of stream (the peer sent `CLOSE`
    /// or the session closed), [`SessionError::Transport`] on a fatal
    /// transport error. Either way the session is closed.
    pub async fn recv(&self) -> Result<(FrameKind, Bytes), SessionError> {
        loop {
            let packet = self.next_packet().await?;
            match packet.ptype {
                PacketType::Ping => {
                    let reply = Packet::new(packet.frame, PacketType::Pong, packet.data);
                    if self.send_packet(reply).await.is_err() {
                        self.close().await;
                        return Err(SessionError::Closed);
                    }
                    self.extend_deadlines().await;
                }
                PacketType::Close => {
                    self.close().await;
                    return Err(SessionError::Closed);
                }
                PacketType::Message => return Ok((packet.frame, packet.data)),
                // OPEN, PONG, UPGRADE and NOOP carry nothing for the
                // application.
                _ => {}
            }
        }
    }

    /// Send one application message.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`] once the session is closed,
    /// [`SessionError::Transport`] on a fatal transport error.
    pub async fn send(
        &self,
        frame: FrameKind,
        data: impl Into<Bytes>,
    ) -> Result<(), SessionError> {
        self.wait_opened().await?;
        self.send_packet(Packet::new(frame, PacketType::Message, data.into()))
            .await
    }

    /// Close the session: remove it from the manager and tear down the
    /// active conn. Idempotent; every concurrent caller observes success.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.manager.remove(&self.inner.id).await;
        let conn = { self.inner.active.read().await.conn.clone() };
        conn.close().await;
        tracing::debug!(sid = %self.inner.id, "session closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Forward an HTTP request to the active conn's handler.
    pub(crate) async fn serve(&self, req: HttpRequest) -> Response<Full<Bytes>> {
        let conn = { self.inner.active.read().await.conn.clone() };
        conn.serve(req).await
    }

    /// Put the `OPEN` packet on the wire and release application sends.
    pub(crate) async fn flush_open(&self, body: Bytes) {
        let packet = Packet::text(PacketType::Open, body);
        if let Err(err) = self.send_packet(packet).await {
            tracing::debug!(sid = %self.id(), %err, "failed to flush open packet");
            self.close().await;
        }
        self.inner.opened.send_replace(true);
    }

    async fn wait_opened(&self) -> Result<(), SessionError> {
        let mut opened = self.inner.opened.subscribe();
        loop {
            if *opened.borrow_and_update() {
                return Ok(());
            }
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            if opened.changed().await.is_err() {
                return Err(SessionError::Closed);
            }
        }
    }

    /// Read one packet off the active conn, retrying temporary errors on
    /// a short back-off. A fatal error closes the session.
    async fn next_packet(&self) -> Result<Packet, SessionError> {
        let mut last = TransportError::Closed;
        for _ in 0..RETRY_ATTEMPTS {
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            let result = {
                let active = self.inner.active.read().await;
                active.conn.recv().await
            };
            match result {
                Ok(packet) => return Ok(packet),
                Err(err) if err.is_temporary() => {
                    last = err;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => {
                    self.close().await;
                    return Err(SessionError::Transport(err));
                }
            }
        }
        self.close().await;
        Err(SessionError::Transport(last))
    }

    /// Write one packet through the active conn, with the same retry
    /// discipline as [`next_packet`](Self::next_packet).
    async fn send_packet(&self, packet: Packet) -> Result<(), SessionError> {
        let _write = self.inner.write_lock.lock().await;
        let mut last = TransportError::Closed;
        for _ in 0..RETRY_ATTEMPTS {
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            let result = {
                let active = self.inner.active.read().await;
                active.conn.send(packet.clone()).await
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_temporary() => {
                    last = err;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => {
                    self.close().await;
                    return Err(SessionError::Transport(err));
                }
            }
        }
        self.close().await;
        Err(SessionError::Transport(last))
    }

    /// Push both deadlines of the active conn out by one heartbeat cycle.
    async fn extend_deadlines(&self) {
        let deadline = Instant::now() + self.inner.ping_timeout;
        let active = self.inner.active.read().await;
        active.conn.set_read_deadline(deadline);
        active.conn.set_write_deadline(deadline);
    }

    /// Run the upgrade handshake on a fresh conn and, if it completes,
    /// swap the conn in. Any deviation closes the fresh conn and leaves
    /// the session on its current transport.
    pub(crate) async fn upgrade(&self, transport: TransportKind, conn: Arc<dyn Conn>) {
        if let Err(err) = self.try_upgrade(transport, Arc::clone(&conn)).await {
            tracing::debug!(sid = %self.id(), %err, "transport upgrade aborted");
            conn.close().await;
        }
    }

    async fn try_upgrade(
        &self,
        transport: TransportKind,
        new_conn: Arc<dyn Conn>,
    ) -> Result<(), UpgradeError> {
        let deadline = Instant::now() + self.inner.ping_timeout;
        new_conn.set_read_deadline(deadline);
        new_conn.set_write_deadline(deadline);

        // Probe: exactly one PING, answered with a PONG carrying the
        // same body.
        let probe = new_conn.recv().await?;
        if probe.ptype != PacketType::Ping {
            return Err(UpgradeError::UnexpectedPacket {
                expected: PacketType::Ping,
                got: probe.ptype,
            });
        }
        new_conn
            .send(Packet::new(probe.frame, PacketType::Pong, probe.data))
            .await?;

        let old = { self.inner.active.read().await.conn.clone() };
        let Some(pausable) = old.as_pausable() else {
            return Err(UpgradeError::NotPausable);
        };
        // From here until the swap (or abort) the old conn refuses new
        // work with temporary errors; the read/write loops spin on
        // back-off while its queues drain.
        pausable.pause().await?;

        let commit: Result<(), UpgradeError> = async {
            let commit = new_conn.recv().await?;
            if commit.ptype != PacketType::Upgrade {
                return Err(UpgradeError::UnexpectedPacket {
                    expected: PacketType::Upgrade,
                    got: commit.ptype,
                });
            }
            Ok(())
        }
        .await;
        if let Err(err) = commit {
            pausable.resume().await;
            return Err(err);
        }

        {
            let mut active = self.inner.active.write().await;
            if self.is_closed() {
                return Err(UpgradeError::SessionClosed);
            }
            active.conn = Arc::clone(&new_conn);
            active.transport = transport;
        }
        tracing::info!(sid = %self.id(), %transport, "transport upgraded");

        // Ownership transferred: the paused conn is retired, not resumed.
        old.close().await;
        Ok(())
    }
}
