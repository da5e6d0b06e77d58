//! The server-side long-polling conn: queues, state machine, packet I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Response, Uri};
use http_body_util::Full;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use trench_core::{Conn, HttpRequest, Packet, Pausable, TransportError, TransportKind};

use crate::serve;

/// Deadline applied until the session installs a real one.
const IDLE_DEADLINE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Normal,
    Pausing,
    Paused,
    Closed,
}

#[derive(Debug)]
struct Inner {
    uri: Uri,
    remote_addr: SocketAddr,
    remote_headers: HeaderMap,

    state: Mutex<State>,

    inbound_tx: async_channel::Sender<Packet>,
    inbound_rx: async_channel::Receiver<Packet>,
    outbound_tx: async_channel::Sender<Packet>,
    outbound_rx: async_channel::Receiver<Packet>,

    /// Capacity-one wake-up for the long-poll GET; drop-on-full, so a
    /// pending token means "at least one flush is due".
    signal_tx: async_channel::Sender<()>,
    signal_rx: async_channel::Receiver<()>,

    /// Exclusive getter token; a second concurrent GET is refused.
    getting: AtomicBool,

    /// GET/POST handlers currently inside the conn; pausing waits for
    /// this to reach zero.
    in_flight: AtomicUsize,

    read_deadline: Mutex<Instant>,
    write_deadline: Mutex<Instant>,

    /// Bumped on every state, deadline, or queue transition so blocked
    /// operations re-evaluate.
    changed: watch::Sender<()>,
}

/// One long-polling connection, owned by a session and fed by the HTTP
/// front-end.
#[derive(Debug, Clone)]
pub struct PollingConn {
    inner: Arc<Inner>,
}

impl PollingConn {
    /// Create a conn for the request that opened it.
    #[must_use]
    pub fn new(uri: Uri, remote_addr: SocketAddr, remote_headers: HeaderMap) -> Self {
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (signal_tx, signal_rx) = async_channel::bounded(1);
        let idle = Instant::now() + IDLE_DEADLINE;
        let (changed, _) = watch::channel(());

        Self {
            inner: Arc::new(Inner {
                uri,
                remote_addr,
                remote_headers,
                state: Mutex::new(State::Normal),
                inbound_tx,
                inbound_rx,
                outbound_tx,
                outbound_rx,
                signal_tx,
                signal_rx,
                getting: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                read_deadline: Mutex::new(idle),
                write_deadline: Mutex::new(idle),
                changed,
            }),
        }
    }

    pub(crate) fn state(&self) -> State {
        *self.inner.state.lock()
    }

    fn bump(&self) {
        self.inner.changed.send_replace(());
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<()> {
        self.inner.changed.subscribe()
    }

    pub(crate) fn write_deadline(&self) -> Instant {
        *self.inner.write_deadline.lock()
    }

    /// Wait for the sender signal; returns on wake-up or channel close.
    pub(crate) async fn wait_signal(&self) {
        let _ = self.inner.signal_rx.recv().await;
    }

    /// Count an HTTP handler as in flight until the guard drops.
    pub(crate) fn track(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Claim the exclusive getter token, if free.
    pub(crate) fn try_poll_token(&self) -> Option<PollToken> {
        self.inner
            .getting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            .then(|| PollToken {
                inner: Arc::clone(&self.inner),
            })
    }

    /// Move every ready outbound packet out of the queue.
    pub(crate) fn drain_outbound(&self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(packet) = self.inner.outbound_rx.try_recv() {
            packets.push(packet);
        }
        if !packets.is_empty() {
            self.bump();
        }
        packets
    }

    /// Enqueue one decoded packet from a POST body.
    pub(crate) fn feed(&self, packet: Packet) -> Result<(), TransportError> {
        self.inner
            .inbound_tx
            .try_send(packet)
            .map_err(|_| TransportError::Closed)
    }

    /// Tear the conn down, failing every pending and subsequent
    /// operation. Idempotent.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == State::Closed {
                return;
            }
            *state = State::Closed;
        }
        self.inner.inbound_tx.close();
        self.inner.outbound_tx.close();
        self.inner.signal_tx.close();
        self.bump();
        tracing::debug!(peer = %self.inner.remote_addr, "polling conn closed");
    }

    async fn recv_packet(&self) -> Result<Packet, TransportError> {
        let mut changed = self.subscribe();
        loop {
            match self.state() {
                State::Closed => return Err(TransportError::Closed),
                // A pausing conn still hands out what it already queued;
                // only an empty queue reports the (temporary) refusal.
                State::Pausing | State::Paused => {
                    return match self.inner.inbound_rx.try_recv() {
                        Ok(packet) => {
                            self.bump();
                            Ok(packet)
                        }
                        Err(_) => Err(TransportError::Paused),
                    }
                }
                State::Normal => {}
            }
            let deadline = *self.inner.read_deadline.lock();
            tokio::select! {
                received = self.inner.inbound_rx.recv() => {
                    return match received {
                        Ok(packet) => {
                            self.bump();
                            Ok(packet)
                        }
                        Err(_) => Err(TransportError::Closed),
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(TransportError::Timeout)
                }
                _ = changed.changed() => {}
            }
        }
    }

    fn send_packet(&self, packet: Packet) -> Result<(), TransportError> {
        match self.state() {
            State::Closed => Err(TransportError::Closed),
            State::Pausing | State::Paused => Err(TransportError::Paused),
            State::Normal => {
                self.inner
                    .outbound_tx
                    .try_send(packet)
                    .map_err(|_| TransportError::Closed)?;
                let _ = self.inner.signal_tx.try_send(());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Conn for PollingConn {
    fn transport(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn recv(&self) -> Result<Packet, TransportError> {
        self.recv_packet().await
    }

    async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        self.send_packet(packet)
    }

    fn set_read_deadline(&self, deadline: Instant) {
        *self.inner.read_deadline.lock() = deadline;
        self.bump();
    }

    fn set_write_deadline(&self, deadline: Instant) {
        *self.inner.write_deadline.lock() = deadline;
        self.bump();
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

    async fn serve(&self, req: HttpRequest) -> Response<Full<Bytes>> {
        serve::handle(self, req).await
    }

    async fn close(&self) {
        self.shutdown();
    }

    fn as_pausable(&self) -> Option<&dyn Pausable> {
        Some(self)
    }
}

#[async_trait]
impl Pausable for PollingConn {
    async fn pause(&self) -> Result<(), TransportError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                State::Closed => return Err(TransportError::Closed),
                State::Normal => *state = State::Pausing,
                State::Pausing | State::Paused => {}
            }
        }
        self.bump();

        let mut changed = self.subscribe();
        loop {
            match self.state() {
                State::Closed => return Err(TransportError::Closed),
                State::Paused => return Ok(()),
                State::Pausing | State::Normal => {}
            }
            let drained = self.inner.in_flight.load(Ordering::SeqCst) == 0
                && self.inner.outbound_rx.is_empty()
                && self.inner.inbound_rx.is_empty();
            if drained {
                let mut state = self.inner.state.lock();
                if *state == State::Pausing {
                    *state = State::Paused;
                }
                drop(state);
                self.bump();
                continue;
            }
            let _ = changed.changed().await;
        }
    }

    async fn resume(&self) {
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, State::Pausing | State::Paused) {
                *state = State::Normal;
            }
        }
        self.bump();
    }
}

/// RAII guard counting an HTTP handler as in flight.
pub(crate) struct InFlightGuard {
    inner: Arc<Inner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.changed.send_replace(());
    }
}

/// RAII guard holding the exclusive getter token.
pub(crate) struct PollToken {
    inner: Arc<Inner>,
}

impl Drop for PollToken {
    fn drop(&mut self) {
        self.inner.getting.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use trench_core::PacketType;

    fn conn() -> PollingConn {
        PollingConn::new(
            "/engine.io/?transport=polling".parse().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
            HeaderMap::new(),
        )
    }

    fn message(data: &str) -> Packet {
        Packet::text(PacketType::Message, data.to_owned())
    }

    #[tokio::test]
    async fn send_then_recv_through_queues() {
        let conn = conn();
        conn.feed(message("in")).unwrap();
        let packet = conn.recv().await.unwrap();
        assert_eq!(packet, message("in"));
    }

    #[tokio::test]
    async fn recv_times_out_at_the_read_deadline() {
        let conn = conn();
        conn.set_read_deadline(Instant::now() + Duration::from_millis(30));
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert!(!err.is_temporary());
    }

    #[tokio::test]
    async fn recv_picks_up_a_shortened_deadline_while_blocked() {
        let conn = conn();
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.set_read_deadline(Instant::now() + Duration::from_millis(10));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn pause_refuses_new_work_but_drains_queued_inbound() {
        let conn = conn();
        conn.feed(message("early")).unwrap();

        let pause = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.pause().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Still pausing: the queued packet has not been consumed yet.
        assert!(!pause.is_finished());

        // Queued work is still handed out while pausing.
        assert_eq!(conn.recv().await.unwrap(), message("early"));
        // New work is refused with a temporary error.
        let err = conn.recv().await.unwrap_err();
        assert!(err.is_temporary());
        let err = conn.send(message("late")).await.unwrap_err();
        assert!(err.is_temporary());

        pause.await.unwrap().unwrap();

        conn.resume().await;
        conn.send(message("after")).await.unwrap();
        assert_eq!(conn.drain_outbound(), vec![message("after")]);
    }

    #[tokio::test]
    async fn close_unblocks_a_pending_recv() {
        let conn = conn();
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.close().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let conn = conn();
        conn.close().await;
        conn.close().await;
        assert!(matches!(
            conn.send(message("x")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn pause_fails_once_closed() {
        let conn = conn();
        conn.shutdown();
        assert!(matches!(conn.pause().await, Err(TransportError::Closed)));
    }
}
