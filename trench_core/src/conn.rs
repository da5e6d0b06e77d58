//! The contract between a session and its underlying transport conns.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Response, Uri};
use http_body_util::Full;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::packet::Packet;
use crate::request::HttpRequest;

/// The wire mechanisms a session can run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// HTTP long-polling.
    Polling,
    /// Full-duplex WebSocket.
    Websocket,
}

impl TransportKind {
    /// The name used in the `transport` query parameter and in the
    /// advertised upgrade list.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Websocket => "websocket",
        }
    }

    /// Parse a `transport` query parameter value.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "polling" => Some(Self::Polling),
            "websocket" => Some(Self::Websocket),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One underlying connection of some transport, owned by exactly one
/// session.
///
/// `recv` and `send` move whole packets; deadlines bound how long either
/// may block. Both report [`TransportError::Paused`]-class errors as
/// *temporary* so the session's retry loop can ride out an upgrade.
#[async_trait]
pub trait Conn: fmt::Debug + Send + Sync + 'static {
    /// Which transport this conn belongs to.
    fn transport(&self) -> TransportKind;

    /// Receive the next packet from the peer.
    async fn recv(&self) -> Result<Packet, TransportError>;

    /// Deliver one packet to the peer.
    async fn send(&self, packet: Packet) -> Result<(), TransportError>;

    /// Bound subsequent receives.
    fn set_read_deadline(&self, deadline: Instant);

    /// Bound subsequent sends.
    fn set_write_deadline(&self, deadline: Instant);

    /// The URI of the request that created this conn.
    fn uri(&self) -> &Uri;

    /// The peer's socket address.
    fn remote_addr(&self) -> SocketAddr;

    /// The headers of the request that created this conn.
    fn remote_headers(&self) -> &HeaderMap;

    /// Handle one HTTP request addressed to this conn.
    async fn serve(&self, req: HttpRequest) -> Response<Full<Bytes>>;

    /// Tear the conn down, unblocking every pending operation. Idempotent.
    async fn close(&self);

    /// The pause capability, if this transport supports being upgraded
    /// away from.
    fn as_pausable(&self) -> Option<&dyn Pausable> {
        None
    }
}

/// The capability a transport needs before the session will upgrade away
/// from it.
#[async_trait]
pub trait Pausable: Send + Sync {
    /// Refuse new work with temporary errors, then wait until in-flight
    /// HTTP requests have drained and both packet queues are empty.
    ///
    /// Queued packets are flushed, never discarded.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] if the conn closes mid-pause.
    async fn pause(&self) -> Result<(), TransportError>;

    /// Accept work again after an aborted upgrade.
    async fn resume(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_names_round_trip() {
        for kind in [TransportKind::Polling, TransportKind::Websocket] {
            assert_eq!(TransportKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(TransportKind::from_name("carrier-pigeon"), None);
    }
}
