//! Error types shared across the workspace.

use thiserror::Error;

use crate::packet::PacketType;

/// Errors produced by a transport connection.
///
/// Carries the temporary/permanent split the session relies on: a
/// *temporary* error means "retry shortly, the conn is mid-pause or
/// mid-contention"; everything else is fatal for the conn.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The conn is closed; no further operations will succeed.
    #[error("transport closed")]
    Closed,

    /// The conn is paused for an upgrade; the operation may be retried.
    #[error("transport paused")]
    Paused,

    /// A second poll request arrived while one was already in flight.
    #[error("another poll request is already in flight")]
    OverlapPoll,

    /// A read or write deadline elapsed mid-operation.
    #[error("deadline exceeded")]
    Timeout,

    /// The peer sent bytes that do not decode as a payload or packet.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// The underlying socket failed.
    #[error("socket error: {0}")]
    Socket(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Wrap an underlying socket failure.
    pub fn socket(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Socket(Box::new(err))
    }

    /// Whether the operation that produced this error may be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Paused | Self::OverlapPoll)
    }
}

/// Errors decoding a payload or packet off the wire. Always permanent.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The length field is missing, non-decimal, zero, or absurdly long.
    #[error("payload length field is missing or malformed")]
    InvalidLength,

    /// A binary-framed packet did not start with `0x00` or `0x01`.
    #[error("unrecognized framing marker {0:#04x}")]
    InvalidMarker(u8),

    /// The type digit is not one of `0`–`6`.
    #[error("unknown packet type digit {0:#04x}")]
    InvalidType(u8),

    /// The buffer ended mid-packet.
    #[error("payload ends mid-packet")]
    UnexpectedEof,

    /// A text-framed binary packet carried invalid base64.
    #[error("invalid base64 in text-framed binary packet: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A text packet that is not valid UTF-8 cannot travel on a text frame.
    #[error("text packet is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors normalizing an incoming HTTP request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Reading the request body failed.
    #[error("failed to read request body: {0}")]
    Body(String),

    /// The body exceeds the configured maximum payload size.
    #[error("request body exceeds the configured maximum")]
    TooLarge,
}

/// Errors surfaced by the session upgrade handshake. Internal to the
/// engine; a failed upgrade never reaches the application.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The fresh conn failed before the handshake completed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The peer sent the wrong packet type at a handshake step.
    #[error("expected {expected:?} during upgrade, got {got:?}")]
    UnexpectedPacket {
        /// The packet type the handshake step requires.
        expected: PacketType,
        /// The packet type actually received.
        got: PacketType,
    },

    /// The active transport cannot pause, so there is nothing to upgrade.
    #[error("active transport cannot pause")]
    NotPausable,

    /// The session closed while the handshake was in flight.
    #[error("session closed during upgrade")]
    SessionClosed,
}
