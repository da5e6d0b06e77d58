//! The packet: one typed unit of transmission.

use bytes::Bytes;

use crate::error::PayloadError;

/// The seven packet types, identified on the wire by one ASCII digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Session parameters, sent once when the session is created.
    Open,
    /// Orderly teardown, from either side.
    Close,
    /// Client heartbeat probe.
    Ping,
    /// Server heartbeat reply, echoing the probe body.
    Pong,
    /// Application data.
    Message,
    /// Commits an in-progress transport upgrade.
    Upgrade,
    /// No-op; keeps a paused long-poll cycle alive.
    Noop,
}

impl PacketType {
    /// The ASCII digit identifying this type on the wire.
    #[must_use]
    pub const fn digit(self) -> u8 {
        match self {
            Self::Open => b'0',
            Self::Close => b'1',
            Self::Ping => b'2',
            Self::Pong => b'3',
            Self::Message => b'4',
            Self::Upgrade => b'5',
            Self::Noop => b'6',
        }
    }

    /// Parse a wire digit back into a packet type.
    #[must_use]
    pub const fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            b'0' => Some(Self::Open),
            b'1' => Some(Self::Close),
            b'2' => Some(Self::Ping),
            b'3' => Some(Self::Pong),
            b'4' => Some(Self::Message),
            b'5' => Some(Self::Upgrade),
            b'6' => Some(Self::Noop),
            _ => None,
        }
    }
}

/// Whether a packet travels as text or binary.
///
/// Maps to the WebSocket opcode, and decides how the packet is framed
/// inside a long-polling payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Binary,
}

/// One unit of transmission: a frame kind, a type, and opaque data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Text or binary framing.
    pub frame: FrameKind,
    /// The packet type.
    pub ptype: PacketType,
    /// The body; empty for control packets without a payload.
    pub data: Bytes,
}

impl Packet {
    /// Create a packet.
    #[must_use]
    pub fn new(frame: FrameKind, ptype: PacketType, data: impl Into<Bytes>) -> Self {
        Self {
            frame,
            ptype,
            data: data.into(),
        }
    }

    /// A text packet.
    #[must_use]
    pub fn text(ptype: PacketType, data: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Text, ptype, data)
    }

    /// A binary packet.
    #[must_use]
    pub fn binary(ptype: PacketType, data: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Binary, ptype, data)
    }

    /// The empty `NOOP` packet.
    #[must_use]
    pub fn noop() -> Self {
        Self::text(PacketType::Noop, Bytes::new())
    }

    /// Whether this packet travels on a binary frame.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self.frame, FrameKind::Binary)
    }

    /// Serialize for a stream transport: the type digit followed by the
    /// body, one packet per frame, no length prefix.
    #[must_use]
    pub fn encode_frame(&self) -> (FrameKind, Bytes) {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.ptype.digit());
        out.extend_from_slice(&self.data);
        (self.frame, Bytes::from(out))
    }

    /// Parse one stream frame back into a packet.
    ///
    /// # Errors
    ///
    /// [`PayloadError::UnexpectedEof`] on an empty frame and
    /// [`PayloadError::InvalidType`] on an unknown type digit.
    pub fn decode_frame(frame: FrameKind, bytes: &[u8]) -> Result<Self, PayloadError> {
        let (&digit, data) = bytes.split_first().ok_or(PayloadError::UnexpectedEof)?;
        let ptype = PacketType::from_digit(digit).ok_or(PayloadError::InvalidType(digit))?;
        Ok(Self::new(frame, ptype, Bytes::copy_from_slice(data)))
    }
}
