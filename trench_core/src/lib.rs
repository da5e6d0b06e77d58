//! # Trench core
//!
//! The shared substrate of the trench transport layer: the packet model,
//! the payload codec used by the long-polling transport, the connection
//! parameters advertised to clients, and the [`Conn`] contract every
//! transport implements.
//!
//! # Wire format
//!
//! A packet is a type digit followed by opaque data:
//!
//! | Type      | Digit | Purpose                                   |
//! |-----------|-------|-------------------------------------------|
//! | `OPEN`    | `0`   | Session parameters, sent once on creation |
//! | `CLOSE`   | `1`   | Orderly session teardown                  |
//! | `PING`    | `2`   | Client heartbeat                          |
//! | `PONG`    | `3`   | Server heartbeat reply                    |
//! | `MESSAGE` | `4`   | Application data                          |
//! | `UPGRADE` | `5`   | Commits a transport upgrade               |
//! | `NOOP`    | `6`   | Keeps a paused long-poll cycle alive      |
//!
//! Over WebSocket each frame carries exactly one packet. Over long-polling
//! many packets are batched into a single *payload* body; see [`payload`]
//! for the two framings.

pub mod conn;
pub mod error;
pub mod packet;
pub mod params;
pub mod payload;
pub mod request;

pub use conn::{Conn, Pausable, TransportKind};
pub use error::{PayloadError, RequestError, TransportError};
pub use packet::{FrameKind, Packet, PacketType};
pub use params::ConnParameters;
pub use request::HttpRequest;
