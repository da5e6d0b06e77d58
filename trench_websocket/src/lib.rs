//! # Trench WebSocket transport
//!
//! Wraps a full-duplex WebSocket connection as a [`Conn`](trench_core::Conn):
//! one frame carries exactly one packet, the frame opcode carries the
//! packet's text/binary kind, and read/write deadlines bound every
//! operation on the underlying socket.
//!
//! The conn is born from a plain HTTP request. Serving that request
//! returns the `101 Switching Protocols` response and resolves the
//! hyper upgrade in the background; packet I/O waits until the socket is
//! live. The transport has no pause capability, so sessions never upgrade
//! *away* from it.

mod conn;
mod handshake;

pub use conn::WebSocketConn;
pub use handshake::HandshakeError;
