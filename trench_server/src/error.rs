//! Error types surfaced to the embedding application.

use thiserror::Error;
use trench_core::TransportError;

/// Why a session read or write failed.
///
/// Only the session's top-level `recv`/`send` surface errors; heartbeat
/// and upgrade failures are handled internally and show up here, at most,
/// as [`SessionError::Closed`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is closed. For `recv` this is the end of the stream.
    #[error("session closed")]
    Closed,

    /// The active conn failed permanently, or temporary errors outlasted
    /// the retry budget. The session is closed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The server's accept channel shut down.
#[derive(Debug, Clone, Copy, Error)]
#[error("server closed")]
pub struct AcceptError;
