//! # Trench session engine
//!
//! A bidirectional, message-oriented transport server. A client opens a
//! session over HTTP long-polling, then may upgrade it in place to a
//! WebSocket without changing its identity or losing a packet. The server
//! multiplexes many sessions, enforces liveness with a heartbeat, and
//! exposes a small surface to the embedding application:
//!
//! ```text
//! let server = Server::new(ServerConfig::default());
//! loop {
//!     let session = server.accept().await?;
//!     tokio::spawn(async move {
//!         while let Ok((_kind, data)) = session.recv().await {
//!             session.send(FrameKind::Text, data).await?;
//!         }
//!     });
//! }
//! ```
//!
//! Route every request under the engine's path to [`Server::handle`]
//! (or hand a listener to [`Server::serve`]); the dispatcher sorts out
//! session creation, long-poll traffic, and WebSocket upgrades from the
//! `sid`/`transport` query parameters.

pub mod config;
pub mod error;
mod manager;
mod server;
mod session;

pub use config::{AccessControl, ServerConfig};
pub use error::{AcceptError, SessionError};
pub use server::Server;
pub use session::Session;
pub use trench_core::{FrameKind, TransportKind};
