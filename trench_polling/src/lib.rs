//! # Trench long-polling transport
//!
//! Maps the bidirectional packet stream onto HTTP request-response pairs:
//!
//! ```text
//! send()        ──► outbound queue ──► GET  (drained into one payload)
//! POST body     ──► inbound queue  ──► recv()
//! ```
//!
//! A capacity-one "sender signal" wakes the long-poll GET the moment a
//! packet is queued; at most one GET may be in flight (a second gets 400).
//! The transport can [`pause`](trench_core::Pausable::pause) so a session
//! upgrade can swap it out without losing a packet: pausing waits for
//! in-flight requests to drain and both queues to empty, while new work is
//! refused with temporary errors the session retries.

mod conn;
mod serve;

pub use conn::PollingConn;
