//! The session manager: mints ids and maps them to live sessions.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::Mutex;

use crate::session::Session;

/// Bytes of entropy behind a session id; encodes to exactly 20 URL-safe
/// base64 characters.
const ID_BYTES: usize = 15;

/// Concurrent map of session id to session. Removal on close is the only
/// eviction.
#[derive(Debug, Clone, Default)]
pub(crate) struct Manager {
    sessions: Arc<Mutex<BTreeMap<String, Session>>>,
}

impl Manager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh 20-character URL-safe id, re-rolling on the
    /// (negligible) chance of a collision with a live session.
    pub(crate) async fn new_id(&self) -> String {
        let sessions = self.sessions.lock().await;
        loop {
            let mut bytes = [0u8; ID_BYTES];
            OsRng.fill_bytes(&mut bytes);
            let id = URL_SAFE_NO_PAD.encode(bytes);
            if !sessions.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) async fn insert(&self, session: Session) {
        self.sessions
            .lock()
            .await
            .insert(session.id().to_owned(), session);
    }

    pub(crate) async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub(crate) async fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.remove(id)
    }

    pub(crate) async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn minted_ids_are_twenty_url_safe_characters() {
        let manager = Manager::new();
        for _ in 0..64 {
            let id = manager.new_id().await;
            assert_eq!(id.len(), 20);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[tokio::test]
    async fn minted_ids_do_not_repeat() {
        let manager = Manager::new();
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..256 {
            assert!(seen.insert(manager.new_id().await));
        }
    }
}
