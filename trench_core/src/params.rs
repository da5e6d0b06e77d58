//! The connection parameters advertised in the `OPEN` packet.

use serde::{Deserialize, Serialize};

/// The JSON body of the `OPEN` packet.
///
/// The client drives its heartbeat from `ping_interval`/`ping_timeout`
/// and decides which transports to probe from `upgrades`. Field order is
/// wire-visible, so keep it stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnParameters {
    /// The minted session id.
    pub sid: String,
    /// Transports the session can upgrade to from its current one.
    pub upgrades: Vec<String>,
    /// How often the client should send `PING`, in milliseconds.
    pub ping_interval: u64,
    /// The server's per-heartbeat read/write deadline, in milliseconds.
    pub ping_timeout: u64,
    /// Largest accepted request body, in bytes. Advertised only when the
    /// server enforces one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

impl ConnParameters {
    /// Serialize to the compact JSON the `OPEN` packet carries.
    #[must_use]
    pub fn to_json(&self) -> Vec<u8> {
        // Serialization of a plain struct with string/number/array fields
        // cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse the `OPEN` body.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error on malformed input.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_body_matches_the_wire_format() {
        let params = ConnParameters {
            sid: "aBcDeFgHiJkLmNoPqRsT".to_owned(),
            upgrades: vec!["websocket".to_owned()],
            ping_interval: 25_000,
            ping_timeout: 60_000,
            max_payload: None,
        };
        let json = String::from_utf8(params.to_json()).unwrap();
        assert_eq!(
            json,
            "{\"sid\":\"aBcDeFgHiJkLmNoPqRsT\",\"upgrades\":[\"websocket\"],\
             \"pingInterval\":25000,\"pingTimeout\":60000}"
        );
        // The full OPEN packet body is 97 characters: the type digit plus
        // this JSON with a 20-character sid.
        assert_eq!(1 + json.len(), 97);
    }

    #[test]
    fn max_payload_is_advertised_only_when_set() {
        let mut params = ConnParameters {
            sid: "s".to_owned(),
            upgrades: vec![],
            ping_interval: 1,
            ping_timeout: 2,
            max_payload: Some(1024),
        };
        let json = String::from_utf8(params.to_json()).unwrap();
        assert!(json.contains("\"maxPayload\":1024"));

        params.max_payload = None;
        let json = String::from_utf8(params.to_json()).unwrap();
        assert!(!json.contains("maxPayload"));
    }

    #[test]
    fn json_round_trips() {
        let params = ConnParameters {
            sid: "0123456789abcdefghij".to_owned(),
            upgrades: vec![],
            ping_interval: 25_000,
            ping_timeout: 60_000,
            max_payload: Some(65_536),
        };
        let round = ConnParameters::from_json(&params.to_json()).unwrap();
        assert_eq!(round, params);
    }
}
