//! RFC 6455 server-side opening handshake over `hyper::upgrade`.

use async_tungstenite::tungstenite::handshake::derive_accept_key;
use bytes::Bytes;
use http::{header, HeaderValue, Method, Response, StatusCode};
use http_body_util::Full;
use thiserror::Error;

use trench_core::HttpRequest;

/// Why a request cannot be accepted as a WebSocket opening handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The handshake must be a GET.
    #[error("websocket handshake requires GET")]
    MethodNotAllowed,

    /// The `Connection` header is missing or lacks the `upgrade` token.
    #[error("missing or invalid Connection header")]
    BadConnectionHeader,

    /// The `Upgrade` header is missing or not `websocket`.
    #[error("missing or invalid Upgrade header")]
    BadUpgradeHeader,

    /// Only `Sec-WebSocket-Version: 13` is accepted.
    #[error("unsupported Sec-WebSocket-Version")]
    UnsupportedVersion,

    /// The `Sec-WebSocket-Key` header is missing.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    /// The server connection cannot switch protocols (no upgrade handle).
    #[error("connection does not support protocol upgrades")]
    UpgradeUnavailable,
}

/// Validate the opening handshake and return the client's nonce key.
pub(crate) fn validate(req: &HttpRequest) -> Result<HeaderValue, HandshakeError> {
    if *req.method() != Method::GET {
        return Err(HandshakeError::MethodNotAllowed);
    }
    let headers = req.headers();

    let connection = headers
        .get(header::CONNECTION)
        .ok_or(HandshakeError::BadConnectionHeader)?;
    if !header_has_token(connection, "upgrade") {
        return Err(HandshakeError::BadConnectionHeader);
    }

    let upgrade = headers
        .get(header::UPGRADE)
        .ok_or(HandshakeError::BadUpgradeHeader)?;
    if !upgrade
        .to_str()
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(HandshakeError::BadUpgradeHeader);
    }

    match headers.get(header::SEC_WEBSOCKET_VERSION) {
        Some(version) if version == "13" => {}
        _ => return Err(HandshakeError::UnsupportedVersion),
    }

    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .cloned()
        .ok_or(HandshakeError::MissingKey)
}

/// Validate a handshake without consuming anything, including that the
/// server connection can actually switch protocols.
///
/// # Errors
///
/// The first [`HandshakeError`] the request violates.
pub fn check(req: &HttpRequest) -> Result<(), HandshakeError> {
    validate(req)?;
    if !req.can_upgrade() {
        return Err(HandshakeError::UpgradeUnavailable);
    }
    Ok(())
}

/// Build the `101 Switching Protocols` response for a validated key.
pub(crate) fn response(key: &HeaderValue) -> Response<Full<Bytes>> {
    let accept = derive_accept_key(key.as_bytes());
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = resp.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(&accept) {
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, value);
    }
    resp
}

fn header_has_token(value: &HeaderValue, token: &str) -> bool {
    value
        .to_str()
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}
