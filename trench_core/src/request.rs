//! A body-erased HTTP request.
//!
//! The front-end collects the body exactly once and hands transports this
//! flat view, so conn implementations never deal with streaming bodies
//! and the whole dispatch path can be exercised in tests with synthetic
//! requests.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{header, HeaderMap, Method, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::upgrade::OnUpgrade;

use crate::error::RequestError;

/// One normalized HTTP request: metadata, the collected body, and (when
/// the server connection allows it) the protocol-upgrade handle.
#[derive(Debug)]
pub struct HttpRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: SocketAddr,
    on_upgrade: Option<OnUpgrade>,
}

impl HttpRequest {
    /// Build a request from parts, e.g. in tests. No upgrade handle.
    #[must_use]
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: impl Into<Bytes>,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            body: body.into(),
            remote_addr,
            on_upgrade: None,
        }
    }

    /// Normalize an incoming `http` request, collecting its body.
    ///
    /// # Errors
    ///
    /// [`RequestError::Body`] if the body stream fails and
    /// [`RequestError::TooLarge`] if it exceeds `max_body`.
    pub async fn collect<B>(
        req: http::Request<B>,
        remote_addr: SocketAddr,
        max_body: Option<usize>,
    ) -> Result<Self, RequestError>
    where
        B: http_body::Body,
        B::Error: std::fmt::Display,
    {
        let (mut parts, body) = req.into_parts();
        let on_upgrade = parts.extensions.remove::<OnUpgrade>();
        let body = body
            .collect()
            .await
            .map_err(|e| RequestError::Body(e.to_string()))?
            .to_bytes();
        if let Some(max) = max_body {
            if body.len() > max {
                return Err(RequestError::TooLarge);
            }
        }
        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            remote_addr,
            on_upgrade,
        })
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URI.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The request headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The collected body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The peer's socket address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The first value of `name` in the query string.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.uri.query()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }

    /// Whether an upgrade handle is attached.
    #[must_use]
    pub fn can_upgrade(&self) -> bool {
        self.on_upgrade.is_some()
    }

    /// Take the protocol-upgrade handle, if the server connection
    /// provided one.
    pub fn take_on_upgrade(&mut self) -> Option<OnUpgrade> {
        self.on_upgrade.take()
    }
}

/// A plain-text HTTP response; the shape every error and every polling
/// body uses.
#[must_use]
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=UTF-8"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> HttpRequest {
        HttpRequest::new(
            Method::GET,
            uri.parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    #[test]
    fn query_params_are_found() {
        let req = request("/engine.io/?EIO=3&transport=polling&sid=abc");
        assert_eq!(req.query_param("transport"), Some("polling"));
        assert_eq!(req.query_param("sid"), Some("abc"));
        assert_eq!(req.query_param("EIO"), Some("3"));
        assert_eq!(req.query_param("b64"), None);
    }

    #[test]
    fn valueless_params_are_empty() {
        let req = request("/engine.io/?b64&transport=polling");
        assert_eq!(req.query_param("b64"), Some(""));
    }

    #[test]
    fn no_query_string() {
        assert_eq!(request("/engine.io/").query_param("sid"), None);
    }
}
