//! The HTTP front-end: session creation, dispatch, and upgrade launch.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;

use trench_core::request::text_response;
use trench_core::{Conn, ConnParameters, HttpRequest, TransportKind};
use trench_polling::PollingConn;
use trench_websocket::WebSocketConn;

use crate::config::{AccessControl, ServerConfig};
use crate::error::AcceptError;
use crate::manager::Manager;
use crate::session::Session;

struct ServerInner {
    config: ServerConfig,
    manager: Manager,
    accept_tx: async_channel::Sender<Session>,
    accept_rx: async_channel::Receiver<Session>,
}

/// The transport server. Cheap to clone; all clones share one session
/// space.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server with the given configuration.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let (accept_tx, accept_rx) = async_channel::unbounded();
        Self {
            inner: Arc::new(ServerInner {
                config,
                manager: Manager::new(),
                accept_tx,
                accept_rx,
            }),
        }
    }

    /// Wait for the next freshly created session, in creation order.
    ///
    /// # Errors
    ///
    /// [`AcceptError`] if the server shut down.
    pub async fn accept(&self) -> Result<Session, AcceptError> {
        self.inner.accept_rx.recv().await.map_err(|_| AcceptError)
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.manager.len().await
    }

    /// Handle one HTTP request addressed to the engine.
    ///
    /// Collects the body, then dispatches on the `sid` and `transport`
    /// query parameters: no `sid` creates a session, a known `sid` on the
    /// session's transport forwards to its conn, and a known `sid` on a
    /// different transport launches an upgrade.
    pub async fn handle<B>(
        &self,
        req: http::Request<B>,
        remote_addr: SocketAddr,
    ) -> Response<Full<Bytes>>
    where
        B: http_body::Body,
        B::Error: std::fmt::Display,
    {
        let req =
            match HttpRequest::collect(req, remote_addr, self.inner.config.max_payload).await {
                Ok(req) => req,
                Err(err) => return text_response(StatusCode::BAD_REQUEST, err.to_string()),
            };
        self.dispatch(req).await
    }

    /// Accept-loop convenience: serve every connection of `listener`
    /// through [`handle`](Self::handle), with protocol upgrades enabled.
    ///
    /// # Errors
    ///
    /// Returns the first listener accept error.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(server.handle(req, peer).await)
                    }
                });
                let builder = auto::Builder::new(TokioExecutor::new());
                if let Err(err) = builder.serve_connection_with_upgrades(io, service).await {
                    tracing::debug!(%peer, "http connection ended: {err}");
                }
            });
        }
    }

    async fn dispatch(&self, req: HttpRequest) -> Response<Full<Bytes>> {
        let cors = self
            .inner
            .config
            .access_control
            .as_ref()
            .map(|hook| hook(&req));
        let mut resp = self.route(req).await;
        if let Some(cors) = cors {
            apply_access_control(&mut resp, &cors);
        }
        resp
    }

    async fn route(&self, req: HttpRequest) -> Response<Full<Bytes>> {
        let requested = req.query_param("transport").unwrap_or("polling");
        let transport = match TransportKind::from_name(requested) {
            Some(t) if self.inner.config.transports.contains(&t) => t,
            _ => return text_response(StatusCode::BAD_REQUEST, "invalid transport"),
        };

        let Some(sid) = req.query_param("sid").map(str::to_owned) else {
            return self.open_session(transport, req).await;
        };

        let Some(session) = self.inner.manager.get(&sid).await else {
            return text_response(StatusCode::BAD_REQUEST, "invalid sid");
        };

        if transport == session.transport().await {
            session.serve(req).await
        } else if transport == TransportKind::Websocket && self.inner.config.allow_upgrades {
            self.launch_upgrade(session, req).await
        } else {
            text_response(StatusCode::BAD_REQUEST, "invalid transport")
        }
    }

    async fn open_session(
        &self,
        transport: TransportKind,
        req: HttpRequest,
    ) -> Response<Full<Bytes>> {
        if let Some(allow) = &self.inner.config.allow_request {
            if let Err(reason) = allow(&req) {
                return text_response(StatusCode::BAD_REQUEST, reason);
            }
        }
        if transport == TransportKind::Websocket {
            if let Err(err) = WebSocketConn::check(&req) {
                return text_response(StatusCode::BAD_REQUEST, err.to_string());
            }
        }

        let sid = self.inner.manager.new_id().await;
        let params = ConnParameters {
            sid: sid.clone(),
            upgrades: self.advertised_upgrades(transport),
            ping_interval: self.inner.config.ping_interval.as_millis() as u64,
            ping_timeout: self.inner.config.ping_timeout.as_millis() as u64,
            max_payload: self.inner.config.max_payload.map(|max| max as u64),
        };
        let open_body = Bytes::from(params.to_json());

        let conn: Arc<dyn Conn> = match transport {
            TransportKind::Polling => Arc::new(PollingConn::new(
                req.uri().clone(),
                req.remote_addr(),
                req.headers().clone(),
            )),
            TransportKind::Websocket => Arc::new(WebSocketConn::new(
                req.uri().clone(),
                req.remote_addr(),
                req.headers().clone(),
            )),
        };

        let session = Session::new(
            self.inner.manager.clone(),
            transport,
            Arc::clone(&conn),
            sid.clone(),
            self.inner.config.ping_timeout,
        );
        self.inner.manager.insert(session.clone()).await;
        tracing::info!(sid = %sid, %transport, peer = %req.remote_addr(), "session created");

        let _ = self.inner.accept_tx.try_send(session.clone());

        match transport {
            // Enqueues immediately, so the request below flushes it.
            TransportKind::Polling => session.flush_open(open_body).await,
            // The socket only exists after the 101 below goes out.
            TransportKind::Websocket => {
                let session = session.clone();
                tokio::spawn(async move { session.flush_open(open_body).await });
            }
        }

        let mut resp = session.serve(req).await;
        if let Some(name) = &self.inner.config.cookie {
            if let Ok(value) = HeaderValue::from_str(&format!("{name}={sid}")) {
                resp.headers_mut().insert(header::SET_COOKIE, value);
            }
        }
        resp
    }

    async fn launch_upgrade(&self, session: Session, req: HttpRequest) -> Response<Full<Bytes>> {
        if let Err(err) = WebSocketConn::check(&req) {
            return text_response(StatusCode::BAD_REQUEST, err.to_string());
        }
        let conn = WebSocketConn::new(
            req.uri().clone(),
            req.remote_addr(),
            req.headers().clone(),
        );
        let handle: Arc<dyn Conn> = Arc::new(conn.clone());
        tokio::spawn({
            let session = session.clone();
            async move { session.upgrade(TransportKind::Websocket, handle).await }
        });
        // The upgrade task reads its handshake packets from this conn.
        conn.serve(req).await
    }

    /// Only targets the session can actually upgrade to are advertised.
    fn advertised_upgrades(&self, transport: TransportKind) -> Vec<String> {
        if transport == TransportKind::Polling
            && self.inner.config.allow_upgrades
            && self
                .inner
                .config
                .transports
                .contains(&TransportKind::Websocket)
        {
            vec![TransportKind::Websocket.as_str().to_owned()]
        } else {
            Vec::new()
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn apply_access_control(resp: &mut Response<Full<Bytes>>, cors: &AccessControl) {
    let headers = resp.headers_mut();
    let pairs = [
        ("access-control-allow-origin", cors.origin.as_deref()),
        ("access-control-allow-credentials", cors.credentials.as_deref()),
        ("access-control-allow-methods", cors.methods.as_deref()),
        ("access-control-allow-headers", cors.headers.as_deref()),
    ];
    for (name, value) in pairs {
        if let Some(value) = value {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        }
    }
    if let Some(max_age) = cors.max_age.filter(|&age| age > 0) {
        if let Ok(value) = HeaderValue::from_str(&max_age.to_string()) {
            headers.insert("access-control-max-age", value);
        }
    }
}
