//! Server configuration: timing knobs, transport set, and request hooks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use trench_core::{HttpRequest, TransportKind};

/// How often clients are told to send `PING`.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// The per-heartbeat read/write deadline, also advertised to clients.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Default name of the session-id cookie.
pub const DEFAULT_COOKIE: &str = "io";

/// Predicate consulted before a session is created; an `Err` denies the
/// request and its message becomes the 400 body.
pub type AllowRequestFn = Arc<dyn Fn(&HttpRequest) -> Result<(), String> + Send + Sync>;

/// Hook producing the CORS header values for a request.
pub type AccessControlFn = Arc<dyn Fn(&HttpRequest) -> AccessControl + Send + Sync>;

/// The `Access-Control-*` values emitted on responses. Unset fields emit
/// no header; `max_age` is emitted only when positive.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    /// `Access-Control-Allow-Origin`.
    pub origin: Option<String>,
    /// `Access-Control-Allow-Credentials`.
    pub credentials: Option<String>,
    /// `Access-Control-Allow-Methods`.
    pub methods: Option<String>,
    /// `Access-Control-Allow-Headers`.
    pub headers: Option<String>,
    /// `Access-Control-Max-Age`, in seconds.
    pub max_age: Option<u32>,
}

/// Knobs for a [`Server`](crate::Server).
#[derive(Clone)]
pub struct ServerConfig {
    pub(crate) ping_interval: Duration,
    pub(crate) ping_timeout: Duration,
    pub(crate) allow_upgrades: bool,
    pub(crate) cookie: Option<String>,
    pub(crate) transports: Vec<TransportKind>,
    pub(crate) max_payload: Option<usize>,
    pub(crate) allow_request: Option<AllowRequestFn>,
    pub(crate) access_control: Option<AccessControlFn>,
}

impl ServerConfig {
    /// The default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            allow_upgrades: true,
            cookie: Some(DEFAULT_COOKIE.to_owned()),
            transports: vec![TransportKind::Polling, TransportKind::Websocket],
            max_payload: None,
            allow_request: None,
            access_control: None,
        }
    }

    /// How often clients should send `PING`. Advertised in `OPEN`.
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// The per-heartbeat read/write deadline. Advertised in `OPEN`.
    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Whether cross-transport upgrade attempts are honored.
    #[must_use]
    pub fn with_allow_upgrades(mut self, allow: bool) -> Self {
        self.allow_upgrades = allow;
        self
    }

    /// The session-id cookie name; `None` disables the cookie.
    #[must_use]
    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie;
        self
    }

    /// Which transports the front-end accepts.
    #[must_use]
    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }

    /// Largest accepted request body; enforced on POSTs and advertised
    /// in `OPEN` when set.
    #[must_use]
    pub fn with_max_payload(mut self, max: Option<usize>) -> Self {
        self.max_payload = max;
        self
    }

    /// Deny session creation when the hook returns an error.
    #[must_use]
    pub fn with_allow_request(
        mut self,
        hook: impl Fn(&HttpRequest) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.allow_request = Some(Arc::new(hook));
        self
    }

    /// Emit CORS headers from the hook's values.
    #[must_use]
    pub fn with_access_control(
        mut self,
        hook: impl Fn(&HttpRequest) -> AccessControl + Send + Sync + 'static,
    ) -> Self {
        self.access_control = Some(Arc::new(hook));
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("allow_upgrades", &self.allow_upgrades)
            .field("cookie", &self.cookie)
            .field("transports", &self.transports)
            .field("max_payload", &self.max_payload)
            .field("allow_request", &self.allow_request.is_some())
            .field("access_control", &self.access_control.is_some())
            .finish()
    }
}
