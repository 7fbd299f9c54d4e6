// ── Runtime connection configuration ──
//
// These types describe *how* to connect to the Pub/Sub service.
// They carry connection tuning only and never touch disk; the CLI
// builds a `ConnectionOptions` and hands it in.

use std::time::Duration;

use url::Url;
use uuid::Uuid;

/// Production Pub/Sub endpoint.
pub const DEFAULT_URL: &str = "wss://api.cogswell.io/pubsub";

/// Default time allowed for a transport open.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default lifetime of an outstanding request.
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(30);

/// Default keep-alive ping interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Options for a single Pub/Sub connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// WebSocket endpoint.
    pub url: Url,
    /// Reconnect automatically after an unplanned close.
    pub auto_reconnect: bool,
    /// Upper bound on a single transport open. Also seeds the first
    /// reconnect delay.
    pub connect_timeout: Duration,
    /// Session to resume. `None` starts a fresh session.
    pub session_uuid: Option<Uuid>,
    /// How long a request may wait for its response before failing
    /// with a timeout.
    pub request_ttl: Duration,
    /// Interval between keep-alive pings while connected.
    pub keepalive_interval: Duration,
    /// First sequence number handed out.
    pub first_sequence: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            url: default_url(),
            auto_reconnect: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session_uuid: None,
            request_ttl: DEFAULT_REQUEST_TTL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            first_sequence: 0,
        }
    }
}

impl ConnectionOptions {
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_session_uuid(mut self, session_uuid: Option<Uuid>) -> Self {
        self.session_uuid = session_uuid;
        self
    }

    pub fn with_request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_first_sequence(mut self, first_sequence: u64) -> Self {
        self.first_sequence = first_sequence;
        self
    }
}

fn default_url() -> Url {
    Url::parse(DEFAULT_URL).expect("default URL is valid")
}
