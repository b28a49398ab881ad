//! Public notification client configuration.
//!
//! [`NotifyConfig`] gathers everything the transport factories need: backend
//! URLs, which delivery method to use, reconnect and polling timing, and
//! optionally the user to deliver for. It is built in code with the `with_*`
//! methods or loaded from `MAVILLE_*` environment variables (after reading a
//! `.env` file when present).
//!
//! | Variable | Default |
//! |---|---|
//! | `MAVILLE_API_URL` | `http://localhost:7000/api` |
//! | `MAVILLE_WS_URL` | derived from the API URL (`ws://localhost:7000/ws`) |
//! | `MAVILLE_NOTIFICATION_METHOD` | `sse` (`websocket`, `sse`, `both`, `polling`) |
//! | `MAVILLE_WS_PROTOCOL` | `stomp` (`stomp`, `raw`) |
//! | `MAVILLE_SOCKJS` | `true` |
//! | `MAVILLE_RETRY_MAX_ATTEMPTS` | `5` |
//! | `MAVILLE_RETRY_BASE_DELAY_MS` | `1000` |
//! | `MAVILLE_RETRY_MAX_DELAY_MS` | `30000` |
//! | `MAVILLE_RETRY_JITTER` | `false` |
//! | `MAVILLE_POLL_INTERVAL_MS` | `30000` |
//! | `MAVILLE_HEARTBEAT_MS` | `4000` |
//! | `MAVILLE_CONNECT_TIMEOUT_MS` | `10000` |
//! | `MAVILLE_USER_ROLE` / `MAVILLE_USER_ID` | unset |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::domain::UserIdentity;
use crate::polling::DEFAULT_POLL_INTERVAL;
use crate::retry::ReconnectPolicy;
use crate::selector::NotificationMethod;
use crate::{NotifyError, Result};

pub const DEFAULT_API_URL: &str = "http://localhost:7000/api";

/// Wire protocol spoken on the WebSocket endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WebSocketProtocol {
    /// STOMP 1.2 (Spring message broker).
    #[default]
    Stomp,

    /// One JSON envelope per text frame.
    Raw,
}

impl FromStr for WebSocketProtocol {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stomp" => Ok(WebSocketProtocol::Stomp),
            "raw" | "json" => Ok(WebSocketProtocol::Raw),
            other => Err(NotifyError::InvalidConfig(format!(
                "unknown WebSocket protocol: {other}"
            ))),
        }
    }
}

impl fmt::Display for WebSocketProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WebSocketProtocol::Stomp => "stomp",
            WebSocketProtocol::Raw => "raw",
        })
    }
}

/// Notification client configuration.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    // ---
    /// REST base URL, including the `/api` prefix.
    pub api_url: String,

    /// Explicit WebSocket endpoint. Derived from `api_url` when `None`.
    pub ws_url: Option<String>,

    pub method: NotificationMethod,

    pub ws_protocol: WebSocketProtocol,

    /// Wrap STOMP in SockJS framing (Spring `withSockJS()` endpoints).
    pub sockjs: bool,

    /// Reconnect policy shared by every push transport.
    pub reconnect: ReconnectPolicy,

    pub poll_interval: Duration,

    /// STOMP heart-beat offered to the broker (zero disables).
    pub heartbeat: Duration,

    /// Bound on connecting plus any protocol handshake.
    pub connect_timeout: Duration,

    /// User to deliver notifications for, when known up front.
    pub identity: Option<UserIdentity>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

impl NotifyConfig {
    // ---
    /// Configuration for the backend at `api_url` with every other value at
    /// its default.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ws_url: None,
            method: NotificationMethod::default(),
            ws_protocol: WebSocketProtocol::default(),
            sockjs: true,
            reconnect: ReconnectPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat: Duration::from_secs(4),
            connect_timeout: Duration::from_secs(10),
            identity: None,
        }
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    pub fn with_method(mut self, method: NotificationMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_ws_protocol(mut self, protocol: WebSocketProtocol) -> Self {
        self.ws_protocol = protocol;
        self
    }

    pub fn with_sockjs(mut self, sockjs: bool) -> Self {
        self.sockjs = sockjs;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_identity(mut self, identity: UserIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// WebSocket endpoint: the explicit one, or the API URL with its `/api`
    /// suffix replaced by `/ws` and the scheme mapped to `ws`/`wss`.
    pub fn websocket_url(&self) -> Result<String> {
        // ---
        if let Some(url) = &self.ws_url {
            return Ok(url.clone());
        }

        let mut url = Url::parse(&self.api_url)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| NotifyError::InvalidConfig(format!("cannot derive ws URL from {}", self.api_url)))?;

        let path = url.path().trim_end_matches('/');
        let base = path.strip_suffix("/api").unwrap_or(path).to_string();
        url.set_path(&format!("{base}/ws"));
        url.set_query(None);

        Ok(url.into())
    }

    /// Reject values that would make a transport unusable.
    pub fn validate(&self) -> Result<()> {
        // ---
        let api = Url::parse(&self.api_url)?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(NotifyError::InvalidConfig(format!(
                "API URL must be http(s): {}",
                self.api_url
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(NotifyError::InvalidConfig("poll interval must be positive".into()));
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(NotifyError::InvalidConfig(
                "reconnect base delay exceeds max delay".into(),
            ));
        }
        self.websocket_url().map(|_| ())
    }

    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        // ---
        dotenvy::dotenv().ok();
        Self::from_source(config::Environment::default())
    }

    /// Load from an explicit set of `MAVILLE_*` variables.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        // ---
        let map: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_source(config::Environment::default().source(Some(map)))
    }

    fn from_source(env: config::Environment) -> Result<Self> {
        // ---
        let settings: EnvSettings = config::Config::builder()
            .add_source(env.prefix("MAVILLE"))
            .build()?
            .try_deserialize()?;

        settings.into_config()
    }
}

/// Flat view of the `MAVILLE_*` variables.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvSettings {
    api_url: Option<String>,
    ws_url: Option<String>,
    notification_method: Option<String>,
    ws_protocol: Option<String>,
    sockjs: Option<bool>,
    retry_max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    retry_jitter: Option<bool>,
    poll_interval_ms: Option<u64>,
    heartbeat_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    user_role: Option<String>,
    user_id: Option<String>,
}

impl EnvSettings {
    fn into_config(self) -> Result<NotifyConfig> {
        // ---
        let mut config = NotifyConfig::new(self.api_url.unwrap_or_else(|| DEFAULT_API_URL.into()));

        config.ws_url = self.ws_url.filter(|u| !u.trim().is_empty());
        config.method = NotificationMethod::from_setting(self.notification_method.as_deref());

        if let Some(protocol) = self.ws_protocol {
            config.ws_protocol = protocol.parse()?;
        }
        if let Some(sockjs) = self.sockjs {
            config.sockjs = sockjs;
        }

        let reconnect = &mut config.reconnect;
        if let Some(n) = self.retry_max_attempts {
            reconnect.max_attempts = n;
        }
        if let Some(ms) = self.retry_base_delay_ms {
            reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.retry_max_delay_ms {
            reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(jitter) = self.retry_jitter {
            reconnect.jitter = jitter;
        }

        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.heartbeat_ms {
            config.heartbeat = Duration::from_millis(ms);
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(role) = self.user_role.filter(|r| !r.trim().is_empty()) {
            config.identity = Some(UserIdentity::from_role(&role, self.user_id.as_deref())?);
        }

        config.validate()?;
        Ok(config)
    }
}
