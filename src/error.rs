use thiserror::Error;

/// Errors that can occur while delivering notifications.
///
/// Most of these never reach the dashboard: transport failures are absorbed
/// by the reconnect policy and surfaced only as a
/// [`ConnectionStatus`](crate::ConnectionStatus).
#[derive(Error, Debug)]
pub enum NotifyError {
    /// The remote endpoint refused or dropped the connection.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Connecting or the protocol handshake took too long.
    #[error("connection timed out")]
    Timeout,

    /// The peer sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The STOMP broker answered with an ERROR frame.
    #[error("STOMP error: {0}")]
    Stomp(String),

    /// WebSocket client error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The REST backend answered with a non-success status.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An endpoint URL could not be parsed or extended.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Environment configuration could not be loaded.
    #[error("configuration loading failed: {0}")]
    Config(#[from] config::ConfigError),

    /// A configuration value is present but unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The selected notification method needs a transport that was not supplied.
    #[error("missing transport for method {0}")]
    MissingTransport(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for notification operations
pub type Result<T> = std::result::Result<T, NotifyError>;
