//! Real-time notification delivery for the MaVille public-works dashboard.
//!
//! The backend pushes notifications over three channels: STOMP (optionally
//! inside SockJS), a plain JSON WebSocket, and a per-user Server-Sent Events
//! stream. When no push channel is wanted, unread notifications are polled
//! from the REST API instead.
//!
//! Each push channel is a [`Connector`] driven by a [`ConnectionManager`]
//! that owns reconnection, subscriptions and status. A
//! [`NotificationSelector`] activates the channels implied by the configured
//! [`NotificationMethod`] and reports one combined [`ConnectionStatus`] to a
//! [`NotificationObserver`], typically a [`ToastNotifier`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use maville_notify::{
//!     NotificationSelector, NotifyConfig, ToastNotifier, TracingToastSink, UserIdentity,
//! };
//!
//! # async fn run() -> maville_notify::Result<()> {
//! let config = NotifyConfig::from_env()?;
//! let user = UserIdentity::resident("marie@test.com");
//!
//! let selector = NotificationSelector::from_config(&config, &user)?;
//! let toasts = Arc::new(ToastNotifier::new(TracingToastSink, config.method));
//!
//! let activation = selector.activate(&user, toasts)?;
//! println!("status: {}", activation.status());
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod api;
mod domain;
mod error;
mod macros;
mod notify_config;
mod polling;
mod retry;
mod selector;
mod toast;

pub mod transport;

// Re-export main types
pub use api::{ClearResult, NotificationList, NotificationRecord, NotificationsApi, UnreadSource};
pub use error::{NotifyError, Result};
pub use notify_config::{NotifyConfig, WebSocketProtocol, DEFAULT_API_URL};
pub use polling::{PollHandle, Poller, DEFAULT_POLL_INTERVAL};
pub use retry::{ReconnectPolicy, ReconnectState};

pub use selector::{
    //
    Activation,
    NotificationMethod,
    NotificationObserver,
    NotificationSelector,
    NotificationSession,
    Transports,
};

pub use toast::{
    //
    ChannelToastSink,
    Toast,
    ToastAction,
    ToastLevel,
    ToastNotifier,
    ToastSink,
    TracingToastSink,
    DEFAULT_PROJECTS_PATH,
};

pub use transport::{
    //
    create_memory_transport,
    create_sse_transport,
    create_stomp_transport,
    create_websocket_transport,
    ConnectionManager,
    MemoryServer,
    Subscription,
};

// --- public re-exports
pub use domain::{
    //
    now_timestamp,
    ConnectionStatus,
    Connector,
    EnvelopeKind,
    Inbound,
    Link,
    Listener,
    NotificationEnvelope,
    NotificationEvent,
    NotificationPayload,
    Routing,
    StatusListener,
    StatusSubscription,
    Topic,
    UserIdentity,
    BROADCAST_TOPIC,
};
