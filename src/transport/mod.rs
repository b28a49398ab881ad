//! Transport implementations.
//!
//! Every transport is a [`Connector`](crate::Connector) driven by a
//! [`ConnectionManager`], which owns reconnection, subscriptions and status.
//! Concrete connectors are exposed through constructor functions so callers
//! only ever hold a manager.
//!
//! - `stomp`: STOMP 1.2 over WebSocket, optionally inside SockJS
//! - `websocket`: plain JSON envelopes over WebSocket
//! - `sse`: the per-user Server-Sent Events stream
//! - `memory`: in-process reference connector for tests and local runs

mod manager;
mod memory;
mod websocket;

pub mod sse;
pub mod stomp;

pub use manager::{ConnectionManager, Subscription};
pub use memory::{MemoryConnector, MemoryServer};
pub use sse::SseConnector;
pub use stomp::StompConnector;
pub use websocket::WebSocketConnector;

use crate::domain::{Routing, UserIdentity};
use crate::notify_config::{NotifyConfig, WebSocketProtocol};
use crate::retry::ReconnectPolicy;
use crate::Result;

/// Manager for the WebSocket transport selected by `config.ws_protocol`.
pub fn create_websocket_transport(config: &NotifyConfig) -> Result<ConnectionManager> {
    // ---
    match config.ws_protocol {
        WebSocketProtocol::Stomp => create_stomp_transport(config),
        WebSocketProtocol::Raw => {
            let connector = WebSocketConnector::new(config.websocket_url()?, config.connect_timeout);
            Ok(ConnectionManager::new(connector, config.reconnect.clone()))
        }
    }
}

/// Manager for a STOMP endpoint, SockJS framing per `config.sockjs`.
pub fn create_stomp_transport(config: &NotifyConfig) -> Result<ConnectionManager> {
    // ---
    let connector = StompConnector::new(config.websocket_url()?)
        .with_sockjs(config.sockjs)
        .with_heartbeat(config.heartbeat)
        .with_connect_timeout(config.connect_timeout);

    Ok(ConnectionManager::new(connector, config.reconnect.clone()))
}

/// Manager for the event stream of `identity`.
pub fn create_sse_transport(
    config: &NotifyConfig,
    client: reqwest::Client,
    identity: &UserIdentity,
) -> Result<ConnectionManager> {
    // ---
    let url = sse::stream_url(&config.api_url, identity.identifier())?;
    let connector = SseConnector::new(client, url, config.connect_timeout);

    Ok(ConnectionManager::new(connector, config.reconnect.clone()))
}

/// Manager over an in-memory server.
pub fn create_memory_transport(
    server: &MemoryServer,
    routing: Routing,
    policy: ReconnectPolicy,
) -> ConnectionManager {
    ConnectionManager::new(server.connector(routing), policy)
}
