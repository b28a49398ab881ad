// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the seam between the connection manager, which owns
//! status, listeners and reconnection, and the concrete wire protocols
//! (WebSocket, STOMP, SSE, in-memory). It intentionally avoids any reference
//! to a specific client library.
//!
//! A [`Connector`] knows how to open one live [`Link`] to a notification
//! endpoint. A link yields normalized [`Inbound`] items until it closes; it is
//! owned by a single task and is never shared. Reconnection, queued
//! subscriptions and fan-out to listeners are handled elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::NotificationEnvelope;
use crate::macros::log_error;
use crate::Result;

/// A subscription key.
///
/// For destination-routed transports (STOMP) a topic is a broker destination
/// such as `/topic/notifications/residents`. For type-routed transports
/// (raw WebSocket, SSE) it is an envelope `type` such as `notification`.
/// The wildcard topic `*` matches every envelope on either kind.
///
/// Topics are immutable, cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Topic(pub Arc<str>);

impl Topic {
    /// The wildcard topic `*`.
    pub fn wildcard() -> Self {
        Topic(Arc::from("*"))
    }

    pub fn is_wildcard(&self) -> bool {
        &*self.0 == "*"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Topic
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Topic(value.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a transport decides which listeners receive an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Routing {
    /// By broker destination; subscriptions are forwarded to the broker.
    Destination,

    /// By envelope `type`; subscriptions stay local.
    MessageType,
}

/// One item read from a link.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// A normalized envelope.
    ///
    /// `route` is the broker destination it arrived on, if the protocol has
    /// one. Without a route the envelope `type` is used.
    Envelope {
        route: Option<Topic>,
        envelope: NotificationEnvelope,
    },

    /// A frame that could not be decoded. It is logged and dropped; the link
    /// stays up.
    Malformed { reason: String },
}

/// Callback receiving every envelope for one subscription.
pub type Listener = Arc<dyn Fn(&NotificationEnvelope) + Send + Sync>;

/// Invoke a listener, containing any panic it raises.
///
/// Returns false if the listener panicked.
pub(crate) fn deliver(listener: &Listener, envelope: &NotificationEnvelope, origin: &str) -> bool {
    // ---
    let delivered = catch_unwind(AssertUnwindSafe(|| listener(envelope))).is_ok();
    if !delivered {
        log_error!("{origin}: listener panicked on {} envelope", envelope.kind());
    }
    delivered
}

/// Opens links to a notification endpoint.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    // ---
    /// Short name used in logs (`stomp`, `sse`, ...).
    fn name(&self) -> &str;

    /// How envelopes from this connector are routed.
    fn routing(&self) -> Routing;

    /// Establish a new link. Returning `Ok` means the connection is usable
    /// (handshakes included).
    async fn open(&self) -> Result<Box<dyn Link>>;
}

/// A single live connection.
///
/// Implementations must keep [`next_frame`](Link::next_frame) cancel-safe:
/// the manager polls it concurrently with its command channel and drops the
/// future whenever a command arrives.
#[async_trait::async_trait]
pub trait Link: Send {
    // ---
    /// Wait for the next inbound item.
    ///
    /// - `None`: the remote closed the link
    /// - `Some(Err(_))`: the link failed and must be discarded
    async fn next_frame(&mut self) -> Option<Result<Inbound>>;

    /// Transmit an already serialized JSON body.
    async fn send(&mut self, destination: &Topic, body: &str) -> Result<()>;

    /// Start receiving a destination. Type-routed links need not override it.
    async fn subscribe(&mut self, _topic: &Topic) -> Result<()> {
        Ok(())
    }

    /// Stop receiving a destination.
    async fn unsubscribe(&mut self, _topic: &Topic) -> Result<()> {
        Ok(())
    }

    /// Close the link gracefully.
    async fn close(&mut self) -> Result<()>;
}
