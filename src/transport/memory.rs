//! In-memory connector.
//!
//! This module provides a pure in-process implementation of the domain-level
//! [`Connector`] trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory connector defines the **reference behavior** for the
//! transport layer. The WebSocket, STOMP and SSE connectors approximate it as
//! closely as their protocols allow:
//!
//! - A destination-routed link only receives frames for destinations it has
//!   subscribed; a frame without a destination reaches every link.
//! - A body sent with a destination is normalized leniently (a bare object
//!   becomes the payload of a `notification` envelope). A body sent without
//!   one must be a complete envelope.
//! - Anything that does not decode is reported as malformed, never dropped
//!   silently.
//!
//! ## Fault injection
//!
//! [`MemoryServer`] is also the control surface for tests: it can refuse or
//! fail connection attempts, drop every live link, and records what clients
//! sent and subscribed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::domain::{
    // ---
    lock_ignore_poison,
    Connector,
    Inbound,
    Link,
    NotificationEnvelope,
    Routing,
    Topic,
};
use crate::macros::log_debug;
use crate::{NotifyError, Result};

enum ServerFrame {
    //
    Message { route: Option<Topic>, body: String },
    Drop,
}

#[derive(Default)]
struct ServerState {
    next_link: u64,
    links: Vec<(u64, mpsc::UnboundedSender<ServerFrame>)>,
    fail_next: u32,
    refuse: bool,
    open_instants: Vec<Instant>,
    close_count: usize,
    sent: Vec<(Topic, String)>,
    subscribed: Vec<Topic>,
    unsubscribed: Vec<Topic>,
}

/// Simulated notification backend shared by every [`MemoryConnector`] built
/// from it.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector opening links to this server.
    pub fn connector(&self, routing: Routing) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
            routing,
        }
    }

    /// Push a JSON body on `route` (or unrouted) to every live link.
    pub fn push(&self, route: Option<&str>, body: &serde_json::Value) {
        self.push_raw(route, body.to_string());
    }

    /// Push an arbitrary text frame, valid or not.
    pub fn push_raw(&self, route: Option<&str>, body: impl Into<String>) {
        // ---
        let body = body.into();
        let state = lock_ignore_poison(&self.state);

        for (_, tx) in &state.links {
            let _ = tx.send(ServerFrame::Message {
                route: route.map(Topic::from),
                body: body.clone(),
            });
        }
    }

    /// Close every live link from the server side.
    pub fn drop_connections(&self) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        for (_, tx) in state.links.drain(..) {
            let _ = tx.send(ServerFrame::Drop);
        }
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_opens(&self, count: u32) {
        lock_ignore_poison(&self.state).fail_next = count;
    }

    /// Refuse (or accept again) every connection attempt.
    pub fn refuse_connections(&self, refuse: bool) {
        lock_ignore_poison(&self.state).refuse = refuse;
    }

    /// Connection attempts so far, successful or not.
    pub fn open_count(&self) -> usize {
        lock_ignore_poison(&self.state).open_instants.len()
    }

    /// When each connection attempt happened.
    pub fn open_instants(&self) -> Vec<Instant> {
        lock_ignore_poison(&self.state).open_instants.clone()
    }

    /// Links closed by clients.
    pub fn close_count(&self) -> usize {
        lock_ignore_poison(&self.state).close_count
    }

    pub fn live_links(&self) -> usize {
        lock_ignore_poison(&self.state).links.len()
    }

    /// Every `(destination, body)` clients sent, in order.
    pub fn sent(&self) -> Vec<(Topic, String)> {
        lock_ignore_poison(&self.state).sent.clone()
    }

    /// Every destination clients subscribed, in order.
    pub fn subscribed(&self) -> Vec<Topic> {
        lock_ignore_poison(&self.state).subscribed.clone()
    }

    pub fn unsubscribed(&self) -> Vec<Topic> {
        lock_ignore_poison(&self.state).unsubscribed.clone()
    }
}

/// [`Connector`] backed by a [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
    routing: Routing,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    // ---
    fn name(&self) -> &str {
        "memory"
    }

    fn routing(&self) -> Routing {
        self.routing
    }

    async fn open(&self) -> Result<Box<dyn Link>> {
        // ---
        let mut state = lock_ignore_poison(&self.server.state);
        state.open_instants.push(Instant::now());

        if state.refuse {
            return Err(NotifyError::Connection("memory server refused connection".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(NotifyError::Connection("memory server unavailable".into()));
        }

        let id = state.next_link;
        state.next_link += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        state.links.push((id, tx));
        log_debug!("memory: link {id} opened");

        Ok(Box::new(MemoryLink {
            id,
            server: self.server.clone(),
            routing: self.routing,
            inbox: rx,
            subscribed: HashSet::new(),
        }))
    }
}

struct MemoryLink {
    id: u64,
    server: MemoryServer,
    routing: Routing,
    inbox: mpsc::UnboundedReceiver<ServerFrame>,
    subscribed: HashSet<Topic>,
}

impl MemoryLink {
    // ---
    fn accepts(&self, route: Option<&Topic>) -> bool {
        match (self.routing, route) {
            (Routing::Destination, Some(route)) => self.subscribed.contains(route),
            _ => true,
        }
    }
}

fn decode(route: Option<Topic>, body: &str) -> Inbound {
    // ---
    let decoded = match &route {
        Some(_) => serde_json::from_str(body)
            .map(|value| NotificationEnvelope::normalize(value, "notification")),
        None => NotificationEnvelope::from_wire(body),
    };

    match decoded {
        Ok(envelope) => Inbound::Envelope { route, envelope },
        Err(err) => Inbound::Malformed {
            reason: err.to_string(),
        },
    }
}

#[async_trait::async_trait]
impl Link for MemoryLink {
    // ---
    async fn next_frame(&mut self) -> Option<Result<Inbound>> {
        // ---
        loop {
            match self.inbox.recv().await? {
                ServerFrame::Drop => return None,
                ServerFrame::Message { route, body } => {
                    if self.accepts(route.as_ref()) {
                        return Some(Ok(decode(route, &body)));
                    }
                }
            }
        }
    }

    async fn send(&mut self, destination: &Topic, body: &str) -> Result<()> {
        // ---
        lock_ignore_poison(&self.server.state)
            .sent
            .push((destination.clone(), body.to_string()));
        Ok(())
    }

    async fn subscribe(&mut self, topic: &Topic) -> Result<()> {
        // ---
        self.subscribed.insert(topic.clone());
        lock_ignore_poison(&self.server.state)
            .subscribed
            .push(topic.clone());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<()> {
        // ---
        self.subscribed.remove(topic);
        lock_ignore_poison(&self.server.state)
            .unsubscribed
            .push(topic.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.server.state);
        state.links.retain(|(id, _)| *id != self.id);
        state.close_count += 1;
        log_debug!("memory: link {} closed", self.id);
        Ok(())
    }
}
