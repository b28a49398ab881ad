// src/transport/manager.rs

//! Shared connection manager.
//!
//! A [`ConnectionManager`] wraps one logical real-time connection (WebSocket,
//! STOMP or SSE) behind a cheap, cloneable handle. Every clone shares the same
//! link, status and listener registry, so the dashboard can hand the manager
//! to as many consumers as it likes.
//!
//! ## Concurrency model
//!
//! - Each call to [`connect`](ConnectionManager::connect) that finds no live
//!   session spawns one **supervisor task**. The supervisor is the single
//!   owner of the [`Link`]: it opens it, reads frames, forwards subscriptions
//!   and outbound messages, and runs the reconnect backoff.
//! - Handles talk to the supervisor over an unbounded command channel. Sends
//!   on one link therefore keep their order.
//! - Every session carries a generation number. A supervisor only touches the
//!   shared status while its generation is still the current one, so a
//!   session torn down by [`disconnect`](ConnectionManager::disconnect) can
//!   never overwrite the status afterwards.
//! - Listeners (message and status) always run outside internal locks.
//! - Locks nest registry, then state, then status; never the other way.
//!
//! ## Reconnection
//!
//! A failed open or an unexpected closure consumes one attempt of the
//! [`ReconnectPolicy`]. Attempts reset on every successful open. Once the
//! policy is exhausted the session ends with status `error` and nothing
//! retries until `connect()` is called again.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::domain::{
    // ---
    deliver,
    lock_ignore_poison,
    ConnectionStatus,
    Connector,
    Inbound,
    Link,
    Listener,
    NotificationEnvelope,
    Routing,
    StatusCell,
    StatusNotice,
    StatusListener,
    StatusSubscription,
    Topic,
};
use crate::macros::{log_debug, log_error, log_info, log_warn};
use crate::retry::{ReconnectPolicy, ReconnectState};

//
// Supervisor commands
//

enum Cmd {
    //
    Send { destination: Topic, body: String },
    Subscribe(Topic),
    Unsubscribe(Topic),
    Close,
}

/// Why the link loop returned.
enum LinkExit {
    //
    Closed,
    Lost(String),
}

enum LinkEvent {
    //
    Command(Option<Cmd>),
    Frame(Option<crate::Result<Inbound>>),
}

struct Session {
    generation: u64,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

#[derive(Default)]
struct State {
    generation: u64,
    session: Option<Session>,
    explicitly_disconnected: bool,
}

impl State {
    fn is_current(&self, generation: u64) -> bool {
        matches!(&self.session, Some(s) if s.generation == generation)
    }

    fn command(&self, cmd: Cmd) {
        if let Some(session) = &self.session {
            let _ = session.cmd_tx.send(cmd);
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_topic: HashMap<Topic, Vec<(u64, Listener)>>,
}

type Supervisor = std::pin::Pin<Box<dyn Future<Output = ()> + Send>>;

/// Outcome of `start_session`, acted on once the state lock is released.
#[derive(Default)]
struct Started {
    notice: Option<StatusNotice>,
    supervisor: Option<(tokio::runtime::Handle, Supervisor)>,
}

impl Started {
    /// Report `connecting` first, then let the supervisor run, so listeners
    /// always see the transitions in order.
    fn launch(self) {
        // ---
        if let Some(notice) = self.notice {
            notice.fire();
        }
        if let Some((handle, supervisor)) = self.supervisor {
            handle.spawn(supervisor);
        }
    }
}

struct Inner {
    // ---
    name: String,
    connector: Arc<dyn Connector>,
    routing: Routing,
    policy: ReconnectPolicy,
    state: Mutex<State>,
    status: Arc<StatusCell>,
    listeners: Mutex<Registry>,
}

/// Cloneable handle to one shared real-time connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.inner.name)
            .field("routing", &self.inner.routing)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionManager {
    // ---
    /// Create a manager for `connector`. Nothing is opened until
    /// [`connect`](Self::connect) is called.
    pub fn new<C>(connector: C, policy: ReconnectPolicy) -> Self
    where
        C: Connector,
    {
        // ---
        Self::from_arc(Arc::new(connector), policy)
    }

    pub fn from_arc(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        // ---
        let inner = Inner {
            name: connector.name().to_string(),
            routing: connector.routing(),
            connector,
            policy,
            state: Mutex::new(State::default()),
            status: StatusCell::new(ConnectionStatus::Disconnected),
            listeners: Mutex::new(Registry::default()),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn routing(&self) -> Routing {
        self.inner.routing
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.get()
    }

    pub(crate) fn status_cell(&self) -> Arc<StatusCell> {
        self.inner.status.clone()
    }

    /// True after [`disconnect`](Self::disconnect) until the next explicit
    /// [`connect`](Self::connect).
    pub fn is_explicitly_disconnected(&self) -> bool {
        lock_ignore_poison(&self.inner.state).explicitly_disconnected
    }

    /// Open the connection.
    ///
    /// Idempotent: a no-op while a session is connecting, connected or
    /// backing off. Clears the explicit-disconnect mark and starts with a
    /// fresh reconnect budget when a new session is needed.
    pub fn connect(&self) {
        // ---
        let started = {
            let mut state = lock_ignore_poison(&self.inner.state);
            state.explicitly_disconnected = false;
            self.start_session(&mut state)
        };

        started.launch();
    }

    /// Connect unless someone explicitly disconnected this manager.
    ///
    /// Returns false when the explicit disconnect was respected.
    pub fn ensure_connected(&self) -> bool {
        // ---
        let started = {
            let mut state = lock_ignore_poison(&self.inner.state);
            if state.explicitly_disconnected {
                log_debug!("{}: explicitly disconnected, not reconnecting", self.inner.name);
                return false;
            }
            self.start_session(&mut state)
        };

        started.launch();
        true
    }

    /// Close the connection and stop any pending reconnect.
    ///
    /// Safe to call repeatedly. The manager stays down until the next
    /// explicit [`connect`](Self::connect).
    pub fn disconnect(&self) {
        // ---
        let notice = {
            let mut state = lock_ignore_poison(&self.inner.state);
            state.explicitly_disconnected = true;
            self.teardown(&mut state)
        };

        if let Some(notice) = notice {
            notice.fire();
        }
    }

    /// Tear the session down without marking the manager as explicitly
    /// disconnected.
    pub(crate) fn release(&self) {
        // ---
        let notice = {
            let mut state = lock_ignore_poison(&self.inner.state);
            self.teardown(&mut state)
        };

        if let Some(notice) = notice {
            notice.fire();
        }
    }

    fn start_session(&self, state: &mut State) -> Started {
        // ---
        if state.session.is_some() {
            log_debug!("{}: connect ignored, session already running", self.inner.name);
            return Started::default();
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log_error!("{}: connect called outside a tokio runtime", self.inner.name);
                return Started {
                    notice: self.inner.status.replace(ConnectionStatus::Error),
                    supervisor: None,
                };
            }
        };

        state.generation += 1;
        let generation = state.generation;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        state.session = Some(Session { generation, cmd_tx });

        log_info!("{}: connecting (session {generation})", self.inner.name);

        Started {
            notice: self.inner.status.replace(ConnectionStatus::Connecting),
            supervisor: Some((handle, supervise(self.inner.clone(), generation, cmd_rx))),
        }
    }

    fn teardown(&self, state: &mut State) -> Option<StatusNotice> {
        // ---
        if let Some(session) = state.session.take() {
            log_info!("{}: disconnecting (session {})", self.inner.name, session.generation);
            let _ = session.cmd_tx.send(Cmd::Close);
        }
        self.inner.status.replace(ConnectionStatus::Disconnected)
    }

    /// Register `listener` for `topic`.
    ///
    /// Works before [`connect`](Self::connect): the registration is kept and
    /// forwarded to the broker once a link is up. For destination-routed
    /// connectors the first listener on a destination subscribes it on the
    /// live link; the last one to leave unsubscribes it.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, listener: F) -> Subscription
    where
        F: Fn(&NotificationEnvelope) + Send + Sync + 'static,
    {
        // ---
        let topic = topic.into();
        let listener: Listener = Arc::new(listener);

        let id = {
            let mut registry = lock_ignore_poison(&self.inner.listeners);
            let id = registry.next_id;
            registry.next_id += 1;

            let entry = registry.by_topic.entry(topic.clone()).or_default();
            entry.push((id, listener));

            // Queued under the registry lock so subscribe and unsubscribe
            // commands for one destination reach the supervisor in order.
            if entry.len() == 1 && self.inner.forwards(&topic) {
                lock_ignore_poison(&self.inner.state).command(Cmd::Subscribe(topic.clone()));
            }
            id
        };

        log_debug!("{}: listener {id} registered on {topic}", self.inner.name);

        Subscription {
            manager: Arc::downgrade(&self.inner),
            topic,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Serialize `message` and send it to `destination`.
    ///
    /// Only transmitted while connected; otherwise the message is logged and
    /// dropped. Never fails.
    pub fn send<T>(&self, destination: impl Into<Topic>, message: &T)
    where
        T: Serialize + ?Sized,
    {
        // ---
        let destination = destination.into();

        if self.status() != ConnectionStatus::Connected {
            log_warn!("{}: not connected, dropping message to {destination}", self.inner.name);
            return;
        }

        let body = match serde_json::to_string(message) {
            Ok(body) => body,
            Err(_err) => {
                log_error!("{}: failed to serialize message: {_err}", self.inner.name);
                return;
            }
        };

        lock_ignore_poison(&self.inner.state).command(Cmd::Send { destination, body });
    }

    /// Observe status transitions. The listener is called right away with the
    /// current status.
    pub fn on_status_change<F>(&self, listener: F) -> StatusSubscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        // ---
        let listener: StatusListener = Arc::new(listener);
        self.inner.status.watch(listener)
    }

    /// Number of listeners currently registered on `topic`.
    pub fn listener_count(&self, topic: &Topic) -> usize {
        lock_ignore_poison(&self.inner.listeners)
            .by_topic
            .get(topic)
            .map_or(0, Vec::len)
    }
}

impl Inner {
    // ---
    fn forwards(&self, topic: &Topic) -> bool {
        self.routing == Routing::Destination && !topic.is_wildcard()
    }

    fn remove_listener(&self, topic: &Topic, id: u64) {
        // ---
        let mut registry = lock_ignore_poison(&self.listeners);
        let Some(entry) = registry.by_topic.get_mut(topic) else {
            return;
        };
        entry.retain(|(lid, _)| *lid != id);

        if entry.is_empty() {
            registry.by_topic.remove(topic);
            if self.forwards(topic) {
                lock_ignore_poison(&self.state).command(Cmd::Unsubscribe(topic.clone()));
            }
        }
    }

    fn registered_topics(&self) -> Vec<Topic> {
        lock_ignore_poison(&self.listeners)
            .by_topic
            .keys()
            .filter(|t| self.forwards(t))
            .cloned()
            .collect()
    }

    /// Fan an envelope out to the listeners of its route and of the wildcard.
    fn dispatch(&self, route: Option<Topic>, envelope: &NotificationEnvelope) {
        // ---
        let key = route.unwrap_or_else(|| Topic::from(envelope.kind()));

        let targets: Vec<Listener> = {
            let registry = lock_ignore_poison(&self.listeners);
            let exact = registry.by_topic.get(&key).into_iter().flatten();
            let wildcard = if key.is_wildcard() {
                None
            } else {
                registry.by_topic.get(&Topic::wildcard())
            };

            exact
                .chain(wildcard.into_iter().flatten())
                .map(|(_, l)| l.clone())
                .collect()
        };

        if targets.is_empty() {
            log_debug!("{}: no listener for {key}", self.name);
        }

        for listener in &targets {
            deliver(listener, envelope, &self.name);
        }
    }

    /// Set `status` if `generation` is still the live session.
    fn set_status_if_current(&self, generation: u64, status: ConnectionStatus) -> bool {
        // ---
        let notice = {
            let state = lock_ignore_poison(&self.state);
            if !state.is_current(generation) {
                return false;
            }
            self.status.replace(status)
        };

        if let Some(notice) = notice {
            notice.fire();
        }
        true
    }

    /// End the session after the reconnect budget ran out.
    fn give_up(&self, generation: u64) {
        // ---
        let notice = {
            let mut state = lock_ignore_poison(&self.state);
            if !state.is_current(generation) {
                return;
            }
            state.session = None;
            self.status.replace(ConnectionStatus::Error)
        };

        if let Some(notice) = notice {
            notice.fire();
        }
    }
}

/// Race `fut` against the command channel.
///
/// Returns `None` when the session is closed first. Commands that need a live
/// link are discarded: subscriptions are replayed from the registry on the
/// next open.
async fn or_close<F>(fut: F, cmd_rx: &mut mpsc::UnboundedReceiver<Cmd>) -> Option<F::Output>
where
    F: Future,
{
    // ---
    tokio::pin!(fut);

    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Cmd::Close) => return None,
                Some(Cmd::Send { destination: _destination, .. }) => {
                    log_warn!("no link, dropping message to {_destination}");
                }
                Some(Cmd::Subscribe(_)) | Some(Cmd::Unsubscribe(_)) => {}
            },
        }
    }
}

fn supervise(inner: Arc<Inner>, generation: u64, cmd_rx: mpsc::UnboundedReceiver<Cmd>) -> Supervisor {
    Box::pin(run_session(inner, generation, cmd_rx))
}

async fn run_session(inner: Arc<Inner>, generation: u64, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
    // ---
    let name = inner.name.clone();
    let mut reconnect = ReconnectState::default();

    loop {
        let Some(opened) = or_close(inner.connector.open(), &mut cmd_rx).await else {
            log_debug!("{name}: session {generation} closed while opening");
            return;
        };

        match opened {
            Ok(mut link) => {
                reconnect.reset();

                if !inner.set_status_if_current(generation, ConnectionStatus::Connected) {
                    let _ = link.close().await;
                    return;
                }
                log_info!("{name}: connected");

                match run_link(&inner, link.as_mut(), &mut cmd_rx).await {
                    LinkExit::Closed => {
                        if let Err(_err) = link.close().await {
                            log_debug!("{name}: close failed: {_err}");
                        }
                        return;
                    }
                    LinkExit::Lost(_reason) => {
                        log_warn!("{name}: connection lost: {_reason}");
                        let _ = link.close().await;
                    }
                }
            }
            Err(_err) => {
                log_warn!("{name}: connection attempt failed: {_err}");
            }
        }

        match inner.policy.next_delay(&mut reconnect) {
            Some(delay) => {
                if !inner.set_status_if_current(generation, ConnectionStatus::Connecting) {
                    return;
                }
                log_info!(
                    "{name}: reconnect attempt {}/{} in {delay:?}",
                    reconnect.attempts(),
                    inner.policy.max_attempts
                );

                if or_close(tokio::time::sleep(delay), &mut cmd_rx).await.is_none() {
                    return;
                }
            }
            None => {
                log_error!(
                    "{name}: giving up after {} reconnect attempts",
                    reconnect.attempts()
                );
                inner.give_up(generation);
                return;
            }
        }
    }
}

async fn run_link(
    inner: &Inner,
    link: &mut dyn Link,
    cmd_rx: &mut mpsc::UnboundedReceiver<Cmd>,
) -> LinkExit {
    // ---
    let mut active: HashSet<Topic> = HashSet::new();

    for topic in inner.registered_topics() {
        if let Err(err) = link.subscribe(&topic).await {
            return LinkExit::Lost(format!("subscribe {topic} failed: {err}"));
        }
        active.insert(topic);
    }

    loop {
        let event = tokio::select! {
            cmd = cmd_rx.recv() => LinkEvent::Command(cmd),
            frame = link.next_frame() => LinkEvent::Frame(frame),
        };

        match event {
            LinkEvent::Command(None) | LinkEvent::Command(Some(Cmd::Close)) => {
                return LinkExit::Closed;
            }
            LinkEvent::Command(Some(Cmd::Send { destination, body })) => {
                if let Err(err) = link.send(&destination, &body).await {
                    return LinkExit::Lost(format!("send to {destination} failed: {err}"));
                }
            }
            LinkEvent::Command(Some(Cmd::Subscribe(topic))) => {
                if active.insert(topic.clone()) {
                    if let Err(err) = link.subscribe(&topic).await {
                        return LinkExit::Lost(format!("subscribe {topic} failed: {err}"));
                    }
                }
            }
            LinkEvent::Command(Some(Cmd::Unsubscribe(topic))) => {
                if active.remove(&topic) {
                    if let Err(err) = link.unsubscribe(&topic).await {
                        return LinkExit::Lost(format!("unsubscribe {topic} failed: {err}"));
                    }
                }
            }
            LinkEvent::Frame(None) => return LinkExit::Lost("closed by remote".into()),
            LinkEvent::Frame(Some(Err(err))) => return LinkExit::Lost(err.to_string()),
            LinkEvent::Frame(Some(Ok(Inbound::Envelope { route, envelope }))) => {
                inner.dispatch(route, &envelope);
            }
            LinkEvent::Frame(Some(Ok(Inbound::Malformed { reason: _reason }))) => {
                log_warn!("{}: dropping malformed frame: {_reason}", inner.name);
            }
        }
    }
}

/// A listener registration returned by [`ConnectionManager::subscribe`].
///
/// Dropping it unsubscribes. Unsubscribing twice, or after every manager
/// handle is gone, is a no-op.
#[must_use = "dropping the subscription removes the listener"]
pub struct Subscription {
    manager: Weak<Inner>,
    topic: Topic,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    // ---
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn unsubscribe(&self) {
        // ---
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.manager.upgrade() {
            inner.remove_listener(&self.topic, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}
