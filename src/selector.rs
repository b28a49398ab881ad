// src/selector.rs

//! Notification method selection.
//!
//! The dashboard picks one delivery method at startup:
//!
//! - `websocket`: the WebSocket transport only (STOMP or raw)
//! - `sse`: the Server-Sent Events stream only (default)
//! - `both`: WebSocket and SSE at the same time
//! - `polling`: no push transport, periodic fetch of unread notifications
//!
//! [`NotificationSelector::activate`] wires the implied transports to one
//! [`NotificationObserver`] and reports a single combined status. Envelopes
//! arriving on two transports at once are delivered twice; callers that care
//! must de-duplicate on the payload id.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::NotificationsApi;
use crate::domain::{
    // ---
    lock_ignore_poison,
    ConnectionStatus,
    Listener,
    NotificationEnvelope,
    NotificationEvent,
    Routing,
    StatusCell,
    StatusSubscription,
    Topic,
    UserIdentity,
};
use crate::macros::{log_debug, log_info, log_warn};
use crate::notify_config::NotifyConfig;
use crate::polling::{PollHandle, Poller};
use crate::transport::{create_sse_transport, create_websocket_transport, ConnectionManager, Subscription};
use crate::{NotifyError, Result};

/// How notifications reach the dashboard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMethod {
    WebSocket,
    #[default]
    Sse,
    Both,
    Polling,
}

impl NotificationMethod {
    // ---
    /// Parse a configured value; unknown or missing values fall back to `sse`.
    pub fn from_setting(value: Option<&str>) -> Self {
        // ---
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            None => Self::default(),
            Some(value) => value.parse().unwrap_or_else(|_| {
                log_warn!("unknown notification method {value:?}, using sse");
                Self::default()
            }),
        }
    }

    pub fn uses_websocket(&self) -> bool {
        matches!(self, NotificationMethod::WebSocket | NotificationMethod::Both)
    }

    pub fn uses_sse(&self) -> bool {
        matches!(self, NotificationMethod::Sse | NotificationMethod::Both)
    }

    pub fn uses_polling(&self) -> bool {
        matches!(self, NotificationMethod::Polling)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationMethod::WebSocket => "websocket",
            NotificationMethod::Sse => "sse",
            NotificationMethod::Both => "both",
            NotificationMethod::Polling => "polling",
        }
    }
}

impl FromStr for NotificationMethod {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(NotificationMethod::WebSocket),
            "sse" => Ok(NotificationMethod::Sse),
            "both" => Ok(NotificationMethod::Both),
            "polling" | "poll" => Ok(NotificationMethod::Polling),
            other => Err(NotifyError::InvalidConfig(format!(
                "unknown notification method: {other}"
            ))),
        }
    }
}

impl fmt::Display for NotificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives everything an activation produces.
pub trait NotificationObserver: Send + Sync + 'static {
    fn on_event(&self, event: NotificationEvent);
}

impl<F> NotificationObserver for F
where
    F: Fn(NotificationEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: NotificationEvent) {
        self(event)
    }
}

/// The transports a selector may activate. Unused ones can be left out.
#[derive(Clone, Debug, Default)]
pub struct Transports {
    pub websocket: Option<ConnectionManager>,
    pub sse: Option<ConnectionManager>,
    pub poller: Option<Poller>,
}

impl Transports {
    // ---
    /// Build what `config.method` needs for `identity`.
    pub fn from_config(config: &NotifyConfig, identity: &UserIdentity) -> Result<Self> {
        // ---
        let client = NotificationsApi::http_client(config.connect_timeout)?;
        let mut transports = Transports::default();

        if config.method.uses_websocket() {
            transports.websocket = Some(create_websocket_transport(config)?);
        }
        if config.method.uses_sse() {
            transports.sse = Some(create_sse_transport(config, client.clone(), identity)?);
        }
        if config.method.uses_polling() {
            let api = NotificationsApi::new(client, &config.api_url)?;
            transports.poller = Some(Poller::new(Arc::new(api)));
        }
        Ok(transports)
    }
}

/// Activates the transports of one notification method.
#[derive(Clone, Debug)]
pub struct NotificationSelector {
    method: NotificationMethod,
    transports: Transports,
    poll_interval: Duration,
}

impl NotificationSelector {
    // ---
    pub fn new(method: NotificationMethod, transports: Transports, poll_interval: Duration) -> Self {
        Self {
            method,
            transports,
            poll_interval,
        }
    }

    pub fn from_config(config: &NotifyConfig, identity: &UserIdentity) -> Result<Self> {
        // ---
        let transports = Transports::from_config(config, identity)?;
        Ok(Self::new(config.method, transports, config.poll_interval))
    }

    pub fn method(&self) -> NotificationMethod {
        self.method
    }

    pub fn transports(&self) -> &Transports {
        &self.transports
    }

    /// Start delivering notifications for `identity` to `observer`.
    ///
    /// Fails only when the method needs a transport that was not supplied;
    /// connection problems surface through the combined status.
    pub fn activate(
        &self,
        identity: &UserIdentity,
        observer: Arc<dyn NotificationObserver>,
    ) -> Result<Activation> {
        // ---
        let mut managers = Vec::new();
        if self.method.uses_websocket() {
            let ws = self.transports.websocket.clone();
            managers.push(ws.ok_or(NotifyError::MissingTransport("websocket"))?);
        }
        if self.method.uses_sse() {
            let sse = self.transports.sse.clone();
            managers.push(sse.ok_or(NotifyError::MissingTransport("sse"))?);
        }
        let poller = match self.method.uses_polling() {
            true => Some(
                self.transports
                    .poller
                    .clone()
                    .ok_or(NotifyError::MissingTransport("polling"))?,
            ),
            false => None,
        };

        log_info!("notifications: activating {} for {identity}", self.method);

        // Combined status, watched before anything connects.
        let mut members: Vec<(String, Arc<StatusCell>)> = managers
            .iter()
            .map(|m| (m.name().to_string(), m.status_cell()))
            .collect();
        if let Some(poller) = &poller {
            members.push(("polling".to_string(), poller.status_cell()));
        }

        let combiner = Combiner::new(&members, observer.clone());
        let status_subs: Vec<StatusSubscription> = members
            .iter()
            .enumerate()
            .map(|(index, (_, cell))| {
                let combiner = combiner.clone();
                cell.watch(Arc::new(move |status| combiner.member_changed(index, status)))
            })
            .collect();

        // Message delivery.
        let forward = {
            let observer = observer.clone();
            move |envelope: &NotificationEnvelope| {
                observer.on_event(NotificationEvent::Notification(envelope.clone()))
            }
        };

        let mut subscriptions = Vec::new();
        for manager in &managers {
            let topics = match manager.routing() {
                Routing::Destination => identity.destinations(),
                Routing::MessageType => vec![Topic::wildcard()],
            };
            for topic in topics {
                subscriptions.push(manager.subscribe(topic, forward.clone()));
            }
        }

        for manager in &managers {
            if !manager.ensure_connected() {
                log_info!("notifications: {} was disconnected explicitly, leaving it down", manager.name());
            }
        }

        let poll = poller.map(|poller| {
            let listener: Listener = Arc::new(forward.clone());
            poller.start(identity.identifier(), self.poll_interval, listener)
        });

        Ok(Activation {
            method: self.method,
            combined: combiner.combined.clone(),
            parts: Mutex::new(Some(ActiveParts {
                subscriptions,
                status_subs,
                poll,
                managers,
            })),
        })
    }
}

struct CombinerState {
    statuses: Vec<ConnectionStatus>,
}

/// Folds member statuses into the combined one and reports changes.
struct Combiner {
    names: Vec<String>,
    state: Mutex<CombinerState>,
    combined: Arc<StatusCell>,
    observer: Arc<dyn NotificationObserver>,
}

impl Combiner {
    // ---
    fn new(members: &[(String, Arc<StatusCell>)], observer: Arc<dyn NotificationObserver>) -> Arc<Self> {
        // ---
        let statuses: Vec<ConnectionStatus> = members.iter().map(|(_, c)| c.get()).collect();
        let combined = StatusCell::new(ConnectionStatus::combine(statuses.iter().copied()));

        Arc::new(Self {
            names: members.iter().map(|(n, _)| n.clone()).collect(),
            state: Mutex::new(CombinerState { statuses }),
            combined,
            observer,
        })
    }

    fn member_changed(&self, index: usize, status: ConnectionStatus) {
        // ---
        let (entered_error, combined, notice) = {
            let mut state = lock_ignore_poison(&self.state);
            let Some(slot) = state.statuses.get_mut(index) else {
                return;
            };
            let previous = std::mem::replace(slot, status);
            let entered_error = status == ConnectionStatus::Error && previous != ConnectionStatus::Error;

            let combined = ConnectionStatus::combine(state.statuses.iter().copied());
            (entered_error, combined, self.combined.replace(combined))
        };

        if entered_error {
            let name = self.names.get(index).map_or("transport", String::as_str);
            self.observer
                .on_event(NotificationEvent::Error(format!("{name} notifications unavailable")));
        }

        if let Some(notice) = notice {
            notice.fire();
            log_debug!("notifications: combined status {combined}");
            self.observer.on_event(NotificationEvent::StatusChange(combined));
        }
    }
}

struct ActiveParts {
    subscriptions: Vec<Subscription>,
    status_subs: Vec<StatusSubscription>,
    poll: Option<PollHandle>,
    managers: Vec<ConnectionManager>,
}

/// Live wiring created by [`NotificationSelector::activate`].
///
/// Dropping it deactivates.
#[must_use = "dropping the activation stops notification delivery"]
pub struct Activation {
    method: NotificationMethod,
    combined: Arc<StatusCell>,
    parts: Mutex<Option<ActiveParts>>,
}

impl Activation {
    // ---
    pub fn method(&self) -> NotificationMethod {
        self.method
    }

    /// Combined status of every active transport.
    pub fn status(&self) -> ConnectionStatus {
        self.combined.get()
    }

    pub fn on_status_change<F>(&self, listener: F) -> StatusSubscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.combined.watch(Arc::new(listener))
    }

    pub fn is_active(&self) -> bool {
        lock_ignore_poison(&self.parts).is_some()
    }

    /// Release subscriptions, stop polling and close the transports without
    /// marking them as explicitly disconnected. Idempotent.
    pub fn deactivate(&self) {
        // ---
        let Some(parts) = lock_ignore_poison(&self.parts).take() else {
            return;
        };
        let ActiveParts {
            subscriptions,
            status_subs,
            poll,
            managers,
        } = parts;

        drop(subscriptions);
        drop(status_subs);

        if let Some(poll) = poll {
            poll.stop();
        }
        for manager in &managers {
            manager.release();
        }

        self.combined.set(ConnectionStatus::Disconnected);
        log_info!("notifications: {} deactivated", self.method);
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("method", &self.method)
            .field("status", &self.status())
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Default)]
struct SessionState {
    enabled: bool,
    identity: Option<UserIdentity>,
    active: Option<(UserIdentity, Activation)>,
}

/// Keeps one activation in line with who is signed in.
///
/// Notifications are delivered only while the session is enabled and an
/// identity is known; changing either re-activates as needed.
pub struct NotificationSession {
    selector: NotificationSelector,
    observer: Arc<dyn NotificationObserver>,
    state: Mutex<SessionState>,
}

impl NotificationSession {
    // ---
    /// A disabled session with no identity.
    pub fn new(selector: NotificationSelector, observer: Arc<dyn NotificationObserver>) -> Self {
        Self {
            selector,
            observer,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        // ---
        lock_ignore_poison(&self.state).enabled = enabled;
        self.reconcile()
    }

    pub fn set_identity(&self, identity: Option<UserIdentity>) -> Result<()> {
        // ---
        lock_ignore_poison(&self.state).identity = identity;
        self.reconcile()
    }

    /// Set identity and enable in one step (`None` disables).
    pub fn sync(&self, identity: Option<&UserIdentity>) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            state.enabled = identity.is_some();
            state.identity = identity.cloned();
        }
        self.reconcile()
    }

    pub fn status(&self) -> ConnectionStatus {
        lock_ignore_poison(&self.state)
            .active
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, |(_, a)| a.status())
    }

    /// Identity notifications are currently delivered for.
    pub fn active_identity(&self) -> Option<UserIdentity> {
        lock_ignore_poison(&self.state)
            .active
            .as_ref()
            .map(|(who, _)| who.clone())
    }

    fn reconcile(&self) -> Result<()> {
        // ---
        let (stale, wanted) = {
            let mut state = lock_ignore_poison(&self.state);
            let wanted = state.identity.clone().filter(|_| state.enabled);

            let current = state.active.as_ref().map(|(who, _)| who);
            if current == wanted.as_ref() {
                return Ok(());
            }
            (state.active.take(), wanted)
        };

        if let Some((_who, activation)) = stale {
            log_debug!("notifications: leaving session for {_who}");
            activation.deactivate();
        }

        let Some(identity) = wanted else {
            return Ok(());
        };

        let activation = self.selector.activate(&identity, self.observer.clone())?;
        lock_ignore_poison(&self.state).active = Some((identity, activation));
        Ok(())
    }
}

impl fmt::Debug for NotificationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationSession")
            .field("method", &self.selector.method)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_method_parsing() {
        // ---
        assert_eq!("websocket".parse::<NotificationMethod>().unwrap(), NotificationMethod::WebSocket);
        assert_eq!(" BOTH ".parse::<NotificationMethod>().unwrap(), NotificationMethod::Both);
        assert!("smoke-signal".parse::<NotificationMethod>().is_err());

        assert_eq!(NotificationMethod::from_setting(None), NotificationMethod::Sse);
        assert_eq!(NotificationMethod::from_setting(Some("")), NotificationMethod::Sse);
        assert_eq!(NotificationMethod::from_setting(Some("nope")), NotificationMethod::Sse);
        assert_eq!(NotificationMethod::from_setting(Some("polling")), NotificationMethod::Polling);
    }

    #[test]
    fn test_method_transports() {
        // ---
        assert!(NotificationMethod::Both.uses_websocket() && NotificationMethod::Both.uses_sse());
        assert!(!NotificationMethod::Sse.uses_websocket());
        assert!(NotificationMethod::Polling.uses_polling());
        assert!(!NotificationMethod::Polling.uses_sse());
    }

    #[test]
    fn test_missing_transport_is_reported() {
        // ---
        let selector = NotificationSelector::new(
            NotificationMethod::Both,
            Transports::default(),
            Duration::from_secs(30),
        );
        let observer: Arc<dyn NotificationObserver> = Arc::new(|_event: NotificationEvent| {});

        assert!(matches!(
            selector.activate(&UserIdentity::Stpm, observer),
            Err(NotifyError::MissingTransport("websocket"))
        ));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&NotificationMethod::WebSocket).unwrap(), "\"websocket\"");
    }
}
