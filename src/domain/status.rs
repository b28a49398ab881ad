// src/domain/status.rs

//! Connection status and its observable cell.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};

use crate::macros::log_error;

/// Connection status of a transport, a poller, or a combination of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    // ---
    /// Combine the statuses of concurrently active transports.
    ///
    /// - `Connected` if any is connected
    /// - `Connecting` if any is connecting and none connected
    /// - `Error` only if every one is in error
    /// - `Disconnected` otherwise, including for an empty set
    pub fn combine<I>(statuses: I) -> ConnectionStatus
    where
        I: IntoIterator<Item = ConnectionStatus>,
    {
        // ---
        let mut any = false;
        let mut connecting = false;
        let mut all_error = true;

        for status in statuses {
            any = true;
            match status {
                ConnectionStatus::Connected => return ConnectionStatus::Connected,
                ConnectionStatus::Connecting => connecting = true,
                ConnectionStatus::Error => {}
                ConnectionStatus::Disconnected => {}
            }
            if status != ConnectionStatus::Error {
                all_error = false;
            }
        }

        if connecting {
            ConnectionStatus::Connecting
        } else if any && all_error {
            ConnectionStatus::Error
        } else {
            ConnectionStatus::Disconnected
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked with each status transition.
pub type StatusListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Acquire mutex guard, ignoring poisoning
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct CellState {
    current: ConnectionStatus,
    next_id: u64,
    listeners: Vec<(u64, StatusListener)>,
}

/// Observable status value.
///
/// Listeners run outside the internal lock, so they may read the cell (or
/// any other cell) again without deadlocking.
pub(crate) struct StatusCell {
    state: Mutex<CellState>,
}

/// Listeners to notify after a status change, captured under the lock.
#[must_use]
pub(crate) struct StatusNotice {
    status: ConnectionStatus,
    listeners: Vec<StatusListener>,
}

impl StatusNotice {
    pub(crate) fn fire(self) {
        for listener in self.listeners {
            notify_one(&listener, self.status);
        }
    }
}

fn notify_one(listener: &StatusListener, status: ConnectionStatus) {
    // ---
    if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
        log_error!("status listener panicked on {status}");
    }
}

impl StatusCell {
    // ---
    pub(crate) fn new(initial: ConnectionStatus) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState {
                current: initial,
                next_id: 0,
                listeners: Vec::new(),
            }),
        })
    }

    pub(crate) fn get(&self) -> ConnectionStatus {
        lock_ignore_poison(&self.state).current
    }

    /// Store `status`; returns the pending notification if it changed.
    pub(crate) fn replace(&self, status: ConnectionStatus) -> Option<StatusNotice> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.current == status {
            return None;
        }
        state.current = status;

        Some(StatusNotice {
            status,
            listeners: state.listeners.iter().map(|(_, l)| l.clone()).collect(),
        })
    }

    /// Store `status` and notify listeners if it changed.
    ///
    /// Returns true when the value changed.
    pub(crate) fn set(&self, status: ConnectionStatus) -> bool {
        match self.replace(status) {
            Some(notice) => {
                notice.fire();
                true
            }
            None => false,
        }
    }

    /// Register a listener and call it right away with the current status.
    pub(crate) fn watch(self: &Arc<Self>, listener: StatusListener) -> StatusSubscription {
        // ---
        let (id, current) = {
            let mut state = lock_ignore_poison(&self.state);
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.push((id, listener.clone()));
            (id, state.current)
        };

        notify_one(&listener, current);

        StatusSubscription {
            cell: Arc::downgrade(self),
            id,
        }
    }

    fn remove(&self, id: u64) {
        lock_ignore_poison(&self.state)
            .listeners
            .retain(|(lid, _)| *lid != id);
    }
}

/// Registration returned by `on_status_change`.
///
/// Dropping it removes the listener. Removing twice, or after the owner is
/// gone, is a no-op.
#[must_use = "dropping the subscription removes the listener"]
pub struct StatusSubscription {
    cell: Weak<StatusCell>,
    id: u64,
}

impl StatusSubscription {
    /// Remove the listener now.
    pub fn unsubscribe(&mut self) {
        // ---
        if let Some(cell) = self.cell.upgrade() {
            cell.remove(self.id);
        }
        self.cell = Weak::new();
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for StatusSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusSubscription")
            .field("id", &self.id)
            .finish()
    }
}
