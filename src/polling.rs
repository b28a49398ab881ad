// src/polling.rs

//! Polling fallback.
//!
//! When no push transport is wanted (or available) the dashboard pulls unread
//! notifications on a timer. Each poll fetches once, maps every record to a
//! `notification` envelope and hands it to the listener; there is no
//! de-duplication across polls, a notification stays unread until the
//! backend marks it read.
//!
//! The timer runs in one tokio task per [`PollHandle`]. Stopping (or dropping)
//! the handle aborts the task, so no fetch starts afterwards.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::UnreadSource;
use crate::domain::{
    // ---
    deliver,
    lock_ignore_poison,
    ConnectionStatus,
    Listener,
    StatusCell,
    StatusSubscription,
};
use crate::macros::{log_debug, log_info, log_warn};

/// Default time between two polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Timer-driven pull of unread notifications.
#[derive(Clone)]
pub struct Poller {
    source: Arc<dyn UnreadSource>,
    status: Arc<StatusCell>,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("status", &self.status.get())
            .finish()
    }
}

impl Poller {
    // ---
    pub fn new(source: Arc<dyn UnreadSource>) -> Self {
        Self {
            source,
            status: StatusCell::new(ConnectionStatus::Disconnected),
        }
    }

    /// `connected` after a successful fetch, `error` after a failed one.
    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    pub fn on_status_change<F>(&self, listener: F) -> StatusSubscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.status.watch(Arc::new(listener))
    }

    pub(crate) fn status_cell(&self) -> Arc<StatusCell> {
        self.status.clone()
    }

    /// Fetch unread notifications for `user` now, then every `every`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, user: &str, every: Duration, listener: Listener) -> PollHandle {
        // ---
        let source = self.source.clone();
        let status = self.status.clone();
        let user = user.to_string();

        log_info!("polling: every {every:?} for {user}");
        status.set(ConnectionStatus::Connecting);

        let task = tokio::spawn(async move {
            // ---
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match source.fetch_unread(&user).await {
                    Ok(records) => {
                        log_debug!("polling: {} unread for {user}", records.len());
                        status.set(ConnectionStatus::Connected);

                        for record in records {
                            let envelope = record.to_payload().into_envelope();
                            deliver(&listener, &envelope, "polling");
                        }
                    }
                    Err(_err) => {
                        log_warn!("polling: fetch for {user} failed: {_err}");
                        status.set(ConnectionStatus::Error);
                    }
                }
            }
        });

        PollHandle {
            task: Mutex::new(Some(task)),
            status: self.status.clone(),
        }
    }
}

/// A running poll loop.
#[must_use = "dropping the handle stops polling"]
pub struct PollHandle {
    task: Mutex<Option<JoinHandle<()>>>,
    status: Arc<StatusCell>,
}

impl PollHandle {
    // ---
    /// Cancel the timer. Idempotent.
    pub fn stop(&self) {
        // ---
        let task = lock_ignore_poison(&self.task).take();
        if let Some(task) = task {
            task.abort();
            self.status.set(ConnectionStatus::Disconnected);
            log_debug!("polling: stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock_ignore_poison(&self.task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for PollHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollHandle")
            .field("running", &self.is_running())
            .finish()
    }
}
