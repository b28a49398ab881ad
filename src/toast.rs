// src/toast.rs

//! Toast adapter: turns notification events into user-facing alerts.
//!
//! [`ToastNotifier`] is a [`NotificationObserver`]; plug it into
//! [`NotificationSelector::activate`](crate::NotificationSelector::activate)
//! and choose where toasts go with a [`ToastSink`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::domain::{ConnectionStatus, EnvelopeKind, NotificationEnvelope, NotificationEvent};
use crate::macros::{log_debug, log_error, log_info, log_warn};
use crate::selector::{NotificationMethod, NotificationObserver};

/// Where the "Voir" action of a project notification points.
pub const DEFAULT_PROJECTS_PATH: &str = "/prestataires/projets";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Info,
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToastAction {
    pub label: String,
    pub href: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ToastAction>,
}

/// Display surface for toasts.
pub trait ToastSink: Send + Sync + 'static {
    fn show(&self, toast: Toast);
}

impl<F> ToastSink for F
where
    F: Fn(Toast) + Send + Sync + 'static,
{
    fn show(&self, toast: Toast) {
        self(toast)
    }
}

/// Writes toasts to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingToastSink;

impl ToastSink for TracingToastSink {
    fn show(&self, toast: Toast) {
        // ---
        let description = toast.description.as_deref().unwrap_or_default();
        match toast.level {
            ToastLevel::Error => log_error!("[toast] {} {description}", toast.message),
            ToastLevel::Info | ToastLevel::Success => {
                log_info!("[toast:{:?}] {} {description}", toast.level, toast.message)
            }
        }
    }
}

/// Forwards toasts to a tokio channel. A closed receiver drops them.
#[derive(Clone, Debug)]
pub struct ChannelToastSink(pub mpsc::UnboundedSender<Toast>);

impl ToastSink for ChannelToastSink {
    fn show(&self, toast: Toast) {
        if self.0.send(toast).is_err() {
            log_debug!("toast: receiver gone, dropping toast");
        }
    }
}

/// Observer that shows one toast per displayable envelope.
pub struct ToastNotifier<S> {
    sink: S,
    method: NotificationMethod,
    enabled: AtomicBool,
    projects_path: String,
}

impl<S: ToastSink> ToastNotifier<S> {
    // ---
    pub fn new(sink: S, method: NotificationMethod) -> Self {
        Self {
            sink,
            method,
            enabled: AtomicBool::new(true),
            projects_path: DEFAULT_PROJECTS_PATH.to_string(),
        }
    }

    pub fn with_projects_path(mut self, path: impl Into<String>) -> Self {
        self.projects_path = path.into();
        self
    }

    /// A disabled notifier drops every envelope.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Toast for `envelope`, if its type is displayable.
    pub fn toast_for(&self, envelope: &NotificationEnvelope) -> Option<Toast> {
        // ---
        let text = |field| {
            envelope
                .payload_str(field)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let message = text("message");

        match envelope.classify() {
            EnvelopeKind::Notification => {
                let action = envelope.payload_field("projetId").map(|_| ToastAction {
                    label: "Voir".to_string(),
                    href: self.projects_path.clone(),
                });
                Some(Toast {
                    level: ToastLevel::Info,
                    message: message.unwrap_or_else(|| "Nouvelle notification".to_string()),
                    description: text("type"),
                    action,
                })
            }
            EnvelopeKind::Error => Some(Toast {
                level: ToastLevel::Error,
                message: message.unwrap_or_else(|| "Une erreur est survenue".to_string()),
                description: None,
                action: None,
            }),
            EnvelopeKind::Success => Some(Toast {
                level: ToastLevel::Success,
                message: message.unwrap_or_else(|| "Opération réussie".to_string()),
                description: None,
                action: None,
            }),
            EnvelopeKind::Other(_kind) => {
                log_debug!("toast: no toast for {_kind} envelopes");
                None
            }
        }
    }
}

impl<S: ToastSink> NotificationObserver for ToastNotifier<S> {
    fn on_event(&self, event: NotificationEvent) {
        // ---
        match event {
            NotificationEvent::Notification(envelope) => {
                if !self.is_enabled() {
                    return;
                }
                if let Some(toast) = self.toast_for(&envelope) {
                    self.sink.show(toast);
                }
            }
            NotificationEvent::StatusChange(ConnectionStatus::Connected) => {
                log_info!("Notifications {} activées", self.method);
            }
            NotificationEvent::StatusChange(ConnectionStatus::Error) => {
                log_warn!("Notifications {}: connexion en erreur", self.method);
            }
            NotificationEvent::StatusChange(_) => {}
            NotificationEvent::Error(_reason) => {
                log_warn!("Notifications {}: {_reason}", self.method);
            }
        }
    }
}

impl<S> fmt::Debug for ToastNotifier<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToastNotifier")
            .field("method", &self.method)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("projects_path", &self.projects_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    fn collecting() -> (ToastNotifier<impl ToastSink>, Arc<Mutex<Vec<Toast>>>) {
        // ---
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |toast: Toast| seen.lock().unwrap().push(toast)
        };
        (ToastNotifier::new(sink, NotificationMethod::Sse), seen)
    }

    fn notify(notifier: &ToastNotifier<impl ToastSink>, kind: &str, payload: Value) {
        notifier.on_event(NotificationEvent::Notification(NotificationEnvelope::new(kind, payload)));
    }

    #[test]
    fn test_project_notification_has_action() {
        // ---
        let (notifier, seen) = collecting();
        notify(
            &notifier,
            "notification",
            json!({"message": "Nouvelle candidature", "type": "CANDIDATURE", "projetId": 9}),
        );

        let toasts = seen.lock().unwrap();
        assert_eq!(
            toasts[0],
            Toast {
                level: ToastLevel::Info,
                message: "Nouvelle candidature".into(),
                description: Some("CANDIDATURE".into()),
                action: Some(ToastAction {
                    label: "Voir".into(),
                    href: DEFAULT_PROJECTS_PATH.into()
                }),
            }
        );
    }

    #[test]
    fn test_nested_payload_and_fallbacks() {
        // ---
        let (notifier, seen) = collecting();
        notify(&notifier, "notification", json!({"payload": {"message": "Rue fermée", "projetId": 3}}));
        notify(&notifier, "notification", json!({}));
        notify(&notifier, "error", Value::Null);
        notify(&notifier, "success", json!({"message": "Enregistré"}));

        let toasts = seen.lock().unwrap();
        assert_eq!(toasts[0].message, "Rue fermée");
        assert!(toasts[0].action.is_some());
        assert_eq!(toasts[1].message, "Nouvelle notification");
        assert_eq!(toasts[1].action, None);
        assert_eq!(toasts[2].message, "Une erreur est survenue");
        assert_eq!(toasts[2].level, ToastLevel::Error);
        assert_eq!(toasts[3].message, "Enregistré");
    }

    #[test]
    fn test_empty_strings_use_fallbacks() {
        // ---
        let (notifier, seen) = collecting();
        notify(&notifier, "notification", json!({"message": "", "type": ""}));
        notify(&notifier, "error", json!({"message": ""}));
        notify(&notifier, "success", json!({"message": ""}));

        let toasts = seen.lock().unwrap();
        assert_eq!(toasts[0].message, "Nouvelle notification");
        assert_eq!(toasts[0].description, None);
        assert_eq!(toasts[1].message, "Une erreur est survenue");
        assert_eq!(toasts[2].message, "Opération réussie");
    }

    #[test]
    fn test_polled_record_without_message_uses_fallback() {
        // ---
        let record: crate::NotificationRecord =
            serde_json::from_value(json!({"id": 3, "typeChangement": "ENTRAVE"})).unwrap();
        let (notifier, seen) = collecting();
        notifier.on_event(NotificationEvent::Notification(record.to_payload().into_envelope()));

        let toasts = seen.lock().unwrap();
        assert_eq!(toasts[0].message, "Nouvelle notification");
        assert_eq!(toasts[0].description.as_deref(), Some("ENTRAVE"));
    }

    #[test]
    fn test_unknown_kinds_and_disabled_notifier() {
        // ---
        let (notifier, seen) = collecting();
        notify(&notifier, "PING", json!({"message": "x"}));
        notifier.set_enabled(false);
        notify(&notifier, "notification", json!({"message": "hidden"}));
        notifier.on_event(NotificationEvent::StatusChange(ConnectionStatus::Connected));

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_channel_sink_forwards() {
        // ---
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = ToastNotifier::new(ChannelToastSink(tx), NotificationMethod::Both)
            .with_projects_path("/projets");
        notify(&notifier, "notification", json!({"message": "ok", "projetId": 1}));

        let toast = rx.try_recv().unwrap();
        assert_eq!(toast.action.unwrap().href, "/projets");
    }
}
