// src/domain/envelope.rs

//! Notification envelope and observer events.
//!
//! Every transport normalizes what it receives into a [`NotificationEnvelope`]
//! before anything else sees it. The envelope mirrors the backend's wire
//! format:
//!
//! ```json
//! { "type": "notification", "payload": { ... }, "timestamp": "2025-01-01T00:00:00.000Z" }
//! ```
//!
//! Higher layers receive envelopes wrapped in a [`NotificationEvent`] so that
//! status changes and transport errors travel through the same observer.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ConnectionStatus;

/// Current time as an RFC 3339 string with millisecond precision (`...Z`).
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Normalized wrapper around any inbound real-time message.
///
/// Envelopes are immutable once constructed; listeners receive them by
/// reference and clone if they need to keep one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    #[serde(rename = "type")]
    kind: String,

    #[serde(default)]
    payload: Value,

    #[serde(default = "now_timestamp")]
    timestamp: String,
}

impl NotificationEnvelope {
    // ---
    /// Create an envelope stamped with the current time.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: now_timestamp(),
        }
    }

    /// Replace the timestamp (builder style).
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Parse a complete envelope from its JSON wire form.
    ///
    /// `type` is required; `payload` defaults to `null` and `timestamp` to now.
    pub fn from_wire(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Build an envelope from an arbitrary JSON message body.
    ///
    /// Brokers do not always send the full envelope: a bare notification
    /// object is accepted too. Missing `type` falls back to `default_kind`,
    /// a missing or null `payload` means the whole body is the payload, and a
    /// missing `timestamp` is filled with the current time.
    pub fn normalize(value: Value, default_kind: &str) -> Self {
        // ---
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(default_kind)
            .to_string();

        let timestamp = value
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(now_timestamp);

        let inner = value.get("payload").filter(|p| !p.is_null()).cloned();
        let payload = inner.unwrap_or(value);

        Self {
            kind,
            payload,
            timestamp,
        }
    }

    /// The raw `type` field.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Typed classification of [`kind`](Self::kind).
    pub fn classify(&self) -> EnvelopeKind {
        EnvelopeKind::from(self.kind.as_str())
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Look up a string field in the payload, then in a nested `payload`.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        // ---
        self.payload
            .get(field)
            .and_then(Value::as_str)
            .or_else(|| {
                self.payload
                    .get("payload")
                    .and_then(|inner| inner.get(field))
                    .and_then(Value::as_str)
            })
    }

    /// Look up a non-null field in the payload, then in a nested `payload`.
    pub fn payload_field(&self, field: &str) -> Option<&Value> {
        // ---
        self.payload
            .get(field)
            .filter(|v| !v.is_null())
            .or_else(|| {
                self.payload
                    .get("payload")
                    .and_then(|inner| inner.get(field))
                    .filter(|v| !v.is_null())
            })
    }
}

/// Typed view of an envelope's `type`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeKind {
    Notification,
    Error,
    Success,
    Other(String),
}

impl From<&str> for EnvelopeKind {
    fn from(value: &str) -> Self {
        // ---
        match value {
            "notification" => EnvelopeKind::Notification,
            "error" => EnvelopeKind::Error,
            "success" => EnvelopeKind::Success,
            other => EnvelopeKind::Other(other.to_string()),
        }
    }
}

/// Payload the backend attaches to a pushed notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projet_id: Option<i64>,
}

impl NotificationPayload {
    /// Wrap the payload into a `notification` envelope.
    pub fn into_envelope(self) -> NotificationEnvelope {
        // ---
        let payload = serde_json::to_value(&self).unwrap_or(Value::Null);
        NotificationEnvelope::new("notification", payload)
    }
}

/// Event delivered to a [`NotificationObserver`](crate::NotificationObserver).
#[derive(Clone, Debug, PartialEq)]
pub enum NotificationEvent {
    /// An envelope arrived on one of the active transports.
    Notification(NotificationEnvelope),

    /// The combined connection status changed.
    StatusChange(ConnectionStatus),

    /// One transport became unavailable; delivery degrades, nothing is raised.
    Error(String),
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_wire_requires_type() {
        // ---
        assert!(NotificationEnvelope::from_wire(r#"{"payload":{}}"#).is_err());
        assert!(NotificationEnvelope::from_wire("not json").is_err());

        let env = NotificationEnvelope::from_wire(r#"{"type":"success"}"#).unwrap();
        assert_eq!(env.classify(), EnvelopeKind::Success);
        assert_eq!(env.payload(), &Value::Null);
        assert!(!env.timestamp().is_empty());
    }

    #[test]
    fn test_normalize_full_envelope() {
        // ---
        let env = NotificationEnvelope::normalize(
            json!({
                "type": "notification",
                "payload": {"message": "Travaux rue Sherbrooke"},
                "timestamp": "2025-03-01T10:00:00.000Z"
            }),
            "notification",
        );

        assert_eq!(env.kind(), "notification");
        assert_eq!(env.payload_str("message"), Some("Travaux rue Sherbrooke"));
        assert_eq!(env.timestamp(), "2025-03-01T10:00:00.000Z");
    }

    #[test]
    fn test_normalize_bare_body_becomes_payload() {
        // ---
        let body = json!({"id": "7", "message": "Nouveau projet"});
        let env = NotificationEnvelope::normalize(body.clone(), "notification");

        assert_eq!(env.classify(), EnvelopeKind::Notification);
        assert_eq!(env.payload(), &body);
    }

    #[test]
    fn test_nested_payload_lookup() {
        // ---
        let env = NotificationEnvelope::new(
            "notification",
            json!({"payload": {"message": "imbriqué", "projetId": 4}}),
        );

        assert_eq!(env.payload_str("message"), Some("imbriqué"));
        assert_eq!(env.payload_field("projetId"), Some(&json!(4)));
        assert_eq!(env.payload_field("absent"), None);
    }

    #[test]
    fn test_payload_into_envelope_uses_camel_case() {
        // ---
        let env = NotificationPayload {
            id: "12".into(),
            message: Some("Candidature acceptée".into()),
            kind: "STATUT_CHANGE".into(),
            date: "2025-02-11T09:30".into(),
            projet_id: Some(3),
        }
        .into_envelope();

        assert_eq!(env.kind(), "notification");
        assert_eq!(env.payload()["projetId"], json!(3));
        assert_eq!(env.payload()["type"], json!("STATUT_CHANGE"));
    }

    #[test]
    fn test_timestamp_format() {
        // ---
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'), "{ts}");
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
