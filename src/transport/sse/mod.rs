//! Server-Sent Events connector using `reqwest`.
//!
//! The backend streams per-user events from
//! `GET {api}/notifications/stream/{user}`. The link is receive-only: sends
//! are logged and dropped.
//!
//! ## Event mapping
//!
//! - `connected` events (or data with `"status":"connected"`) confirm the
//!   subscription; they are logged and swallowed
//! - named `notification` events become `notification` envelopes
//! - other events whose data carries a string `type` become envelopes of
//!   that type
//! - anything else is ignored; undecodable data is reported as malformed
//!
//! The server's `retry` hint is not used: reconnection follows the manager's
//! policy like every other transport.

pub mod parser;

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use serde_json::Value;
use url::Url;

use crate::domain::{
    // ---
    now_timestamp,
    Connector,
    Inbound,
    Link,
    NotificationEnvelope,
    Routing,
    Topic,
};
use crate::macros::{log_debug, log_info, log_warn};
use crate::{NotifyError, Result};

use parser::{SseEvent, SseParser};

/// `{api}/notifications/stream/{user}`, with `user` percent-encoded.
pub fn stream_url(api_url: &str, user: &str) -> Result<String> {
    // ---
    let mut url = Url::parse(api_url)?;
    url.path_segments_mut()
        .map_err(|_| NotifyError::InvalidConfig(format!("{api_url} cannot be a base URL")))?
        .pop_if_empty()
        .extend(["notifications", "stream", user]);
    Ok(url.into())
}

/// Connector for the per-user notification event stream.
#[derive(Clone, Debug)]
pub struct SseConnector {
    client: reqwest::Client,
    url: String,
    connect_timeout: Duration,
}

impl SseConnector {
    // ---
    pub fn new(client: reqwest::Client, url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Connector for SseConnector {
    // ---
    fn name(&self) -> &str {
        "sse"
    }

    fn routing(&self) -> Routing {
        Routing::MessageType
    }

    async fn open(&self) -> Result<Box<dyn Link>> {
        // ---
        let request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");

        let response = tokio::time::timeout(self.connect_timeout, request.send())
            .await
            .map_err(|_| NotifyError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Api {
                status: status.as_u16(),
                message: format!("event stream refused: {status}"),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("text/event-stream") {
            return Err(NotifyError::Protocol(format!(
                "expected text/event-stream, got {content_type:?}"
            )));
        }

        log_info!("sse: stream open at {}", self.url);

        Ok(Box::new(SseLink {
            body: response.bytes_stream().boxed(),
            parser: SseParser::new(),
            pending: VecDeque::new(),
        }))
    }
}

struct SseLink {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
}

/// Map one server-sent event to what the manager should see, if anything.
pub(crate) fn decode_event(event: &SseEvent) -> Option<Inbound> {
    // ---
    if event.event == "connected" {
        log_info!("sse: subscription confirmed");
        return None;
    }

    let data: Value = match serde_json::from_str(&event.data) {
        Ok(data) => data,
        Err(err) => {
            return Some(Inbound::Malformed {
                reason: format!("{} event data is not JSON: {err}", event.event),
            })
        }
    };

    if data.get("status").and_then(Value::as_str) == Some("connected") {
        log_info!("sse: subscription confirmed");
        return None;
    }

    let envelope = if event.event == "notification" {
        let payload = data
            .get("payload")
            .filter(|p| !p.is_null())
            .cloned()
            .unwrap_or_else(|| data.clone());
        let timestamp = data
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(now_timestamp);

        NotificationEnvelope::new("notification", payload).with_timestamp(timestamp)
    } else if data.get("type").and_then(Value::as_str).is_some() {
        NotificationEnvelope::normalize(data, "notification")
    } else {
        log_debug!("sse: ignoring untyped {} event", event.event);
        return None;
    };

    Some(Inbound::Envelope {
        route: None,
        envelope,
    })
}

#[async_trait::async_trait]
impl Link for SseLink {
    // ---
    async fn next_frame(&mut self) -> Option<Result<Inbound>> {
        // ---
        loop {
            while let Some(event) = self.pending.pop_front() {
                if let Some(inbound) = decode_event(&event) {
                    return Some(Ok(inbound));
                }
            }

            match self.body.next().await? {
                Ok(chunk) => self.pending.extend(self.parser.feed(&chunk)),
                Err(err) => return Some(Err(err.into())),
            }
        }
    }

    async fn send(&mut self, _destination: &Topic, _body: &str) -> Result<()> {
        // ---
        log_warn!("sse: stream is receive-only, dropping message to {_destination}");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // ---
        self.body = futures_util::stream::empty().boxed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn event(name: &str, data: &str) -> SseEvent {
        SseEvent {
            event: name.into(),
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    #[test]
    fn test_stream_url_encodes_user() {
        // ---
        assert_eq!(
            stream_url("http://localhost:7000/api", "marie test@x.com").unwrap(),
            "http://localhost:7000/api/notifications/stream/marie%20test@x.com"
        );
        assert_eq!(
            stream_url("http://localhost:7000/api/", "stpm").unwrap(),
            "http://localhost:7000/api/notifications/stream/stpm"
        );
    }

    #[test]
    fn test_connected_events_are_swallowed() {
        // ---
        assert_eq!(decode_event(&event("connected", "ok")), None);
        assert_eq!(decode_event(&event("message", r#"{"status":"connected"}"#)), None);
    }

    #[test]
    fn test_named_notification_event() {
        // ---
        let inbound = decode_event(&event(
            "notification",
            r#"{"payload":{"message":"Projet approuvé"},"timestamp":"2025-01-01T00:00:00.000Z"}"#,
        ));

        let Some(Inbound::Envelope { route, envelope }) = inbound else {
            panic!("expected envelope");
        };
        assert_eq!(route, None);
        assert_eq!(envelope.kind(), "notification");
        assert_eq!(envelope.payload_str("message"), Some("Projet approuvé"));
        assert_eq!(envelope.timestamp(), "2025-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_typed_default_event() {
        // ---
        let Some(Inbound::Envelope { envelope, .. }) =
            decode_event(&event("message", r#"{"type":"success","payload":{"message":"ok"}}"#))
        else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.kind(), "success");
    }

    #[test]
    fn test_untyped_and_invalid_events() {
        // ---
        assert_eq!(decode_event(&event("message", r#"{"hello":1}"#)), None);
        assert!(matches!(
            decode_event(&event("notification", "{oops")),
            Some(Inbound::Malformed { .. })
        ));
    }
}
