//! STOMP 1.2 connector over a WebSocket, optionally inside SockJS framing.
//!
//! ## Connection behavior
//!
//! Opening a link performs the full handshake before returning:
//!
//! 1. WebSocket connect (to a fresh SockJS session URL when enabled)
//! 2. SockJS `o` frame
//! 3. `CONNECT` with `accept-version:1.2`, `host` and `heart-beat`
//! 4. `CONNECTED` from the broker; an `ERROR` frame fails the attempt
//!
//! The whole handshake is bounded by the connect timeout.
//!
//! ## Message delivery semantics
//!
//! `MESSAGE` bodies are normalized into envelopes (a bare JSON object becomes
//! the payload of a `notification` envelope) and routed by their
//! `destination` header. An `ERROR` frame on a live link ends it. Client
//! heart-beats are sent at the negotiated interval; incoming heart-beats are
//! consumed and otherwise ignored.

pub mod frame;
pub mod sockjs;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::domain::{
    // ---
    Connector,
    Inbound,
    Link,
    NotificationEnvelope,
    Routing,
    Topic,
};
use crate::macros::{log_debug, log_info, log_warn};
use crate::transport::websocket::{frame_text, open_socket, WsStream};
use crate::{NotifyError, Result};

use frame::{StompDecoder, StompFrame};
use sockjs::SockJsFrame;

/// Connector for a Spring-style STOMP endpoint.
#[derive(Clone, Debug)]
pub struct StompConnector {
    url: String,
    sockjs: bool,
    heartbeat: Duration,
    connect_timeout: Duration,
}

impl StompConnector {
    // ---
    /// `url` is the endpoint (`ws://host/ws` or, with SockJS, `http://host/ws`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sockjs: true,
            heartbeat: Duration::from_secs(4),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_sockjs(mut self, sockjs: bool) -> Self {
        self.sockjs = sockjs;
        self
    }

    /// Outgoing heart-beat we offer and incoming one we ask for. Zero disables.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Value of the `host` header: the endpoint's authority.
    fn virtual_host(&self) -> String {
        // ---
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| {
                let host = u.host_str()?.to_string();
                Some(match u.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host,
                })
            })
            .unwrap_or_else(|| "localhost".to_string())
    }

    async fn handshake(&self) -> Result<StompLink> {
        // ---
        let url = if self.sockjs {
            sockjs::session_url(&self.url)?
        } else {
            self.url.clone()
        };

        let stream = open_socket(&url, self.connect_timeout).await?;
        let mut link = StompLink {
            stream,
            sockjs: self.sockjs,
            decoder: StompDecoder::new(),
            pending: VecDeque::new(),
            subscriptions: HashMap::new(),
            next_sub: 0,
            heartbeat: None,
            sockjs_open: !self.sockjs,
        };

        let heart_beat = format!("{0},{0}", self.heartbeat.as_millis());
        let connect = StompFrame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", self.virtual_host())
            .header("heart-beat", heart_beat);

        if self.sockjs {
            link.await_sockjs_open().await?;
        }
        link.write(&connect).await?;

        let connected = loop {
            match link.next_stomp().await {
                None => return Err(NotifyError::Connection("closed during handshake".into())),
                Some(Err(err)) => return Err(err),
                Some(Ok(frame)) if frame.command == "CONNECTED" => break frame,
                Some(Ok(frame)) if frame.command == "ERROR" => {
                    return Err(NotifyError::Stomp(error_text(&frame)));
                }
                Some(Ok(frame)) => {
                    log_debug!("stomp: ignoring {} before CONNECTED", frame.command);
                }
            }
        };

        let send_every = negotiate_heartbeat(self.heartbeat, connected.get("heart-beat"));
        if let Some(period) = send_every {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            link.heartbeat = Some(ticker);
        }

        log_info!(
            "stomp: connected (server {}, heart-beat {send_every:?})",
            connected.get("server").unwrap_or("unknown")
        );
        Ok(link)
    }
}

#[async_trait::async_trait]
impl Connector for StompConnector {
    // ---
    fn name(&self) -> &str {
        "stomp"
    }

    fn routing(&self) -> Routing {
        Routing::Destination
    }

    async fn open(&self) -> Result<Box<dyn Link>> {
        // ---
        let link = timeout(self.connect_timeout, self.handshake())
            .await
            .map_err(|_| NotifyError::Timeout)??;
        Ok(Box::new(link))
    }
}

/// How often the client must send heart-beats, given what it offers and the
/// `heart-beat` header of CONNECTED (`sx,sy`).
///
/// The period is `max(offered, sy)`; zero on either side disables it.
pub fn negotiate_heartbeat(offered: Duration, server: Option<&str>) -> Option<Duration> {
    // ---
    if offered.is_zero() {
        return None;
    }

    let wanted_by_server = server
        .and_then(|hb| hb.split_once(','))
        .and_then(|(_, sy)| sy.trim().parse::<u64>().ok())
        .unwrap_or(0);

    if wanted_by_server == 0 {
        return None;
    }
    Some(offered.max(Duration::from_millis(wanted_by_server)))
}

fn error_text(frame: &StompFrame) -> String {
    // ---
    match (frame.get("message"), frame.body.trim()) {
        (Some(message), "") => message.to_string(),
        (Some(message), body) => format!("{message}: {body}"),
        (None, body) => body.to_string(),
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

struct StompLink {
    stream: WsStream,
    sockjs: bool,
    decoder: StompDecoder,
    pending: VecDeque<StompFrame>,
    subscriptions: HashMap<Topic, String>,
    next_sub: u64,
    heartbeat: Option<Interval>,
    sockjs_open: bool,
}

impl StompLink {
    // ---
    async fn write_text(&mut self, text: &str) -> Result<()> {
        // ---
        let payload = if self.sockjs {
            sockjs::encode(&[text])
        } else {
            text.to_string()
        };
        self.stream.send(Message::Text(payload)).await?;
        Ok(())
    }

    async fn write(&mut self, frame: &StompFrame) -> Result<()> {
        self.write_text(&frame.encode()).await
    }

    async fn await_sockjs_open(&mut self) -> Result<()> {
        // ---
        while !self.sockjs_open {
            let message = self
                .stream
                .next()
                .await
                .ok_or_else(|| NotifyError::Connection("closed before SockJS open".into()))??;

            if let Some(Ok(text)) = frame_text(message) {
                match SockJsFrame::parse(&text)? {
                    SockJsFrame::Open => self.sockjs_open = true,
                    SockJsFrame::Close { code, reason } => {
                        return Err(NotifyError::Connection(format!(
                            "SockJS closed: {code} {reason}"
                        )));
                    }
                    other => {
                        return Err(NotifyError::Protocol(format!(
                            "expected SockJS open, got {other:?}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Feed one WebSocket text payload into the decoder.
    ///
    /// Returns false when the server closed the SockJS session.
    fn absorb(&mut self, text: &str) -> Result<bool> {
        // ---
        if !self.sockjs {
            self.pending.extend(self.decoder.push(text)?);
            return Ok(true);
        }

        match SockJsFrame::parse(text)? {
            SockJsFrame::Open | SockJsFrame::Heartbeat => Ok(true),
            SockJsFrame::Messages(messages) => {
                for message in messages {
                    self.pending.extend(self.decoder.push(&message)?);
                }
                Ok(true)
            }
            SockJsFrame::Close { code: _code, reason: _reason } => {
                log_info!("stomp: SockJS session closed ({_code} {_reason})");
                Ok(false)
            }
        }
    }

    /// Next complete STOMP frame, sending heart-beats while waiting.
    async fn next_stomp(&mut self) -> Option<Result<StompFrame>> {
        // ---
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }

            tokio::select! {
                _ = tick(&mut self.heartbeat) => {
                    if let Err(err) = self.write_text("\n").await {
                        return Some(Err(err));
                    }
                }
                message = self.stream.next() => {
                    let message = match message? {
                        Ok(message) => message,
                        Err(err) => return Some(Err(err.into())),
                    };

                    if message.is_close() {
                        return None;
                    }

                    match frame_text(message) {
                        None => {}
                        Some(Err(reason)) => return Some(Err(NotifyError::Protocol(reason))),
                        Some(Ok(text)) => match self.absorb(&text) {
                            Ok(true) => {}
                            Ok(false) => return None,
                            Err(err) => return Some(Err(err)),
                        },
                    }
                }
            }
        }
    }
}

/// Envelope carried by a MESSAGE frame.
fn message_to_inbound(frame: StompFrame) -> Inbound {
    // ---
    let route = frame.get("destination").map(Topic::from);

    match serde_json::from_str(&frame.body) {
        Ok(value) => Inbound::Envelope {
            route,
            envelope: NotificationEnvelope::normalize(value, "notification"),
        },
        Err(err) => Inbound::Malformed {
            reason: format!("MESSAGE body is not JSON: {err}"),
        },
    }
}

#[async_trait::async_trait]
impl Link for StompLink {
    // ---
    async fn next_frame(&mut self) -> Option<Result<Inbound>> {
        // ---
        loop {
            let frame = match self.next_stomp().await? {
                Ok(frame) => frame,
                Err(err) => return Some(Err(err)),
            };

            match frame.command.as_str() {
                "MESSAGE" => return Some(Ok(message_to_inbound(frame))),
                "ERROR" => return Some(Err(NotifyError::Stomp(error_text(&frame)))),
                _other => log_debug!("stomp: ignoring {_other} frame"),
            }
        }
    }

    async fn send(&mut self, destination: &Topic, body: &str) -> Result<()> {
        // ---
        let frame = StompFrame::new("SEND")
            .header("destination", destination.as_str())
            .header("content-type", "application/json")
            .with_body(body);
        self.write(&frame).await
    }

    async fn subscribe(&mut self, topic: &Topic) -> Result<()> {
        // ---
        if self.subscriptions.contains_key(topic) {
            return Ok(());
        }

        let id = format!("sub-{}", self.next_sub);
        self.next_sub += 1;

        let frame = StompFrame::new("SUBSCRIBE")
            .header("id", id.as_str())
            .header("destination", topic.as_str())
            .header("ack", "auto");
        self.write(&frame).await?;

        log_debug!("stomp: subscribed {topic} as {id}");
        self.subscriptions.insert(topic.clone(), id);
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<()> {
        // ---
        let Some(id) = self.subscriptions.remove(topic) else {
            return Ok(());
        };
        self.write(&StompFrame::new("UNSUBSCRIBE").header("id", id)).await
    }

    async fn close(&mut self) -> Result<()> {
        // ---
        if let Err(_err) = self.write(&StompFrame::new("DISCONNECT")).await {
            log_warn!("stomp: DISCONNECT not delivered: {_err}");
        }
        self.stream.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_negotiate_heartbeat() {
        // ---
        let four = Duration::from_secs(4);

        assert_eq!(negotiate_heartbeat(four, Some("10000,10000")), Some(Duration::from_secs(10)));
        assert_eq!(negotiate_heartbeat(four, Some("0,1000")), Some(four));
        assert_eq!(negotiate_heartbeat(four, Some("10000,0")), None);
        assert_eq!(negotiate_heartbeat(four, None), None);
        assert_eq!(negotiate_heartbeat(Duration::ZERO, Some("0,1000")), None);
    }

    #[test]
    fn test_message_body_is_normalized_and_routed() {
        // ---
        let frame = StompFrame::new("MESSAGE")
            .header("destination", "/topic/notifications/residents")
            .with_body(r#"{"id":"3","message":"Entrave rue Saint-Denis","type":"ENTRAVE"}"#);

        match message_to_inbound(frame) {
            Inbound::Envelope { route, envelope } => {
                assert_eq!(route, Some(Topic::from("/topic/notifications/residents")));
                assert_eq!(envelope.kind(), "ENTRAVE");
                assert_eq!(envelope.payload_str("message"), Some("Entrave rue Saint-Denis"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_message_without_type_defaults_to_notification() {
        // ---
        let frame = StompFrame::new("MESSAGE")
            .header("destination", "/topic/notifications")
            .with_body(r#"{"message":"Bonjour"}"#);

        let Inbound::Envelope { envelope, .. } = message_to_inbound(frame) else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.kind(), "notification");
    }

    #[test]
    fn test_non_json_message_is_malformed() {
        // ---
        let frame = StompFrame::new("MESSAGE").with_body("plain text");
        assert!(matches!(message_to_inbound(frame), Inbound::Malformed { .. }));
    }

    #[test]
    fn test_error_text() {
        // ---
        let frame = StompFrame::new("ERROR")
            .header("message", "Access denied")
            .with_body("no such destination");
        assert_eq!(error_text(&frame), "Access denied: no such destination");
        assert_eq!(error_text(&StompFrame::new("ERROR").header("message", "x")), "x");
    }

    #[test]
    fn test_virtual_host() {
        // ---
        assert_eq!(StompConnector::new("http://localhost:7000/ws").virtual_host(), "localhost:7000");
        assert_eq!(StompConnector::new("wss://maville.example/ws").virtual_host(), "maville.example");
    }
}
