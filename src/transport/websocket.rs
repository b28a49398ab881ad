//! Raw WebSocket connector using `tokio-tungstenite`.
//!
//! Every text frame carries one complete envelope:
//!
//! ```json
//! {"type":"notification","payload":{...},"timestamp":"..."}
//! ```
//!
//! Binary frames are decoded as UTF-8 and treated the same way. A close frame
//! (or end of stream) ends the link; the manager decides whether to
//! reconnect. Envelopes are routed by their `type`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::domain::{
    // ---
    Connector,
    Inbound,
    Link,
    NotificationEnvelope,
    Routing,
    Topic,
};
use crate::macros::log_debug;
use crate::{NotifyError, Result};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket, bounded by `connect_timeout`.
pub(crate) async fn open_socket(url: &str, connect_timeout: Duration) -> Result<WsStream> {
    // ---
    let (stream, _response) = timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| NotifyError::Timeout)??;

    log_debug!("websocket: connected to {url} ({})", _response.status());
    Ok(stream)
}

/// Text carried by a data frame; `None` for control frames.
pub(crate) fn frame_text(message: Message) -> Option<std::result::Result<String, String>> {
    // ---
    match message {
        Message::Text(text) => Some(Ok(text)),
        Message::Binary(bytes) => Some(String::from_utf8(bytes).map_err(|e| e.to_string())),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
        Message::Close(_) => None,
    }
}

/// Connector for the plain JSON-over-WebSocket protocol.
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    // ---
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    // ---
    fn name(&self) -> &str {
        "websocket"
    }

    fn routing(&self) -> Routing {
        Routing::MessageType
    }

    async fn open(&self) -> Result<Box<dyn Link>> {
        // ---
        let stream = open_socket(&self.url, self.connect_timeout).await?;
        Ok(Box::new(WebSocketLink { stream }))
    }
}

struct WebSocketLink {
    stream: WsStream,
}

#[async_trait::async_trait]
impl Link for WebSocketLink {
    // ---
    async fn next_frame(&mut self) -> Option<Result<Inbound>> {
        // ---
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(err.into())),
            };

            if message.is_close() {
                log_debug!("websocket: close frame received");
                return None;
            }

            let inbound = match frame_text(message) {
                None => continue,
                Some(Err(reason)) => Inbound::Malformed { reason },
                Some(Ok(text)) => match NotificationEnvelope::from_wire(&text) {
                    Ok(envelope) => Inbound::Envelope {
                        route: None,
                        envelope,
                    },
                    Err(err) => Inbound::Malformed {
                        reason: err.to_string(),
                    },
                },
            };

            return Some(Ok(inbound));
        }
    }

    async fn send(&mut self, _destination: &Topic, body: &str) -> Result<()> {
        // ---
        self.stream.send(Message::Text(body.to_string())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // ---
        self.stream.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_frame_text() {
        // ---
        assert_eq!(
            frame_text(Message::Text("{}".into())),
            Some(Ok("{}".to_string()))
        );
        assert_eq!(
            frame_text(Message::Binary(b"{\"type\":\"x\"}".to_vec())),
            Some(Ok("{\"type\":\"x\"}".to_string()))
        );
        assert!(matches!(
            frame_text(Message::Binary(vec![0xff, 0xfe])),
            Some(Err(_))
        ));
        assert_eq!(frame_text(Message::Ping(vec![])), None);
    }

    #[tokio::test]
    async fn test_open_unreachable_fails() {
        // ---
        let connector = WebSocketConnector::new("ws://127.0.0.1:9/ws", Duration::from_secs(2));
        assert!(connector.open().await.is_err());
    }
}
