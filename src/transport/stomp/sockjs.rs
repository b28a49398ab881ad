//! SockJS WebSocket-transport framing.
//!
//! Spring endpoints registered with `withSockJS()` wrap every payload in a
//! one-letter frame:
//!
//! - `o` open
//! - `h` heartbeat
//! - `a["msg1","msg2"]` a batch of messages
//! - `m"msg"` a single message
//! - `c[3000,"Go away!"]` close
//!
//! Client-to-server messages are plain JSON arrays of strings.

use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::{NotifyError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SockJsFrame {
    Open,
    Heartbeat,
    Messages(Vec<String>),
    Close { code: u16, reason: String },
}

impl SockJsFrame {
    // ---
    pub fn parse(text: &str) -> Result<Self> {
        // ---
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| NotifyError::Protocol("empty SockJS frame".into()))?;
        let rest = chars.as_str();

        match kind {
            'o' => Ok(SockJsFrame::Open),
            'h' => Ok(SockJsFrame::Heartbeat),
            'a' => Ok(SockJsFrame::Messages(serde_json::from_str(rest)?)),
            'm' => Ok(SockJsFrame::Messages(vec![serde_json::from_str(rest)?])),
            'c' => {
                let (code, reason): (u16, String) = serde_json::from_str(rest)?;
                Ok(SockJsFrame::Close { code, reason })
            }
            other => Err(NotifyError::Protocol(format!(
                "unknown SockJS frame type: {other}"
            ))),
        }
    }
}

/// Wrap outgoing messages for the server.
pub fn encode(messages: &[&str]) -> String {
    // ---
    Value::from(messages.iter().map(|m| Value::from(*m)).collect::<Vec<_>>()).to_string()
}

/// Raw-WebSocket URL of a fresh SockJS session under `endpoint`:
/// `{endpoint}/{server-id}/{session-id}/websocket`.
///
/// `http`/`https` endpoints are mapped to `ws`/`wss`.
pub fn session_url(endpoint: &str) -> Result<String> {
    // ---
    let mut url = Url::parse(endpoint)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(NotifyError::InvalidConfig(format!(
                "unsupported SockJS scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| NotifyError::InvalidConfig(format!("cannot use scheme {scheme}")))?;

    let session = Uuid::new_v4();
    let server = u16::from_be_bytes([session.as_bytes()[0], session.as_bytes()[1]]) % 1000;

    url.path_segments_mut()
        .map_err(|_| NotifyError::InvalidConfig(format!("{endpoint} cannot be a base URL")))?
        .pop_if_empty()
        .push(&format!("{server:03}"))
        .push(&session.simple().to_string())
        .push("websocket");

    Ok(url.into())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_parse_frames() {
        // ---
        assert_eq!(SockJsFrame::parse("o").unwrap(), SockJsFrame::Open);
        assert_eq!(SockJsFrame::parse("h").unwrap(), SockJsFrame::Heartbeat);
        assert_eq!(
            SockJsFrame::parse(r#"a["CONNECTED\nversion:1.2\n\n\u0000"]"#).unwrap(),
            SockJsFrame::Messages(vec!["CONNECTED\nversion:1.2\n\n\0".into()])
        );
        assert_eq!(
            SockJsFrame::parse(r#"c[3000,"Go away!"]"#).unwrap(),
            SockJsFrame::Close {
                code: 3000,
                reason: "Go away!".into()
            }
        );
        assert!(SockJsFrame::parse("").is_err());
        assert!(SockJsFrame::parse("x").is_err());
        assert!(SockJsFrame::parse("a[1").is_err());
    }

    #[test]
    fn test_encode_escapes_control_characters() {
        assert_eq!(encode(&["SEND\n\n\0"]), r#"["SEND\n\n\u0000"]"#);
    }

    #[test]
    fn test_session_url_layout() {
        // ---
        let url = session_url("http://localhost:7000/ws").unwrap();
        let parts: Vec<&str> = url.split('/').collect();

        assert!(url.starts_with("ws://localhost:7000/ws/"), "{url}");
        assert_eq!(parts.len(), 7);
        assert_eq!(parts[4].len(), 3);
        assert_eq!(parts[5].len(), 32);
        assert_eq!(parts[6], "websocket");
    }

    #[test]
    fn test_session_url_secure_and_trailing_slash() {
        // ---
        let url = session_url("https://maville.example/ws/").unwrap();
        assert!(url.starts_with("wss://maville.example/ws/"), "{url}");
        assert!(!url["wss://".len()..].contains("//"), "{url}");
    }
}
