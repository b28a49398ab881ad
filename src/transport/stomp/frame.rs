//! STOMP 1.2 frame codec.
//!
//! ```text
//! COMMAND
//! header1:value1
//! header2:value2
//!
//! body^@
//! ```
//!
//! Header values are escaped (`\\`, `\n`, `\r`, `\c`) except in CONNECT and
//! CONNECTED frames. A `content-length` header, when present, takes
//! precedence over the NUL terminator for locating the end of the body. Bare
//! end-of-line sequences between frames are heart-beats.

use crate::{NotifyError, Result};

/// One STOMP frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    // ---
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header (builder style).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`. Repeated headers keep the first
    /// occurrence, as STOMP 1.2 requires.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn escapes_headers(command: &str) -> bool {
        command != "CONNECT" && command != "CONNECTED"
    }

    /// Serialize to wire text, NUL terminator included.
    ///
    /// `content-length` is added for non-empty bodies unless already set.
    pub fn encode(&self) -> String {
        // ---
        let escape_headers = Self::escapes_headers(&self.command);
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);

        out.push_str(&self.command);
        out.push('\n');

        for (name, value) in &self.headers {
            if escape_headers {
                out.push_str(&escape(name));
                out.push(':');
                out.push_str(&escape(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }

        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

pub fn escape(value: &str) -> String {
    // ---
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape`]. Undefined escape sequences are a protocol error.
pub fn unescape(value: &str) -> Result<String> {
    // ---
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(NotifyError::Protocol(format!(
                    "invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Largest body accepted through `content-length`.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

/// Incremental decoder: WebSocket messages may split or batch frames.
#[derive(Debug, Default)]
pub struct StompDecoder {
    buffer: String,
}

impl StompDecoder {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` and return every complete frame it finishes.
    ///
    /// Heart-beats are consumed silently.
    pub fn push(&mut self, text: &str) -> Result<Vec<StompFrame>> {
        // ---
        self.buffer.push_str(text);
        let mut frames = Vec::new();

        loop {
            let start = self.buffer.len() - self.buffer.trim_start_matches(['\n', '\r']).len();
            self.buffer.drain(..start);

            match self.take_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(err) => {
                    self.buffer.clear();
                    return Err(err);
                }
            }
        }
        Ok(frames)
    }

    fn take_frame(&mut self) -> Result<Option<StompFrame>> {
        // ---
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let Some((head_len, sep_len)) = find_header_end(&self.buffer) else {
            return Ok(None);
        };

        let head = &self.buffer[..head_len];
        let mut lines = head.lines();
        let command = lines.next().unwrap_or_default().trim_end_matches('\r').to_string();
        if command.is_empty() {
            return Err(NotifyError::Protocol("frame without command".into()));
        }

        let escaped = StompFrame::escapes_headers(&command);
        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let Some((name, value)) = line.split_once(':') else {
                return Err(NotifyError::Protocol(format!("malformed header: {line}")));
            };
            if escaped {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let body_start = head_len + sep_len;
        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| NotifyError::Protocol(format!("bad content-length: {v}")))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) if len > MAX_BODY_LEN => {
                return Err(NotifyError::Protocol(format!(
                    "content-length {len} exceeds {MAX_BODY_LEN}"
                )));
            }
            Some(len) => {
                let end = body_start
                    .checked_add(len)
                    .ok_or_else(|| NotifyError::Protocol(format!("bad content-length: {len}")))?;
                if self.buffer.len() <= end {
                    return Ok(None);
                }
                if self.buffer.as_bytes()[end] != 0 {
                    return Err(NotifyError::Protocol(
                        "frame body not NUL-terminated".into(),
                    ));
                }
                end
            }
            None => match self.buffer[body_start..].find('\0') {
                Some(offset) => body_start + offset,
                None => return Ok(None),
            },
        };

        let body = self
            .buffer
            .get(body_start..body_end)
            .ok_or_else(|| NotifyError::Protocol("content-length splits a character".into()))?
            .to_string();

        self.buffer.drain(..=body_end);

        Ok(Some(StompFrame {
            command,
            headers,
            body,
        }))
    }
}

/// Offset of the blank line ending the headers, and its length.
fn find_header_end(buffer: &str) -> Option<(usize, usize)> {
    // ---
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));

    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parse every frame in `text`, which must hold only whole frames.
pub fn parse_frames(text: &str) -> Result<Vec<StompFrame>> {
    // ---
    let mut decoder = StompDecoder::new();
    let frames = decoder.push(text)?;

    if !decoder.buffer.is_empty() {
        return Err(NotifyError::Protocol("truncated frame".into()));
    }
    Ok(frames)
}
