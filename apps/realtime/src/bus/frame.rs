//! STOMP 1.2 frames: commands, header escaping, and the text wire format.

use std::fmt;

use crate::error::{RealtimeError, Result};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Client → broker
    Connect,
    Subscribe,
    Unsubscribe,
    Send,
    Disconnect,
    // Broker → client
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Disconnect => "DISCONNECT",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "CONNECT" | "STOMP" => Self::Connect,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "SEND" => Self::Send,
            "DISCONNECT" => Self::Disconnect,
            "CONNECTED" => Self::Connected,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(RealtimeError::frame(format!("unknown command {other:?}"))),
        })
    }

    /// CONNECT and CONNECTED headers are sent verbatim (no escaping).
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Header names
// ---------------------------------------------------------------------------

pub struct Header;

impl Header {
    pub const ACCEPT_VERSION: &'static str = "accept-version";
    pub const AUTHORIZATION: &'static str = "Authorization";
    pub const CONTENT_LENGTH: &'static str = "content-length";
    pub const CONTENT_TYPE: &'static str = "content-type";
    pub const DESTINATION: &'static str = "destination";
    pub const HEART_BEAT: &'static str = "heart-beat";
    pub const HOST: &'static str = "host";
    pub const ID: &'static str = "id";
    pub const MESSAGE: &'static str = "message";
    pub const RECEIPT: &'static str = "receipt";
    pub const RECEIPT_ID: &'static str = "receipt-id";
    pub const SESSION: &'static str = "session";
    pub const SUBSCRIPTION: &'static str = "subscription";
    pub const VERSION: &'static str = "version";
}

const JSON: &str = "application/json";

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.body = body.into();
        self.header(Header::CONTENT_TYPE, content_type)
    }

    /// First value for `name`; repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Build a CONNECT frame carrying the bearer credential.
    pub fn connect(host: &str, token: &str) -> Self {
        Self::new(Command::Connect)
            .header(Header::ACCEPT_VERSION, "1.2,1.1")
            .header(Header::HOST, host)
            .header(Header::HEART_BEAT, "0,0")
            .header(Header::AUTHORIZATION, format!("Bearer {token}"))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header(Header::ID, id)
            .header(Header::DESTINATION, destination)
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header(Header::ID, id)
    }

    /// Build a SEND frame with a JSON body.
    pub fn send(destination: &str, json: String) -> Self {
        Self::new(Command::Send)
            .header(Header::DESTINATION, destination)
            .with_body(JSON, json)
    }

    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// Encode to the text wire format, NUL-terminated.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (k, v) in &self.headers {
            if escape {
                out.push_str(&escape_header(k));
                out.push(':');
                out.push_str(&escape_header(v));
            } else {
                out.push_str(k);
                out.push(':');
                out.push_str(v);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get(Header::CONTENT_LENGTH).is_none() {
            out.push_str(Header::CONTENT_LENGTH);
            out.push(':');
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode every frame in a transport message.
    ///
    /// Bare EOLs between frames are heart-beats and are skipped, so a
    /// heart-beat-only message yields an empty vec.
    pub fn decode_all(input: &str) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        let mut rest = input;
        loop {
            rest = rest.trim_start_matches(['\r', '\n']);
            if rest.is_empty() {
                return Ok(frames);
            }
            let (frame, tail) = decode_one(rest)?;
            frames.push(frame);
            rest = tail;
        }
    }
}

fn decode_one(input: &str) -> Result<(Frame, &str)> {
    let (command_line, mut rest) = split_line(input)
        .ok_or_else(|| RealtimeError::frame("missing command line"))?;
    let command = Command::parse(command_line)?;
    let unescape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, tail) =
            split_line(rest).ok_or_else(|| RealtimeError::frame("unterminated headers"))?;
        rest = tail;
        if line.is_empty() {
            break;
        }
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| RealtimeError::frame(format!("header without colon: {line:?}")))?;
        if unescape {
            headers.push((unescape_header(k)?, unescape_header(v)?));
        } else {
            headers.push((k.to_string(), v.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == Header::CONTENT_LENGTH)
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| RealtimeError::frame(format!("bad content-length {v:?}")))
        })
        .transpose()?;

    let body_end = match content_length {
        Some(len) => {
            if rest.len() < len || !rest.is_char_boundary(len) {
                return Err(RealtimeError::frame("body shorter than content-length"));
            }
            if rest.as_bytes().get(len) != Some(&0) {
                return Err(RealtimeError::frame("missing NUL after body"));
            }
            len
        }
        None => rest
            .find('\0')
            .ok_or_else(|| RealtimeError::frame("missing NUL terminator"))?,
    };

    let frame = Frame {
        command,
        headers,
        body: rest[..body_end].to_string(),
    };
    Ok((frame, &rest[body_end + 1..]))
}

/// Split off one line, accepting both `\n` and `\r\n`.
fn split_line(input: &str) -> Option<(&str, &str)> {
    let idx = input.find('\n')?;
    let line = input[..idx].strip_suffix('\r').unwrap_or(&input[..idx]);
    Some((line, &input[idx + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
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
                return Err(RealtimeError::frame(format!(
                    "undefined header escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}
