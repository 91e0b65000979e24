//! STOMP 1.2 frame codec.

use std::fmt;

use bytes::Bytes;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StompError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("malformed header line `{0}`")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header")]
    BadEscape,
    #[error("frame is not terminated")]
    Unterminated,
    #[error("invalid content-length `{0}`")]
    BadContentLength(String),
    #[error("frame header is not utf-8")]
    Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(raw: &str) -> Result<Self, StompError> {
        Ok(match raw {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => return Err(StompError::UnknownCommand(other.to_string())),
        })
    }

    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: Command,
    /// Kept in wire order; on repeated keys the first one wins.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StompFrame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, heartbeat: (u64, u64)) -> Self {
        StompFrame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1))
    }

    pub fn send(destination: &str, body: impl Into<Bytes>) -> Self {
        StompFrame::new(Command::Send)
            .header("destination", destination)
            .with_body(body)
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        StompFrame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn disconnect() -> Self {
        StompFrame::new(Command::Disconnect)
    }

    /// Negotiated heart-beat periods in milliseconds, `(send, expect)`, given
    /// what the client asked for. Zero disables that direction.
    pub fn negotiate_heartbeat(&self, requested: (u64, u64)) -> (u64, u64) {
        let (server_send, server_expect) = self
            .get("heart-beat")
            .and_then(|raw| raw.split_once(','))
            .and_then(|(a, b)| Some((a.trim().parse::<u64>().ok()?, b.trim().parse::<u64>().ok()?)))
            .unwrap_or((0, 0));
        let send = if requested.0 == 0 || server_expect == 0 {
            0
        } else {
            requested.0.max(server_expect)
        };
        let expect = if requested.1 == 0 || server_send == 0 {
            0
        } else {
            requested.1.max(server_send)
        };
        (send, expect)
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = self.command.escapes_headers();
        let mut out = Vec::with_capacity(self.body.len() + 64);
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (key, value) in &self.headers {
            if key == "content-length" {
                continue;
            }
            push_header_part(&mut out, key, escape);
            out.push(b':');
            push_header_part(&mut out, value, escape);
            out.push(b'\n');
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }
}

fn push_header_part(out: &mut Vec<u8>, text: &str, escape: bool) {
    if !escape {
        out.extend_from_slice(text.as_bytes());
        return;
    }
    for ch in text.chars() {
        match ch {
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            ':' => out.extend_from_slice(b"\\c"),
            other => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn unescape(text: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::BadEscape),
        }
    }
    Ok(out)
}

/// Parses every frame in one transport message. Bare EOLs between frames are
/// heart-beats and yield nothing.
pub fn parse_frames(mut input: &[u8]) -> Result<Vec<StompFrame>, StompError> {
    let mut frames = Vec::new();
    loop {
        while let Some((&first, rest)) = input.split_first() {
            if first == b'\n' || first == b'\r' {
                input = rest;
            } else {
                break;
            }
        }
        if input.is_empty() {
            return Ok(frames);
        }
        let (frame, rest) = parse_one(input)?;
        frames.push(frame);
        input = rest;
    }
}

fn parse_one(input: &[u8]) -> Result<(StompFrame, &[u8]), StompError> {
    let lf = find(input, b"\n\n").map(|at| (at, at + 2));
    let crlf = find(input, b"\r\n\r\n").map(|at| (at, at + 4));
    let head_end = match (lf, crlf) {
        (Some(a), Some(b)) => a.min(b),
        (a, b) => a.or(b).ok_or(StompError::Unterminated)?,
    };
    let head = std::str::from_utf8(&input[..head_end.0]).map_err(|_| StompError::Encoding)?;
    let mut lines = head.lines();
    let command = Command::parse(lines.next().unwrap_or_default().trim_end_matches('\r'))?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
        let (key, value) = if escape {
            (unescape(key)?, unescape(value)?)
        } else {
            (key.to_string(), value.to_string())
        };
        headers.push((key, value));
    }

    let body_start = &input[head_end.1..];
    let length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| StompError::BadContentLength(v.clone()))
        })
        .transpose()?;
    let (body, rest) = match length {
        Some(len) => {
            if body_start.len() <= len || body_start[len] != 0 {
                return Err(StompError::Unterminated);
            }
            (&body_start[..len], &body_start[len + 1..])
        }
        None => {
            let end = body_start
                .iter()
                .position(|b| *b == 0)
                .ok_or(StompError::Unterminated)?;
            (&body_start[..end], &body_start[end + 1..])
        }
    };

    Ok((
        StompFrame {
            command,
            headers,
            body: Bytes::copy_from_slice(body),
        },
        rest,
    ))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
