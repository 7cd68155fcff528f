// src/stomp.rs
//
// STOMP 1.2 text frames as carried in WebSocket text messages.

use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Subscribe,
    Unsubscribe,
    Send,
    Disconnect,
    Ack,
    Nack,
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    fn parse(s: &str) -> ChatResult<Self> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "DISCONNECT" => Command::Disconnect,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => {
                return Err(ChatError::InvalidRequest(format!(
                    "Unknown STOMP command '{}'",
                    other
                )))
            }
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Disconnect => "DISCONNECT",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are sent unescaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Frame {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: String) -> Self {
        self.headers.push(("content-type".into(), content_type.to_string()));
        self.headers
            .push(("content-length".into(), body.len().to_string()));
        self.body = body;
        self
    }

    /// First occurrence wins on repeated headers.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, name: &str) -> ChatResult<&str> {
        self.get(name).ok_or_else(|| {
            ChatError::InvalidRequest(format!(
                "{} frame is missing the '{}' header",
                self.command.as_str(),
                name
            ))
        })
    }

    pub fn serialize(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Every frame in one WebSocket text message. Heart-beat EOLs yield nothing.
pub fn parse_frames(input: &str) -> ChatResult<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, remaining) = parse_one(rest)?;
        frames.push(frame);
        rest = remaining;
    }
}

fn parse_one(input: &str) -> ChatResult<(Frame, &str)> {
    let (head, after_head) = match input.find("\n\n") {
        Some(i) => (&input[..i], &input[i + 2..]),
        None => match input.find("\r\n\r\n") {
            Some(i) => (&input[..i], &input[i + 4..]),
            None => return Err(ChatError::InvalidRequest("Incomplete STOMP frame".into())),
        },
    };

    let mut lines = head.lines();
    let command = Command::parse(lines.next().unwrap_or_default().trim_end_matches('\r'))?;
    let unescape = command.escapes_headers();
    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ChatError::InvalidRequest(format!("Malformed STOMP header '{}'", line)))?;
        if unescape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let declared_len = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok());
    let (body, remaining) = match declared_len {
        Some(len) if after_head.len() > len && after_head.as_bytes()[len] == 0 => {
            let body = after_head
                .get(..len)
                .ok_or_else(|| ChatError::InvalidRequest("content-length splits a character".into()))?;
            (body, &after_head[len + 1..])
        }
        Some(_) => {
            return Err(ChatError::InvalidRequest(
                "STOMP body does not match content-length".into(),
            ))
        }
        None => match after_head.find('\0') {
            Some(i) => (&after_head[..i], &after_head[i + 1..]),
            None => return Err(ChatError::InvalidRequest("STOMP frame is not NUL terminated".into())),
        },
    };

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        remaining,
    ))
}

fn escape_header(value: &str) -> String {
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

fn unescape_header(value: &str) -> ChatResult<String> {
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
                return Err(ChatError::InvalidRequest(format!(
                    "Invalid STOMP header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_with_escaped_header_and_body() {
        let raw = "SEND\ndestination:/app/chat.sendMessage/7\nx-note:a\\cb\n\n{\"content\":\"hi\"}\0";
        let frames = parse_frames(raw).unwrap();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.command, Command::Send);
        assert_eq!(frame.get("destination"), Some("/app/chat.sendMessage/7"));
        assert_eq!(frame.get("x-note"), Some("a:b"));
        assert_eq!(frame.body, "{\"content\":\"hi\"}");
    }

    #[test]
    fn heartbeats_and_multiple_frames() {
        let raw = "\n\nSUBSCRIBE\nid:sub-0\ndestination:/topic/chat/1\n\n\0\nDISCONNECT\nreceipt:77\n\n\0";
        let frames = parse_frames(raw).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command, Command::Subscribe);
        assert_eq!(frames[1].get("receipt"), Some("77"));
        assert!(parse_frames("\n").unwrap().is_empty());
    }

    #[test]
    fn connect_headers_are_taken_verbatim() {
        let raw = "CONNECT\naccept-version:1.2\nAuthorization:Bearer a.b\\c\n\n\0";
        let frame = parse_frames(raw).unwrap().remove(0);
        assert_eq!(frame.get("Authorization"), Some("Bearer a.b\\c"));
    }

    #[test]
    fn message_frame_serializes_with_escapes_and_nul() {
        let frame = Frame::new(Command::Message)
            .header("destination", "/topic/chat/1")
            .header("subscription", "s:1")
            .with_body("application/json", "{}".into());
        let text = frame.serialize();
        assert!(text.starts_with("MESSAGE\ndestination:/topic/chat/1\nsubscription:s\\c1\n"));
        assert!(text.ends_with("\n\n{}\0"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_frames("HELLO\n\n\0").is_err());
        assert!(parse_frames("SEND\ndestination:/x\n\nbody without nul").is_err());
        assert!(parse_frames("SEND\nbad\\qescape:1\n\n\0").is_err());
    }
}
