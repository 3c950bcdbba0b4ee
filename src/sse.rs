//! Server-sent events (`text/event-stream`).

use std::fmt::Display;

use http::StatusCode;

use crate::{
    body::BodySink,
    error::HttpError,
    message::{Headers, ResponseHeader},
};

pub const EVENT_STREAM: &str = "text/event-stream";

/// One server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    pub id: Option<String>,
    /// The event type, `message` when unset
    pub event: Option<String>,
    pub data: Option<String>,
    /// Reconnection delay in milliseconds
    pub retry: Option<u64>,
    pub comment: Option<String>,
}
impl Event {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::default()
        }
    }

    pub fn comment(comment: impl Into<String>) -> Self {
        Self {
            comment: Some(comment.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_retry(mut self, retry: u64) -> Self {
        self.retry = Some(retry);
        self
    }

    /// True for an event that only carries a comment, such as a keep-alive.
    pub fn is_comment(&self) -> bool {
        self.data.is_none() && self.event.is_none() && self.id.is_none() && self.retry.is_none()
    }

    fn is_empty(&self) -> bool {
        self.is_comment() && self.comment.is_none()
    }

    /// The wire form, ending in a blank line. Multi-line values are split across lines of the same field.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut field = |name: &str, value: &str| {
            for line in value.split('\n') {
                out.push_str(name);
                out.push_str(": ");
                out.push_str(line.strip_suffix('\r').unwrap_or(line));
                out.push_str("\r\n");
            }
        };
        if let Some(x) = &self.comment {
            field("", x);
        }
        if let Some(x) = &self.event {
            field("event", x);
        }
        if let Some(x) = &self.id {
            field("id", x);
        }
        if let Some(x) = self.retry {
            field("retry", &x.to_string());
        }
        if let Some(x) = &self.data {
            field("data", x);
        }
        out.push_str("\r\n");
        out
    }
}
impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Incremental parser of an event stream.
///
/// Lines may end in `\r\n`, `\n` or `\r`, and a chunk may end anywhere, including between
/// the `\r` and `\n` of one line ending.
#[derive(Debug, Default)]
pub struct EventParser {
    line: Vec<u8>,
    skip_lf: bool,
    current: Event,
    data: Vec<String>,
    comments: Vec<String>,
    /// The id of the last event, which persists across events
    last_id: Option<String>,
}
impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    /// Parse a chunk, returning every event it completed.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        for byte in data {
            match byte {
                b'\n' if self.skip_lf => self.skip_lf = false,
                b'\r' | b'\n' => {
                    self.skip_lf = *byte == b'\r';
                    let line = std::mem::take(&mut self.line);
                    if let Some(event) = self.on_line(&String::from_utf8_lossy(&line)) {
                        events.push(event);
                    }
                }
                _ => {
                    self.skip_lf = false;
                    self.line.push(*byte);
                }
            }
        }
        events
    }

    fn on_line(&mut self, line: &str) -> Option<Event> {
        if line.is_empty() {
            return self.dispatch();
        }
        let (name, value) = match line.split_once(':') {
            Some((n, v)) => (n, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match name {
            "" => self.comments.push(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            "event" => self.current.event = Some(value.to_owned()),
            "id" if !value.contains('\0') => self.current.id = Some(value.to_owned()),
            "retry" => {
                if let Ok(x) = value.parse() {
                    self.current.retry = Some(x);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Event> {
        let mut event = std::mem::take(&mut self.current);
        if !self.data.is_empty() {
            event.data = Some(std::mem::take(&mut self.data).join("\n"));
        }
        if !self.comments.is_empty() {
            event.comment = Some(std::mem::take(&mut self.comments).join("\n"));
        }
        if event.id.is_some() {
            self.last_id = event.id.clone();
        }
        (!event.is_empty()).then_some(event)
    }
}

/// Headers of an event-stream response.
pub fn event_stream_header() -> Result<ResponseHeader, HttpError> {
    let mut header = ResponseHeader::new(StatusCode::OK);
    header.headers.insert("Content-Type", EVENT_STREAM)?;
    header.headers.insert("Cache-Control", "no-cache")?;
    Ok(header)
}

/// True if the headers declare an event stream.
pub fn is_event_stream(headers: &Headers) -> bool {
    headers
        .get("Content-Type")
        .and_then(|x| x.split(';').next())
        .map(|x| x.trim().eq_ignore_ascii_case(EVENT_STREAM))
        .unwrap_or(false)
}

/// Writes events to a streaming response body.
#[derive(Debug, Clone)]
pub struct EventSink {
    sink: BodySink,
}
impl EventSink {
    pub fn new(sink: BodySink) -> Self {
        Self { sink }
    }

    pub fn send(&self, event: &Event) -> Result<(), HttpError> {
        self.sink.write_str(&event.encode())?;
        Ok(())
    }

    pub fn close(&self) -> Result<(), HttpError> {
        self.sink.close()
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_open()
    }
}

#[cfg(test)]
mod test {
    use super::{event_stream_header, is_event_stream, Event, EventParser};

    #[test]
    fn test_encode() {
        let event = Event::new("line one\nline two").with_id("7").with_event("update");
        assert_eq!(
            event.encode(),
            "event: update\r\nid: 7\r\ndata: line one\r\ndata: line two\r\n\r\n"
        );
        assert_eq!(Event::comment("ping").encode(), ": ping\r\n\r\n");
    }

    #[test]
    fn test_parse_split_across_chunks() {
        let mut parser = EventParser::new();
        assert!(parser.feed(b"id: 1\r").is_empty());
        assert!(parser.feed(b"\ndata: hel").is_empty());
        let events = parser.feed(b"lo\r\ndata:world\r\n\r\n: keep-alive\n\nretry: 3000\revent: x\r\r");
        assert_eq!(
            events,
            vec![
                Event::new("hello\nworld").with_id("1"),
                Event::comment("keep-alive"),
                Event {
                    event: Some("x".to_owned()),
                    retry: Some(3000),
                    ..Event::default()
                },
            ]
        );
        assert_eq!(parser.last_event_id(), Some("1"));
    }

    #[test]
    fn test_round_trip_through_parser() {
        let event = Event::new("a\nb").with_id("42").with_retry(10);
        let mut parser = EventParser::new();
        assert_eq!(parser.feed(event.encode().as_bytes()), vec![event]);
    }

    #[test]
    fn test_event_stream_header() {
        let header = event_stream_header().unwrap();
        assert!(is_event_stream(&header.headers));
        assert_eq!(header.headers.get("Cache-Control"), Some("no-cache"));
    }
}
