//! Server-sent event decoding
//!
//! Turns a `text/event-stream` body into [`Event`]s. Only the fields relays
//! use are kept; `retry` is parsed but the client keeps its own interval.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Upper bound for a single buffered line
const MAX_LINE_LEN: usize = 1024 * 1024;

/// A dispatched event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    /// `id:` field of this event, empty if absent
    pub id: String,
    /// `event:` field, if any
    pub event: Option<String>,
    /// Concatenated `data:` lines joined with `\n`
    pub data: String,
    /// `retry:` hint in milliseconds
    pub retry: Option<u64>,
}

/// Codec for `text/event-stream`
#[derive(Debug, Default)]
pub struct EventCodec {
    pending: Event,
    has_fields: bool,
    has_data: bool,
}

impl EventCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn field(&mut self, name: &str, value: &str) {
        match name {
            "data" => {
                if self.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.has_data = true;
            }
            "id" => {
                if !value.contains('\0') {
                    self.pending.id = value.to_string();
                }
            }
            "event" => self.pending.event = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.pending.retry = Some(ms);
                }
            }
            _ => return,
        }
        self.has_fields = true;
    }

    fn dispatch(&mut self) -> Option<Event> {
        if !self.has_fields {
            return None;
        }
        self.has_fields = false;
        self.has_data = false;
        Some(std::mem::take(&mut self.pending))
    }
}

impl Decoder for EventCodec {
    type Item = Event;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Event>, Self::Error> {
        loop {
            let Some(end) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LEN {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "event stream line too long",
                    ));
                }
                return Ok(None);
            };

            let raw = src.split_to(end + 1);
            let mut line = &raw[..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    return Ok(Some(event));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (name, value) = match line.split_once(':') {
                Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_ref(), ""),
            };
            self.field(name, value);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Event>, Self::Error> {
        let event = self.decode(src)?;
        if event.is_none() {
            // An unterminated trailing event is discarded
            src.clear();
            self.pending = Event::default();
            self.has_fields = false;
            self.has_data = false;
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<Event> {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::from(input);
        let mut events = Vec::new();
        while let Some(event) = codec.decode(&mut buf).unwrap() {
            events.push(event);
        }
        while let Some(event) = codec.decode_eof(&mut buf).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_single_event() {
        let events = decode_all("id: 42\nevent: offer\ndata: {\"type\":\"offer\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "42");
        assert_eq!(events[0].event.as_deref(), Some("offer"));
        assert_eq!(events[0].data, "{\"type\":\"offer\"}");
    }

    #[test]
    fn test_multiline_data_and_crlf() {
        let events = decode_all("data: first\r\ndata:second\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "first\nsecond");
        assert_eq!(events[0].id, "");
    }

    #[test]
    fn test_comments_and_empty_blocks_are_skipped() {
        let events = decode_all(": keepalive\n\n\n: again\nid: 1\ndata: x\n\nretry: 3000\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "x");
        assert_eq!(events[1].data, "");
        assert_eq!(events[1].retry, Some(3000));
    }

    #[test]
    fn test_split_across_chunks() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::from("id: 7\nda");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ta: hello\n\n");
        let event = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(event.id, "7");
        assert_eq!(event.data, "hello");
    }

    #[test]
    fn test_unterminated_event_is_dropped_at_eof() {
        let events = decode_all("id: 1\ndata: done\n\nid: 2\ndata: partial\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "1");
    }
}
