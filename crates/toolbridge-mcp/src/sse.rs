//! Incremental `text/event-stream` decoder.
//!
//! Both the streamable HTTP transport (SSE-framed POST responses) and the
//! persistent SSE transport feed network chunks through [`SseParser`].
//! Chunks may split lines and even UTF-8 sequences, so raw bytes are buffered
//! until a full line is available.

use std::fmt;

/// A decoded event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// Event type from the `event:` field; `None` means "message".
    pub event: Option<String>,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Last `id:` field seen for this event.
    pub id: Option<String>,
    /// Reconnection hint from the `retry:` field, in milliseconds.
    pub retry: Option<u64>,
}

impl SseEvent {
    /// The effective event type.
    pub fn kind(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw[..newline]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                events.extend(self.dispatch());
            } else {
                self.field(line);
            }
        }
        events
    }

    /// Convenience wrapper over [`SseParser::feed`].
    pub fn feed_str(&mut self, text: &str) -> Vec<SseEvent> {
        self.feed(text.as_bytes())
    }

    /// Flush an event left unterminated when the stream ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            if !line.is_empty() {
                self.field(&line);
            }
        }
        self.dispatch()
    }

    fn field(&mut self, line: &str) {
        // Comment / keep-alive
        if line.starts_with(':') {
            return;
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => self.retry = value.parse().ok(),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            self.retry = None;
            return None;
        }

        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
            retry: self.retry.take(),
        })
    }

    /// Whether part of an event is still buffered.
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty() || !self.data.is_empty()
    }
}

impl fmt::Debug for SseParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseParser")
            .field("buffer_len", &self.buffer.len())
            .field("pending_data_lines", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: endpoint\ndata: /messages?sessionId=abc\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "endpoint");
        assert_eq!(events[0].data, "/messages?sessionId=abc");
    }

    #[test]
    fn test_default_kind_is_message() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "message");
        assert_eq!(events[0].data, r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
    }

    #[test]
    fn test_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: line one\ndata: line two\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn test_split_across_chunks() {
        let mut parser = SseParser::new();

        assert!(parser.feed(b"event: mess").is_empty());
        assert!(parser.feed(b"age\ndata: {\"a\":").is_empty());
        assert!(parser.has_buffered_data());

        let events = parser.feed(b" 1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, r#"{"a": 1}"#);
        assert!(!parser.has_buffered_data());
    }

    #[test]
    fn test_split_utf8_sequence() {
        let mut parser = SseParser::new();
        let bytes = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte 'é'.
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;

        assert!(parser.feed(&bytes[..split]).is_empty());
        let events = parser.feed(&bytes[split..]);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_comments_and_crlf() {
        let mut parser = SseParser::new();
        let events = parser.feed_str(": keep-alive\r\nid: 7\r\nretry: 2500\r\ndata: hi\r\n\r\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hi");
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].retry, Some(2500));
    }

    #[test]
    fn test_empty_event_ignored() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: ping\n\n\n").is_empty());
        // The dangling event type must not leak into the next event.
        let events = parser.feed(b"data: x\n\n");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: tail").is_empty());
        let event = parser.finish().unwrap();
        assert_eq!(event.data, "tail");
        assert!(parser.finish().is_none());
    }
}
