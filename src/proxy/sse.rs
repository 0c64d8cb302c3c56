//! Incremental Server-Sent Events parser.
//!
//! Upstream bodies arrive in arbitrary byte chunks; lines may be split
//! across them. The decoder buffers partial lines and yields one
//! [`SseEvent`] per blank-line-terminated event.

/// One dispatched SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// The OpenAI end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and collect every event they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.push_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is buffered at end of input. A trailing event without
    /// its blank line is still dispatched.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest).trim_end().to_string();
            if let Some(event) = self.push_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        // Blank line ends the event
        if line.is_empty() {
            return self.dispatch();
        }
        // Comment
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_split_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: {\"a\"").is_empty());
        let events = d.push(b":1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn test_named_events_and_crlf() {
        let mut d = SseDecoder::new();
        let events = d.push(b"event: message_start\r\ndata: {}\r\n\r\n");
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn test_comments_and_empty_lines_ignored() {
        let mut d = SseDecoder::new();
        assert!(d.push(b": keep-alive\n\n\n").is_empty());
    }

    #[test]
    fn test_data_prefix_without_space() {
        let mut d = SseDecoder::new();
        let events = d.push(b"data:{\"x\":2}\n\n");
        assert_eq!(events[0].data, "{\"x\":2}");
    }

    #[test]
    fn test_finish_dispatches_unterminated_event() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: tail").is_empty());
        assert_eq!(d.finish().unwrap().data, "tail");
        assert!(d.finish().is_none());
    }
}
