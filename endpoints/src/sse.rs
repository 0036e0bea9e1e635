//! Server-Sent Events parsing
//!
//! Buffers incoming bytes and yields complete events. Events are
//! delimited by blank lines; multiple `data:` lines within one event are
//! joined with newlines per the SSE spec. The OpenAI-style stream
//! terminator `data: [DONE]` is surfaced as its own event kind.

/// Cap on buffered bytes, against malformed streams that never terminate
/// an event
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// One parsed SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload (multiple data lines already joined)
    Data(String),
    /// The `[DONE]` stream terminator
    Done,
}

/// Incremental SSE stream parser
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    truncated: bool,
}

impl SseParser {
    /// Create a parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning any events completed by them.
    ///
    /// Incomplete events stay buffered for the next call. Invalid UTF-8 is
    /// replaced lossily.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        if self.buffer.len() > MAX_BUFFER_SIZE {
            if !self.truncated {
                tracing::warn!(
                    limit = MAX_BUFFER_SIZE,
                    "SSE buffer limit exceeded; stream looks malformed"
                );
                self.truncated = true;
            }
            // Drop the oldest half, cutting at a line boundary so we never
            // split an event mid-line
            let target = self.buffer.len() - MAX_BUFFER_SIZE / 2;
            let cut = self.buffer[target..]
                .find('\n')
                .map(|pos| target + pos + 1)
                .unwrap_or(target);
            self.buffer.drain(..cut);
        }

        let mut events = Vec::new();
        while let Some(pos) = self.find_event_boundary() {
            let raw: String = self.buffer.drain(..pos).collect();
            if let Some(event) = parse_event(&raw) {
                events.push(event);
            }
            self.truncated = false;
        }
        events
    }

    /// Whether bytes are buffered awaiting completion
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Drop any buffered state
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.truncated = false;
    }

    fn find_event_boundary(&self) -> Option<usize> {
        let lf = self.buffer.find("\n\n").map(|pos| pos + 2);
        let crlf = self.buffer.find("\r\n\r\n").map(|pos| pos + 4);
        match (lf, crlf) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // event/id/retry fields carry nothing we time or parse
    }
    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");
    if data.trim() == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(data))
    }
}
