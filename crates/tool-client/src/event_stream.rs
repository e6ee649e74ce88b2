//! Server-sent event decoding
//!
//! Both transports can receive `text/event-stream` bodies: the SSE transport
//! for its whole session, the Streamable HTTP transport for individual
//! responses. The decoder buffers partial chunks across network reads and
//! yields complete events on blank-line boundaries.

use crate::error::{Error, Result};

/// Largest event the decoder will buffer before giving up on the stream.
pub const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// One decoded event. `event` is `None` for the default "message" type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Event type with the SSE default applied.
    pub fn kind(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental event-stream decoder.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a boundary.
    scanned: usize,
    max_event_bytes: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_event_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_event_bytes,
        }
    }

    /// Feed a chunk of the body and return every event it completes.
    ///
    /// Blocks are only decoded once their terminating blank line has arrived,
    /// so a multi-byte character split across chunks stays intact. An
    /// unterminated event growing past the limit is a protocol error and
    /// discards the buffer.
    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> Result<Vec<SseEvent>> {
        self.buffer
            .extend(chunk.as_ref().iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.next_boundary() {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.scanned = 0;
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }

        if self.buffer.len() > self.max_event_bytes {
            let buffered = self.buffer.len();
            self.buffer.clear();
            self.scanned = 0;
            return Err(Error::Protocol(format!(
                "event exceeds {} bytes ({buffered} buffered without a boundary)",
                self.max_event_bytes
            )));
        }
        Ok(events)
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let block = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        parse_block(&String::from_utf8_lossy(&block))
    }

    fn next_boundary(&mut self) -> Option<usize> {
        // A newline at the end of the last scan may pair with the next byte.
        let from = self.scanned.saturating_sub(1);
        let found = self.buffer[from..]
            .windows(2)
            .position(|w| w == b"\n\n")
            .map(|i| from + i);
        if found.is_none() {
            self.scanned = self.buffer.len();
        }
        found
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}
