//! Incremental newline-delimited frame decoder.
//!
//! Bytes are buffered until a `\n` arrives, so a frame (or a multi-byte
//! UTF-8 character) split across reads is reassembled before decoding.

use serde_json::Value;

use super::protocol::{classify_record, Frame};

/// Output of the decoder for one complete line.
#[derive(Debug, Clone)]
pub enum DecodeEvent {
    /// A decoded frame.
    Frame(Frame),
    /// A line that looked like a record but could not be decoded.
    Warning {
        /// The offending line, trimmed.
        line: String,
        /// Parser error message.
        reason: String,
    },
}

/// Longest line the worker may emit before it is discarded.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// How much of an oversized line is kept in its warning.
const PREVIEW_BYTES: usize = 120;

/// Splits a chunked byte stream into frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_line: usize,
    /// Set while skipping the rest of an oversized line.
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that drops lines longer than `max_line` bytes.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    /// Feed a chunk and return events for every line it completes.
    ///
    /// A line growing past the limit yields one `Warning` and is skipped up
    /// to its terminating newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodeEvent> {
        // The buffered prefix never contains a newline, so only scan what's new.
        let mut cursor = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.buffer[cursor..].iter().position(|&b| b == b'\n') {
            let end = cursor + offset;
            let line = &self.buffer[consumed..end];
            if self.discarding {
                self.discarding = false;
            } else if line.len() > self.max_line {
                events.push(oversized(line, self.max_line));
            } else if let Some(event) = decode_line(line) {
                events.push(event);
            }
            consumed = end + 1;
            cursor = consumed;
        }
        self.buffer.drain(..consumed);

        if self.buffer.len() > self.max_line {
            if !self.discarding {
                events.push(oversized(&self.buffer, self.max_line));
                self.discarding = true;
            }
            self.buffer.clear();
        }
        events
    }

    /// Decode whatever is left after end-of-stream.
    pub fn finish(&mut self) -> Option<DecodeEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        decode_line(&rest)
    }

    /// Bytes held back waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn oversized(bytes: &[u8], max_line: usize) -> DecodeEvent {
    let preview = &bytes[..bytes.len().min(PREVIEW_BYTES)];
    DecodeEvent::Warning {
        line: String::from_utf8_lossy(preview).into_owned(),
        reason: format!("line exceeds {max_line} bytes; discarded"),
    }
}

fn decode_line(bytes: &[u8]) -> Option<DecodeEvent> {
    let text = String::from_utf8_lossy(bytes);
    let line = text.trim();
    if line.is_empty() {
        return None;
    }

    // Log output from the worker must never be mistaken for a record.
    if !(line.starts_with('{') && line.ends_with('}')) {
        return Some(DecodeEvent::Frame(Frame::Diagnostic(line.to_string())));
    }

    let result = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(record)) => classify_record(record),
        Ok(_) => Err("not a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    };

    Some(match result {
        Ok(frame) => DecodeEvent::Frame(frame),
        Err(reason) => DecodeEvent::Warning {
            line: line.to_string(),
            reason,
        },
    })
}
