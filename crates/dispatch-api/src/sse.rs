//! Incremental decoder for `text/event-stream` bodies.
//!
//! The push stream delivers named, newline-framed messages:
//!
//! ```text
//! event: vehicle_position_update
//! id: 4812
//! data: {"vehicle_id":"v1","latitude":45.76,"longitude":4.85}
//!
//! ```
//!
//! Chunks arrive at arbitrary byte boundaries, so the decoder buffers
//! partial lines and only emits a [`RawMessage`] once its terminating blank
//! line has been seen.

use bytes::{Buf, BytesMut};

/// One complete message from the push stream, before JSON parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Transport-level event type (`event:` field), if the server set one.
    pub event_type: Option<String>,
    /// Concatenated `data:` lines, joined with `\n`.
    pub data: String,
    /// Last event id seen on the stream (`id:` field).
    pub id: Option<String>,
}

/// Line-oriented SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    event_type: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    /// A `\r` ended the previous chunk; swallow a leading `\n` in the next.
    pending_cr: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every message it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawMessage> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            if self.pending_cr && !self.buf.is_empty() {
                if self.buf[0] == b'\n' {
                    self.buf.advance(1);
                }
                self.pending_cr = false;
            }

            let Some(pos) = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                break;
            };

            let line = self.buf.split_to(pos);
            let terminator = self.buf[0];
            self.buf.advance(1);
            if terminator == b'\r' {
                if self.buf.first() == Some(&b'\n') {
                    self.buf.advance(1);
                } else if self.buf.is_empty() {
                    self.pending_cr = true;
                }
            }

            let line = String::from_utf8_lossy(&line);
            if let Some(message) = self.process_line(&line) {
                out.push(message);
            }
        }

        out
    }

    fn process_line(&mut self, line: &str) -> Option<RawMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // comment / keep-alive
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            "id" => {
                if !value.contains('\0') {
                    self.last_id = Some(value.to_owned());
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawMessage> {
        let event_type = self.event_type.take().filter(|t| !t.is_empty());
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(RawMessage {
            event_type,
            data,
            id: self.last_id.clone(),
        })
    }
}
