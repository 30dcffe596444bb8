use snafu::ResultExt;

use super::error::{InvalidUtf8Snafu, WireResult};
use super::record::WireRecord;

const FIELD_DATA: &str = "data";

/// Incremental decoder for `text/event-stream` bodies.
///
/// Network chunks may split an event anywhere, including inside a multi-byte
/// character, so bytes are buffered until a blank line closes the event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every record completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<WireResult<WireRecord>> {
        self.buffer.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some((end, separator_len)) = find_event_boundary(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..end + separator_len).collect();
            if let Some(record) = decode_event(&event[..end]) {
                records.push(record);
            }
        }
        records
    }

    /// Flushes a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<WireResult<WireRecord>> {
        if self.buffer.is_empty() {
            return None;
        }
        let event = std::mem::take(&mut self.buffer);
        decode_event(&event)
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|window| window == b"\n\n");
    let crlf = buffer.windows(4).position(|window| window == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(lf), Some(crlf)) if crlf < lf => Some((crlf, 4)),
        (Some(lf), _) => Some((lf, 2)),
        (None, Some(crlf)) => Some((crlf, 4)),
        (None, None) => None,
    }
}

// Comment lines, keep-alives and events without a data field yield nothing.
fn decode_event(event: &[u8]) -> Option<WireResult<WireRecord>> {
    let text = match std::str::from_utf8(event).context(InvalidUtf8Snafu {
        stage: "sse-decode-event",
    }) {
        Ok(text) => text,
        Err(error) => return Some(Err(error)),
    };

    let mut data_lines = Vec::new();
    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == FIELD_DATA {
            data_lines.push(value);
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(WireRecord::from_json(&data_lines.join("\n")))
}
