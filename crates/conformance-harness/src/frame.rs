use crate::errors::HarnessError;

/// A complete event-stream frame: a non-empty label plus its payload text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental line-at-a-time decoder for `event:`/`data:` framed streams.
///
/// Lines are expected without their terminators. A frame is emitted on a blank
/// line only when both a label and at least one data line are pending; the
/// pending state is cleared on every blank line either way.
#[derive(Debug, Default)]
pub struct EventFrameParser {
    event: Option<String>,
    data_lines: Vec<String>,
}

impl EventFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line and returns the frame it completes, if any.
    pub fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.starts_with(':') {
            return None;
        }
        if line.is_empty() {
            let event = self.event.take();
            let data_lines = std::mem::take(&mut self.data_lines);
            return match event {
                Some(event) if !event.is_empty() && !data_lines.is_empty() => Some(SseFrame {
                    event,
                    data: data_lines.join("\n"),
                }),
                _ => None,
            };
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines.push(rest.trim().to_string());
        }
        None
    }

    /// Drops any partially accumulated frame.
    pub fn reset(&mut self) {
        self.event = None;
        self.data_lines.clear();
    }

    /// Whether a label or data line is waiting for its blank line.
    pub fn has_pending(&self) -> bool {
        self.event.is_some() || !self.data_lines.is_empty()
    }
}

/// Longest line [`LineDecoder`] buffers before giving up on the stream.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a raw byte stream into lines, tolerating chunk boundaries that fall
/// anywhere (including inside a multi-byte character or a CRLF pair).
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    // Bytes of `buf` already known to hold no newline.
    scanned: usize,
    max_line_len: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line_len(MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line_len,
        }
    }

    /// Returns the lines completed by `chunk`. Fails once an unterminated
    /// line grows past the limit.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<String>, HarnessError> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let mut line = &self.buf[start..end];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
            self.scanned = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line_len {
            return Err(HarnessError::connection(format!(
                "line exceeds {} bytes without a newline",
                self.max_line_len
            )));
        }
        Ok(lines)
    }

    /// Returns the unterminated tail once the byte stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let mut rest = std::mem::take(&mut self.buf);
        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
