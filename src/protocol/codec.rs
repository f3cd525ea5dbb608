//! Newline-delimited line codec
//!
//! Bytes arrive from the socket in arbitrary chunks; the codec buffers them and
//! hands back complete lines with the `\n` / `\r\n` terminator removed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ChatError, Result};

/// Default maximum line length in bytes
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Streaming line decoder / encoder
#[derive(Debug)]
pub struct LineCodec {
    buffer: BytesMut,
    max_line_length: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl LineCodec {
    /// Create a codec that rejects lines longer than `max_line_length` bytes
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_line_length.min(4096)),
            max_line_length,
        }
    }

    /// Feed data into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next complete line.
    /// Returns Ok(None) if more data is needed.
    pub fn decode_next(&mut self) -> Result<Option<String>> {
        match self.buffer.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                if pos > self.max_line_length {
                    return Err(self.too_long(pos));
                }
                let raw = self.buffer.split_to(pos + 1);
                Self::to_line(&raw[..pos]).map(Some)
            }
            None if self.buffer.len() > self.max_line_length => {
                Err(self.too_long(self.buffer.len()))
            }
            None => Ok(None),
        }
    }

    /// Flush whatever is left once the peer has closed its side.
    /// An unterminated trailing line is still a line.
    pub fn finish(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.decode_next()? {
            return Ok(Some(line));
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let raw = self.buffer.split();
        Self::to_line(&raw).map(Some)
    }

    /// Encode a line for the wire, appending the terminator if missing
    pub fn encode(line: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(line.len() + 1);
        buf.put_slice(line.as_bytes());
        if !line.ends_with('\n') {
            buf.put_u8(b'\n');
        }
        buf.freeze()
    }

    fn to_line(raw: &[u8]) -> Result<String> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        String::from_utf8(raw.to_vec())
            .map_err(|e| ChatError::invalid_message(format!("Line is not UTF-8: {}", e)))
    }

    fn too_long(&self, len: usize) -> ChatError {
        ChatError::protocol(format!(
            "Line too long: {} bytes (max: {} bytes)",
            len, self.max_line_length
        ))
    }
}
