//! Frame Codec
//!
//! Byte-stream framing for text messages over stream sockets: a length prefix
//! plus a CRC32 checksum in front of each UTF-8 payload.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | UTF-8 Payload (variable)                 |
//! | big-endian u32 | CRC32          | one protocol message                     |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! The length covers the payload only. The checksum is the CRC32 of the payload.

use super::TransportError;

/// Maximum payload size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame header size: 4 bytes length + 4 bytes checksum
pub const HEADER_SIZE: usize = 8;

#[inline]
fn compute_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encode one text message into a frame
///
/// # Errors
///
/// `TransportError::Frame` if the payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode(text: &str) -> Result<Vec<u8>, TransportError> {
    let payload = text.as_bytes();
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Frame(format!(
            "frame too large: {} bytes (max: {MAX_FRAME_SIZE})",
            payload.len()
        )));
    }

    let len = u32::try_from(payload.len())
        .map_err(|_| TransportError::Frame("frame length overflows u32".to_string()))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&compute_checksum(payload).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Streaming decoder
///
/// Buffers incoming bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next message
    ///
    /// `Ok(None)` means more bytes are needed. Errors are not recoverable:
    /// the stream is out of sync afterwards.
    pub fn decode(&mut self) -> Result<Option<String>, TransportError> {
        let available = self.available();
        if available < HEADER_SIZE {
            return Ok(None);
        }

        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        if len > MAX_FRAME_SIZE {
            return Err(TransportError::Frame(format!(
                "frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }
        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let start = self.read_pos + HEADER_SIZE;
        let end = start + len;
        let payload = &self.buffer[start..end];

        let actual = compute_checksum(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        let text = std::str::from_utf8(payload)
            .map_err(|e| TransportError::Frame(format!("payload is not UTF-8: {e}")))?
            .to_owned();

        self.read_pos = end;
        Ok(Some(text))
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}
