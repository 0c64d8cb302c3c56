//! Incremental decoder for `application/vnd.amazon.eventstream`.
//!
//! Each frame:
//!   [4B total_length][4B headers_length][4B prelude_CRC32]
//!   [headers: typed key-value pairs]
//!   [payload bytes]
//!   [4B message_CRC32]
//!
//! Network reads do not line up with frame boundaries, so bytes are
//! buffered until a whole frame is available.

use bytes::{Bytes, BytesMut};

const PRELUDE_LEN: usize = 12;
const MIN_FRAME_LEN: usize = PRELUDE_LEN + 4;
/// Upper bound on a single frame; anything larger is treated as corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event_type: String,
    /// `event` or `exception` (or `error`).
    pub message_type: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn is_exception(&self) -> bool {
        self.message_type != "event"
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("prelude checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    PreludeCrc { expected: u32, actual: u32 },
    #[error("message checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    MessageCrc { expected: u32, actual: u32 },
    #[error("invalid frame length {0}")]
    Length(usize),
    #[error("malformed header block")]
    Header,
}

/// CRC-32/ISO-HDLC.
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

fn be_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

/// Parse one header. Returns (name, string value, bytes consumed); non-string
/// values are skipped with an empty value.
fn parse_header(data: &[u8]) -> Option<(String, String, usize)> {
    let name_len = *data.first()? as usize;
    if data.len() < 1 + name_len + 1 {
        return None;
    }
    let name = std::str::from_utf8(&data[1..1 + name_len]).ok()?.to_string();
    let value_type = data[1 + name_len];
    let head = 1 + name_len + 1;
    let rest = &data[head..];

    let var_len = |rest: &[u8]| -> Option<usize> {
        if rest.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        (rest.len() >= 2 + len).then_some(len)
    };

    let (value, consumed) = match value_type {
        0 => ("true".to_string(), 0),
        1 => ("false".to_string(), 0),
        2 => (String::new(), 1),
        3 => (String::new(), 2),
        4 => (String::new(), 4),
        5 | 8 => (String::new(), 8),
        6 => (String::new(), 2 + var_len(rest)?),
        7 => {
            let len = var_len(rest)?;
            (std::str::from_utf8(&rest[2..2 + len]).ok()?.to_string(), 2 + len)
        }
        9 => (String::new(), 16),
        _ => return None,
    };
    if rest.len() < consumed {
        return None;
    }
    Some((name, value, head + consumed))
}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buf: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, `Ok(None)` when more bytes are needed. Any error
    /// is terminal: after a bad checksum the frame boundaries cannot be
    /// trusted.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.buf.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total_length = be_u32(&self.buf[0..4]) as usize;
        let headers_length = be_u32(&self.buf[4..8]) as usize;

        let expected = be_u32(&self.buf[8..12]);
        let actual = crc32_checksum(&self.buf[0..8]);
        if expected != actual {
            return Err(DecodeError::PreludeCrc { expected, actual });
        }
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_length)
            || PRELUDE_LEN + headers_length + 4 > total_length
        {
            return Err(DecodeError::Length(total_length));
        }
        if self.buf.len() < total_length {
            return Ok(None);
        }

        let frame = self.buf.split_to(total_length).freeze();
        let crc_offset = total_length - 4;
        let expected = be_u32(&frame[crc_offset..]);
        let actual = crc32_checksum(&frame[..crc_offset]);
        if expected != actual {
            return Err(DecodeError::MessageCrc { expected, actual });
        }

        let headers_end = PRELUDE_LEN + headers_length;
        let mut event_type = String::new();
        let mut message_type = String::from("event");
        let mut offset = PRELUDE_LEN;
        while offset < headers_end {
            let (name, value, consumed) =
                parse_header(&frame[offset..headers_end]).ok_or(DecodeError::Header)?;
            match name.as_str() {
                ":event-type" | ":exception-type" | ":error-code" => event_type = value,
                ":message-type" => message_type = value,
                _ => {}
            }
            offset += consumed;
        }

        Ok(Some(Frame {
            event_type,
            message_type,
            payload: frame.slice(headers_end..crc_offset),
        }))
    }
}

/// Encode a frame with string headers. Used to fake Bedrock upstreams.
pub fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        header_bytes.push(7);
        header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value.as_bytes());
    }
    let total = PRELUDE_LEN + header_bytes.len() + payload.len() + 4;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    let prelude_crc = crc32_checksum(&out);
    out.extend_from_slice(&prelude_crc.to_be_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    let message_crc = crc32_checksum(&out);
    out.extend_from_slice(&message_crc.to_be_bytes());
    out
}
