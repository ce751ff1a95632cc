//! Binary codec for the fixed message header and framed messages.
//!
//! Wire format:
//! ```text
//! [magic:4][type:1][version:1][reserved:2][timestamp_ms:8][payload_len:4][seq:4][payload:N]
//! ```
//! Total header size: 24 bytes. All multi-byte integers are big-endian.
//!
//! The functions here are pure: no state, no I/O.  The receive loop reads
//! exactly [`HEADER_SIZE`] bytes, calls [`decode_header`], checks the payload
//! length against its limit, then reads the payload.  Buffer-oriented callers
//! can use [`decode_message`] instead, which reports
//! [`ProtocolError::InsufficientData`] until a whole message is available.

use thiserror::Error;

use crate::protocol::messages::{
    Message, MessageHeader, MessageType, HEADER_SIZE, PROTOCOL_MAGIC,
};

/// Errors that can occur during header or payload encoding and decoding.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    /// Truncated header, wrong magic constant, or unknown type byte.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// The byte slice is shorter than the message it announces.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The header announces a payload larger than the configured maximum.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The payload could not be parsed (bad JSON, short binary layout, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A typed payload decode was attempted on a message of another type.
    #[error("expected {expected} payload, got {actual}")]
    UnexpectedMessageType {
        expected: MessageType,
        actual: MessageType,
    },
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Encodes `header` into its fixed 24-byte big-endian layout.
///
/// Encoding is total: every [`MessageHeader`] value has a representation.
pub fn encode_header(header: &MessageHeader) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    buf[4] = header.message_type as u8;
    buf[5] = header.version;
    // buf[6..8] reserved, always zero
    buf[8..16].copy_from_slice(&header.timestamp_ms.to_be_bytes());
    buf[16..20].copy_from_slice(&header.payload_length.to_be_bytes());
    buf[20..24].copy_from_slice(&header.sequence_number.to_be_bytes());
    buf
}

/// Decodes a header from the first [`HEADER_SIZE`] bytes of `bytes`.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedHeader`] when the buffer is too short,
/// the magic constant does not match, or the type byte is unknown.
pub fn decode_header(bytes: &[u8]) -> Result<MessageHeader, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::MalformedHeader(format!(
            "need {HEADER_SIZE} bytes, got {}",
            bytes.len()
        )));
    }

    let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != PROTOCOL_MAGIC {
        return Err(ProtocolError::MalformedHeader(format!(
            "bad magic 0x{magic:08X}"
        )));
    }

    let type_byte = bytes[4];
    let message_type = MessageType::try_from(type_byte).map_err(|_| {
        ProtocolError::MalformedHeader(format!("unknown message type 0x{type_byte:02X}"))
    })?;

    // bytes[6..8] are reserved – ignored on decode
    Ok(MessageHeader {
        message_type,
        version: bytes[5],
        timestamp_ms: read_u64(bytes, 8)?,
        payload_length: read_u32(bytes, 16)?,
        sequence_number: read_u32(bytes, 20)?,
    })
}

// ── Whole messages ────────────────────────────────────────────────────────────

/// Serializes a message (header + payload) into one contiguous buffer.
///
/// The header's `payload_length` is written from the actual payload length,
/// so the invariant "length field equals payload size" always holds on the
/// wire.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut header = msg.header;
    header.payload_length = msg.payload.len() as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + msg.payload.len());
    buf.extend_from_slice(&encode_header(&header));
    buf.extend_from_slice(&msg.payload);
    buf
}

/// Decodes one message from the beginning of `bytes`.
///
/// Returns the message and the number of bytes consumed so the caller can
/// advance its read cursor.
///
/// # Errors
///
/// - [`ProtocolError::InsufficientData`] when more bytes are needed (normal
///   for a partially filled stream buffer).
/// - [`ProtocolError::MalformedHeader`] for a bad header.
/// - [`ProtocolError::PayloadTooLarge`] when the announced payload exceeds
///   `max_payload_size`.
pub fn decode_message(
    bytes: &[u8],
    max_payload_size: usize,
) -> Result<(Message, usize), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let header = decode_header(bytes)?;
    let payload_len = check_payload_length(&header, max_payload_size)?;

    let total_needed = HEADER_SIZE + payload_len;
    if bytes.len() < total_needed {
        return Err(ProtocolError::InsufficientData {
            needed: total_needed,
            available: bytes.len(),
        });
    }

    let payload = bytes[HEADER_SIZE..total_needed].to_vec();
    Ok((Message { header, payload }, total_needed))
}

/// Validates the header's payload length against `max_payload_size`.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] when the limit is exceeded.
pub fn check_payload_length(
    header: &MessageHeader,
    max_payload_size: usize,
) -> Result<usize, ProtocolError> {
    let len = header.payload_length as usize;
    if len > max_payload_size {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: max_payload_size,
        });
    }
    Ok(len)
}

// ── Utility helpers ───────────────────────────────────────────────────────────

pub(crate) fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> Result<u16, ProtocolError> {
    let bytes = take::<2>(buf, offset)?;
    Ok(u16::from_be_bytes(bytes))
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    let bytes = take::<4>(buf, offset)?;
    Ok(u32::from_be_bytes(bytes))
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> Result<u64, ProtocolError> {
    let bytes = take::<8>(buf, offset)?;
    Ok(u64::from_be_bytes(bytes))
}

fn take<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], ProtocolError> {
    buf.get(offset..offset + N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or(ProtocolError::InsufficientData {
            needed: offset + N,
            available: buf.len(),
        })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
