//! Message type codes, the fixed wire header, and the framed [`Message`].
//!
//! Every message on the stream is a 24-byte header followed by exactly
//! `payload_length` payload bytes.  The payload is opaque at this level; the
//! typed payload structs in [`crate::protocol::payloads`] know how to turn
//! themselves into (and back from) those bytes.

use serde::{Deserialize, Serialize};

use crate::protocol::codec::ProtocolError;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Magic constant identifying the protocol family (`"EXPS"` in ASCII).
pub const PROTOCOL_MAGIC: u32 = 0x4558_5053;

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Total size of the common message header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Default upper bound for a single payload (16 MiB).
///
/// A header announcing more than the configured maximum is a protocol
/// violation; this keeps a hostile or buggy peer from making the reader
/// allocate unbounded memory.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

// ── Message type codes ────────────────────────────────────────────────────────

/// All message type codes understood by the transport.
///
/// Codes are grouped by purpose:
/// - `0x01..0x0F` – session control (handshake, heartbeat)
/// - `0x10..0x1F` – media and input carried for the application
/// - `0x20..0x2F` – feedback and rate control
/// - `0x30..0x3F` – forward error correction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    Heartbeat = 0x03,
    HeartbeatAck = 0x04,
    VideoFrame = 0x10,
    AudioFrame = 0x11,
    TouchEvent = 0x12,
    ProtocolFeedback = 0x20,
    BitrateControl = 0x21,
    KeyFrameRequest = 0x22,
    FecConfig = 0x30,
    FecShard = 0x31,
    FecGroupMetadata = 0x32,
    Error = 0x7F,
}

impl MessageType {
    /// Every defined message type, in code order.
    pub const ALL: [MessageType; 14] = [
        MessageType::Handshake,
        MessageType::HandshakeAck,
        MessageType::Heartbeat,
        MessageType::HeartbeatAck,
        MessageType::VideoFrame,
        MessageType::AudioFrame,
        MessageType::TouchEvent,
        MessageType::ProtocolFeedback,
        MessageType::BitrateControl,
        MessageType::KeyFrameRequest,
        MessageType::FecConfig,
        MessageType::FecShard,
        MessageType::FecGroupMetadata,
        MessageType::Error,
    ];

    /// Returns `true` for the session-control types that the session layer
    /// consumes itself and never forwards to the application.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MessageType::Handshake
                | MessageType::HandshakeAck
                | MessageType::Heartbeat
                | MessageType::HeartbeatAck
        )
    }

    /// Returns `true` for types that travel on the sender's priority path.
    ///
    /// Critical messages have their own queue and their own sequence space so
    /// a burst of media can never evict a heartbeat.
    pub fn is_critical(self) -> bool {
        self.is_control()
    }

    /// Returns `true` for frame-carrying types that may be protected by FEC.
    pub fn is_frame(self) -> bool {
        matches!(self, MessageType::VideoFrame | MessageType::AudioFrame)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::Handshake),
            0x02 => Ok(MessageType::HandshakeAck),
            0x03 => Ok(MessageType::Heartbeat),
            0x04 => Ok(MessageType::HeartbeatAck),
            0x10 => Ok(MessageType::VideoFrame),
            0x11 => Ok(MessageType::AudioFrame),
            0x12 => Ok(MessageType::TouchEvent),
            0x20 => Ok(MessageType::ProtocolFeedback),
            0x21 => Ok(MessageType::BitrateControl),
            0x22 => Ok(MessageType::KeyFrameRequest),
            0x30 => Ok(MessageType::FecConfig),
            0x31 => Ok(MessageType::FecShard),
            0x32 => Ok(MessageType::FecGroupMetadata),
            0x7F => Ok(MessageType::Error),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// ── Common message header ─────────────────────────────────────────────────────

/// 24-byte header prepended to every message on the wire.
///
/// ```text
/// [magic:4][type:1][version:1][reserved:2][timestamp_ms:8][payload_len:4][seq:4]
/// ```
///
/// The magic constant is implied (it is written by the encoder and checked by
/// the decoder) so it is not stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Identifies the payload type.
    pub message_type: MessageType,
    /// Protocol version of the sender.
    pub version: u8,
    /// Monotonic milliseconds on the sender's clock.
    pub timestamp_ms: u64,
    /// Length of the payload in bytes (not including this header).
    pub payload_length: u32,
    /// Per-direction, per-priority-class counter; wraps at `u32::MAX`.
    pub sequence_number: u32,
}

impl MessageHeader {
    /// Builds a header for the current protocol version.
    pub fn new(
        message_type: MessageType,
        timestamp_ms: u64,
        payload_length: u32,
        sequence_number: u32,
    ) -> Self {
        Self {
            message_type,
            version: PROTOCOL_VERSION,
            timestamp_ms,
            payload_length,
            sequence_number,
        }
    }
}

// ── Framed message ────────────────────────────────────────────────────────────

/// A header together with the payload bytes that followed it on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a message whose header `payload_length` matches `payload`.
    pub fn new(
        message_type: MessageType,
        sequence_number: u32,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Self {
        let header = MessageHeader::new(
            message_type,
            timestamp_ms,
            payload.len() as u32,
            sequence_number,
        );
        Self { header, payload }
    }

    /// Shorthand for `self.header.message_type`.
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Shorthand for `self.header.sequence_number`.
    pub fn sequence_number(&self) -> u32 {
        self.header.sequence_number
    }

    /// Decodes the payload as `T`, checking that the header type matches.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedMessageType`] when the header names
    /// a different type, or the payload decoder's error otherwise.
    pub fn decode_payload<T: crate::protocol::payloads::WirePayload>(
        &self,
    ) -> Result<T, ProtocolError> {
        if self.header.message_type != T::MESSAGE_TYPE {
            return Err(ProtocolError::UnexpectedMessageType {
                expected: T::MESSAGE_TYPE,
                actual: self.header.message_type,
            });
        }
        T::from_message_payload(&self.payload)
    }
}
