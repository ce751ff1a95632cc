//! Typed payloads carried inside [`Message`](crate::protocol::messages::Message).
//!
//! Two encodings are in use:
//!
//! - **JSON** (`serde_json`, camelCase field names) for control and structured
//!   payloads.  These are small and infrequent, and JSON keeps them easy to
//!   inspect and to extend from either end.
//! - **Compact big-endian binary** for media and FEC shards, which are large
//!   and frequent.  Each has a fixed-size prefix followed by the raw bytes.
//!
//! Every payload struct implements [`WirePayload`], which ties it to its
//! [`MessageType`] so `Message::decode_payload::<T>()` can check the header
//! before touching the bytes.

use serde::{Deserialize, Serialize};

use crate::protocol::codec::{read_u16, read_u32, read_u64, require_len, ProtocolError};
use crate::protocol::messages::MessageType;

/// A payload that knows its message type and wire representation.
pub trait WirePayload: Sized {
    /// The header type this payload travels under.
    const MESSAGE_TYPE: MessageType;

    /// Serializes the payload into the bytes that follow the header.
    fn to_message_payload(&self) -> Result<Vec<u8>, ProtocolError>;

    /// Parses the bytes that followed the header.
    fn from_message_payload(bytes: &[u8]) -> Result<Self, ProtocolError>;
}

macro_rules! json_payload {
    ($($ty:ty => $message_type:expr),+ $(,)?) => {
        $(
            impl WirePayload for $ty {
                const MESSAGE_TYPE: MessageType = $message_type;

                fn to_message_payload(&self) -> Result<Vec<u8>, ProtocolError> {
                    serde_json::to_vec(self)
                        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
                }

                fn from_message_payload(bytes: &[u8]) -> Result<Self, ProtocolError> {
                    serde_json::from_slice(bytes).map_err(|e| {
                        ProtocolError::MalformedPayload(format!(
                            "{}: {e}",
                            <$ty as WirePayload>::MESSAGE_TYPE
                        ))
                    })
                }
            }
        )+
    };
}

// ── Session control ───────────────────────────────────────────────────────────

/// Sent by the client to open a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    pub device_id: String,
    pub device_name: String,
    pub client_version: String,
    pub screen_width: u32,
    pub screen_height: u32,
}

/// Server reply to a [`HandshakeMessage`].
///
/// `session_id` is empty when `accepted` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAckMessage {
    pub session_id: String,
    pub server_version: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    /// Sender's monotonic clock in milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAckMessage {
    /// The `timestamp` of the heartbeat being answered, echoed unchanged.
    pub original_timestamp: u64,
    /// Responder's clock when the ack was built.
    pub response_timestamp: u64,
}

// ── Feedback and rate control ─────────────────────────────────────────────────

/// Periodic receiver report used to drive the sender's bitrate controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolFeedbackMessage {
    pub timestamp: u64,
    pub average_rtt_ms: f64,
    pub total_messages: u64,
    pub dropped_messages: u64,
    /// Messages observed since the previous feedback report.
    pub total_messages_delta: u64,
    /// Gap-detected losses since the previous feedback report.
    pub dropped_messages_delta: u64,
    pub receive_rate_bps: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BitrateControlMessage {
    pub timestamp: u64,
    pub target_bitrate_bps: u64,
    pub reason: String,
}

/// Asks the encoder side to emit a key frame as soon as possible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFrameRequestMessage {
    pub timestamp: u64,
    pub reason: String,
}

// ── Forward error correction ──────────────────────────────────────────────────

/// Announces the FEC parameters a sender is about to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FecConfigMessage {
    pub enabled: bool,
    pub data_shards: u8,
    pub parity_shards: u8,
}

/// Describes one FEC group: `data_shards` consecutive frames starting at
/// `first_sequence`, protected by `parity_shards` parity shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FecGroupMetadata {
    pub group_id: u32,
    pub protected_type: MessageType,
    pub first_sequence: u32,
    pub data_shards: u8,
    pub parity_shards: u8,
    pub shard_length: u32,
    /// Original (unpadded) length of each of the `data_shards` frames.
    pub original_lengths: Vec<u32>,
}

impl FecGroupMetadata {
    /// Returns `true` if `sequence` falls inside
    /// `[first_sequence .. first_sequence + data_shards - 1]`, with wrapping.
    pub fn contains_sequence(&self, sequence: u32) -> bool {
        sequence.wrapping_sub(self.first_sequence) < u32::from(self.data_shards)
    }

    /// Index of `sequence` within the group, if it belongs to it.
    pub fn data_index(&self, sequence: u32) -> Option<usize> {
        self.contains_sequence(sequence)
            .then(|| sequence.wrapping_sub(self.first_sequence) as usize)
    }
}

/// One erasure-coded shard.
///
/// Binary layout (big-endian):
/// ```text
/// [group_id:4][shard_index:2][data_shards:1][parity_shards:1][is_parity:1]
/// [original_length:4][shard_length:4][data:shard_length]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecShardMessage {
    pub group_id: u32,
    pub shard_index: u16,
    pub data_shards: u8,
    pub parity_shards: u8,
    pub is_parity: bool,
    /// For data shards, the unpadded frame length; for parity, the shard length.
    pub original_length: u32,
    pub data: Vec<u8>,
}

const FEC_SHARD_PREFIX: usize = 4 + 2 + 1 + 1 + 1 + 4 + 4;

impl WirePayload for FecShardMessage {
    const MESSAGE_TYPE: MessageType = MessageType::FecShard;

    fn to_message_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(FEC_SHARD_PREFIX + self.data.len());
        buf.extend_from_slice(&self.group_id.to_be_bytes());
        buf.extend_from_slice(&self.shard_index.to_be_bytes());
        buf.push(self.data_shards);
        buf.push(self.parity_shards);
        buf.push(u8::from(self.is_parity));
        buf.extend_from_slice(&self.original_length.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    fn from_message_payload(bytes: &[u8]) -> Result<Self, ProtocolError> {
        require_len(bytes, FEC_SHARD_PREFIX, "FecShard")?;
        let shard_length = read_u32(bytes, 13)? as usize;
        let data = &bytes[FEC_SHARD_PREFIX..];
        if data.len() != shard_length {
            return Err(ProtocolError::MalformedPayload(format!(
                "FecShard: shard length {shard_length} but {} data bytes",
                data.len()
            )));
        }
        Ok(Self {
            group_id: read_u32(bytes, 0)?,
            shard_index: read_u16(bytes, 4)?,
            data_shards: bytes[6],
            parity_shards: bytes[7],
            is_parity: bytes[8] != 0,
            original_length: read_u32(bytes, 9)?,
            data: data.to_vec(),
        })
    }
}

// ── Media ─────────────────────────────────────────────────────────────────────

/// An encoded video frame.  The codec bitstream in `data` is opaque here.
///
/// Binary layout (big-endian):
/// ```text
/// [frame_number:8][presentation_ts_ms:8][width:4][height:4][is_key_frame:1][data:N]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrameMessage {
    pub frame_number: u64,
    pub presentation_ts_ms: u64,
    pub width: u32,
    pub height: u32,
    pub is_key_frame: bool,
    pub data: Vec<u8>,
}

const VIDEO_FRAME_PREFIX: usize = 8 + 8 + 4 + 4 + 1;

impl WirePayload for VideoFrameMessage {
    const MESSAGE_TYPE: MessageType = MessageType::VideoFrame;

    fn to_message_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(VIDEO_FRAME_PREFIX + self.data.len());
        buf.extend_from_slice(&self.frame_number.to_be_bytes());
        buf.extend_from_slice(&self.presentation_ts_ms.to_be_bytes());
        buf.extend_from_slice(&self.width.to_be_bytes());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.push(u8::from(self.is_key_frame));
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    fn from_message_payload(bytes: &[u8]) -> Result<Self, ProtocolError> {
        require_len(bytes, VIDEO_FRAME_PREFIX, "VideoFrame")?;
        Ok(Self {
            frame_number: read_u64(bytes, 0)?,
            presentation_ts_ms: read_u64(bytes, 8)?,
            width: read_u32(bytes, 16)?,
            height: read_u32(bytes, 20)?,
            is_key_frame: bytes[24] != 0,
            data: bytes[VIDEO_FRAME_PREFIX..].to_vec(),
        })
    }
}

/// An encoded audio packet.
///
/// Binary layout (big-endian):
/// ```text
/// [presentation_ts_ms:8][sample_rate:4][channels:1][data:N]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrameMessage {
    pub presentation_ts_ms: u64,
    pub sample_rate: u32,
    pub channels: u8,
    pub data: Vec<u8>,
}

const AUDIO_FRAME_PREFIX: usize = 8 + 4 + 1;

impl WirePayload for AudioFrameMessage {
    const MESSAGE_TYPE: MessageType = MessageType::AudioFrame;

    fn to_message_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(AUDIO_FRAME_PREFIX + self.data.len());
        buf.extend_from_slice(&self.presentation_ts_ms.to_be_bytes());
        buf.extend_from_slice(&self.sample_rate.to_be_bytes());
        buf.push(self.channels);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    fn from_message_payload(bytes: &[u8]) -> Result<Self, ProtocolError> {
        require_len(bytes, AUDIO_FRAME_PREFIX, "AudioFrame")?;
        Ok(Self {
            presentation_ts_ms: read_u64(bytes, 0)?,
            sample_rate: read_u32(bytes, 8)?,
            channels: bytes[12],
            data: bytes[AUDIO_FRAME_PREFIX..].to_vec(),
        })
    }
}

// ── Input and errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TouchAction {
    Down,
    Move,
    Up,
    Cancel,
}

/// A touch sample from the remote device.  Coordinates are normalised to
/// `0.0..=1.0` of the mirrored surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TouchEventMessage {
    pub timestamp: u64,
    pub pointer_id: u32,
    pub action: TouchAction,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub pressure: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub code: u32,
    pub message: String,
}

json_payload! {
    HandshakeMessage => MessageType::Handshake,
    HandshakeAckMessage => MessageType::HandshakeAck,
    HeartbeatMessage => MessageType::Heartbeat,
    HeartbeatAckMessage => MessageType::HeartbeatAck,
    ProtocolFeedbackMessage => MessageType::ProtocolFeedback,
    BitrateControlMessage => MessageType::BitrateControl,
    KeyFrameRequestMessage => MessageType::KeyFrameRequest,
    FecConfigMessage => MessageType::FecConfig,
    FecGroupMetadata => MessageType::FecGroupMetadata,
    TouchEventMessage => MessageType::TouchEvent,
    ErrorMessage => MessageType::Error,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
