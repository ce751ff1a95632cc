//! # expand-core
//!
//! Pure building blocks of the ExpandScreen streaming transport: the wire
//! codec, forward error correction, and the control loops that sit on top of
//! them.  Nothing in this crate touches a socket, a runtime, or the clock
//! beyond a monotonic millisecond counter.
//!
//! # Architecture overview (for beginners)
//!
//! A PC mirrors its screen to a tablet or phone over one TCP connection.
//! Encoded video frames, audio, touch input and control messages all share
//! that stream.  This crate defines:
//!
//! - **`protocol`** – how bytes travel: a 24-byte big-endian header, typed
//!   payloads, and sequence numbers so the receiver can spot losses.
//!
//! - **`fec`** – forward error correction.  `k` frames are protected by `m`
//!   Reed–Solomon parity shards; any `m` of the `k + m` can be lost and the
//!   frames are rebuilt without a round trip.
//!
//! - **`domain`** – the adaptive bitrate controller (AIMD) and RTT
//!   statistics that close the loop between receiver feedback and the
//!   encoder's target bitrate.
//!
//! The `expand-net` crate wires these into tokio tasks.

pub mod domain;
pub mod fec;
pub mod protocol;

pub use domain::bitrate::{BitrateConfig, BitrateController, BitrateDecision, BitrateFeedback};
pub use domain::rtt::RttEstimator;
pub use fec::{FecError, FecGroupCodec, GroupAssembler, RecoveredFrame, ReedSolomon};
pub use protocol::codec::{
    decode_header, decode_message, encode_header, encode_message, ProtocolError,
};
pub use protocol::messages::{Message, MessageHeader, MessageType, HEADER_SIZE};
pub use protocol::payloads::WirePayload;
