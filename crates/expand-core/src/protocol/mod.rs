//! Protocol module: message types, the binary codec, typed payloads, and
//! sequence numbering.

pub mod clock;
pub mod codec;
pub mod messages;
pub mod payloads;
pub mod sequence;

pub use codec::{
    check_payload_length, decode_header, decode_message, encode_header, encode_message,
    ProtocolError,
};
pub use messages::*;
pub use payloads::*;
pub use sequence::{SequenceCounter, SequenceGap, SequenceObservation, SequenceTracker};
