//! Forward error correction: GF(256) arithmetic, a systematic Reed–Solomon
//! shard codec, the frame-group codec built on it, and the receive-side
//! group assembler.

pub mod assembler;
pub mod gf256;
pub mod group;
pub mod matrix;
pub mod reed_solomon;

use thiserror::Error;

pub use assembler::{AssemblyOutcome, GroupAssembler};
pub use group::{FecGroupCodec, RecoveredFrame};
pub use reed_solomon::ReedSolomon;

/// Errors raised by the shard and group codecs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FecError {
    /// Shard counts or buffer shapes that the codec cannot work with.
    #[error("invalid FEC parameters: {0}")]
    InvalidParameters(String),

    /// Fewer than `required` shards survived; the lost frames stay lost.
    #[error("insufficient shards: {present} present, {required} required")]
    InsufficientShards { present: usize, required: usize },

    #[error("shard {index} is {actual} bytes, expected {expected}")]
    ShardLengthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    /// Metadata and received data do not describe the same group.
    #[error("FEC group mismatch: {0}")]
    GroupMismatch(String),
}
