//! Frame-group codec: protects `k` consecutive frame payloads with `m`
//! parity shards and rebuilds missing frames on the receive side.
//!
//! Frames have different lengths, but the shard codec needs equal-length
//! buffers.  Every frame is zero-padded to the group's `shard_length` (the
//! longest frame, at least 1 byte) and the original lengths travel in the
//! [`FecGroupMetadata`] so recovered frames can be truncated back.

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::debug;

use crate::fec::reed_solomon::ReedSolomon;
use crate::fec::FecError;
use crate::protocol::messages::MessageType;
use crate::protocol::payloads::{FecGroupMetadata, FecShardMessage};

/// A frame rebuilt from parity, ready to be handed to the application as if
/// it had arrived normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredFrame {
    pub group_id: u32,
    pub message_type: MessageType,
    pub sequence_number: u32,
    pub payload: Vec<u8>,
}

/// Encoder/decoder for FEC frame groups with fixed `(k, m)`.
#[derive(Debug, Clone)]
pub struct FecGroupCodec {
    rs: ReedSolomon,
}

impl FecGroupCodec {
    /// # Errors
    ///
    /// [`FecError::InvalidParameters`] when `k` or `m` is zero or `k + m`
    /// exceeds 256.  Both must also fit the `u8` wire fields.
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, FecError> {
        if data_shards > u8::MAX as usize || parity_shards > u8::MAX as usize {
            return Err(FecError::InvalidParameters(format!(
                "shard counts must fit in a byte (k={data_shards}, m={parity_shards})"
            )));
        }
        Ok(Self {
            rs: ReedSolomon::new(data_shards, parity_shards)?,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.rs.data_shards()
    }

    pub fn parity_shards(&self) -> usize {
        self.rs.parity_shards()
    }

    /// Computes the group metadata and the `m` parity shard messages for
    /// `frames`, which carry sequence numbers
    /// `[first_sequence .. first_sequence + k - 1]`.
    ///
    /// # Errors
    ///
    /// [`FecError::InvalidParameters`] unless exactly `k` frames are given or
    /// a frame is longer than `u32::MAX` bytes.
    pub fn encode_parity<F: AsRef<[u8]>>(
        &self,
        frames: &[F],
        protected_type: MessageType,
        first_sequence: u32,
        group_id: u32,
    ) -> Result<(FecGroupMetadata, Vec<FecShardMessage>), FecError> {
        let k = self.rs.data_shards();
        let m = self.rs.parity_shards();
        if frames.len() != k {
            return Err(FecError::InvalidParameters(format!(
                "group needs exactly {k} frames, got {}",
                frames.len()
            )));
        }

        let shard_length = frames
            .iter()
            .map(|f| f.as_ref().len())
            .max()
            .unwrap_or(0)
            .max(1);
        let shard_length_u32 = u32::try_from(shard_length).map_err(|_| {
            FecError::InvalidParameters(format!("frame of {shard_length} bytes is too large"))
        })?;

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(k + m);
        let mut original_lengths = Vec::with_capacity(k);
        for frame in frames {
            let frame = frame.as_ref();
            let mut shard = vec![0u8; shard_length];
            shard[..frame.len()].copy_from_slice(frame);
            shards.push(shard);
            original_lengths.push(frame.len() as u32);
        }
        shards.extend((0..m).map(|_| vec![0u8; shard_length]));

        self.rs.encode_parity(&mut shards, shard_length)?;

        let metadata = FecGroupMetadata {
            group_id,
            protected_type,
            first_sequence,
            data_shards: k as u8,
            parity_shards: m as u8,
            shard_length: shard_length_u32,
            original_lengths,
        };

        let parity = shards
            .into_iter()
            .enumerate()
            .skip(k)
            .map(|(index, data)| FecShardMessage {
                group_id,
                shard_index: index as u16,
                data_shards: k as u8,
                parity_shards: m as u8,
                is_parity: true,
                original_length: shard_length_u32,
                data,
            })
            .collect();

        Ok((metadata, parity))
    }

    /// Rebuilds the frames of `metadata`'s group that are missing from
    /// `received_frames`.
    ///
    /// Only newly recovered frames are returned, truncated to their original
    /// length and ordered by position in the group.  Frames outside the
    /// group's sequence range and parity for other groups are ignored.
    ///
    /// # Errors
    ///
    /// - [`FecError::InsufficientShards`] when too few frames and parity
    ///   shards arrived.
    /// - [`FecError::GroupMismatch`] when the metadata is inconsistent or a
    ///   received frame does not fit the group's shard length.
    pub fn recover_missing(
        &self,
        metadata: &FecGroupMetadata,
        received_frames: &HashMap<u32, Vec<u8>>,
        received_parity: &[FecShardMessage],
    ) -> Result<Vec<RecoveredFrame>, FecError> {
        let k = metadata.data_shards as usize;
        let m = metadata.parity_shards as usize;
        let shard_length = metadata.shard_length as usize;
        validate_metadata(metadata)?;

        // Check what is usable before allocating anything of `shard_length`,
        // which comes from the peer.
        let mut present = vec![false; k + m];
        let mut data = Vec::with_capacity(k);
        for (&sequence, payload) in received_frames {
            let Some(index) = metadata.data_index(sequence) else {
                continue;
            };
            if payload.len() > shard_length {
                return Err(FecError::GroupMismatch(format!(
                    "frame {sequence} is {} bytes, group {} shard length is {shard_length}",
                    payload.len(),
                    metadata.group_id
                )));
            }
            present[index] = true;
            data.push((index, payload));
        }

        if data.len() == k {
            return Ok(Vec::new());
        }

        let mut parity = Vec::with_capacity(m);
        for shard in received_parity {
            let index = shard.shard_index as usize;
            if shard.group_id != metadata.group_id
                || !shard.is_parity
                || index < k
                || index >= k + m
                || shard.data.len() != shard_length
                || present[index]
            {
                debug!(
                    "ignoring shard {} of group {} for group {}",
                    shard.shard_index, shard.group_id, metadata.group_id
                );
                continue;
            }
            present[index] = true;
            parity.push((index, shard));
        }

        let usable = data.len() + parity.len();
        if usable < k {
            return Err(FecError::InsufficientShards {
                present: usable,
                required: k,
            });
        }

        let mut shards = vec![Vec::new(); k + m];
        for (index, payload) in data {
            let mut shard = vec![0u8; shard_length];
            shard[..payload.len()].copy_from_slice(payload);
            shards[index] = shard;
        }
        for (index, shard) in parity {
            shards[index] = shard.data.clone();
        }

        let rs = if k == self.rs.data_shards() && m == self.rs.parity_shards() {
            Cow::Borrowed(&self.rs)
        } else {
            Cow::Owned(ReedSolomon::new(k, m)?)
        };
        let rebuilt = rs.decode_missing(&mut shards, &present, shard_length)?;

        let recovered = rebuilt
            .into_iter()
            .filter(|&index| index < k)
            .map(|index| {
                let mut payload = std::mem::take(&mut shards[index]);
                payload.truncate(metadata.original_lengths[index] as usize);
                RecoveredFrame {
                    group_id: metadata.group_id,
                    message_type: metadata.protected_type,
                    sequence_number: metadata.first_sequence.wrapping_add(index as u32),
                    payload,
                }
            })
            .collect();
        Ok(recovered)
    }
}

fn validate_metadata(metadata: &FecGroupMetadata) -> Result<(), FecError> {
    let k = metadata.data_shards as usize;
    if k == 0 || metadata.parity_shards == 0 || metadata.shard_length == 0 {
        return Err(FecError::GroupMismatch(format!(
            "group {} has empty parameters",
            metadata.group_id
        )));
    }
    if metadata.original_lengths.len() != k {
        return Err(FecError::GroupMismatch(format!(
            "group {} lists {} original lengths for {k} data shards",
            metadata.group_id,
            metadata.original_lengths.len()
        )));
    }
    if let Some(len) = metadata
        .original_lengths
        .iter()
        .find(|&&len| len > metadata.shard_length)
    {
        return Err(FecError::GroupMismatch(format!(
            "group {} original length {len} exceeds shard length {}",
            metadata.group_id, metadata.shard_length
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames() -> Vec<Vec<u8>> {
        vec![
            b"first frame".to_vec(),
            b"2nd".to_vec(),
            Vec::new(),
            b"the fourth and longest frame".to_vec(),
        ]
    }

    fn received_without(frames: &[Vec<u8>], first: u32, skip: &[usize]) -> HashMap<u32, Vec<u8>> {
        frames
            .iter()
            .enumerate()
            .filter(|(i, _)| !skip.contains(i))
            .map(|(i, f)| (first.wrapping_add(i as u32), f.clone()))
            .collect()
    }

    #[test]
    fn test_encode_builds_metadata_from_frame_lengths() {
        // Arrange
        let codec = FecGroupCodec::new(4, 2).unwrap();

        // Act
        let (meta, parity) = codec
            .encode_parity(&frames(), MessageType::VideoFrame, 100, 7)
            .unwrap();

        // Assert
        assert_eq!(meta.shard_length, 28);
        assert_eq!(meta.original_lengths, vec![11, 3, 0, 28]);
        assert_eq!(meta.first_sequence, 100);
        assert_eq!(parity.len(), 2);
        assert_eq!(parity[0].shard_index, 4);
        assert_eq!(parity[1].shard_index, 5);
        assert!(parity.iter().all(|p| p.is_parity && p.group_id == 7 && p.data.len() == 28));
    }

    #[test]
    fn test_all_empty_frames_use_one_byte_shards() {
        let codec = FecGroupCodec::new(2, 1).unwrap();
        let (meta, parity) = codec
            .encode_parity(&[Vec::<u8>::new(), Vec::new()], MessageType::AudioFrame, 0, 0)
            .unwrap();
        assert_eq!(meta.shard_length, 1);
        assert_eq!(parity[0].data, vec![0]);
    }

    #[test]
    fn test_encode_requires_exactly_k_frames() {
        let codec = FecGroupCodec::new(4, 2).unwrap();
        let err = codec
            .encode_parity(&frames()[..3], MessageType::VideoFrame, 0, 0)
            .unwrap_err();
        assert!(matches!(err, FecError::InvalidParameters(_)));
    }

    #[test]
    fn test_any_single_missing_frame_is_recovered_exactly() {
        let codec = FecGroupCodec::new(4, 2).unwrap();
        let frames = frames();
        let (meta, parity) = codec
            .encode_parity(&frames, MessageType::VideoFrame, 100, 1)
            .unwrap();

        for missing in 0..4 {
            // Arrange
            let received = received_without(&frames, 100, &[missing]);

            // Act
            let recovered = codec.recover_missing(&meta, &received, &parity).unwrap();

            // Assert – exact bytes, no padding leaking through
            assert_eq!(recovered.len(), 1);
            assert_eq!(recovered[0].sequence_number, 100 + missing as u32);
            assert_eq!(recovered[0].payload, frames[missing]);
            assert_eq!(recovered[0].message_type, MessageType::VideoFrame);
        }
    }

    #[test]
    fn test_nothing_missing_short_circuits() {
        let codec = FecGroupCodec::new(4, 2).unwrap();
        let frames = frames();
        let (meta, _) = codec
            .encode_parity(&frames, MessageType::VideoFrame, 0, 1)
            .unwrap();

        // No parity at all: recovery must not even need it.
        let recovered = codec
            .recover_missing(&meta, &received_without(&frames, 0, &[]), &[])
            .unwrap();

        assert!(recovered.is_empty());
    }

    #[test]
    fn test_recovery_never_returns_a_received_sequence() {
        let codec = FecGroupCodec::new(4, 2).unwrap();
        let frames = frames();
        let (meta, parity) = codec
            .encode_parity(&frames, MessageType::VideoFrame, 10, 3)
            .unwrap();
        let received = received_without(&frames, 10, &[0, 2]);

        let recovered = codec.recover_missing(&meta, &received, &parity).unwrap();

        let sequences: Vec<u32> = recovered.iter().map(|r| r.sequence_number).collect();
        assert_eq!(sequences, vec![10, 12]);
        assert!(sequences.iter().all(|s| !received.contains_key(s)));
    }

    #[test]
    fn test_too_many_losses_report_insufficient_shards() {
        let codec = FecGroupCodec::new(4, 1).unwrap();
        let frames = frames();
        let (meta, parity) = codec
            .encode_parity(&frames, MessageType::VideoFrame, 0, 1)
            .unwrap();

        let err = codec
            .recover_missing(&meta, &received_without(&frames, 0, &[1, 3]), &parity)
            .unwrap_err();

        assert_eq!(err, FecError::InsufficientShards { present: 3, required: 4 });
    }

    #[test]
    fn test_foreign_parity_and_out_of_range_frames_are_ignored() {
        // Arrange
        let codec = FecGroupCodec::new(4, 2).unwrap();
        let frames = frames();
        let (meta, mut parity) = codec
            .encode_parity(&frames, MessageType::VideoFrame, 50, 9)
            .unwrap();
        parity[1].group_id = 10;
        let mut received = received_without(&frames, 50, &[1]);
        received.insert(54, b"not in this group".to_vec());
        received.insert(49, b"nor this one".to_vec());

        // Act – one parity shard is still valid, enough for one loss
        let recovered = codec.recover_missing(&meta, &received, &parity).unwrap();

        // Assert
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].payload, frames[1]);
    }

    #[test]
    fn test_group_across_sequence_wrap() {
        let codec = FecGroupCodec::new(4, 2).unwrap();
        let frames = frames();
        let first = u32::MAX - 1;
        let (meta, parity) = codec
            .encode_parity(&frames, MessageType::VideoFrame, first, 1)
            .unwrap();

        let recovered = codec
            .recover_missing(&meta, &received_without(&frames, first, &[3]), &parity)
            .unwrap();

        assert_eq!(recovered[0].sequence_number, 1);
        assert_eq!(recovered[0].payload, frames[3]);
    }

    #[test]
    fn test_metadata_with_other_parameters_is_still_recoverable() {
        let sender = FecGroupCodec::new(3, 1).unwrap();
        let receiver = FecGroupCodec::new(8, 2).unwrap();
        let frames = vec![vec![1u8; 5], vec![2u8; 9], vec![3u8; 2]];
        let (meta, parity) = sender
            .encode_parity(&frames, MessageType::AudioFrame, 0, 1)
            .unwrap();

        let recovered = receiver
            .recover_missing(&meta, &received_without(&frames, 0, &[2]), &parity)
            .unwrap();

        assert_eq!(recovered[0].payload, vec![3u8; 2]);
    }

    #[test]
    fn test_oversized_shard_length_without_matching_parity_fails_early() {
        // Arrange – a peer announces a 4 GiB shard length
        let codec = FecGroupCodec::new(4, 1).unwrap();
        let frames = frames();
        let (mut meta, parity) = codec
            .encode_parity(&frames, MessageType::VideoFrame, 0, 1)
            .unwrap();
        meta.shard_length = u32::MAX;

        // Act
        let err = codec
            .recover_missing(&meta, &received_without(&frames, 0, &[2]), &parity)
            .unwrap_err();

        // Assert – the real parity no longer matches and is not counted
        assert_eq!(err, FecError::InsufficientShards { present: 3, required: 4 });
    }

    #[test]
    fn test_inconsistent_metadata_is_rejected() {
        let codec = FecGroupCodec::new(4, 2).unwrap();
        let (mut meta, parity) = codec
            .encode_parity(&frames(), MessageType::VideoFrame, 0, 1)
            .unwrap();
        meta.original_lengths.pop();

        let err = codec.recover_missing(&meta, &HashMap::new(), &parity).unwrap_err();

        assert!(matches!(err, FecError::GroupMismatch(_)));
    }
}
