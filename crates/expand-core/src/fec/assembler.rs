//! Receive-side bookkeeping for FEC groups.
//!
//! Frames, group metadata and parity shards arrive as separate messages.
//! The assembler keeps a bounded window of recent frames (by sequence number)
//! and of pending groups (by group id), and runs recovery as soon as a group
//! has its metadata plus enough parity to cover what is missing.
//!
//! A group is resolved exactly once: it is retired after all its frames are
//! seen, after a successful recovery, or after recovery fails.  A bounded
//! history of retired ids lets parity that trails a resolved group be
//! dropped instead of opening a new pending entry.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace, warn};

use crate::fec::group::{FecGroupCodec, RecoveredFrame};
use crate::fec::FecError;
use crate::protocol::payloads::{FecGroupMetadata, FecShardMessage};
use crate::protocol::MessageType;

/// Lower bound on how many recent frames are retained.
const MIN_FRAME_WINDOW: usize = 64;

/// Lower bound on how many resolved group ids are remembered.
const MIN_RETIRED_HISTORY: usize = 16;

/// What happened to a group after new input.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyOutcome {
    /// The group still waits for metadata, frames or parity.
    Pending,
    /// Every data frame arrived; nothing to recover.
    Complete { group_id: u32 },
    /// Missing frames were rebuilt.
    Recovered(Vec<RecoveredFrame>),
    /// Recovery was attempted and could not succeed.
    Failed { group_id: u32, error: FecError },
}

#[derive(Debug, Default)]
struct PendingGroup {
    metadata: Option<FecGroupMetadata>,
    parity: Vec<FecShardMessage>,
}

#[derive(Debug)]
pub struct GroupAssembler {
    codec: FecGroupCodec,
    max_pending_groups: usize,
    frame_window: usize,
    frames: HashMap<u32, Vec<u8>>,
    frame_order: VecDeque<u32>,
    groups: HashMap<u32, PendingGroup>,
    group_order: VecDeque<u32>,
    /// Recently resolved groups; late input for them is ignored.
    retired: VecDeque<u32>,
    retired_history: usize,
    evicted_groups: u64,
}

impl GroupAssembler {
    /// `codec` supplies the default `(k, m)`; groups announced with other
    /// parameters are still handled.
    pub fn new(codec: FecGroupCodec, max_pending_groups: usize) -> Self {
        let max_pending_groups = max_pending_groups.max(1);
        let frame_window =
            (max_pending_groups * codec.data_shards() * 2).max(MIN_FRAME_WINDOW);
        Self {
            codec,
            max_pending_groups,
            frame_window,
            frames: HashMap::new(),
            frame_order: VecDeque::new(),
            groups: HashMap::new(),
            group_order: VecDeque::new(),
            retired: VecDeque::new(),
            retired_history: (max_pending_groups * 2).max(MIN_RETIRED_HISTORY),
            evicted_groups: 0,
        }
    }

    /// Records a received frame-carrying message.
    ///
    /// Returns outcomes for any group this frame completes.
    pub fn on_frame(
        &mut self,
        message_type: MessageType,
        sequence_number: u32,
        payload: &[u8],
    ) -> Vec<AssemblyOutcome> {
        if !message_type.is_frame() {
            return Vec::new();
        }
        self.remember_frame(sequence_number, payload.to_vec());

        let waiting: Vec<u32> = self
            .groups
            .iter()
            .filter(|(_, g)| {
                g.metadata
                    .as_ref()
                    .is_some_and(|m| m.contains_sequence(sequence_number))
            })
            .map(|(id, _)| *id)
            .collect();

        waiting
            .into_iter()
            .map(|id| self.try_resolve(id))
            .filter(|o| *o != AssemblyOutcome::Pending)
            .collect()
    }

    pub fn on_metadata(&mut self, metadata: FecGroupMetadata) -> AssemblyOutcome {
        let group_id = metadata.group_id;
        if self.is_retired(group_id) {
            debug!("ignoring metadata for resolved group {group_id}");
            return AssemblyOutcome::Pending;
        }
        self.group_entry(group_id).metadata = Some(metadata);
        self.try_resolve(group_id)
    }

    pub fn on_parity(&mut self, shard: FecShardMessage) -> AssemblyOutcome {
        if !shard.is_parity {
            debug!("ignoring non-parity shard {} of group {}", shard.shard_index, shard.group_id);
            return AssemblyOutcome::Pending;
        }
        let group_id = shard.group_id;
        if self.is_retired(group_id) {
            trace!(
                "ignoring late parity shard {} of resolved group {group_id}",
                shard.shard_index
            );
            return AssemblyOutcome::Pending;
        }
        let group = self.group_entry(group_id);
        if group.parity.iter().any(|p| p.shard_index == shard.shard_index) {
            return AssemblyOutcome::Pending;
        }
        group.parity.push(shard);
        self.try_resolve(group_id)
    }

    /// Number of groups still waiting for input.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Groups dropped unresolved to respect the pending-group bound.
    pub fn evicted_groups(&self) -> u64 {
        self.evicted_groups
    }

    fn try_resolve(&mut self, group_id: u32) -> AssemblyOutcome {
        let Some(group) = self.groups.get(&group_id) else {
            return AssemblyOutcome::Pending;
        };
        let Some(metadata) = group.metadata.as_ref() else {
            return AssemblyOutcome::Pending;
        };

        let k = metadata.data_shards as usize;
        let m = metadata.parity_shards as usize;
        let received: HashMap<u32, Vec<u8>> = (0..k as u32)
            .map(|i| metadata.first_sequence.wrapping_add(i))
            .filter_map(|seq| self.frames.get(&seq).map(|f| (seq, f.clone())))
            .collect();

        if received.len() == k {
            self.retire(group_id);
            return AssemblyOutcome::Complete { group_id };
        }

        let missing = k - received.len();
        let parity = group.parity.len();
        if parity == 0 || (parity < missing && parity < m) {
            return AssemblyOutcome::Pending;
        }

        let result = self.codec.recover_missing(metadata, &received, &group.parity);
        let outcome = match result {
            Ok(recovered) => {
                debug!("FEC group {group_id}: recovered {} frame(s)", recovered.len());
                for frame in &recovered {
                    self.remember_frame(frame.sequence_number, frame.payload.clone());
                }
                AssemblyOutcome::Recovered(recovered)
            }
            Err(error) => {
                warn!("FEC group {group_id}: recovery failed: {error}");
                AssemblyOutcome::Failed { group_id, error }
            }
        };
        self.retire(group_id);
        outcome
    }

    fn group_entry(&mut self, group_id: u32) -> &mut PendingGroup {
        if !self.groups.contains_key(&group_id) {
            while self.groups.len() >= self.max_pending_groups {
                let Some(oldest) = self.group_order.pop_front() else {
                    break;
                };
                if self.groups.remove(&oldest).is_some() {
                    self.evicted_groups += 1;
                    debug!("evicting unresolved FEC group {oldest}");
                }
            }
            self.group_order.push_back(group_id);
        }
        self.groups.entry(group_id).or_default()
    }

    fn retire(&mut self, group_id: u32) {
        self.groups.remove(&group_id);
        self.group_order.retain(|id| *id != group_id);
        self.retired.push_back(group_id);
        while self.retired.len() > self.retired_history {
            self.retired.pop_front();
        }
    }

    fn is_retired(&self, group_id: u32) -> bool {
        !self.groups.contains_key(&group_id) && self.retired.contains(&group_id)
    }

    fn remember_frame(&mut self, sequence_number: u32, payload: Vec<u8>) {
        if self.frames.insert(sequence_number, payload).is_none() {
            self.frame_order.push_back(sequence_number);
        }
        while self.frame_order.len() > self.frame_window {
            if let Some(old) = self.frame_order.pop_front() {
                self.frames.remove(&old);
            }
        }
    }
}
