//! Sequence numbering on the send side and continuity tracking on the
//! receive side.
//!
//! # Why sequence numbers? (for beginners)
//!
//! Every message carries a `u32` sequence number.  The sender hands them out
//! in order; the receiver watches them arrive.  If it sees 1, 2, 4 it knows
//! message 3 never made it, which is exactly the signal the FEC layer and the
//! bitrate controller need.
//!
//! Numbers wrap at `u32::MAX` back to 0.  All comparisons therefore use
//! wrapping arithmetic: `b` is "after" `a` when `b - a` (mod 2^32) is less
//! than half the number space.

use std::sync::atomic::{AtomicU32, Ordering};

/// A thread-safe, monotonically increasing counter for sequence numbers.
///
/// ```rust
/// use expand_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.reserve(3), 2);
/// assert_eq!(counter.current(), 5);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU32,
}

impl SequenceCounter {
    /// Creates a new counter starting at 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a counter whose first [`next`](Self::next) returns `start`.
    pub fn starting_at(start: u32) -> Self {
        Self {
            inner: AtomicU32::new(start),
        }
    }

    /// Returns the next sequence number and advances the counter by one.
    ///
    /// Wraps from `u32::MAX` to 0 without panicking.  `Relaxed` is enough:
    /// the value orders messages, it does not publish memory.
    pub fn next(&self) -> u32 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserves `count` consecutive numbers and returns the first one.
    ///
    /// The block `[first .. first + count - 1]` (wrapping) belongs to the
    /// caller alone.
    pub fn reserve(&self, count: u32) -> u32 {
        self.inner.fetch_add(count, Ordering::Relaxed)
    }

    /// Returns the value the next call to [`next`](Self::next) would hand out.
    pub fn current(&self) -> u32 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ── Receive-side continuity ───────────────────────────────────────────────────

/// A detected discontinuity: `missing` messages between `expected` and
/// `received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// The number that should have arrived (`last + 1`).
    pub expected: u32,
    /// The number that actually arrived.
    pub received: u32,
    /// How many numbers were skipped (`received - last - 1`).
    pub missing: u32,
}

/// Result of feeding one sequence number to a [`SequenceTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceObservation {
    /// The very first number seen; establishes the baseline.
    First,
    /// Exactly `last + 1`.
    InOrder,
    /// A forward jump; the gap has been added to the dropped count.
    Gap(SequenceGap),
    /// A duplicate or a number from the past.  Ignored for accounting.
    Stale { last: u32, received: u32 },
}

/// Tracks continuity of one sequence space and counts gap-detected losses.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
    dropped: u64,
    stale: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `sequence` into the tracker.
    ///
    /// A forward jump is any wrapping distance in `1..2^31`; anything else
    /// (zero or "behind") is stale and leaves `last` and the dropped count
    /// untouched.
    pub fn observe(&mut self, sequence: u32) -> SequenceObservation {
        let Some(last) = self.last else {
            self.last = Some(sequence);
            return SequenceObservation::First;
        };

        let distance = sequence.wrapping_sub(last);
        if distance == 0 || distance >= 1 << 31 {
            self.stale += 1;
            return SequenceObservation::Stale {
                last,
                received: sequence,
            };
        }

        self.last = Some(sequence);
        if distance == 1 {
            return SequenceObservation::InOrder;
        }

        let missing = distance - 1;
        self.dropped += u64::from(missing);
        SequenceObservation::Gap(SequenceGap {
            expected: last.wrapping_add(1),
            received: sequence,
            missing,
        })
    }

    /// Highest sequence number accepted so far.
    pub fn last(&self) -> Option<u32> {
        self.last
    }

    /// Total numbers skipped across all gaps.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Count of duplicate or backwards numbers seen.
    pub fn stale(&self) -> u64 {
        self.stale
    }
}
