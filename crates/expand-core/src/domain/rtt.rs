//! Round-trip-time statistics from heartbeat echoes.

use std::time::Duration;

/// EWMA weight of a new sample (`srtt = 7/8 * srtt + 1/8 * sample`).
const SMOOTHING: f64 = 0.125;

/// Running RTT statistics.
///
/// Keeps the last sample, the simple incremental mean of all samples, and a
/// smoothed value that tracks recent conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RttEstimator {
    last_ms: Option<u64>,
    mean_ms: f64,
    smoothed_ms: f64,
    samples: u64,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in the echo of a heartbeat sent at `original_timestamp_ms` and
    /// answered by the time the local clock reads `now_ms`.
    ///
    /// Returns the sample.  A timestamp from the future yields 0 rather than
    /// wrapping.
    pub fn record_echo(&mut self, original_timestamp_ms: u64, now_ms: u64) -> u64 {
        let sample = now_ms.saturating_sub(original_timestamp_ms);
        self.record_sample(sample);
        sample
    }

    pub fn record_sample(&mut self, sample_ms: u64) {
        let sample = sample_ms as f64;
        self.samples += 1;
        self.mean_ms += (sample - self.mean_ms) / self.samples as f64;
        self.smoothed_ms = if self.samples == 1 {
            sample
        } else {
            self.smoothed_ms + SMOOTHING * (sample - self.smoothed_ms)
        };
        self.last_ms = Some(sample_ms);
    }

    /// Most recent sample, or `None` before the first echo.
    pub fn last(&self) -> Option<Duration> {
        self.last_ms.map(Duration::from_millis)
    }

    /// Mean of every sample so far (0 before the first echo).
    pub fn mean_ms(&self) -> f64 {
        self.mean_ms
    }

    /// Exponentially smoothed RTT (0 before the first echo).
    pub fn smoothed_ms(&self) -> f64 {
        self.smoothed_ms
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}
