//! Process-wide monotonic millisecond clock used for header timestamps and
//! heartbeat RTT measurement.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the first call in this process.
///
/// Monotonic: never goes backwards, unaffected by wall-clock changes.  Values
/// are only meaningful within one process, which is all heartbeat echoes
/// need since the original timestamp comes back to the clock that made it.
pub fn monotonic_ms() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_monotonic_ms_never_decreases() {
        let a = monotonic_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = monotonic_ms();
        assert!(b >= a + 5, "expected at least 5ms to elapse ({a} -> {b})");
    }
}
