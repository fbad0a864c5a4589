// ABOUTME: Monotonic millisecond clock anchored at process start
// ABOUTME: Non-decreasing, immune to wall-clock adjustments, sub-ms precision

use std::sync::OnceLock;
use std::time::Instant;

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

fn process_epoch() -> Instant {
    *PROCESS_EPOCH.get_or_init(Instant::now)
}

/// Handle to the process-relative monotonic clock.
///
/// All instances share one anchor, taken the first time any clock is
/// created, so readings are comparable across the whole process. Backed by
/// [`Instant`], which is monotonic and unaffected by wall-clock changes.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Create a clock handle over the shared process anchor.
    pub fn new() -> Self {
        Self {
            epoch: process_epoch(),
        }
    }

    /// Milliseconds since process start. Granularity is sub-millisecond on
    /// every supported platform.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clock_is_non_decreasing() {
        let clock = Clock::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= last, "clock went backwards: {now} < {last}");
            last = now;
        }
    }

    #[test]
    fn test_clock_instances_share_anchor() {
        let a = Clock::new();
        let b = Clock::new();
        let diff = (a.now() - b.now()).abs();
        assert!(diff < 1.0, "anchors diverged by {diff}ms");
    }

    #[test]
    fn test_clock_advances_with_real_time() {
        let clock = Clock::new();
        let before = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let after = clock.now();
        assert!(
            after - before >= 9.0,
            "expected ~10ms to elapse, got {}ms",
            after - before
        );
    }
}
