// ABOUTME: Clock-offset estimator fed by reflected timing probes
// ABOUTME: Median-of-window delta with commit hysteresis and sync-state events

use crate::config::{DELTA_UPDATE_THRESHOLD_MS, DELTA_WINDOW_CAPACITY, INIT_PROBE_COUNT};
use crate::stats::SampleWindow;
use crate::time::Clock;
use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Events published while the estimator digests probes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeSyncEvent {
    /// The committed delta moved past the update threshold.
    DeltaUpdated(f64),
    /// A probe was digested; waiters re-check synchronization state.
    StateUpdated,
}

/// Per-peer clock-offset estimator.
///
/// Each reflected probe yields one delta sample under the symmetric-delay
/// assumption; samples accumulate in a bounded window and the committed
/// delta follows the window median with hysteresis, so the rest of the
/// pipeline only resynchronizes on meaningful movement.
pub struct Timekeeper {
    clock: Clock,
    window: Mutex<SampleWindow>,
    // f64 bits; single writer (control context), torn reads are the only
    // hazard and a 64-bit atomic rules them out.
    committed_bits: AtomicU64,
    events: broadcast::Sender<TimeSyncEvent>,
}

impl Timekeeper {
    /// Create an estimator with an empty window and a committed delta of 0.
    pub fn new(clock: Clock) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            clock,
            window: Mutex::new(SampleWindow::new(DELTA_WINDOW_CAPACITY)),
            committed_bits: AtomicU64::new(0f64.to_bits()),
            events,
        }
    }

    /// Subscribe to estimator events.
    pub fn subscribe(&self) -> broadcast::Receiver<TimeSyncEvent> {
        self.events.subscribe()
    }

    /// Digest a reflected probe received right now.
    pub fn handle_response(&self, sent_at: f64, responded_at: f64) {
        self.record_probe(sent_at, responded_at, self.clock.now());
    }

    /// Digest a reflected probe received at `received_at`.
    ///
    /// The peer is assumed to have seen the request halfway through the
    /// round trip; the delta sample is the gap between its reported clock
    /// and that midpoint.
    pub fn record_probe(&self, sent_at: f64, responded_at: f64, received_at: f64) {
        let roundtrip = received_at - sent_at;
        let peer_received_at = sent_at + roundtrip / 2.0;
        let delta_sample = responded_at - peer_received_at;

        let median = {
            let mut window = self.window.lock();
            window.push(delta_sample);
            if window.full(INIT_PROBE_COUNT) {
                window.median()
            } else {
                None
            }
        };
        trace!(
            "timing probe: roundtrip={roundtrip:.2}ms delta_sample={delta_sample:.2}ms"
        );

        if let Some(real_delta) = median {
            let committed = self.committed_delta();
            if (real_delta - committed).abs() > DELTA_UPDATE_THRESHOLD_MS {
                self.committed_bits
                    .store(real_delta.to_bits(), Ordering::Relaxed);
                debug!("clock delta committed: {committed:.2}ms -> {real_delta:.2}ms");
                let _ = self.events.send(TimeSyncEvent::DeltaUpdated(real_delta));
            }
        }

        let _ = self.events.send(TimeSyncEvent::StateUpdated);
    }

    /// The committed clock delta in ms.
    pub fn committed_delta(&self) -> f64 {
        f64::from_bits(self.committed_bits.load(Ordering::Relaxed))
    }

    /// The live window median, falling back to the committed delta while
    /// the window is empty.
    pub fn precise_delta(&self) -> f64 {
        self.window
            .lock()
            .median()
            .unwrap_or_else(|| self.committed_delta())
    }

    /// The peer's clock estimate: local time plus the delta. `precise`
    /// selects the live median over the committed value.
    pub fn current_time(&self, precise: bool) -> f64 {
        let delta = if precise {
            self.precise_delta()
        } else {
            self.committed_delta()
        };
        self.clock.now() + delta
    }

    /// True once the window has digested the initial probe burst.
    pub fn is_synchronized(&self) -> bool {
        self.window.lock().full(INIT_PROBE_COUNT)
    }

    /// Resolve once [`Self::is_synchronized`] holds. Returns immediately if
    /// it already does; otherwise waits for probe digestion.
    pub async fn wait_for_first_sync(&self) {
        let mut events = self.subscribe();
        while !self.is_synchronized() {
            match events.recv().await {
                Ok(_) => continue,
                // Lagged: state may have moved while we were behind.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Drop accumulated samples; the committed delta is left in place.
    pub fn flush(&self) {
        self.window.lock().flush();
    }
}

impl std::fmt::Debug for Timekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timekeeper")
            .field("committed_delta", &self.committed_delta())
            .field("synchronized", &self.is_synchronized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_constant_delta(keeper: &Timekeeper, delta: f64, count: usize) {
        for i in 0..count {
            let sent_at = 1_000.0 + i as f64 * 100.0;
            let received_at = sent_at + 20.0;
            // Peer clock runs `delta` ahead; reflection at the midpoint.
            let responded_at = sent_at + 10.0 + delta;
            keeper.record_probe(sent_at, responded_at, received_at);
        }
    }

    #[test]
    fn test_delta_sample_math() {
        let keeper = Timekeeper::new(Clock::new());
        // roundtrip 40ms, peer reflected 17ms above the midpoint
        keeper.record_probe(100.0, 137.0, 140.0);
        assert_eq!(keeper.precise_delta(), 17.0);
    }

    #[test]
    fn test_not_synchronized_until_initial_burst() {
        let keeper = Timekeeper::new(Clock::new());
        feed_constant_delta(&keeper, 50.0, INIT_PROBE_COUNT - 1);
        assert!(!keeper.is_synchronized());
        feed_constant_delta(&keeper, 50.0, 1);
        assert!(keeper.is_synchronized());
    }

    #[test]
    fn test_committed_delta_waits_for_full_window() {
        let keeper = Timekeeper::new(Clock::new());
        feed_constant_delta(&keeper, 137.0, INIT_PROBE_COUNT - 1);
        assert_eq!(
            keeper.committed_delta(),
            0.0,
            "no commit before the window fills"
        );
        feed_constant_delta(&keeper, 137.0, 1);
        assert!((keeper.committed_delta() - 137.0).abs() < 1e-9);
    }

    #[test]
    fn test_small_median_shift_does_not_recommit() {
        let keeper = Timekeeper::new(Clock::new());
        feed_constant_delta(&keeper, 100.0, INIT_PROBE_COUNT);
        assert_eq!(keeper.committed_delta(), 100.0);

        let mut events = keeper.subscribe();
        // Drown the window in samples at 103: median moves to 103,
        // still inside the 5ms threshold.
        feed_constant_delta(&keeper, 103.0, DELTA_WINDOW_CAPACITY);
        assert_eq!(keeper.committed_delta(), 100.0);
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, TimeSyncEvent::DeltaUpdated(_)),
                "3ms median shift must not emit a delta update"
            );
        }
    }

    #[test]
    fn test_median_shift_past_threshold_recommits_once() {
        let keeper = Timekeeper::new(Clock::new());
        feed_constant_delta(&keeper, 100.0, INIT_PROBE_COUNT);
        assert_eq!(keeper.committed_delta(), 100.0);

        let mut events = keeper.subscribe();
        feed_constant_delta(&keeper, 107.0, DELTA_WINDOW_CAPACITY);
        assert_eq!(keeper.committed_delta(), 107.0);

        let mut delta_updates = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TimeSyncEvent::DeltaUpdated(_)) {
                delta_updates += 1;
            }
        }
        assert_eq!(
            delta_updates, 1,
            "crossing the threshold commits exactly once"
        );
    }

    #[test]
    fn test_state_updated_after_every_probe() {
        let keeper = Timekeeper::new(Clock::new());
        let mut events = keeper.subscribe();
        feed_constant_delta(&keeper, 10.0, 3);
        let mut state_updates = 0;
        while let Ok(event) = events.try_recv() {
            if event == TimeSyncEvent::StateUpdated {
                state_updates += 1;
            }
        }
        assert_eq!(state_updates, 3);
    }

    #[test]
    fn test_flush_resets_synchronization() {
        let keeper = Timekeeper::new(Clock::new());
        feed_constant_delta(&keeper, 42.0, INIT_PROBE_COUNT);
        assert!(keeper.is_synchronized());
        keeper.flush();
        assert!(!keeper.is_synchronized());
        // Committed value survives a flush.
        assert_eq!(keeper.committed_delta(), 42.0);
    }

    #[tokio::test]
    async fn test_wait_for_first_sync_resolves_on_tenth_probe() {
        let keeper = std::sync::Arc::new(Timekeeper::new(Clock::new()));
        let waiter = {
            let keeper = std::sync::Arc::clone(&keeper);
            tokio::spawn(async move { keeper.wait_for_first_sync().await })
        };
        tokio::task::yield_now().await;
        feed_constant_delta(&keeper, 5.0, INIT_PROBE_COUNT);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve once synchronized")
            .unwrap();
    }
}
