// ABOUTME: Lock-free circular sample buffer shared with the audio callback
// ABOUTME: Plus the atomic delay scalar that positions the callback's read window

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Wraparound f32 sample buffer shared between the feeder task and the
/// audio callback.
///
/// There are no head or tail pointers: writes land at absolute logical
/// offsets taken modulo the length, and correctness relies on the producer
/// staying ahead of the consumer by the configured delay. Samples are
/// stored as `f32` bits in `AtomicU32` cells with relaxed ordering; a torn
/// sample is impossible and cross-cell ordering does not matter for PCM.
pub struct SharedSampleBuffer {
    cells: Box<[AtomicU32]>,
}

impl SharedSampleBuffer {
    /// Allocate a zeroed buffer of `len` samples.
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "buffer length must be positive");
        let cells = (0..len).map(|_| AtomicU32::new(0f32.to_bits())).collect();
        Self { cells }
    }

    /// Size the buffer for `max_latency_ms` of audio at the given format.
    pub fn for_format(max_latency_ms: u32, sample_rate: u32, channels: u16) -> Self {
        let len =
            (max_latency_ms as u64 * sample_rate as u64 / 1000) as usize * channels as usize;
        Self::new(len)
    }

    /// Length in samples.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True when the buffer holds no cells. Never true in practice; the
    /// constructor rejects zero lengths.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Write `samples` starting at logical offset `offset` (modulo length).
    pub fn write(&self, offset: u64, samples: &[f32]) {
        let len = self.cells.len() as u64;
        for (k, &sample) in samples.iter().enumerate() {
            let index = ((offset + k as u64) % len) as usize;
            self.cells[index].store(sample.to_bits(), Ordering::Relaxed);
        }
    }

    /// Read `out.len()` samples starting at logical offset `offset`.
    pub fn read(&self, offset: u64, out: &mut [f32]) {
        let len = self.cells.len() as u64;
        for (k, slot) in out.iter_mut().enumerate() {
            let index = ((offset + k as u64) % len) as usize;
            *slot = f32::from_bits(self.cells[index].load(Ordering::Relaxed));
        }
    }

    /// Read and zero `out.len()` samples starting at `offset`.
    ///
    /// The consumer clears behind itself so that a stalled producer plays
    /// out as silence instead of a stale lap of the buffer.
    pub fn read_and_clear(&self, offset: u64, out: &mut [f32]) {
        let len = self.cells.len() as u64;
        let zero = 0f32.to_bits();
        for (k, slot) in out.iter_mut().enumerate() {
            let index = ((offset + k as u64) % len) as usize;
            *slot = f32::from_bits(self.cells[index].swap(zero, Ordering::Relaxed));
        }
    }
}

/// Shared playback-delay scalar, in milliseconds.
///
/// Written by the control context on every resync, read by the audio
/// callback on every tick. Stored as f64 bits in an `AtomicU64`; tearing is
/// the only hazard the callback cares about and the 64-bit atomic rules it
/// out.
#[derive(Debug)]
pub struct SharedDelay {
    bits: AtomicU64,
}

impl SharedDelay {
    /// Create a delay scalar with the given initial value.
    pub fn new(delay_ms: f64) -> Self {
        Self {
            bits: AtomicU64::new(delay_ms.to_bits()),
        }
    }

    /// Store a new delay.
    pub fn store(&self, delay_ms: f64) {
        self.bits.store(delay_ms.to_bits(), Ordering::Relaxed);
    }

    /// Load the current delay.
    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}
