// ABOUTME: Audio source descriptor and chunked PCM stream types
// ABOUTME: Sources produce fixed-size indexed chunks anchored to their owner peer's clock

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Descriptor of an audio source, as exchanged over the control channel.
///
/// `started_at` and `latency_ms` are expressed on the owner peer's
/// monotonic clock; sinks translate them through the peer's clock delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Stable identity of the source.
    pub id: Uuid,
    /// Stable uuid of the peer that owns the source.
    pub peer_uuid: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Instant sample 0 was produced, in ms on the owner's clock.
    pub started_at: f64,
    /// Extra latency budget requested by the source, in ms.
    pub latency_ms: f64,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
}

/// One fixed-size PCM chunk of a source stream.
///
/// Chunks are produced in index order but may arrive out of order;
/// the index alone positions a chunk in the stream.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Monotonically increasing chunk index within the stream.
    pub index: u64,
    /// Interleaved f32 samples, `chunk_samples * channels` long.
    pub samples: Arc<[f32]>,
}

impl AudioChunk {
    /// Presentation timestamp of this chunk on the owner's clock, in ms.
    pub fn timestamp(&self, descriptor: &SourceDescriptor, chunk_samples: u32) -> f64 {
        let chunk_ms = chunk_samples as f64 * 1000.0 / descriptor.sample_rate as f64;
        descriptor.started_at + self.index as f64 * chunk_ms
    }
}

/// Shared handle to a live source.
///
/// Holds the current descriptor and fans descriptor updates out to
/// listeners (sinks resynchronize on every update).
#[derive(Clone)]
pub struct SourceHandle {
    inner: Arc<SourceShared>,
}

struct SourceShared {
    descriptor: RwLock<SourceDescriptor>,
    updates: broadcast::Sender<SourceDescriptor>,
}

impl SourceHandle {
    /// Create a handle around an initial descriptor.
    pub fn new(descriptor: SourceDescriptor) -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(SourceShared {
                descriptor: RwLock::new(descriptor),
                updates,
            }),
        }
    }

    /// Snapshot of the current descriptor.
    pub fn descriptor(&self) -> SourceDescriptor {
        self.inner.descriptor.read().clone()
    }

    /// Replace the descriptor and notify listeners.
    pub fn update(&self, descriptor: SourceDescriptor) {
        *self.inner.descriptor.write() = descriptor.clone();
        let _ = self.inner.updates.send(descriptor);
    }

    /// Subscribe to descriptor updates.
    pub fn subscribe(&self) -> broadcast::Receiver<SourceDescriptor> {
        self.inner.updates.subscribe()
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("descriptor", &self.descriptor())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor {
            id: Uuid::new_v4(),
            peer_uuid: Uuid::new_v4(),
            name: "test source".to_string(),
            started_at: 1_000.0,
            latency_ms: 250.0,
            sample_rate: 48_000,
            channels: 2,
        }
    }

    #[test]
    fn test_chunk_timestamp_advances_by_duration() {
        let desc = descriptor();
        let chunk = AudioChunk {
            index: 3,
            samples: Arc::from(vec![0.0f32; 960].into_boxed_slice()),
        };
        // 480 samples at 48kHz = 10ms per chunk
        assert_eq!(chunk.timestamp(&desc, 480), 1_030.0);
    }

    #[test]
    fn test_update_notifies_subscribers() {
        let handle = SourceHandle::new(descriptor());
        let mut rx = handle.subscribe();

        let mut updated = handle.descriptor();
        updated.latency_ms = 400.0;
        handle.update(updated.clone());

        let received = rx.try_recv().expect("update should be broadcast");
        assert_eq!(received, updated);
        assert_eq!(handle.descriptor().latency_ms, 400.0);
    }
}
