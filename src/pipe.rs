// ABOUTME: Binds a source to a sink and keeps them glued together
// ABOUTME: Forwards source updates and clock-delta movement into the sink's resync

use crate::audio::{SyncedSink, VolumeControl};
use crate::config::Config;
use crate::error::Error;
use crate::peer::Peer;
use crate::source::{AudioChunk, SourceHandle};
use crate::time::TimeSyncEvent;
use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// The record of one source-to-sink binding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipeBinding {
    /// Source being rendered.
    pub source_id: Uuid,
    /// Sink rendering it.
    pub sink_id: Uuid,
    /// Stream anchor, on the source peer's clock.
    pub started_at: f64,
    /// Source latency budget, in ms.
    pub latency_ms: f64,
}

/// A live source-to-sink pipe.
///
/// Owns the sink, the chunk feed, and the listeners that keep the sink's
/// read window aligned: source descriptor updates and committed-delta
/// movement both funnel into [`SyncedSink::resync`]. Dropping the pipe
/// (or calling [`Pipe::stop`]) detaches everything and stops playback.
pub struct Pipe {
    sink_id: Uuid,
    binding: Arc<Mutex<PipeBinding>>,
    sink: Arc<SyncedSink>,
    volume: VolumeControl,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipe {
    /// Pipe `source` into a local synchronized sink fed by `chunks`.
    ///
    /// Waits for the source peer's first time sync (inside sink start)
    /// before audio begins.
    pub async fn start(
        config: &Config,
        peer: Peer,
        source: SourceHandle,
        chunks: mpsc::UnboundedReceiver<AudioChunk>,
        device_name: Option<String>,
    ) -> Result<Self, Error> {
        let descriptor = source.descriptor();
        let sink_id = Uuid::new_v4();
        let binding = Arc::new(Mutex::new(PipeBinding {
            source_id: descriptor.id,
            sink_id,
            started_at: descriptor.started_at,
            latency_ms: descriptor.latency_ms,
        }));

        let sink = Arc::new(
            SyncedSink::start(config, peer.clone(), source.clone(), device_name).await?,
        );
        let volume = sink.volume_control();
        debug!(
            "piped source {} into sink {sink_id}",
            descriptor.id
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(feed_chunks(Arc::clone(&sink), chunks)));
        tasks.push(tokio::spawn(follow_source(
            Arc::clone(&sink),
            source.subscribe(),
            Arc::clone(&binding),
        )));
        tasks.push(tokio::spawn(follow_time_delta(
            Arc::clone(&sink),
            peer.subscribe_time_sync(),
        )));

        Ok(Self {
            sink_id,
            binding,
            sink,
            volume,
            tasks,
        })
    }

    /// Identity of the sink end of this pipe.
    pub fn sink_id(&self) -> Uuid {
        self.sink_id
    }

    /// Snapshot of the binding record.
    pub fn binding(&self) -> PipeBinding {
        *self.binding.lock()
    }

    /// Set the sink volume (0-100); the callback fades to it click-free.
    pub fn set_volume(&self, volume: u8) {
        self.volume.set_volume(volume);
    }

    /// Mute or unmute the sink.
    pub fn set_muted(&self, muted: bool) {
        self.volume.set_muted(muted);
    }

    /// Whether the sink's output device is present.
    pub fn is_available(&self) -> bool {
        self.sink.is_available()
    }

    /// Drain the sink's last stream error, if any.
    pub fn take_error(&self) -> Option<String> {
        self.sink.take_error()
    }

    /// Unpipe: detach listeners and stop the sink.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("binding", &self.binding())
            .finish()
    }
}

async fn feed_chunks(sink: Arc<SyncedSink>, mut chunks: mpsc::UnboundedReceiver<AudioChunk>) {
    while let Some(chunk) = chunks.recv().await {
        sink.write_chunk(&chunk);
    }
    trace!("chunk stream ended");
}

async fn follow_source(
    sink: Arc<SyncedSink>,
    mut updates: broadcast::Receiver<crate::source::SourceDescriptor>,
    binding: Arc<Mutex<PipeBinding>>,
) {
    loop {
        match updates.recv().await {
            Ok(descriptor) => {
                {
                    let mut binding = binding.lock();
                    binding.started_at = descriptor.started_at;
                    binding.latency_ms = descriptor.latency_ms;
                }
                sink.resync();
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                trace!("missed {skipped} source updates, resyncing anyway");
                sink.resync();
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn follow_time_delta(
    sink: Arc<SyncedSink>,
    mut events: broadcast::Receiver<TimeSyncEvent>,
) {
    loop {
        match events.recv().await {
            Ok(TimeSyncEvent::DeltaUpdated(_)) => sink.resync(),
            Ok(TimeSyncEvent::StateUpdated) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => sink.resync(),
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
