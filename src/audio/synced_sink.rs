// ABOUTME: Synchronized local sink: wall-clock-aligned playback from the shared buffer
// ABOUTME: Owns the cpal stream on a dedicated thread; callback nudges its read phase

use crate::audio::gain::{GainSmoother, VolumeControl};
use crate::audio::shared_buffer::{SharedDelay, SharedSampleBuffer};
use crate::config::Config;
use crate::error::Error;
use crate::peer::Peer;
use crate::source::{AudioChunk, SourceHandle};
use crate::time::Clock;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How the callback corrects its read phase against the shared delay.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Correction {
    /// Inside the deadband; leave the phase alone.
    Hold,
    /// Slew the phase by this many ms toward the clock position.
    Slew(f64),
    /// Error is gross; jump straight to the clock position.
    Snap,
}

/// Hysteresis planner for read-phase drift.
///
/// Engages above `ENGAGE_MS`, keeps correcting until the error drops under
/// `RELEASE_MS`, and snaps outright past `SNAP_MS`. The slew per callback
/// is capped so corrections stay inaudible.
struct PhaseCorrector {
    engaged: bool,
}

impl PhaseCorrector {
    const ENGAGE_MS: f64 = 3.0;
    const RELEASE_MS: f64 = 1.5;
    const SNAP_MS: f64 = 500.0;
    const MAX_SLEW_MS: f64 = 0.25;

    fn new() -> Self {
        Self { engaged: false }
    }

    fn plan(&mut self, error_ms: f64) -> Correction {
        let abs = error_ms.abs();
        if abs >= Self::SNAP_MS {
            self.engaged = false;
            return Correction::Snap;
        }
        let threshold = if self.engaged {
            Self::RELEASE_MS
        } else {
            Self::ENGAGE_MS
        };
        if abs <= threshold {
            self.engaged = false;
            return Correction::Hold;
        }
        self.engaged = true;
        Correction::Slew(error_ms.signum() * abs.min(Self::MAX_SLEW_MS))
    }
}

/// Sample-accurate local sink for one source.
///
/// Chunks are copied into the shared circular buffer at offsets derived
/// from their index; the audio callback reads a window positioned by the
/// shared delay scalar. The callback never allocates, locks, or blocks.
pub struct SyncedSink {
    peer: Peer,
    source: SourceHandle,
    clock: Clock,
    buffer: Arc<SharedSampleBuffer>,
    delay: Arc<SharedDelay>,
    volume: VolumeControl,
    available: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    chunk_stride: u64,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncedSink {
    /// Bind `source` to a local output device and start playing.
    ///
    /// Waits until the source's peer is time-synchronized, then acquires
    /// the device at the source's format and spawns the callback worker.
    /// `device_name` selects a specific output; `None` takes the default.
    pub async fn start(
        config: &Config,
        peer: Peer,
        source: SourceHandle,
        device_name: Option<String>,
    ) -> Result<Self, Error> {
        peer.wait_for_first_time_sync().await;

        let descriptor = source.descriptor();
        let clock = Clock::new();
        let buffer = Arc::new(SharedSampleBuffer::for_format(
            config.max_latency_ms,
            descriptor.sample_rate,
            descriptor.channels,
        ));
        let delay = Arc::new(SharedDelay::new(compute_delay(&peer, &source, clock)));
        let volume = VolumeControl::new(100);
        let last_error = Arc::new(Mutex::new(None));
        let available = Arc::new(AtomicBool::new(true));

        let stop_tx = spawn_output_thread(
            device_name,
            descriptor.sample_rate,
            descriptor.channels,
            Arc::clone(&buffer),
            Arc::clone(&delay),
            volume.clone(),
            Arc::clone(&last_error),
            clock,
        )
        .await?;
        debug!(
            "synced sink started: {}Hz {}ch, delay {:.1}ms",
            descriptor.sample_rate,
            descriptor.channels,
            delay.load()
        );

        let mut tasks = Vec::new();

        // 1 Hz re-derivation keeps the delay honest between delta updates.
        {
            let peer = peer.clone();
            let source = source.clone();
            let delay = Arc::clone(&delay);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    delay.store(compute_delay(&peer, &source, clock));
                }
            }));
        }

        // Device-availability poll.
        {
            let available = Arc::clone(&available);
            let poll_interval = config.sink_poll_interval;
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(poll_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let present = tokio::task::spawn_blocking(|| {
                        cpal::default_host().default_output_device().is_some()
                    })
                    .await
                    .unwrap_or(false);
                    available.store(present, Ordering::Relaxed);
                }
            }));
        }

        Ok(Self {
            peer,
            source,
            clock,
            buffer,
            delay,
            volume,
            available,
            last_error,
            chunk_stride: config.chunk_samples as u64 * descriptor.channels as u64,
            stop_tx: Some(stop_tx),
            tasks,
        })
    }

    /// Copy a chunk into the shared buffer at its stream position.
    pub fn write_chunk(&self, chunk: &AudioChunk) {
        let offset = chunk.index * self.chunk_stride;
        self.buffer.write(offset, &chunk.samples);
    }

    /// Re-derive the shared delay from the peer clock and the source's
    /// current anchor. Called on every delta update and source update.
    pub fn resync(&self) {
        self.delay
            .store(compute_delay(&self.peer, &self.source, self.clock));
    }

    /// Current shared delay in ms.
    pub fn delay_ms(&self) -> f64 {
        self.delay.load()
    }

    /// Volume/mute handle for this sink.
    pub fn volume_control(&self) -> VolumeControl {
        self.volume.clone()
    }

    /// Whether an output device is currently present.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Take the last stream error, if any, clearing it.
    pub fn take_error(&self) -> Option<String> {
        self.last_error.lock().take()
    }

    /// Whether the stream has reported an error since the last drain.
    pub fn has_error(&self) -> bool {
        self.last_error.lock().is_some()
    }

    /// Stop playback, detach listeners, and release the buffer.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

impl Drop for SyncedSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SyncedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedSink")
            .field("peer", &self.peer.uuid())
            .field("delay_ms", &self.delay.load())
            .field("available", &self.is_available())
            .finish()
    }
}

/// The quantity handed to the callback: how many ms ahead of the local
/// clock sample 0 of the stream sits.
fn compute_delay(peer: &Peer, source: &SourceHandle, clock: Clock) -> f64 {
    let descriptor = source.descriptor();
    peer.current_time(true) - descriptor.started_at - descriptor.latency_ms - clock.now()
}

fn open_device(preferred: Option<&str>) -> Result<cpal::Device, Error> {
    let host = cpal::default_host();
    match preferred {
        Some(name) => {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::Output(e.to_string()))?;
            devices
                .find(|device| device.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| Error::Output(format!("output device '{name}' not found")))
        }
        None => host
            .default_output_device()
            .ok_or_else(|| Error::Output("No output device available".to_string())),
    }
}

/// Run the cpal stream on its own thread so the sink handle stays `Send`.
/// The thread parks on the stop channel; dropping the sender releases it.
#[allow(clippy::too_many_arguments)]
async fn spawn_output_thread(
    device_name: Option<String>,
    sample_rate: u32,
    channels: u16,
    buffer: Arc<SharedSampleBuffer>,
    delay: Arc<SharedDelay>,
    volume: VolumeControl,
    error_sink: Arc<Mutex<Option<String>>>,
    clock: Clock,
) -> Result<std::sync::mpsc::Sender<()>, Error> {
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

    std::thread::Builder::new()
        .name("unison-output".to_string())
        .spawn(move || {
            let built = open_device(device_name.as_deref()).and_then(|device| {
                let stream_config = StreamConfig {
                    channels,
                    sample_rate: cpal::SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };
                build_stream(
                    &device,
                    &stream_config,
                    buffer,
                    delay,
                    volume,
                    error_sink,
                    clock,
                )
            });
            match built {
                Ok(stream) => {
                    if let Err(err) = stream.play() {
                        let _ = ready_tx.send(Err(Error::Output(err.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));
                    // Park until the sink is stopped or dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            }
        })
        .map_err(|e| Error::Output(e.to_string()))?;

    ready_rx
        .await
        .map_err(|_| Error::Output("output thread died during startup".to_string()))??;
    Ok(stop_tx)
}

fn build_stream(
    device: &cpal::Device,
    stream_config: &StreamConfig,
    buffer: Arc<SharedSampleBuffer>,
    delay: Arc<SharedDelay>,
    volume: VolumeControl,
    error_sink: Arc<Mutex<Option<String>>>,
    clock: Clock,
) -> Result<cpal::Stream, Error> {
    let channels = stream_config.channels as usize;
    let sample_rate = stream_config.sample_rate.0;
    let mut smoother = GainSmoother::new(sample_rate, volume.gain());
    let mut corrector = PhaseCorrector::new();
    let mut phase_frames: f64 = 0.0;
    let mut started = false;

    let stream = device
        .build_output_stream(
            stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let delay_ms = delay.load();
                let clock_pos_frames = (clock.now() + delay_ms) * sample_rate as f64 / 1000.0;

                // Stream start still ahead of us: hold silence.
                if clock_pos_frames < 0.0 {
                    started = false;
                    data.fill(0.0);
                    return;
                }

                if !started {
                    phase_frames = clock_pos_frames;
                    started = true;
                }

                // The phase advances on the device clock, the target on the
                // system clock; the planner absorbs the difference.
                let error_ms = (phase_frames - clock_pos_frames) * 1000.0 / sample_rate as f64;
                match corrector.plan(error_ms) {
                    Correction::Hold => {}
                    Correction::Slew(ms) => {
                        phase_frames -= ms * sample_rate as f64 / 1000.0;
                    }
                    Correction::Snap => phase_frames = clock_pos_frames,
                }

                let read_offset = phase_frames.max(0.0).round() as u64 * channels as u64;
                buffer.read_and_clear(read_offset, data);
                smoother.apply(data, channels, volume.gain());
                phase_frames += frames as f64;
            },
            move |err| {
                *error_sink.lock() = Some(err.to_string());
            },
            None,
        )
        .map_err(|e| Error::Output(e.to_string()))?;

    Ok(stream)
}
