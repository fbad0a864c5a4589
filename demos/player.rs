// ABOUTME: Single-process demo: a sine source piped into a synchronized sink
// ABOUTME: Shows context setup, chunk production, and pipe lifecycle

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use unison::context::{Context, ContextOptions};
use unison::peer::PeerManager;
use unison::source::{AudioChunk, SourceDescriptor, SourceHandle};
use unison::Pipe;
use uuid::Uuid;

/// Play a synchronized test tone on the local output device
#[derive(Parser, Debug)]
#[command(name = "player")]
#[command(about = "Generate a sine tone and play it through a synced sink", long_about = None)]
struct Args {
    /// Tone frequency in Hz
    #[arg(short, long, default_value_t = 440.0)]
    frequency: f64,

    /// Playback volume (0-100)
    #[arg(short, long, default_value_t = 40)]
    volume: u8,

    /// How long to play, in seconds
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,

    /// Output device name (default output when omitted)
    #[arg(short, long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let context = Context::new(ContextOptions::builder().name("demo player").build());
    let manager = PeerManager::new(context.clone());
    let local = manager.local_peer();
    let config = context.config().clone();
    let clock = context.clock();

    // Anchor the stream half a second out so the sink has headroom.
    let descriptor = SourceDescriptor {
        id: Uuid::new_v4(),
        peer_uuid: local.uuid(),
        name: "sine".to_string(),
        started_at: clock.now() + 500.0,
        latency_ms: 0.0,
        sample_rate: config.stream_rate,
        channels: 2,
    };
    let source = SourceHandle::new(descriptor.clone());

    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
    let chunk_samples = config.chunk_samples;
    let chunk_interval = Duration::from_millis(config.chunk_duration_ms() as u64);
    let generator = tokio::spawn(async move {
        let mut interval = tokio::time::interval(chunk_interval);
        let step = args.frequency * std::f64::consts::TAU / descriptor.sample_rate as f64;
        let mut phase = 0.0f64;
        let mut index = 0u64;
        loop {
            interval.tick().await;
            let mut samples = Vec::with_capacity(chunk_samples as usize * 2);
            for _ in 0..chunk_samples {
                let value = (phase.sin() * 0.5) as f32;
                phase = (phase + step) % std::f64::consts::TAU;
                samples.push(value);
                samples.push(value);
            }
            let chunk = AudioChunk {
                index,
                samples: Arc::from(samples.into_boxed_slice()),
            };
            index += 1;
            if chunk_tx.send(chunk).is_err() {
                return;
            }
        }
    });

    println!(
        "Playing {}Hz for {}s at volume {}",
        args.frequency, args.seconds, args.volume
    );
    let pipe = Pipe::start(&config, local, source, chunk_rx, args.device).await?;
    pipe.set_volume(args.volume);

    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    if let Some(error) = pipe.take_error() {
        eprintln!("Stream reported an error: {error}");
    }
    pipe.stop();
    generator.abort();
    Ok(())
}
