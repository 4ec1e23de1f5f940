//! framecue demo: synthetic MJPEG source through the worker-offloaded pipeline

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, trace, warn};
use tracing_subscriber::EnvFilter;

use framecue::capture::{MjpegDecoder, PatternSource, SeekingCapture, SyntheticFeeder};
use framecue::display::{FramebufferSurface, SurfaceWorker};
use framecue::pipeline::{IntervalTicker, PlaybackClock, WallClock};
use framecue::registry::WorkerRegistry;
use framecue::utils::Capabilities;
use framecue::{Config, PipelineHandle, VideoPipeline};

const RUN_FOR: Duration = Duration::from_secs(6);
const SOURCE_FPS: f64 = 30.0;
const SOURCE_SECONDS: f64 = 10.0;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framecue=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("framecue launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!(?config, "Configuration loaded");

    let caps = Capabilities::detect(true, true);
    if !caps.is_supported() {
        return Err(eyre!("worker-offloaded rendering is not supported here"));
    }

    let registry = WorkerRegistry::new();
    let _watch = registry.on_change(|workers| trace!(workers = workers.len(), "Registry changed"));

    let width = config.pipeline.width;
    let height = config.pipeline.height;

    let mut surface = SurfaceWorker::start(
        FramebufferSurface::new(),
        width,
        height,
        &config.surface,
        Some(registry.clone()),
    )?;

    let clock = Arc::new(WallClock::new());
    let pipeline_clock = {
        let clock = clock.clone();
        move || clock.now()
    };

    let pipeline = VideoPipeline::builder(config.pipeline.clone(), pipeline_clock, move |bitmap, ts| {
        match surface.try_draw(bitmap) {
            Ok(None) => trace!(ts, "Frame handed to surface"),
            Ok(Some(skipped)) => {
                trace!(ts, "Surface backlogged; skipping frame");
                skipped.close();
            }
            Err(e) => warn!(ts, "Draw failed: {}", e),
        }
    })
    .decode_config(config.decode.clone())
    .decoder(MjpegDecoder::new())
    .chunk_feeder(SyntheticFeeder::new(
        width,
        height,
        SOURCE_FPS,
        (SOURCE_FPS * SOURCE_SECONDS) as usize,
    ))
    .fallback_capture(SeekingCapture::new(
        PatternSource::new(width, height).with_duration(SOURCE_SECONDS),
    ))
    .on_queue_stats(|stats| trace!(size = stats.size, "Queue"))
    .registry(registry.clone())
    .build()?;

    let ticks = IntervalTicker::new(config.pipeline.tick_rate_hz)?;
    let handle = PipelineHandle::spawn(pipeline, ticks)?;
    info!(workers = ?registry.counts(), "Pipeline running");

    tokio::select! {
        _ = async {
            tokio::time::sleep(RUN_FOR / 2).await;
            info!("Seeking back to 1s");
            clock.seek(1.0);
            tokio::time::sleep(RUN_FOR / 2).await;
        } => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    let stats = handle.stats();
    handle.stop().await;

    info!(?stats, workers = ?registry.counts(), "framecue shutting down");
    Ok(())
}
