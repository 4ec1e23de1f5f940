//! Video pipeline orchestrator
//!
//! Owns the presentation queue and decides, once per tick, which frames are
//! due against the external playback clock. Decoded frames arrive from the
//! decode worker as events and are drained during every tick, only while the
//! queue has room, so the queue is only ever touched from the task that runs
//! the loop and the codec never runs further ahead than the two bounded
//! buffers allow.
//!
//! A flush leaves the decode stream out of sync with the clock: the chunk
//! feeder cannot seek, so the next decoded frames may lie far behind or ahead
//! of the new position. Until a decoded frame lands near the playhead the
//! stream counts as resyncing and fallback capture keeps the queue filled.

use std::sync::Arc;

use crossbeam::utils::CachePadded;
use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::clock::PlaybackClock;
use super::queue::{FrameCounters, PresentationQueue, QueuedFrame};
use crate::capture::{
    Bitmap, ChunkFeeder, ChunkSink, DecodeCommand, DecodeEvent, DecodeWorker, FallbackCapture,
    FrameDecoder,
};
use crate::error::{PipelineError, Result};
use crate::registry::{meta, WorkerId, WorkerKind, WorkerRegistry};
use crate::{DecodeConfig, PipelineConfig, PipelineStats};

/// Clock jump between two ticks treated as a seek.
pub const DRIFT_THRESHOLD_SECS: f64 = 0.25;

/// Receives each due frame together with its timestamp.
pub type FrameCallback = Box<dyn FnMut(Bitmap, f64) + Send>;

pub type StatsCallback = Box<dyn FnMut(QueueStats) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

/// What is known about the real decode stream.
#[derive(Debug, Default)]
struct StreamHealth {
    worker_ready: bool,
    worker_closed: bool,
    feeder_started: bool,
    feeder_failed: bool,
    feeder_empty: bool,
    errors: u32,
    /// Set by a flush, cleared once a decoded frame lands near the playhead.
    resyncing: bool,
}

pub struct VideoPipelineBuilder {
    config: PipelineConfig,
    decode: DecodeConfig,
    clock: Arc<dyn PlaybackClock>,
    on_frame: FrameCallback,
    on_queue_stats: Option<StatsCallback>,
    fallback: Option<Arc<dyn FallbackCapture>>,
    feeder: Option<Box<dyn ChunkFeeder>>,
    decoder: Option<Box<dyn FrameDecoder>>,
    registry: Option<Arc<WorkerRegistry>>,
}

impl VideoPipelineBuilder {
    pub fn decode_config(mut self, decode: DecodeConfig) -> Self {
        self.decode = decode;
        self
    }

    /// Codec run inside the decode worker. Without one, only fallback
    /// capture can fill the queue.
    pub fn decoder(mut self, decoder: impl FrameDecoder) -> Self {
        self.decoder = Some(Box::new(decoder));
        self
    }

    pub fn chunk_feeder(mut self, feeder: impl ChunkFeeder + 'static) -> Self {
        self.feeder = Some(Box::new(feeder));
        self
    }

    pub fn fallback_capture(mut self, capture: impl FallbackCapture + 'static) -> Self {
        self.fallback = Some(Arc::new(capture));
        self
    }

    pub fn on_queue_stats(mut self, callback: impl FnMut(QueueStats) + Send + 'static) -> Self {
        self.on_queue_stats = Some(Box::new(callback));
        self
    }

    pub fn registry(mut self, registry: Arc<WorkerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<VideoPipeline> {
        self.config.validate()?;
        if self.decode.command_queue_depth == 0 {
            return Err(PipelineError::invalid_config(
                "decode.command_queue_depth must be >= 1",
            ));
        }

        Ok(VideoPipeline {
            queue: PresentationQueue::new(self.config.max_queue_size),
            config: self.config,
            decode: self.decode,
            clock: self.clock,
            on_frame: self.on_frame,
            on_queue_stats: self.on_queue_stats,
            fallback: self.fallback,
            feeder: self.feeder,
            decoder: self.decoder,
            registry: self.registry,
            registration: None,
            reported: None,
            state: State::Idle,
            worker: None,
            feeder_task: None,
            feeder_outcome: None,
            health: StreamHealth::default(),
            epoch: 0,
            last_clock: None,
            last_presented: None,
            held: None,
        })
    }
}

pub struct VideoPipeline {
    config: PipelineConfig,
    decode: DecodeConfig,
    clock: Arc<dyn PlaybackClock>,
    on_frame: FrameCallback,
    on_queue_stats: Option<StatsCallback>,
    fallback: Option<Arc<dyn FallbackCapture>>,
    feeder: Option<Box<dyn ChunkFeeder>>,
    decoder: Option<Box<dyn FrameDecoder>>,
    registry: Option<Arc<WorkerRegistry>>,
    registration: Option<WorkerId>,
    reported: Option<(usize, u64)>,

    queue: PresentationQueue,
    state: State,
    worker: Option<DecodeWorker>,
    feeder_task: Option<JoinHandle<()>>,
    feeder_outcome: Option<oneshot::Receiver<Result<usize>>>,
    health: StreamHealth,
    /// Bumped on every flush; decode output tagged with an older epoch is stale.
    epoch: u64,
    last_clock: Option<f64>,
    /// Timestamp of the last delivered frame since the last flush.
    last_presented: Option<f64>,
    /// First decoded frame ahead of the playhead while resyncing.
    held: Option<QueuedFrame>,
}

impl VideoPipeline {
    pub fn builder(
        config: PipelineConfig,
        clock: impl PlaybackClock + 'static,
        on_frame: impl FnMut(Bitmap, f64) + Send + 'static,
    ) -> VideoPipelineBuilder {
        VideoPipelineBuilder {
            config,
            decode: DecodeConfig::default(),
            clock: Arc::new(clock),
            on_frame: Box::new(on_frame),
            on_queue_stats: None,
            fallback: None,
            feeder: None,
            decoder: None,
            registry: None,
        }
    }

    /// Spawn the decode worker and start feeding it.
    ///
    /// Calling this on a running pipeline does nothing. The feeder runs as a
    /// tokio task, so it is only started when called inside a runtime.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            State::Running => return Ok(()),
            State::Stopped => return Err(PipelineError::Stopped),
            State::Idle => {}
        }

        if let Some(decoder) = self.decoder.take() {
            let worker = DecodeWorker::spawn(
                decoder,
                self.decode.command_queue_depth,
                self.config.max_queue_size,
            )?;
            worker.post(DecodeCommand::Init {
                codec: self.decode.codec.clone(),
            })?;

            if let Some(registry) = &self.registry {
                let id = registry.register(
                    WorkerKind::Decode,
                    Some(format!(
                        "{} {}x{}",
                        self.decode.codec, self.config.width, self.config.height
                    )),
                    Some(meta([("queue", json!(0)), ("epoch", json!(0))])),
                );
                self.registration = Some(id);
            }

            self.start_feeder(&worker);
            self.worker = Some(worker);
        } else if self.feeder.take().is_some() {
            warn!("Chunk feeder supplied without a decoder; ignoring it");
        }

        self.state = State::Running;
        info!(
            decode = self.worker.is_some(),
            fallback = self.fallback.is_some(),
            max_queue_size = self.config.max_queue_size,
            "Video pipeline started"
        );
        Ok(())
    }

    fn start_feeder(&mut self, worker: &DecodeWorker) {
        let Some(feeder) = self.feeder.take() else {
            debug!("No chunk feeder; decode worker stays idle");
            return;
        };
        let Some(sender) = worker.chunk_sender() else {
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Chunk feeder needs a tokio runtime: {}", e);
                return;
            }
        };

        let (tx, rx) = oneshot::channel();
        let task = runtime.spawn(async move {
            let outcome = feeder.feed(ChunkSink::new(sender)).await;
            if tx.send(outcome).is_err() {
                trace!("Pipeline gone before feeder finished");
            }
        });

        self.feeder_task = Some(task);
        self.feeder_outcome = Some(rx);
        self.health.feeder_started = true;
    }

    /// Terminate the decode worker, release every buffered bitmap and
    /// unregister. Terminal: the pipeline cannot be started again.
    pub fn stop(&mut self) {
        if self.state == State::Stopped {
            return;
        }
        self.state = State::Stopped;

        if let Some(task) = self.feeder_task.take() {
            task.abort();
        }
        self.feeder_outcome = None;

        if let Some(mut worker) = self.worker.take() {
            worker.terminate();
        }

        self.release_held();
        let released = self.queue.clear();

        if let (Some(registry), Some(id)) = (&self.registry, self.registration.take()) {
            registry.unregister(id);
        }
        metrics::gauge!("framecue.queue.depth").set(0.0);
        info!(released, "Video pipeline stopped");
    }

    /// Drop everything buffered, here and in the decode worker.
    ///
    /// Used on discontinuities; the pipeline keeps running.
    pub fn flush(&mut self) {
        self.release_held();
        let dropped = self.queue.clear();
        self.epoch += 1;
        self.last_presented = None;
        self.health.resyncing = self.worker.is_some();

        if let Some(worker) = &self.worker {
            if let Err(e) = worker.post(DecodeCommand::Flush { epoch: self.epoch }) {
                warn!("Could not flush decode worker: {}", e);
            }
        }

        debug!(dropped, epoch = self.epoch, "Pipeline flushed");
        self.report_stats();
    }

    /// Top the queue up with fallback captures slightly ahead of `playhead`.
    ///
    /// Only used while no real decode stream is active. Returns how many
    /// frames were queued.
    pub async fn request_ahead(&mut self, playhead: f64) -> usize {
        if self.state != State::Running || self.decode_active() {
            return 0;
        }
        let Some(fallback) = self.fallback.clone() else {
            return 0;
        };

        let frames = self.config.nb_frames_to_check;
        let step = self.config.request_margin_ms / frames as f64 / 1000.0;
        // Never ask for anything already queued or already shown.
        let floor = self
            .queue
            .newest_timestamp()
            .into_iter()
            .chain(self.last_presented)
            .reduce(f64::max);
        let targets: Vec<f64> = (0..frames)
            .map(|i| playhead + i as f64 * step)
            .filter(|t| floor.map_or(true, |floor| *t > floor))
            .take(self.queue.room())
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let captures = join_all(targets.iter().map(|&t| fallback.capture(t))).await;

        let mut queued = 0;
        for (timestamp, bitmap) in targets.into_iter().zip(captures) {
            match bitmap {
                Some(bitmap) => {
                    self.enqueue(timestamp, bitmap);
                    queued += 1;
                }
                None => trace!(timestamp, "Fallback capture produced nothing"),
            }
        }
        queued
    }

    /// One iteration of the scheduling loop.
    pub async fn tick(&mut self) {
        if self.state != State::Running {
            return;
        }

        self.poll_feeder();

        let now = self.clock.now();
        if !now.is_finite() {
            warn!(now, "Clock returned a non-finite time; skipping tick");
            return;
        }

        if let Some(previous) = self.last_clock {
            if (now - previous).abs() > DRIFT_THRESHOLD_SECS {
                debug!(previous, now, "Clock discontinuity");
                self.flush();
            }
        }
        self.last_clock = Some(now);

        self.drain_decode_events(now);

        if self.queue.len() * 2 < self.config.max_queue_size {
            self.request_ahead(now).await;
            self.report_stats();
        }

        let deadline = now + self.config.present_margin();
        while let Some(frame) = self.queue.pop_due(deadline) {
            trace!(ts = frame.timestamp, now, "Presenting frame");
            self.last_presented = Some(frame.timestamp);
            (self.on_frame)(frame.bitmap, frame.timestamp);
            metrics::counter!("framecue.frames.presented").increment(1);
            self.report_stats();
        }

        self.report_registry();
    }

    /// React to one message from the decode worker.
    pub(crate) fn handle_decode_event(&mut self, event: DecodeEvent) {
        match event {
            DecodeEvent::Frame { bitmap, ts, epoch } => {
                if self.state != State::Running || epoch != self.epoch {
                    trace!(ts, epoch, current = self.epoch, "Releasing frame from before flush");
                    self.release_stale(bitmap);
                    return;
                }
                self.accept_decoded(ts, bitmap);
            }
            DecodeEvent::Ready => {
                self.health.worker_ready = true;
                info!("Decode worker ready");
            }
            DecodeEvent::Error { message } => {
                self.health.errors += 1;
                metrics::counter!("framecue.decode.errors").increment(1);
                warn!(errors = self.health.errors, "Decode error: {}", message);
                if self.health.errors == self.decode.max_decode_errors {
                    warn!("Too many decode errors; switching to fallback capture");
                }
            }
            DecodeEvent::Closed => {
                self.health.worker_closed = true;
                debug!("Decode worker closed");
            }
        }
    }

    /// Route a current-epoch decoded frame, holding it back while resyncing
    /// if it is still ahead of the playhead.
    fn accept_decoded(&mut self, ts: f64, bitmap: Bitmap) {
        if self.health.resyncing {
            if let Some(now) = self.last_clock {
                let margin = self.config.present_margin();
                if ts < now - margin {
                    trace!(ts, now, "Decoded frame behind the playhead while resyncing");
                    self.release_stale(bitmap);
                    return;
                }
                if ts >= now + margin {
                    if self.held.is_some() {
                        self.enqueue(ts, bitmap);
                    } else {
                        trace!(ts, now, "Holding decoded frame until it is due");
                        self.held = Some(QueuedFrame {
                            timestamp: ts,
                            bitmap,
                        });
                    }
                    return;
                }
            }
            self.end_resync(ts);
        }
        self.enqueue(ts, bitmap);
    }

    fn end_resync(&mut self, ts: f64) {
        self.health.resyncing = false;
        debug!(ts, epoch = self.epoch, "Decode stream back in sync");
    }

    /// Pull worker events while the queue has room.
    ///
    /// Stops early while a held frame is not yet due; the worker then blocks
    /// on its event channel.
    fn drain_decode_events(&mut self, now: f64) {
        let held_due = self
            .held
            .as_ref()
            .is_some_and(|frame| frame.timestamp < now + self.config.present_margin());
        if held_due {
            if let Some(frame) = self.held.take() {
                self.end_resync(frame.timestamp);
                self.enqueue(frame.timestamp, frame.bitmap);
            }
        }

        while self.held.is_none() && self.queue.room() > 0 {
            let Some(worker) = &self.worker else {
                return;
            };
            match worker.events().try_recv() {
                Ok(event) => self.handle_decode_event(event),
                Err(_) => break,
            }
        }
    }

    fn poll_feeder(&mut self) {
        let Some(outcome) = self.feeder_outcome.as_mut() else {
            return;
        };
        let result = match outcome.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => return,
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Closed) => {
                Err(PipelineError::WorkerGone("chunk feeder"))
            }
        };

        self.feeder_outcome = None;
        self.feeder_task = None;
        match result {
            Ok(0) => {
                info!("Chunk feeder pushed nothing; using fallback capture");
                self.health.feeder_empty = true;
            }
            Ok(chunks) => debug!(chunks, "Chunk feeder finished"),
            Err(e) => {
                warn!("Chunk feeder failed: {}", e);
                self.health.feeder_failed = true;
            }
        }
    }

    fn enqueue(&mut self, timestamp: f64, bitmap: Bitmap) {
        if self.last_presented.is_some_and(|last| timestamp < last) {
            trace!(timestamp, "Frame older than the last presented one");
            self.release_stale(bitmap);
            return;
        }
        if let Some(evicted) = self.queue.insert(QueuedFrame { timestamp, bitmap }) {
            trace!(evicted, timestamp, "Queue full; evicted oldest frame");
            metrics::counter!("framecue.frames.evicted").increment(1);
        }
    }

    fn release_stale(&self, bitmap: Bitmap) {
        self.queue
            .counters()
            .stale
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        metrics::counter!("framecue.frames.stale").increment(1);
        bitmap.close();
    }

    fn release_held(&mut self) {
        if let Some(frame) = self.held.take() {
            self.release_stale(frame.bitmap);
        }
    }

    fn report_stats(&mut self) {
        let size = self.queue.len();
        metrics::gauge!("framecue.queue.depth").set(size as f64);
        if let Some(callback) = self.on_queue_stats.as_mut() {
            callback(QueueStats { size });
        }
    }

    fn report_registry(&mut self) {
        let (Some(registry), Some(id)) = (&self.registry, self.registration) else {
            return;
        };
        let current = (self.queue.len(), self.epoch);
        if self.reported == Some(current) {
            return;
        }
        registry.update(
            id,
            meta([
                ("queue", json!(current.0)),
                ("epoch", json!(current.1)),
                ("ready", json!(self.health.worker_ready)),
                ("decode_errors", json!(self.health.errors)),
            ]),
        );
        self.reported = Some(current);
    }

    /// Whether a real decode stream is expected to keep the queue filled.
    pub fn decode_active(&self) -> bool {
        let health = &self.health;
        self.worker.is_some()
            && health.feeder_started
            && !health.feeder_empty
            && !health.feeder_failed
            && !health.worker_closed
            && !health.resyncing
            && health.errors < self.decode.max_decode_errors
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_timestamps(&self) -> Vec<f64> {
        self.queue.timestamps()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn counters(&self) -> Arc<CachePadded<FrameCounters>> {
        self.queue.counters()
    }

    pub fn stats(&self) -> PipelineStats {
        stats_from(&self.queue.counters())
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn stats_from(counters: &FrameCounters) -> PipelineStats {
    use std::sync::atomic::Ordering::Relaxed;
    PipelineStats {
        queue_depth: counters.depth.load(Relaxed),
        inserted: counters.inserted.load(Relaxed),
        presented: counters.presented.load(Relaxed),
        evicted: counters.evicted.load(Relaxed),
        flushed: counters.flushed.load(Relaxed),
        stale: counters.stale.load(Relaxed),
    }
}
