//! Frame scheduling: presentation queue, orchestrator and the loop driver

pub mod clock;
pub mod orchestrator;
pub mod queue;
pub mod ticker;

use std::sync::Arc;

use crossbeam::utils::CachePadded;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use clock::{PlaybackClock, WallClock};
pub use orchestrator::{QueueStats, VideoPipeline, VideoPipelineBuilder, DRIFT_THRESHOLD_SECS};
pub use queue::{FrameCounters, PresentationQueue, QueuedFrame};
pub use ticker::{IntervalTicker, ManualTicker, ManualTrigger, TickSource};

use crate::error::{PipelineError, Result};
use crate::PipelineStats;

enum Control {
    Flush,
}

/// Runs a [`VideoPipeline`] on its own tokio task, one `tick` per pulse of
/// the tick source.
pub struct PipelineHandle {
    control: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    counters: Arc<CachePadded<FrameCounters>>,
}

impl PipelineHandle {
    /// Start `pipeline` and drive it from `ticks`. Must be called inside a
    /// tokio runtime.
    pub fn spawn(mut pipeline: VideoPipeline, mut ticks: impl TickSource + 'static) -> Result<Self> {
        pipeline.start()?;

        let counters = pipeline.counters();
        let cancel = CancellationToken::new();
        let (control, mut control_rx) = mpsc::unbounded_channel();

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    Some(Control::Flush) = control_rx.recv() => pipeline.flush(),
                    more = ticks.tick() => {
                        if !more {
                            debug!("Tick source ended");
                            break;
                        }
                        pipeline.tick().await;
                    }
                }
            }

            // Joining the decode thread blocks.
            let stopped = tokio::task::spawn_blocking(move || pipeline.stop()).await;
            if let Err(e) = stopped {
                warn!("Pipeline shutdown failed: {}", e);
            }
        });

        Ok(Self {
            control,
            cancel,
            task: Some(task),
            counters,
        })
    }

    /// Flush before the next tick.
    pub fn flush(&self) -> Result<()> {
        self.control
            .send(Control::Flush)
            .map_err(|_| PipelineError::Stopped)
    }

    pub fn stats(&self) -> PipelineStats {
        orchestrator::stats_from(&self.counters)
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Cancel the loop and wait until the pipeline has fully stopped.
    ///
    /// No frame callback runs after this returns.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Pipeline task failed: {}", e);
            }
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::capture::{MjpegDecoder, PatternSource, SeekingCapture};
    use crate::registry::WorkerRegistry;
    use crate::PipelineConfig;

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn manual_ticks_drive_presentation() {
        let position = Arc::new(Mutex::new(0.0_f64));
        let clock = {
            let position = position.clone();
            move || *position.lock().unwrap()
        };
        let presented = Arc::new(AtomicUsize::new(0));
        let counter = presented.clone();

        let pipeline = VideoPipeline::builder(PipelineConfig::default(), clock, move |bitmap, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            bitmap.close();
        })
        .fallback_capture(SeekingCapture::new(PatternSource::new(4, 4)))
        .build()
        .unwrap();

        let (ticker, trigger) = ManualTicker::new();
        let handle = PipelineHandle::spawn(pipeline, ticker).unwrap();

        trigger.fire();
        wait_until(|| presented.load(Ordering::SeqCst) > 0).await;
        assert!(handle.stats().presented > 0);

        handle.stop().await;
        let after_stop = presented.load(Ordering::SeqCst);
        assert!(!trigger.fire());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(presented.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn flush_and_stop_through_handle() {
        let registry = WorkerRegistry::new();
        let pipeline = VideoPipeline::builder(PipelineConfig::default(), || 100.0, |b, _| b.close())
            .decoder(MjpegDecoder::new())
            .registry(registry.clone())
            .build()
            .unwrap();
        let (ticker, trigger) = ManualTicker::new();
        let handle = PipelineHandle::spawn(pipeline, ticker).unwrap();

        handle.flush().unwrap();
        trigger.fire();
        wait_until(|| {
            registry
                .list()
                .first()
                .map_or(false, |info| info.meta.get("epoch") == Some(&serde_json::json!(1)))
        })
        .await;

        handle.stop().await;
        assert_eq!(registry.counts().total, 0);
    }

    #[tokio::test]
    async fn ended_tick_source_stops_pipeline() {
        let pipeline = VideoPipeline::builder(PipelineConfig::default(), || 0.0, |b, _| b.close())
            .build()
            .unwrap();
        let (ticker, trigger) = ManualTicker::new();
        let handle = PipelineHandle::spawn(pipeline, ticker).unwrap();

        drop(trigger);
        wait_until(|| handle.is_finished()).await;
        assert!(handle.flush().is_err());
    }
}
