//! On-demand frame capture used when no decode stream is running

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use super::frame::Bitmap;
use crate::error::{PipelineError, Result};

/// Capture the frame shown at `time` seconds.
///
/// Implementations resolve `None` on any failure instead of erroring, so the
/// scheduling loop never has to handle capture faults.
#[async_trait]
pub trait FallbackCapture: Send + Sync {
    async fn capture(&self, time: f64) -> Option<Bitmap>;
}

/// A seekable player that can be snapshotted, e.g. a hidden shadow player.
#[async_trait]
pub trait SnapshotSource: Send {
    async fn seek(&mut self, time: f64) -> Result<()>;
    async fn snapshot(&mut self) -> Result<Bitmap>;
}

/// Adapts a [`SnapshotSource`] to the [`FallbackCapture`] contract.
///
/// Seek and snapshot happen under one lock, so concurrent captures cannot
/// interleave and snapshot the wrong position.
pub struct SeekingCapture<S> {
    source: Mutex<S>,
}

impl<S: SnapshotSource> SeekingCapture<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Mutex::new(source),
        }
    }

    async fn seek_and_grab(&self, time: f64) -> Result<Bitmap> {
        let mut source = self.source.lock().await;
        source.seek(time).await?;
        source.snapshot().await
    }
}

#[async_trait]
impl<S: SnapshotSource> FallbackCapture for SeekingCapture<S> {
    async fn capture(&self, time: f64) -> Option<Bitmap> {
        match self.seek_and_grab(time).await {
            Ok(bitmap) => Some(bitmap),
            Err(e) => {
                warn!(time, "Fallback capture failed: {}", e);
                None
            }
        }
    }
}

/// Synthetic shadow player whose picture is a gradient keyed on time.
#[derive(Debug)]
pub struct PatternSource {
    width: u32,
    height: u32,
    duration: Option<f64>,
    position: f64,
}

impl PatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            duration: None,
            position: 0.0,
        }
    }

    /// Seeks past `duration` fail, like a real media element would.
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }
}

#[async_trait]
impl SnapshotSource for PatternSource {
    async fn seek(&mut self, time: f64) -> Result<()> {
        if !time.is_finite() || time < 0.0 {
            return Err(PipelineError::capture(format!("invalid seek target {time}")));
        }
        if let Some(duration) = self.duration {
            if time > duration {
                return Err(PipelineError::capture(format!(
                    "seek to {time:.3}s past end ({duration:.3}s)"
                )));
            }
        }
        self.position = time;
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<Bitmap> {
        let shade = ((self.position * 60.0) as u64 % 256) as u8;
        Ok(Bitmap::solid(
            self.width,
            self.height,
            [shade, 255 - shade, 128, 255],
        ))
    }
}
