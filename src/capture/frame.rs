use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Callback run when a bitmap is released.
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Decoded RGBA8 image with single-owner release semantics.
///
/// A bitmap moves between the decode worker, the presentation queue, the
/// delivery callback and the surface worker; whoever holds it last releases
/// it, either explicitly through [`Bitmap::close`] or implicitly on drop. The
/// release hook therefore runs exactly once per bitmap.
pub struct Bitmap {
    width: u32,
    height: u32,
    data: Bytes,
    on_release: Option<ReleaseHook>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, data: Bytes) -> Self {
        Self {
            width,
            height,
            data,
            on_release: None,
        }
    }

    /// Attach a hook invoked when the bitmap is released.
    pub fn with_release_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    /// Solid-colour bitmap, mostly useful for placeholders and tests.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * 4);
        for _ in 0..pixels {
            data.extend_from_slice(&rgba);
        }
        Self::new(width, height, Bytes::from(data))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Release the bitmap now.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl Drop for Bitmap {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Whether a chunk can be decoded on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Key,
    Delta,
}

/// Encoded media chunk as produced by a demuxer.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub data: Bytes,
    /// Presentation timestamp in seconds.
    pub timestamp: f64,
    pub kind: ChunkKind,
    pub duration: Option<f64>,
}

impl EncodedChunk {
    pub fn key(data: Bytes, timestamp: f64) -> Self {
        Self {
            data,
            timestamp,
            kind: ChunkKind::Key,
            duration: None,
        }
    }

    pub fn delta(data: Bytes, timestamp: f64) -> Self {
        Self {
            data,
            timestamp,
            kind: ChunkKind::Delta,
            duration: None,
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Output of a codec: a bitmap and the time it should be shown at.
#[derive(Debug)]
pub struct DecodedFrame {
    pub bitmap: Bitmap,
    pub timestamp: f64,
}
