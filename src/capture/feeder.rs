//! Chunk feeders: the demuxer side of the decode worker

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use flume::Sender;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use tracing::debug;

use super::frame::EncodedChunk;
use super::worker::DecodeCommand;
use crate::error::{PipelineError, Result};

/// Push handle handed to a [`ChunkFeeder`].
#[derive(Clone)]
pub struct ChunkSink {
    commands: Sender<DecodeCommand>,
}

impl ChunkSink {
    pub fn new(commands: Sender<DecodeCommand>) -> Self {
        Self { commands }
    }

    /// Queue a chunk for the decode worker, waiting while its chunk channel
    /// is full.
    pub async fn push(&self, chunk: EncodedChunk) -> Result<()> {
        self.commands
            .send_async(DecodeCommand::DecodeChunk(chunk))
            .await
            .map_err(|_| PipelineError::WorkerGone("decode"))
    }
}

/// Supplies encoded chunks, typically by demuxing a container.
///
/// Returns the number of chunks pushed; zero is a legitimate outcome.
#[async_trait]
pub trait ChunkFeeder: Send {
    async fn feed(self: Box<Self>, sink: ChunkSink) -> Result<usize>;
}

/// Generates a moving MJPEG test pattern at a fixed frame rate.
#[derive(Debug, Clone)]
pub struct SyntheticFeeder {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frames: usize,
    pub start: f64,
}

impl SyntheticFeeder {
    pub fn new(width: u32, height: u32, fps: f64, frames: usize) -> Self {
        Self {
            width,
            height,
            fps,
            frames,
            start: 0.0,
        }
    }
}

#[async_trait]
impl ChunkFeeder for SyntheticFeeder {
    async fn feed(self: Box<Self>, sink: ChunkSink) -> Result<usize> {
        let period = 1.0 / self.fps;
        for index in 0..self.frames {
            let data = encode_test_pattern(self.width, self.height, index)?;
            let chunk = EncodedChunk::key(data, self.start + index as f64 * period)
                .with_duration(period);
            sink.push(chunk).await?;
        }
        debug!(chunks = self.frames, "Synthetic feeder finished");
        Ok(self.frames)
    }
}

/// Encode frame `index` of a scrolling colour-bar pattern as JPEG.
pub fn encode_test_pattern(width: u32, height: u32, index: usize) -> Result<Bytes> {
    const BARS: [[u8; 3]; 7] = [
        [192, 192, 192],
        [192, 192, 0],
        [0, 192, 192],
        [0, 192, 0],
        [192, 0, 192],
        [192, 0, 0],
        [0, 0, 192],
    ];

    let offset = index as u32 * 4;
    let image = RgbImage::from_fn(width, height, |x, _| {
        let bar = ((x + offset) % width.max(1)) as usize * BARS.len() / width.max(1) as usize;
        image::Rgb(BARS[bar.min(BARS.len() - 1)])
    });

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, 80)
        .encode(image.as_raw(), width, height, ExtendedColorType::Rgb8)
        .map_err(|e| PipelineError::decode(format!("test pattern encode: {e}")))?;
    Ok(Bytes::from(out.into_inner()))
}
