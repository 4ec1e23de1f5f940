use bytes::Bytes;
use zune_jpeg::JpegDecoder;

use super::frame::{Bitmap, DecodedFrame, EncodedChunk};
use crate::error::{PipelineError, Result};

/// Opaque codec driven by the decode worker.
///
/// Implementations live entirely inside the worker thread and never see the
/// orchestrator.
pub trait FrameDecoder: Send + 'static {
    /// Prepare for `codec`. Called once per `init` command.
    fn configure(&mut self, codec: &str) -> Result<()>;

    /// Decode one chunk. May return zero or more frames.
    fn decode(&mut self, chunk: EncodedChunk) -> Result<Vec<DecodedFrame>>;

    /// Drop any internal reference state, e.g. on seek.
    fn reset(&mut self);
}

/// Intra-only MJPEG decoder producing RGBA bitmaps.
#[derive(Debug, Default)]
pub struct MjpegDecoder {
    configured: bool,
}

impl MjpegDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for MjpegDecoder {
    fn configure(&mut self, codec: &str) -> Result<()> {
        match codec.to_ascii_lowercase().as_str() {
            "mjpeg" | "mjpg" | "jpeg" => {
                self.configured = true;
                Ok(())
            }
            other => Err(PipelineError::decode(format!("unsupported codec {other}"))),
        }
    }

    fn decode(&mut self, chunk: EncodedChunk) -> Result<Vec<DecodedFrame>> {
        if !self.configured {
            return Err(PipelineError::decode("decoder used before init"));
        }

        let mut decoder = JpegDecoder::new(&chunk.data[..]);
        let pixels = decoder
            .decode()
            .map_err(|e| PipelineError::decode(format!("jpeg: {e:?}")))?;
        let (width, height) = decoder
            .dimensions()
            .ok_or_else(|| PipelineError::decode("jpeg: missing dimensions"))?;

        let rgba = to_rgba(&pixels, width * height)?;
        let bitmap = Bitmap::new(width as u32, height as u32, Bytes::from(rgba));

        Ok(vec![DecodedFrame {
            bitmap,
            timestamp: chunk.timestamp,
        }])
    }

    fn reset(&mut self) {
        // Every MJPEG chunk is a key frame; nothing to discard.
    }
}

/// Expand grey or RGB pixel data to RGBA.
fn to_rgba(pixels: &[u8], pixel_count: usize) -> Result<Vec<u8>> {
    if pixel_count == 0 {
        return Err(PipelineError::decode("jpeg: empty image"));
    }

    let channels = pixels.len() / pixel_count;
    let mut rgba = Vec::with_capacity(pixel_count * 4);
    match channels {
        1 => {
            for &y in pixels.iter().take(pixel_count) {
                rgba.extend_from_slice(&[y, y, y, 255]);
            }
        }
        3 => {
            for chunk in pixels.chunks_exact(3) {
                rgba.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
            }
        }
        4 => rgba.extend_from_slice(&pixels[..pixel_count * 4]),
        n => {
            return Err(PipelineError::decode(format!(
                "jpeg: unexpected channel count {n}"
            )))
        }
    }
    Ok(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::feeder::encode_test_pattern;

    #[test]
    fn rejects_unknown_codec() {
        let mut decoder = MjpegDecoder::new();
        assert!(decoder.configure("av1").is_err());
        assert!(decoder.configure("MJPEG").is_ok());
    }

    #[test]
    fn decode_before_configure_fails() {
        let mut decoder = MjpegDecoder::new();
        let chunk = EncodedChunk::key(Bytes::from_static(b"not a jpeg"), 0.0);
        assert!(decoder.decode(chunk).is_err());
    }

    #[test]
    fn decodes_test_pattern_to_rgba() {
        let data = encode_test_pattern(32, 16, 3).unwrap();
        let mut decoder = MjpegDecoder::new();
        decoder.configure("mjpeg").unwrap();

        let frames = decoder.decode(EncodedChunk::key(data, 1.5)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp, 1.5);
        assert_eq!(frames[0].bitmap.width(), 32);
        assert_eq!(frames[0].bitmap.height(), 16);
        assert_eq!(frames[0].bitmap.data().len(), 32 * 16 * 4);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let mut decoder = MjpegDecoder::new();
        decoder.configure("mjpeg").unwrap();
        let chunk = EncodedChunk::key(Bytes::from_static(&[0xFF, 0xD8, 0x00]), 0.0);
        assert!(matches!(
            decoder.decode(chunk),
            Err(PipelineError::Decode(_))
        ));
    }

    #[test]
    fn expands_grey_and_rgb() {
        assert_eq!(to_rgba(&[7, 9], 2).unwrap(), vec![7, 7, 7, 255, 9, 9, 9, 255]);
        assert_eq!(to_rgba(&[1, 2, 3], 1).unwrap(), vec![1, 2, 3, 255]);
        assert!(to_rgba(&[1, 2], 0).is_err());
    }
}
