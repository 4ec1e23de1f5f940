//! Drawing surfaces owned by the presentation worker

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::capture::Bitmap;
use crate::error::{PipelineError, Result};

/// Something the presentation worker can draw bitmaps onto.
///
/// The surface is moved into the worker thread when the worker starts and is
/// dropped there when it stops.
pub trait DrawSurface: Send + 'static {
    /// Called once inside the worker before the first draw.
    fn configure(&mut self, width: u32, height: u32) -> Result<()>;

    fn draw(&mut self, bitmap: &Bitmap) -> Result<()>;
}

/// Headless RGBA framebuffer.
///
/// Bitmaps are copied in at the top-left corner and clipped to the
/// framebuffer size.
pub struct FramebufferSurface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    frames_drawn: Arc<AtomicU64>,
}

impl FramebufferSurface {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            pixels: Vec::new(),
            frames_drawn: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of completed draws, readable after the surface has moved.
    pub fn frames_drawn(&self) -> Arc<AtomicU64> {
        self.frames_drawn.clone()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl Default for FramebufferSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl DrawSurface for FramebufferSurface {
    fn configure(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(PipelineError::surface(format!(
                "invalid surface size {width}x{height}"
            )));
        }
        self.width = width;
        self.height = height;
        self.pixels = vec![0; width as usize * height as usize * 4];
        Ok(())
    }

    fn draw(&mut self, bitmap: &Bitmap) -> Result<()> {
        if self.pixels.is_empty() {
            return Err(PipelineError::surface("draw before configure"));
        }

        let src = bitmap.data();
        let src_stride = bitmap.width() as usize * 4;
        if src.len() < src_stride * bitmap.height() as usize {
            return Err(PipelineError::surface("bitmap data shorter than its size"));
        }

        let dst_stride = self.width as usize * 4;
        let row_bytes = src_stride.min(dst_stride);
        let rows = bitmap.height().min(self.height) as usize;
        for row in 0..rows {
            let src_row = &src[row * src_stride..row * src_stride + row_bytes];
            self.pixels[row * dst_stride..row * dst_stride + row_bytes].copy_from_slice(src_row);
        }

        self.frames_drawn.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_requires_configure() {
        let mut surface = FramebufferSurface::new();
        assert!(surface.draw(&Bitmap::solid(1, 1, [0; 4])).is_err());
        assert!(surface.configure(0, 10).is_err());
    }

    #[test]
    fn draw_clips_to_surface() {
        let mut surface = FramebufferSurface::new();
        surface.configure(2, 2).unwrap();
        surface.draw(&Bitmap::solid(4, 4, [9, 8, 7, 6])).unwrap();

        assert_eq!(surface.pixels().len(), 2 * 2 * 4);
        assert!(surface.pixels().chunks(4).all(|px| px == [9, 8, 7, 6]));
        assert_eq!(surface.frames_drawn().load(Ordering::Relaxed), 1);
    }

    #[test]
    fn smaller_bitmap_leaves_rest_untouched() {
        let mut surface = FramebufferSurface::new();
        surface.configure(2, 1).unwrap();
        surface.draw(&Bitmap::solid(1, 1, [1, 1, 1, 1])).unwrap();
        assert_eq!(surface.pixels(), &[1, 1, 1, 1, 0, 0, 0, 0]);
    }
}
