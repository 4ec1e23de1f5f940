pub mod surface;
pub mod worker;

pub use surface::{DrawSurface, FramebufferSurface};
pub use worker::{SurfaceCommand, SurfaceEvent, SurfaceWorker};
