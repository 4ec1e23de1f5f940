use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Platform features the worker-offloaded path relies on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Isolated worker threads can be spawned.
    pub isolated_workers: bool,
    /// A drawing surface can be handed to a worker.
    pub transferable_surface: bool,
    /// Arbitrary sources can be captured into a transferable bitmap.
    pub bitmap_capture: bool,
}

impl Capabilities {
    /// Detect what the platform offers.
    ///
    /// Surfaces and captures are owned by the host, so it states whether it
    /// has them; worker support is checked by actually spawning a thread.
    pub fn detect(has_surface: bool, has_capture: bool) -> Self {
        let isolated_workers = can_spawn_worker();
        let caps = Self {
            isolated_workers,
            transferable_surface: isolated_workers && has_surface,
            bitmap_capture: has_capture,
        };
        info!(?caps, "Detected capabilities");
        caps
    }

    /// Both the off-thread surface and bitmap capture are available.
    ///
    /// When false, callers should render on their own thread instead of
    /// starting a pipeline.
    pub fn is_supported(&self) -> bool {
        self.isolated_workers && self.transferable_surface && self.bitmap_capture
    }
}

fn can_spawn_worker() -> bool {
    let spawned = thread::Builder::new()
        .name("capability-check".into())
        .spawn(|| ());
    match spawned {
        Ok(handle) => handle.join().is_ok(),
        Err(e) => {
            warn!("Worker threads unavailable: {}", e);
            false
        }
    }
}
