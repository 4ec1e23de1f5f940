//! Off-thread presentation surface
//!
//! The worker owns the [`DrawSurface`]; the caller only ever holds a
//! [`SurfaceWorker`] handle. Each `draw` hands a bitmap over and is answered
//! by exactly one `Drawn`, which is what the pending counter tracks.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::surface::DrawSurface;
use crate::capture::Bitmap;
use crate::error::{PipelineError, Result};
use crate::registry::{meta, WorkerId, WorkerKind, WorkerRegistry};
use crate::SurfaceConfig;

const INIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Caller → worker.
pub enum SurfaceCommand {
    Init {
        surface: Box<dyn DrawSurface>,
        width: u32,
        height: u32,
    },
    Frame {
        bitmap: Bitmap,
    },
    Close,
}

/// Worker → caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    Ready,
    /// Surface setup failed; the worker exits after sending this.
    Error { message: String },
    /// One per `Frame`, whether or not the draw succeeded.
    Drawn,
}

pub struct SurfaceWorker {
    commands: Option<Sender<SurfaceCommand>>,
    events: Receiver<SurfaceEvent>,
    thread: Option<JoinHandle<()>>,
    pending: usize,
    max_pending: usize,
    registration: Option<(Arc<WorkerRegistry>, WorkerId)>,
}

impl SurfaceWorker {
    /// Move `surface` into a new worker thread and configure it.
    ///
    /// Errors mean the caller should draw on its own thread instead.
    pub fn start(
        surface: impl DrawSurface,
        width: u32,
        height: u32,
        config: &SurfaceConfig,
        registry: Option<Arc<WorkerRegistry>>,
    ) -> Result<Self> {
        let (command_tx, command_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();

        let thread = thread::Builder::new()
            .name("surface-worker".into())
            .spawn(move || run(command_rx, event_tx))
            .map_err(|source| PipelineError::WorkerSpawn {
                kind: "presentation-surface",
                source,
            })?;

        let mut worker = Self {
            commands: Some(command_tx),
            events: event_rx,
            thread: Some(thread),
            pending: 0,
            max_pending: config.max_pending_draws.max(1),
            registration: None,
        };

        worker.send(SurfaceCommand::Init {
            surface: Box::new(surface),
            width,
            height,
        })?;

        match worker.events.recv_timeout(INIT_TIMEOUT) {
            Ok(SurfaceEvent::Ready) => {}
            Ok(SurfaceEvent::Error { message }) => {
                worker.stop();
                return Err(PipelineError::surface(message));
            }
            Ok(SurfaceEvent::Drawn) | Err(_) => {
                worker.stop();
                return Err(PipelineError::surface("surface worker did not initialise"));
            }
        }

        if let Some(registry) = registry {
            let id = registry.register(
                WorkerKind::PresentationSurface,
                Some(format!("surface {width}x{height}")),
                Some(meta([("pending", json!(0))])),
            );
            worker.registration = Some((registry, id));
        }

        info!(width, height, "Surface worker started");
        Ok(worker)
    }

    /// Hand `bitmap` to the worker for drawing.
    pub fn draw(&mut self, bitmap: Bitmap) -> Result<()> {
        self.collect_acks();
        self.send(SurfaceCommand::Frame { bitmap })?;
        self.pending += 1;
        self.report_pending();
        Ok(())
    }

    /// Like [`draw`](Self::draw) but gives the bitmap back when the worker
    /// already has `max_pending_draws` outstanding.
    pub fn try_draw(&mut self, bitmap: Bitmap) -> Result<Option<Bitmap>> {
        if self.is_backlogged() {
            return Ok(Some(bitmap));
        }
        self.draw(bitmap)?;
        Ok(None)
    }

    /// Draws sent but not yet acknowledged.
    pub fn pending_draws(&mut self) -> usize {
        self.collect_acks();
        self.pending
    }

    pub fn is_backlogged(&mut self) -> bool {
        self.pending_draws() >= self.max_pending
    }

    /// Terminate the worker and drop the surface with it.
    pub fn stop(&mut self) {
        if let Some(commands) = self.commands.take() {
            if commands.send(SurfaceCommand::Close).is_err() {
                debug!("Surface worker already gone");
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Surface worker panicked");
            }
        }
        self.events.drain().for_each(drop);
        self.pending = 0;

        if let Some((registry, id)) = self.registration.take() {
            registry.unregister(id);
        }
    }

    fn send(&self, command: SurfaceCommand) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or(PipelineError::WorkerGone("presentation-surface"))?
            .send(command)
            .map_err(|_| PipelineError::WorkerGone("presentation-surface"))
    }

    fn collect_acks(&mut self) {
        let mut acked = 0;
        for event in self.events.try_iter() {
            match event {
                SurfaceEvent::Drawn => acked += 1,
                other => warn!(?other, "Unexpected surface event"),
            }
        }
        if acked > 0 {
            self.pending = self.pending.saturating_sub(acked);
            self.report_pending();
        }
    }

    fn report_pending(&self) {
        if let Some((registry, id)) = &self.registration {
            registry.update(*id, meta([("pending", json!(self.pending))]));
        }
    }
}

impl Drop for SurfaceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[instrument(skip_all, name = "surface_worker")]
fn run(commands: Receiver<SurfaceCommand>, events: Sender<SurfaceEvent>) {
    let mut surface: Option<Box<dyn DrawSurface>> = None;

    for command in commands.iter() {
        match command {
            SurfaceCommand::Init {
                surface: mut incoming,
                width,
                height,
            } => match incoming.configure(width, height) {
                Ok(()) => {
                    surface = Some(incoming);
                    if events.send(SurfaceEvent::Ready).is_err() {
                        debug!("Surface handle gone before ready");
                        return;
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    if events.send(SurfaceEvent::Error { message }).is_err() {
                        debug!("Surface handle gone; init error dropped: {}", e);
                    }
                    return;
                }
            },
            SurfaceCommand::Frame { bitmap } => {
                match surface.as_mut() {
                    Some(surface) => {
                        let started = Instant::now();
                        if let Err(e) = surface.draw(&bitmap) {
                            warn!("Draw failed: {}", e);
                        }
                        metrics::histogram!("framecue.surface.draw_us")
                            .record(started.elapsed().as_micros() as f64);
                    }
                    None => warn!("Frame received before surface init"),
                }
                bitmap.close();
                if events.send(SurfaceEvent::Drawn).is_err() {
                    return;
                }
            }
            SurfaceCommand::Close => break,
        }
    }

    debug!("Surface worker exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    use super::*;
    use crate::display::FramebufferSurface;

    fn config(max_pending_draws: usize) -> SurfaceConfig {
        SurfaceConfig { max_pending_draws }
    }

    /// Blocks every draw on a barrier so pending draws pile up.
    struct GatedSurface {
        gate: Arc<Barrier>,
    }

    impl DrawSurface for GatedSurface {
        fn configure(&mut self, _: u32, _: u32) -> Result<()> {
            Ok(())
        }

        fn draw(&mut self, _: &Bitmap) -> Result<()> {
            self.gate.wait();
            Ok(())
        }
    }

    struct BrokenSurface;

    impl DrawSurface for BrokenSurface {
        fn configure(&mut self, _: u32, _: u32) -> Result<()> {
            Err(PipelineError::surface("no context"))
        }

        fn draw(&mut self, _: &Bitmap) -> Result<()> {
            unreachable!()
        }
    }

    fn wait_for_pending(worker: &mut SurfaceWorker, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.pending_draws() != expected {
            assert!(Instant::now() < deadline, "pending never reached {expected}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn draws_are_acknowledged() {
        let surface = FramebufferSurface::new();
        let drawn = surface.frames_drawn();
        let mut worker = SurfaceWorker::start(surface, 4, 4, &config(2), None).unwrap();

        worker.draw(Bitmap::solid(4, 4, [1; 4])).unwrap();
        worker.draw(Bitmap::solid(4, 4, [2; 4])).unwrap();
        wait_for_pending(&mut worker, 0);
        assert_eq!(drawn.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn bitmaps_are_released_by_worker() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut worker =
            SurfaceWorker::start(FramebufferSurface::new(), 2, 2, &config(2), None).unwrap();
        for _ in 0..3 {
            let released = released.clone();
            let bitmap = Bitmap::solid(2, 2, [0; 4]).with_release_hook(move || {
                released.fetch_add(1, Ordering::SeqCst);
            });
            worker.draw(bitmap).unwrap();
        }
        wait_for_pending(&mut worker, 0);
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn try_draw_returns_bitmap_when_backlogged() {
        let gate = Arc::new(Barrier::new(2));
        let surface = GatedSurface { gate: gate.clone() };
        let mut worker = SurfaceWorker::start(surface, 2, 2, &config(1), None).unwrap();

        assert!(worker.try_draw(Bitmap::solid(1, 1, [0; 4])).unwrap().is_none());
        assert!(worker.is_backlogged());
        let back = worker.try_draw(Bitmap::solid(1, 1, [0; 4])).unwrap();
        assert!(back.is_some());

        gate.wait();
        wait_for_pending(&mut worker, 0);
        assert!(!worker.is_backlogged());
    }

    #[test]
    fn failed_surface_is_an_error() {
        let result = SurfaceWorker::start(BrokenSurface, 2, 2, &config(1), None);
        assert!(matches!(result, Err(PipelineError::Surface(_))));
    }

    #[test]
    fn registers_and_unregisters() {
        let registry = WorkerRegistry::new();
        let mut worker = SurfaceWorker::start(
            FramebufferSurface::new(),
            2,
            2,
            &config(2),
            Some(registry.clone()),
        )
        .unwrap();
        assert_eq!(registry.counts().presentation_surface, 1);

        worker.draw(Bitmap::solid(2, 2, [0; 4])).unwrap();
        wait_for_pending(&mut worker, 0);
        assert_eq!(registry.list()[0].meta["pending"], json!(0));

        worker.stop();
        assert_eq!(registry.counts().total, 0);
        assert!(worker.draw(Bitmap::solid(2, 2, [0; 4])).is_err());
    }

    #[test]
    fn worker_exits_when_handle_vanishes_before_ready() {
        let (command_tx, command_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        drop(event_rx);
        let thread = thread::spawn(move || run(command_rx, event_tx));

        command_tx
            .send(SurfaceCommand::Init {
                surface: Box::new(FramebufferSurface::new()),
                width: 2,
                height: 2,
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !thread.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(thread.is_finished());
        thread.join().unwrap();
        drop(command_tx);
    }
}
