//! Decode worker boundary
//!
//! The codec runs on its own thread and talks to the orchestrator only
//! through two command channels and one event channel. Buffers and bitmaps
//! move across by value; nothing is shared.
//!
//! Both the chunk and the event channel are bounded. A codec that gets ahead
//! of presentation blocks on its next event until the orchestrator has room.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Selector, Sender};
use tracing::{debug, info, instrument, trace, warn};

use super::decoder::FrameDecoder;
use super::frame::{Bitmap, ChunkKind, EncodedChunk};
use crate::error::{PipelineError, Result};

/// Orchestrator → worker.
#[derive(Debug)]
pub enum DecodeCommand {
    Init { codec: String },
    DecodeChunk(EncodedChunk),
    /// Discard decoder state and any queued chunks; frames decoded afterwards
    /// carry `epoch`.
    Flush { epoch: u64 },
    Close,
}

/// Worker → orchestrator.
#[derive(Debug)]
pub enum DecodeEvent {
    Ready,
    Frame {
        bitmap: Bitmap,
        ts: f64,
        epoch: u64,
    },
    Error {
        message: String,
    },
    /// Last event the worker ever sends.
    Closed,
}

/// Handle to a running decode worker thread.
pub struct DecodeWorker {
    control: Option<Sender<DecodeCommand>>,
    chunks: Option<Sender<DecodeCommand>>,
    events: Receiver<DecodeEvent>,
    thread: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    /// Spawn the worker thread around `decoder`.
    ///
    /// `chunk_depth` bounds how many encoded chunks may wait for the codec,
    /// `event_depth` how many decoded events may wait for the orchestrator.
    pub fn spawn(
        decoder: Box<dyn FrameDecoder>,
        chunk_depth: usize,
        event_depth: usize,
    ) -> Result<Self> {
        let (control_tx, control_rx) = flume::unbounded();
        let (chunk_tx, chunk_rx) = flume::bounded(chunk_depth.max(1));
        let (event_tx, event_rx) = flume::bounded(event_depth.max(1));

        let thread = thread::Builder::new()
            .name("decode-worker".into())
            .spawn(move || run(decoder, control_rx, chunk_rx, event_tx))
            .map_err(|source| PipelineError::WorkerSpawn {
                kind: "decode",
                source,
            })?;

        info!(chunk_depth, event_depth, "Decode worker started");

        Ok(Self {
            control: Some(control_tx),
            chunks: Some(chunk_tx),
            events: event_rx,
            thread: Some(thread),
        })
    }

    /// Send a command without waiting.
    ///
    /// Chunks go to the bounded chunk channel and fail when it is full; all
    /// other commands use the control channel.
    pub fn post(&self, command: DecodeCommand) -> Result<()> {
        let sender = match command {
            DecodeCommand::DecodeChunk(_) => self.chunks.as_ref(),
            _ => self.control.as_ref(),
        }
        .ok_or(PipelineError::WorkerGone("decode"))?;

        sender
            .try_send(command)
            .map_err(|_| PipelineError::WorkerGone("decode"))
    }

    /// Sender used by chunk feeders; awaiting on it applies backpressure.
    pub fn chunk_sender(&self) -> Option<Sender<DecodeCommand>> {
        self.chunks.clone()
    }

    pub fn events(&self) -> &Receiver<DecodeEvent> {
        &self.events
    }

    /// Ask the worker to close and wait for its thread to exit.
    ///
    /// Events emitted in the meantime (frames included) are discarded, which
    /// releases their bitmaps.
    pub fn terminate(&mut self) {
        if let Some(control) = self.control.take() {
            if control.send(DecodeCommand::Close).is_err() {
                debug!("Decode worker already gone");
            }
        }
        self.chunks = None;

        let mut discarded = 0;
        if let Some(thread) = self.thread.take() {
            // The worker may be blocked on a full event channel.
            while !thread.is_finished() {
                if self.events.recv_timeout(Duration::from_millis(5)).is_ok() {
                    discarded += 1;
                }
            }
            if thread.join().is_err() {
                warn!("Decode worker panicked");
            }
        }

        discarded += self.events.drain().count();
        if discarded > 0 {
            debug!(discarded, "Discarded decode events after terminate");
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

enum Inbound {
    Command(DecodeCommand),
    Disconnected,
}

struct WorkerState {
    decoder: Box<dyn FrameDecoder>,
    events: Sender<DecodeEvent>,
    epoch: u64,
    awaiting_key: bool,
}

#[instrument(skip_all, name = "decode_worker")]
fn run(
    decoder: Box<dyn FrameDecoder>,
    control: Receiver<DecodeCommand>,
    chunks: Receiver<DecodeCommand>,
    events: Sender<DecodeEvent>,
) {
    let mut state = WorkerState {
        decoder,
        events,
        epoch: 0,
        awaiting_key: true,
    };

    loop {
        // Control commands win over queued chunks.
        let inbound = match control.try_recv() {
            Ok(command) => Inbound::Command(command),
            Err(flume::TryRecvError::Disconnected) => Inbound::Disconnected,
            Err(flume::TryRecvError::Empty) => Selector::new()
                .recv(&control, |r| r.map_or(Inbound::Disconnected, Inbound::Command))
                .recv(&chunks, |r| r.map_or(Inbound::Disconnected, Inbound::Command))
                .wait(),
        };

        let command = match inbound {
            Inbound::Command(command) => command,
            Inbound::Disconnected => {
                debug!("Orchestrator went away");
                return;
            }
        };

        match command {
            DecodeCommand::Init { codec } => match state.decoder.configure(&codec) {
                Ok(()) => {
                    info!(%codec, "Decoder configured");
                    state.awaiting_key = true;
                    state.emit(DecodeEvent::Ready);
                }
                Err(e) => state.emit(DecodeEvent::Error {
                    message: e.to_string(),
                }),
            },
            DecodeCommand::DecodeChunk(chunk) => state.decode(chunk),
            DecodeCommand::Flush { epoch } => {
                state.decoder.reset();
                let dropped = chunks.drain().count();
                debug!(epoch, dropped, "Decoder flushed");
                state.epoch = epoch;
                state.awaiting_key = true;
            }
            DecodeCommand::Close => {
                state.emit(DecodeEvent::Closed);
                info!("Decode worker closed");
                return;
            }
        }
    }
}

impl WorkerState {
    fn decode(&mut self, chunk: EncodedChunk) {
        if self.awaiting_key {
            if chunk.kind == ChunkKind::Delta {
                trace!(ts = chunk.timestamp, "Skipping delta chunk while waiting for key");
                return;
            }
            self.awaiting_key = false;
        }

        match self.decoder.decode(chunk) {
            Ok(frames) => {
                for frame in frames {
                    self.emit(DecodeEvent::Frame {
                        bitmap: frame.bitmap,
                        ts: frame.timestamp,
                        epoch: self.epoch,
                    });
                }
            }
            Err(e) => {
                // The next good picture has to start from a key chunk again.
                self.awaiting_key = true;
                self.emit(DecodeEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: DecodeEvent) {
        // A dropped receiver drops the event too, releasing any bitmap.
        if self.events.send(event).is_err() {
            trace!("Event receiver gone");
        }
    }
}
