pub mod decoder;
pub mod fallback;
pub mod feeder;
pub mod frame;
pub mod worker;

pub use decoder::{FrameDecoder, MjpegDecoder};
pub use fallback::{FallbackCapture, PatternSource, SeekingCapture, SnapshotSource};
pub use feeder::{ChunkFeeder, ChunkSink, SyntheticFeeder};
pub use frame::{Bitmap, ChunkKind, DecodedFrame, EncodedChunk};
pub use worker::{DecodeCommand, DecodeEvent, DecodeWorker};
