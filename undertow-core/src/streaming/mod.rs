//! Streaming-oriented access to partially downloaded torrent data.

pub mod buffered_reader;

pub use buffered_reader::{
    BufferedPieceReader, DEFAULT_BUFFER_PER_DIRECTION, ReadOutcome, ReaderError, StallHook,
};
