//! Undertow Core - piece-oriented random-access streaming over torrents
//!
//! This crate provides the file layer that lets a media player read
//! arbitrary byte ranges of a file inside a multi-file torrent while the
//! torrent is still downloading: piece geometry and state tracking,
//! file-to-piece matching, a buffered seekable reader over partially
//! present data, and the session layer that turns native-engine events
//! into progress stats and deadline scheduling.

pub mod config;
pub mod engine;
pub mod session;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::UndertowConfig;
pub use engine::{EngineError, EngineEvent, NativeEngine};
pub use session::{FileHandle, FileStats, SessionError, TorrentSession, TorrentStats};
pub use streaming::{BufferedPieceReader, ReadOutcome, ReaderError};
pub use torrent::{PieceCoverageError, PieceIndex, PieceList, PieceState, TorrentFile, TorrentId};

/// Core errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Piece coverage error: {0}")]
    Coverage(#[from] PieceCoverageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UndertowError>;
