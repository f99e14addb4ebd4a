//! Boundary to the native torrent engine.
//!
//! The wire protocol, peer management, and disk allocation live in an
//! external engine. This module defines the narrow interface the core
//! consumes: torrent metadata queries, transfer control, per-piece
//! deadline hints, and the completion event stream. Everything behind
//! [`NativeEngine`] is a black box.

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

use async_trait::async_trait;

use crate::torrent::{FilePriority, PieceIndex, TorrentFile, TorrentId};

/// Piece layout parameters reported by the native engine once metadata is
/// known. The inputs a [`PieceList`](crate::torrent::PieceList) is created
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceGeometry {
    /// Total bytes covered by the pieces.
    pub total_size: u64,
    /// Size of every piece except possibly the last.
    pub piece_size: u64,
    /// Absolute data offset of the first piece, nonzero when the engine's
    /// piece numbering does not start at byte 0 of the stream being read.
    pub initial_data_offset: u64,
}

/// Authoritative per-file byte count reported by the native engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    pub path: String,
    pub downloaded_bytes: u64,
}

/// Errors crossing the native engine boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("native engine shut down")]
    Shutdown,

    #[error("torrent metadata unavailable: {reason}")]
    MetadataUnavailable { reason: String },
}

/// Notifications delivered by the native engine, on its own thread or
/// callback context.
///
/// Events are tagged with the originating torrent so a shared event
/// stream can fan out to multiple sessions; a session ignores events for
/// other torrents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// A block of the piece went in flight.
    PieceDownloading {
        torrent: TorrentId,
        piece: PieceIndex,
    },
    /// The piece is fully downloaded and verified.
    PieceFinished {
        torrent: TorrentId,
        piece: PieceIndex,
    },
    /// The engine believes the whole torrent is complete. Sessions verify
    /// this against [`NativeEngine::file_progresses`] before trusting it.
    TorrentFinished { torrent: TorrentId },
}

impl EngineEvent {
    /// Torrent the event belongs to.
    pub fn torrent(&self) -> TorrentId {
        match self {
            EngineEvent::PieceDownloading { torrent, .. }
            | EngineEvent::PieceFinished { torrent, .. }
            | EngineEvent::TorrentFinished { torrent } => *torrent,
        }
    }
}

/// Control surface of the native torrent engine.
///
/// Implementations wrap whatever client library actually moves bytes.
/// Control calls are fire-and-forget from the core's perspective; the
/// engine acknowledges progress through the event stream.
#[async_trait]
pub trait NativeEngine: Send + Sync {
    /// Files declared in the torrent metadata, in declaration order.
    ///
    /// Resolves once the engine has the metadata; for magnet-style
    /// startup that can be long after the session was requested.
    ///
    /// # Errors
    ///
    /// - `EngineError::Shutdown` - engine stopped before metadata arrived
    /// - `EngineError::MetadataUnavailable` - metadata cannot be produced
    async fn files(&self) -> Result<Vec<TorrentFile>, EngineError>;

    /// Piece layout of the torrent.
    ///
    /// # Errors
    ///
    /// - `EngineError::MetadataUnavailable` - metadata not resolved yet
    fn piece_geometry(&self) -> Result<PieceGeometry, EngineError>;

    /// Authoritative downloaded byte counts per file.
    fn file_progresses(&self) -> Vec<FileProgress>;

    /// Starts or restarts the transfer.
    fn resume(&self);

    /// Stops the transfer without discarding state.
    fn pause(&self);

    /// Asks the engine to fetch a piece sooner; lower deadline values are
    /// more urgent.
    fn set_piece_deadline(&self, piece: PieceIndex, deadline: i32);

    /// Sets a file's download priority.
    fn set_file_priority(&self, file_index: usize, priority: FilePriority);
}
