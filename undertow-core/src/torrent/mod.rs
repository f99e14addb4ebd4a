//! Torrent data model: piece geometry, piece state, and file layout.

pub mod layout;
pub mod piece;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use layout::{FileLayout, PieceCoverageError, PieceSpan, TorrentFile, assign_pieces};
pub use piece::{Piece, PieceList, PieceState, PieceStates};

/// Identifier of a torrent managed by the native engine.
///
/// 20-byte info hash, used to correlate engine events with the session
/// they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TorrentId([u8; 20]);

impl TorrentId {
    /// Creates TorrentId from a 20-byte info hash.
    pub const fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Torrent data is divided into fixed-size pieces (except possibly the
/// last). Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Download priority of a file within a torrent.
///
/// `Ignore` excludes the file from downloading entirely. Open file handles
/// request priorities; the highest request wins.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum FilePriority {
    #[default]
    Ignore,
    Low,
    Normal,
    High,
}
