//! Progress snapshots derived from piece states.
//!
//! Stats are recomputed explicitly by the orchestrator on each relevant
//! event and published through `watch` channels; nothing here recomputes
//! on read.

use serde::Serialize;

use crate::torrent::{PieceList, PieceSpan};

/// Download progress of one file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FileStats {
    /// Bytes of the file covered by `Finished` pieces, clamped to the
    /// file's length (pieces straddling a boundary overhang the file).
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    /// `0.0..=1.0`; exactly `1.0` once finished.
    pub progress: f32,
    /// All pieces of the file finished, or completion verified against
    /// the engine's authoritative byte count.
    pub is_finished: bool,
}

impl FileStats {
    /// Derives a snapshot from the current piece states.
    ///
    /// `finished_override` is the verified-complete flag set by a
    /// cross-checked torrent-finished event; it wins over per-piece
    /// bookkeeping.
    pub(crate) fn recompute(
        pieces: &PieceList,
        span: PieceSpan,
        length: u64,
        finished_override: bool,
    ) -> Self {
        let is_finished = finished_override || pieces.all_finished_in(span.index_range());
        if is_finished {
            return Self {
                downloaded_bytes: length,
                total_bytes: length,
                progress: 1.0,
                is_finished: true,
            };
        }

        let downloaded_bytes = pieces.finished_bytes_in(span.index_range()).min(length);
        Self {
            downloaded_bytes,
            total_bytes: length,
            progress: ratio(downloaded_bytes, length),
            is_finished: false,
        }
    }
}

/// Download progress of the whole torrent, aggregated over the full piece
/// list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TorrentStats {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub progress: f32,
    pub is_finished: bool,
}

impl TorrentStats {
    pub(crate) fn recompute(pieces: &PieceList) -> Self {
        let total_bytes = pieces.total_size();
        let is_finished = pieces.all_finished();
        let downloaded_bytes = if is_finished {
            total_bytes
        } else {
            pieces.finished_bytes()
        };
        Self {
            downloaded_bytes,
            total_bytes,
            progress: if is_finished {
                1.0
            } else {
                ratio(downloaded_bytes, total_bytes)
            },
            is_finished,
        }
    }
}

fn ratio(part: u64, whole: u64) -> f32 {
    if whole == 0 {
        0.0
    } else {
        (part as f32 / whole as f32).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{PieceIndex, PieceState};

    #[test]
    fn test_file_stats_track_finished_span_pieces() {
        let pieces = PieceList::new(1000, 500, 0);
        let span = PieceSpan::new(0, 2);

        let stats = FileStats::recompute(&pieces, span, 1000, false);
        assert_eq!(stats.downloaded_bytes, 0);
        assert_eq!(stats.progress, 0.0);
        assert!(!stats.is_finished);

        pieces.advance(PieceIndex::new(0), PieceState::Finished);
        let stats = FileStats::recompute(&pieces, span, 1000, false);
        assert_eq!(stats.downloaded_bytes, 500);
        assert_eq!(stats.progress, 0.5);
        assert!(!stats.is_finished);

        pieces.advance(PieceIndex::new(1), PieceState::Finished);
        let stats = FileStats::recompute(&pieces, span, 1000, false);
        assert_eq!(stats.downloaded_bytes, 1000);
        assert_eq!(stats.progress, 1.0);
        assert!(stats.is_finished);
    }

    #[test]
    fn test_straddling_piece_bytes_clamp_to_file_length() {
        // File of 1500 bytes whose last piece extends 500 bytes into the
        // next file.
        let pieces = PieceList::new(5000, 1000, 0);
        let span = PieceSpan::new(0, 2);
        pieces.advance(PieceIndex::new(0), PieceState::Finished);
        pieces.advance(PieceIndex::new(1), PieceState::Finished);

        let stats = FileStats::recompute(&pieces, span, 1500, false);
        assert_eq!(stats.downloaded_bytes, 1500);
        assert!(stats.is_finished);
    }

    #[test]
    fn test_finished_override_wins() {
        let pieces = PieceList::new(1000, 500, 0);
        let stats = FileStats::recompute(&pieces, PieceSpan::new(0, 2), 1000, true);
        assert!(stats.is_finished);
        assert_eq!(stats.downloaded_bytes, 1000);
        assert_eq!(stats.progress, 1.0);
    }

    #[test]
    fn test_zero_length_file_is_trivially_finished() {
        let pieces = PieceList::new(1000, 500, 0);
        let stats = FileStats::recompute(&pieces, PieceSpan::empty(1), 0, false);
        assert!(stats.is_finished);
        assert_eq!(stats.progress, 1.0);
        assert_eq!(stats.downloaded_bytes, 0);
    }

    #[test]
    fn test_torrent_stats_cover_whole_piece_list() {
        let pieces = PieceList::new(1000, 500, 0);
        pieces.advance(PieceIndex::new(0), PieceState::Finished);

        let stats = TorrentStats::recompute(&pieces);
        assert_eq!(stats.downloaded_bytes, 500);
        assert_eq!(stats.total_bytes, 1000);
        assert_eq!(stats.progress, 0.5);
        assert!(!stats.is_finished);

        pieces.advance(PieceIndex::new(1), PieceState::Finished);
        let stats = TorrentStats::recompute(&pieces);
        assert!(stats.is_finished);
        assert_eq!(stats.progress, 1.0);
    }
}
