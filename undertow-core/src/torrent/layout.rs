//! File layout within a torrent and the file-to-piece matcher.
//!
//! Files are laid out back-to-back in declaration order. A file's pieces
//! are the ordered subsequence of the torrent's pieces overlapping its
//! byte range; a piece straddling a file boundary belongs to both files'
//! spans. Coverage is validated here, at session setup, so reads never
//! encounter an inconsistent piece map.

use serde::{Deserialize, Serialize};

use super::piece::PieceList;
use super::{FilePriority, PieceIndex};

/// One file declared in the torrent metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentFile {
    /// Relative path inside the torrent, e.g. `Show/01.mkv`.
    pub path: String,
    /// Declared data length in bytes; may differ from on-disk size while
    /// the download is sparse.
    pub length: u64,
    pub priority: FilePriority,
}

impl TorrentFile {
    pub fn new(path: impl Into<String>, length: u64) -> Self {
        Self {
            path: path.into(),
            length,
            priority: FilePriority::default(),
        }
    }
}

/// Half-open range of piece indices `[start, end)` associated with a file.
///
/// Supports O(1) membership tests; the orchestrator uses those to decide
/// which files a finished piece touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceSpan {
    start: u32,
    end: u32,
}

impl PieceSpan {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end, "span start must not exceed end");
        Self { start, end }
    }

    /// Empty span anchored at `at`, used for zero-length files.
    pub fn empty(at: u32) -> Self {
        Self { start: at, end: at }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: PieceIndex) -> bool {
        (self.start..self.end).contains(&index.as_u32())
    }

    pub fn first(&self) -> Option<PieceIndex> {
        (!self.is_empty()).then(|| PieceIndex::new(self.start))
    }

    pub fn last(&self) -> Option<PieceIndex> {
        (!self.is_empty()).then(|| PieceIndex::new(self.end - 1))
    }

    /// Underlying index range, for bulk queries against a [`PieceList`].
    pub fn index_range(&self) -> std::ops::Range<u32> {
        self.start..self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = PieceIndex> + use<> {
        (self.start..self.end).map(PieceIndex::new)
    }
}

/// A file's resolved position within the torrent's piece geometry.
#[derive(Debug, Clone)]
pub struct FileLayout {
    pub file: TorrentFile,
    /// Absolute data offset of the file's first byte.
    pub offset: u64,
    pub span: PieceSpan,
}

impl FileLayout {
    /// Exclusive absolute data offset just past the file's last byte.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.file.length
    }
}

/// Torrent metadata declares a file extending past the bytes the piece
/// list covers.
///
/// Fatal at session setup; a session must not proceed with an inconsistent
/// piece map.
#[derive(Debug, Clone, thiserror::Error)]
#[error("pieces cover bytes up to {covered_end} but file '{path}' ends at {file_end}")]
pub struct PieceCoverageError {
    pub path: String,
    pub file_end: u64,
    pub covered_end: u64,
}

/// Assigns each file its ordered overlap span of pieces.
///
/// File offsets are prefix sums of declared lengths, starting at the piece
/// list's start offset. A piece straddling a boundary appears in both
/// neighbouring files' spans; zero-length files get an empty span.
///
/// # Errors
///
/// [`PieceCoverageError`] naming the first file whose range exceeds the
/// piece coverage.
pub fn assign_pieces(
    files: Vec<TorrentFile>,
    pieces: &PieceList,
) -> Result<Vec<FileLayout>, PieceCoverageError> {
    let covered_end = pieces.end_offset();
    let mut layouts = Vec::with_capacity(files.len());
    let mut offset = pieces.start_offset();

    for file in files {
        let file_end = offset + file.length;
        if file_end > covered_end {
            return Err(PieceCoverageError {
                path: file.path,
                file_end,
                covered_end,
            });
        }

        let span = if file.length == 0 {
            let anchor = pieces
                .piece_at_offset(offset)
                .map(|index| index.as_u32())
                .unwrap_or(pieces.len() as u32);
            PieceSpan::empty(anchor)
        } else {
            // Contiguity of the piece list reduces interval overlap to the
            // pieces containing the first and last file bytes.
            let first = pieces
                .piece_at_offset(offset)
                .expect("file start within covered span");
            let last = pieces
                .piece_at_offset(file_end - 1)
                .expect("file end within covered span");
            PieceSpan::new(first.as_u32(), last.as_u32() + 1)
        };

        layouts.push(FileLayout { file, offset, span });
        offset = file_end;
    }

    Ok(layouts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::piece::PieceState;

    #[test]
    fn test_single_file_spans_all_pieces() {
        let pieces = PieceList::new(64, 16, 0);
        let layouts = assign_pieces(vec![TorrentFile::new("a.mkv", 64)], &pieces).unwrap();
        assert_eq!(layouts.len(), 1);
        assert_eq!(layouts[0].offset, 0);
        assert_eq!(layouts[0].span, PieceSpan::new(0, 4));
    }

    #[test]
    fn test_straddling_piece_belongs_to_both_files() {
        // Files of 2000/3000 bytes over 1000-byte pieces: piece 2 holds
        // bytes [2000, 3000) so the boundary at 2000 is piece-aligned;
        // shrink file one to 1500 to force a straddle.
        let pieces = PieceList::new(5000, 1000, 0);
        let layouts = assign_pieces(
            vec![TorrentFile::new("one.mkv", 1500), TorrentFile::new("two.mkv", 3500)],
            &pieces,
        )
        .unwrap();

        assert_eq!(layouts[0].span, PieceSpan::new(0, 2));
        assert_eq!(layouts[1].span, PieceSpan::new(1, 5));
        // Piece 1 straddles the boundary and appears in both spans.
        assert!(layouts[0].span.contains(PieceIndex::new(1)));
        assert!(layouts[1].span.contains(PieceIndex::new(1)));
    }

    #[test]
    fn test_aligned_boundary_does_not_share_pieces() {
        let pieces = PieceList::new(5000, 1000, 0);
        let layouts = assign_pieces(
            vec![TorrentFile::new("one.mkv", 2000), TorrentFile::new("two.mkv", 3000)],
            &pieces,
        )
        .unwrap();
        assert_eq!(layouts[0].span, PieceSpan::new(0, 2));
        assert_eq!(layouts[1].span, PieceSpan::new(2, 5));
    }

    #[test]
    fn test_zero_length_file_matches_trivially() {
        let pieces = PieceList::new(64, 16, 0);
        let layouts = assign_pieces(
            vec![
                TorrentFile::new("a.bin", 32),
                TorrentFile::new("empty.nfo", 0),
                TorrentFile::new("b.bin", 32),
            ],
            &pieces,
        )
        .unwrap();
        assert!(layouts[1].span.is_empty());
        assert_eq!(layouts[1].offset, 32);
        assert_eq!(layouts[2].span, PieceSpan::new(2, 4));
    }

    #[test]
    fn test_coverage_shortfall_names_offending_file() {
        let pieces = PieceList::new(64, 16, 0);
        let err = assign_pieces(
            vec![TorrentFile::new("a.bin", 32), TorrentFile::new("b.bin", 64)],
            &pieces,
        )
        .unwrap_err();
        assert_eq!(err.path, "b.bin");
        assert_eq!(err.file_end, 96);
        assert_eq!(err.covered_end, 64);
    }

    #[test]
    fn test_every_file_byte_is_covered() {
        let pieces = PieceList::new(5000, 1024, 0);
        let layouts = assign_pieces(
            vec![
                TorrentFile::new("a", 1),
                TorrentFile::new("b", 2047),
                TorrentFile::new("c", 2952),
            ],
            &pieces,
        )
        .unwrap();

        for layout in &layouts {
            let Some(first) = layout.span.first() else {
                continue;
            };
            let last = layout.span.last().unwrap();
            let span_start = pieces.get(first).unwrap().offset;
            let span_end = pieces.get(last).unwrap().end_offset();
            assert!(span_start <= layout.offset);
            assert!(span_end >= layout.end_offset());
        }
    }

    #[test]
    fn test_finished_bytes_in_span_counts_only_span_pieces() {
        let pieces = PieceList::new(5000, 1000, 0);
        let layouts = assign_pieces(
            vec![TorrentFile::new("one.mkv", 1500), TorrentFile::new("two.mkv", 3500)],
            &pieces,
        )
        .unwrap();

        pieces.advance(PieceIndex::new(0), PieceState::Finished);
        pieces.advance(PieceIndex::new(4), PieceState::Finished);

        assert_eq!(pieces.finished_bytes_in(layouts[0].span.index_range()), 1000);
        assert_eq!(pieces.finished_bytes_in(layouts[1].span.index_range()), 1000);
        assert!(!pieces.all_finished_in(layouts[0].span.index_range()));

        pieces.advance(PieceIndex::new(1), PieceState::Finished);
        assert!(pieces.all_finished_in(layouts[0].span.index_range()));
    }
}
