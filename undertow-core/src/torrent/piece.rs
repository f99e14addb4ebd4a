//! Piece geometry and download state.
//!
//! A [`PieceList`] covers a contiguous byte span of torrent data with
//! fixed-size pieces (the last piece may be shorter). Geometry is immutable
//! after construction; only the per-piece download state and deadline hints
//! mutate, and only the event orchestrator writes them. Readers observe
//! state through point-in-time snapshots.

use parking_lot::RwLock;

use super::PieceIndex;

/// Download lifecycle stage of a single piece.
///
/// States form a one-way lattice: `Pending` → `Downloading` → `Finished`.
/// `Finished` is terminal; no event reverts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Not yet requested from peers.
    Pending,
    /// At least one block of the piece is in flight.
    Downloading,
    /// Fully downloaded and verified by the native engine.
    Finished,
}

impl PieceState {
    /// Ordering within the state lattice, used to reject regressions.
    fn rank(self) -> u8 {
        match self {
            PieceState::Pending => 0,
            PieceState::Downloading => 1,
            PieceState::Finished => 2,
        }
    }
}

/// Immutable view of one piece's byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub index: PieceIndex,
    /// Absolute data offset of the piece's first byte.
    pub offset: u64,
    pub size: u64,
}

impl Piece {
    /// Exclusive end offset of the piece's byte range.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }

    /// Inclusive offset of the piece's last byte.
    pub fn last_offset(&self) -> u64 {
        self.offset + self.size - 1
    }
}

/// Ordered, gapless piece collection covering one torrent's data.
///
/// Created once per session from the geometry the native engine reports.
/// `initial_data_offset` shifts absolute offsets when the native piece
/// numbering does not start at byte 0 of the logical stream being read
/// (multi-file torrents).
#[derive(Debug)]
pub struct PieceList {
    /// Absolute data offset of each piece, strictly increasing.
    offsets: Vec<u64>,
    sizes: Vec<u64>,
    states: RwLock<Vec<PieceState>>,
    /// Last deadline hint handed to the native engine per piece.
    deadlines: RwLock<Vec<Option<i32>>>,
    total_size: u64,
}

impl PieceList {
    /// Builds the piece list for `total_size` bytes cut into `piece_size`
    /// chunks starting at `initial_data_offset`.
    ///
    /// The final piece is shortened when `total_size` is not an exact
    /// multiple of `piece_size`.
    ///
    /// # Panics
    ///
    /// Zero `total_size` or `piece_size` is a precondition violation and
    /// panics; a session must never be constructed from inconsistent
    /// metadata.
    pub fn new(total_size: u64, piece_size: u64, initial_data_offset: u64) -> Self {
        assert!(total_size > 0, "total_size must be positive");
        assert!(piece_size > 0, "piece_size must be positive");

        let num_pieces = total_size.div_ceil(piece_size) as usize;
        let mut sizes = vec![piece_size; num_pieces];
        if total_size % piece_size != 0 {
            sizes[num_pieces - 1] = total_size % piece_size;
        }

        let mut offsets = Vec::with_capacity(num_pieces);
        let mut offset = initial_data_offset;
        for size in &sizes {
            offsets.push(offset);
            offset += size;
        }

        Self {
            offsets,
            sizes,
            states: RwLock::new(vec![PieceState::Pending; num_pieces]),
            deadlines: RwLock::new(vec![None; num_pieces]),
            total_size,
        }
    }

    /// Number of pieces in the list.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Sum of all piece sizes in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Absolute data offset of the first piece.
    pub fn start_offset(&self) -> u64 {
        self.offsets.first().copied().unwrap_or(0)
    }

    /// Exclusive absolute data offset just past the last piece.
    pub fn end_offset(&self) -> u64 {
        self.start_offset() + self.total_size
    }

    /// Returns the byte-range view of a piece, or `None` when out of bounds.
    pub fn get(&self, index: PieceIndex) -> Option<Piece> {
        let i = index.as_u32() as usize;
        Some(Piece {
            index,
            offset: *self.offsets.get(i)?,
            size: *self.sizes.get(i)?,
        })
    }

    /// Finds the piece containing the absolute data offset `offset`.
    ///
    /// Binary search over the piece offsets; `None` when the offset falls
    /// outside the covered span.
    pub fn piece_at_offset(&self, offset: u64) -> Option<PieceIndex> {
        if self.is_empty() || offset < self.start_offset() || offset >= self.end_offset() {
            return None;
        }
        let i = match self.offsets.binary_search(&offset) {
            Ok(exact) => exact,
            Err(insertion) => insertion - 1,
        };
        Some(PieceIndex::new(i as u32))
    }

    /// Current state of a piece.
    ///
    /// # Panics
    ///
    /// Panics when `index` is out of bounds; callers obtain indices from
    /// this list or a validated [`PieceSpan`](super::PieceSpan).
    pub fn state(&self, index: PieceIndex) -> PieceState {
        self.states.read()[index.as_u32() as usize]
    }

    /// Takes a point-in-time snapshot of all piece states.
    ///
    /// The snapshot holds a read lock; keep it short-lived. State writes
    /// observed after the snapshot was taken apply to the next one.
    pub fn snapshot(&self) -> PieceStates<'_> {
        PieceStates {
            guard: self.states.read(),
        }
    }

    /// Advances a piece's state along the lattice.
    ///
    /// Returns `true` when the state changed. Regressions (including any
    /// transition away from `Finished`) and out-of-bounds indices are
    /// rejected with `false`; late or stray engine events are absorbed,
    /// never applied.
    pub(crate) fn advance(&self, index: PieceIndex, to: PieceState) -> bool {
        let i = index.as_u32() as usize;
        if i >= self.sizes.len() {
            return false;
        }
        let mut states = self.states.write();
        if to.rank() <= states[i].rank() {
            return false;
        }
        states[i] = to;
        true
    }

    /// Records the deadline hint last passed to the native engine.
    pub(crate) fn record_deadline(&self, index: PieceIndex, deadline: i32) {
        let i = index.as_u32() as usize;
        if let Some(slot) = self.deadlines.write().get_mut(i) {
            *slot = Some(deadline);
        }
    }

    /// Deadline hint last recorded for a piece, if any.
    pub fn deadline(&self, index: PieceIndex) -> Option<i32> {
        self.deadlines
            .read()
            .get(index.as_u32() as usize)
            .copied()
            .flatten()
    }

    /// Sum of sizes of `Finished` pieces within a piece-index range.
    ///
    /// Out-of-bounds portions of the range are ignored.
    pub fn finished_bytes_in(&self, range: std::ops::Range<u32>) -> u64 {
        let states = self.states.read();
        let start = (range.start as usize).min(self.sizes.len());
        let end = (range.end as usize).min(self.sizes.len());
        self.sizes[start..end]
            .iter()
            .zip(states[start..end].iter())
            .filter(|(_, state)| **state == PieceState::Finished)
            .map(|(size, _)| *size)
            .sum()
    }

    /// Whether every piece in the index range is `Finished`.
    pub fn all_finished_in(&self, range: std::ops::Range<u32>) -> bool {
        let states = self.states.read();
        let start = (range.start as usize).min(states.len());
        let end = (range.end as usize).min(states.len());
        states[start..end]
            .iter()
            .all(|state| *state == PieceState::Finished)
    }

    /// Sum of sizes of `Finished` pieces across the whole list.
    pub fn finished_bytes(&self) -> u64 {
        let states = self.states.read();
        self.sizes
            .iter()
            .zip(states.iter())
            .filter(|(_, state)| **state == PieceState::Finished)
            .map(|(size, _)| *size)
            .sum()
    }

    /// Whether every piece in the list is `Finished`.
    pub fn all_finished(&self) -> bool {
        self.states
            .read()
            .iter()
            .all(|state| *state == PieceState::Finished)
    }
}

/// Point-in-time snapshot of piece states, borrowed from a [`PieceList`].
pub struct PieceStates<'a> {
    guard: parking_lot::RwLockReadGuard<'a, Vec<PieceState>>,
}

impl PieceStates<'_> {
    pub fn get(&self, index: PieceIndex) -> Option<PieceState> {
        self.guard.get(index.as_u32() as usize).copied()
    }

    pub fn is_finished(&self, index: PieceIndex) -> bool {
        self.get(index) == Some(PieceState::Finished)
    }
}
