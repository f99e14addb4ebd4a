//! Buffered random-access reading over a partially downloaded file.
//!
//! [`BufferedPieceReader`] exposes a blocking `seek`/`read` stream over the
//! on-disk bytes of one file inside a torrent while pieces are still
//! arriving. Reads return data only for byte ranges whose pieces are
//! `Finished`; everything else reads as zero bytes available, never as EOF
//! and never as garbage.
//!
//! Around the cursor the reader keeps a sliding window of previously read
//! bytes, extended in both directions up to the configured budget. When a
//! seek lands near the old window the overlap is moved inside the buffer
//! instead of being read from disk again. The window is an optimization
//! only: any `read` result is byte-identical to reading the same range
//! from the fully downloaded file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::sync::Arc;

use crate::torrent::{PieceIndex, PieceList, PieceSpan, PieceStates};

/// Default per-direction buffer budget in bytes.
pub const DEFAULT_BUFFER_PER_DIRECTION: usize = 8192 * 16;

/// Errors from reader construction and operations.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// Operation on a reader after `close()`.
    #[error("reader is closed")]
    Closed,

    /// The piece span does not cover the logical stream presented to the
    /// reader. Fatal at construction; the piece map is inconsistent with
    /// the file metadata.
    #[error("pieces cover {covered} bytes from offset {start}, stream needs {needed}")]
    InsufficientCoverage {
        start: u64,
        needed: u64,
        covered: u64,
    },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Result of one `read` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes copied into the destination. `Read(0)` means the data at the
    /// cursor is not downloaded yet (or the destination was empty) — it is
    /// not end-of-stream.
    Read(usize),
    /// Cursor is at or beyond the end of the stream.
    Eof,
}

/// Callback invoked when a read lands on a piece that is not yet
/// `Finished`, with that piece's index. Sessions use it to escalate the
/// piece's deadline for sequential playback.
pub type StallHook = Box<dyn Fn(PieceIndex) + Send + Sync>;

/// Seekable, buffered reader over one file's bytes inside a torrent.
///
/// Positions are file-relative: `seek(0)` addresses the file's first byte
/// even when the file's first piece starts earlier in the torrent's data
/// space (straddling head piece). The reader owns its raw file handle
/// exclusively and releases it on `close()` (or drop).
///
/// Not thread-safe; each reader belongs to a single consumer. Piece states
/// may advance concurrently — each `prepare_buffer` works from a snapshot
/// and later completions are picked up by the next call.
pub struct BufferedPieceReader {
    file: Option<File>,
    pieces: Arc<PieceList>,
    span: PieceSpan,
    /// Absolute data offset corresponding to file-relative position 0.
    logical_start: u64,
    /// Logical stream length in bytes.
    size: u64,
    /// Per-direction buffer budget.
    buffer_size: u64,
    position: u64,
    /// Window backing store, `2 * buffer_size` bytes.
    window: Vec<u8>,
    /// File-relative range currently held in `window`; `None` when empty.
    buffered: Option<Range<u64>>,
    on_stall: Option<StallHook>,
}

impl BufferedPieceReader {
    /// Creates a reader over `file`, whose bytes correspond to the
    /// torrent's data range `[logical_start, logical_start + size)`.
    ///
    /// # Errors
    ///
    /// [`ReaderError::InsufficientCoverage`] when `pieces` does not cover
    /// the full logical range (inconsistent torrent metadata).
    pub fn new(
        file: File,
        pieces: Arc<PieceList>,
        logical_start: u64,
        size: u64,
        buffer_size: usize,
    ) -> Result<Self, ReaderError> {
        let covered = pieces.end_offset().saturating_sub(logical_start);
        let span = if size > 0 {
            let first = pieces.piece_at_offset(logical_start);
            let last = pieces.piece_at_offset(logical_start + size - 1);
            match (first, last) {
                (Some(first), Some(last)) => PieceSpan::new(first.as_u32(), last.as_u32() + 1),
                _ => {
                    return Err(ReaderError::InsufficientCoverage {
                        start: logical_start,
                        needed: size,
                        covered,
                    });
                }
            }
        } else {
            return Err(ReaderError::InsufficientCoverage {
                start: logical_start,
                needed: size,
                covered,
            });
        };

        Ok(Self {
            file: Some(file),
            pieces,
            span,
            logical_start,
            size,
            buffer_size: buffer_size as u64,
            position: 0,
            window: vec![0; buffer_size * 2],
            buffered: None,
            on_stall: None,
        })
    }

    /// Installs the stall callback. See [`StallHook`].
    pub fn with_stall_hook(mut self, hook: StallHook) -> Self {
        self.on_stall = Some(hook);
        self
    }

    /// Current cursor position, file-relative.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Logical stream length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes between the cursor and the end of the stream.
    pub fn bytes_remaining(&self) -> u64 {
        self.size.saturating_sub(self.position)
    }

    /// File-relative range currently buffered in memory, if any.
    pub fn buffered_range(&self) -> Option<Range<u64>> {
        self.buffered.clone()
    }

    /// Moves the cursor. Lazy: the buffer is refilled by the next `read`
    /// or [`prepare_buffer`](Self::prepare_buffer), not here.
    ///
    /// Seeking at or past the end of the stream is allowed; subsequent
    /// reads yield [`ReadOutcome::Eof`].
    ///
    /// # Errors
    ///
    /// [`ReaderError::Closed`] after `close()`.
    pub fn seek(&mut self, position: u64) -> Result<(), ReaderError> {
        self.check_open()?;
        self.position = position;
        Ok(())
    }

    /// Ensures the buffer covers the cursor as far as finished pieces
    /// allow.
    ///
    /// Availability is computed from a snapshot of piece states: contiguous
    /// `Finished` bytes forward and backward from the cursor, each capped
    /// at the per-direction budget. Bytes overlapping the previous window
    /// are moved inside the buffer; only the remainder is read from disk.
    ///
    /// Idempotent: a repeat call with no intervening seek, read, or piece
    /// completion leaves the buffered range unchanged and does not touch
    /// the disk. When the piece under the cursor is not finished the
    /// window is left as-is and the stall hook fires.
    ///
    /// # Errors
    ///
    /// [`ReaderError::Closed`] after `close()`, [`ReaderError::Io`] on disk
    /// read failure.
    pub fn prepare_buffer(&mut self) -> Result<(), ReaderError> {
        self.check_open()?;
        self.fill_around_cursor()
    }

    /// Reads from the cursor into `dst`, advancing the cursor by the
    /// number of bytes copied.
    ///
    /// Copies out of the in-memory window, filling it first when the
    /// cursor is outside the buffered range. Returns
    /// [`ReadOutcome::Eof`] at end-of-stream and `Read(0)` when the data
    /// under the cursor has not finished downloading; neither reads the
    /// disk.
    ///
    /// # Errors
    ///
    /// [`ReaderError::Closed`] after `close()`, [`ReaderError::Io`] on disk
    /// read failure.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<ReadOutcome, ReaderError> {
        self.check_open()?;

        if self.position >= self.size {
            return Ok(ReadOutcome::Eof);
        }
        if dst.is_empty() {
            return Ok(ReadOutcome::Read(0));
        }

        if let Some(read) = self.copy_from_window(dst) {
            return Ok(ReadOutcome::Read(read));
        }

        self.fill_around_cursor()?;

        match self.copy_from_window(dst) {
            Some(read) => Ok(ReadOutcome::Read(read)),
            // Cursor piece not finished yet; nothing to serve.
            None => Ok(ReadOutcome::Read(0)),
        }
    }

    /// Closes the reader and releases the underlying file handle.
    /// Idempotent.
    pub fn close(&mut self) {
        self.file = None;
        self.buffered = None;
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn check_open(&self) -> Result<(), ReaderError> {
        if self.is_closed() {
            return Err(ReaderError::Closed);
        }
        Ok(())
    }

    /// Recomputes the target window around the cursor and fills it.
    fn fill_around_cursor(&mut self) -> Result<(), ReaderError> {
        if self.position >= self.size {
            return Ok(());
        }

        let cursor_piece = self
            .piece_index_at(self.position)
            .expect("cursor within covered span");

        let (back, forward) = {
            let states = self.pieces.snapshot();
            if !states.is_finished(cursor_piece) {
                drop(states);
                if let Some(hook) = &self.on_stall {
                    hook(cursor_piece);
                }
                // Keep whatever is buffered; it still serves seeks back
                // into the old window.
                return Ok(());
            }
            (
                self.available_backward(&states, self.position),
                self.available_forward(&states, self.position),
            )
        };

        let read_start = self.position - back;
        let read_end = (self.position + forward).min(self.size);

        if self.buffered == Some(read_start..read_end) {
            return Ok(());
        }
        self.fill_window(read_start, read_end)
    }

    /// Contiguous `Finished` bytes from `view_offset` forward, including
    /// the byte at `view_offset`, capped at the buffer budget. Zero when
    /// the piece under `view_offset` is not finished.
    fn available_forward(&self, states: &PieceStates<'_>, view_offset: u64) -> u64 {
        let cap = self.buffer_size;
        let logical_last = self.logical_start + self.size - 1;

        let Some(mut index) = self.piece_index_at(view_offset) else {
            return 0;
        };
        let mut offset = self.logical_start + view_offset;
        let mut available = 0u64;

        loop {
            if !states.is_finished(index) {
                return available;
            }
            let piece = self.pieces.get(index).expect("span index in bounds");
            // Clamp to the logical end so trailing bytes of a straddling
            // tail piece never count as readable.
            let piece_last = piece.last_offset().min(logical_last);
            available += piece_last - offset + 1;
            if available >= cap {
                return cap;
            }

            let next = PieceIndex::new(index.as_u32() + 1);
            if !self.span.contains(next) {
                return available;
            }
            offset = piece_last + 1;
            index = next;
        }
    }

    /// Contiguous `Finished` bytes ending just before `view_offset`,
    /// capped at the buffer budget. Zero when the piece under
    /// `view_offset` is not finished: a read is only meaningful once the
    /// cursor's own piece is ready.
    fn available_backward(&self, states: &PieceStates<'_>, view_offset: u64) -> u64 {
        let cap = self.buffer_size;

        let Some(mut index) = self.piece_index_at(view_offset) else {
            return 0;
        };
        let mut offset = self.logical_start + view_offset;
        let mut available = 0u64;

        loop {
            if !states.is_finished(index) {
                return available;
            }
            let piece = self.pieces.get(index).expect("span index in bounds");
            // Clamp to the logical start so leading bytes of a straddling
            // head piece never count.
            let piece_start = piece.offset.max(self.logical_start);
            available += offset - piece_start;
            if available >= cap {
                return cap;
            }

            if index.as_u32() == 0 || !self.span.contains(PieceIndex::new(index.as_u32() - 1)) {
                return available;
            }
            offset = piece_start;
            index = PieceIndex::new(index.as_u32() - 1);
        }
    }

    /// Piece containing the file-relative `view_offset`.
    fn piece_index_at(&self, view_offset: u64) -> Option<PieceIndex> {
        if view_offset >= self.size {
            return None;
        }
        self.pieces.piece_at_offset(self.logical_start + view_offset)
    }

    /// Loads `[read_start, read_end)` into the window, reusing any overlap
    /// with the previous window.
    ///
    /// Only head and tail overlap are reused. An old window strictly
    /// inside the new one would need two disk reads to complete, which is
    /// no cheaper than one full read.
    fn fill_window(&mut self, read_start: u64, read_end: u64) -> Result<(), ReaderError> {
        let length = (read_end - read_start) as usize;

        match self.buffered.clone() {
            Some(old) if old.contains(&read_start) => {
                // Old tail becomes the new head:
                //
                //              reused
                //            |-------|
                //   ---------------------------------
                //      ^     ^       ^          ^
                //   old.start rs  old.end       re
                let keep_from = (read_start - old.start) as usize;
                let keep_until = (old.end - old.start) as usize;
                self.window.copy_within(keep_from..keep_until, 0);
                if read_end > old.end {
                    self.read_file_into(
                        old.end,
                        (old.end - read_start) as usize,
                        (read_end - old.end) as usize,
                    )?;
                }
            }
            Some(old) if read_end > old.start && read_end <= old.end => {
                // Old head becomes the new tail:
                //
                //                  reused
                //                |--------|
                //   ---------------------------------
                //        ^       ^        ^       ^
                //        rs   old.start   re   old.end
                let dst = (old.start - read_start) as usize;
                let copy_len = (read_end - old.start) as usize;
                self.window.copy_within(0..copy_len, dst);
                self.read_file_into(read_start, 0, dst)?;
            }
            _ => {
                self.read_file_into(read_start, 0, length)?;
            }
        }

        self.buffered = Some(read_start..read_end);
        Ok(())
    }

    /// Reads `length` bytes at file-relative `offset` into the window at
    /// `window_offset`.
    fn read_file_into(
        &mut self,
        offset: u64,
        window_offset: usize,
        length: usize,
    ) -> Result<(), ReaderError> {
        if length == 0 {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or(ReaderError::Closed)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut self.window[window_offset..window_offset + length])?;
        Ok(())
    }

    /// Copies from the window when the cursor is inside it; `None`
    /// otherwise.
    fn copy_from_window(&mut self, dst: &mut [u8]) -> Option<usize> {
        let buffered = self.buffered.clone()?;
        if !buffered.contains(&self.position) {
            return None;
        }

        let in_window = (buffered.end - self.position) as usize;
        let remaining = (self.size - self.position) as usize;
        let read = dst.len().min(in_window).min(remaining);

        let from = (self.position - buffered.start) as usize;
        dst[..read].copy_from_slice(&self.window[from..from + read]);
        self.position += read as u64;
        Some(read)
    }
}

impl std::fmt::Debug for BufferedPieceReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedPieceReader")
            .field("position", &self.position)
            .field("size", &self.size)
            .field("buffered", &self.buffered)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// `std::io` adapter so demuxers and media layers can consume the reader
/// through the standard traits.
///
/// Data that is not downloaded yet surfaces as `ErrorKind::WouldBlock`,
/// since `Ok(0)` would be indistinguishable from end-of-stream.
impl Read for BufferedPieceReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match BufferedPieceReader::read(self, buf) {
            Ok(ReadOutcome::Eof) => Ok(0),
            Ok(ReadOutcome::Read(0)) if !buf.is_empty() => Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "data not yet downloaded",
            )),
            Ok(ReadOutcome::Read(read)) => Ok(read),
            Err(ReaderError::Io(error)) => Err(error),
            Err(error) => Err(std::io::Error::other(error)),
        }
    }
}

impl Seek for BufferedPieceReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of stream",
            )
        })?;
        BufferedPieceReader::seek(self, target).map_err(std::io::Error::other)?;
        Ok(target)
    }
}
