//! Per-file entries and reference-counted read handles.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use super::stats::FileStats;
use super::{SessionError, SessionInner};
use crate::streaming::BufferedPieceReader;
use crate::torrent::{FileLayout, FilePriority, PieceList, PieceSpan};

/// One file of the torrent, with its resolved piece span and published
/// stats.
///
/// Entries are shared; downloads start only once a [`FileHandle`] is
/// opened for the file.
pub struct FileEntry {
    index: usize,
    layout: FileLayout,
    pieces: Arc<PieceList>,
    stats_tx: watch::Sender<FileStats>,
    finished_override: AtomicBool,
    /// Priority requested per open handle; `None` demotes the handle's
    /// vote without removing it (a paused handle).
    priority_requests: Mutex<BTreeMap<u64, Option<FilePriority>>>,
}

impl FileEntry {
    pub(crate) fn new(index: usize, layout: FileLayout, pieces: Arc<PieceList>) -> Self {
        let initial = FileStats::recompute(&pieces, layout.span, layout.file.length, false);
        Self {
            index,
            layout,
            pieces,
            stats_tx: watch::channel(initial).0,
            finished_override: AtomicBool::new(false),
            priority_requests: Mutex::new(BTreeMap::new()),
        }
    }

    /// Position of the file in the torrent's declaration order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Relative path inside the torrent.
    pub fn path(&self) -> &str {
        &self.layout.file.path
    }

    /// Declared file length in bytes.
    pub fn length(&self) -> u64 {
        self.layout.file.length
    }

    /// Absolute data offset of the file's first byte.
    pub fn offset(&self) -> u64 {
        self.layout.offset
    }

    /// Pieces overlapping this file's byte range.
    pub fn span(&self) -> PieceSpan {
        self.layout.span
    }

    /// Subscribes to this file's progress snapshots.
    pub fn stats(&self) -> watch::Receiver<FileStats> {
        self.stats_tx.subscribe()
    }

    /// Latest published progress snapshot.
    pub fn current_stats(&self) -> FileStats {
        *self.stats_tx.borrow()
    }

    /// Recomputes and publishes stats from current piece states.
    pub(crate) fn publish_stats(&self) {
        let stats = FileStats::recompute(
            &self.pieces,
            self.layout.span,
            self.layout.file.length,
            self.finished_override.load(Ordering::Acquire),
        );
        self.stats_tx.send_replace(stats);
    }

    /// Marks the file verified-complete: every span piece `Finished` and
    /// stats pinned at 100%. Called by the orchestrator after the
    /// byte-count cross-check passed.
    pub(crate) fn mark_finished_verified(&self) {
        for piece in self.layout.span.iter() {
            self.pieces
                .advance(piece, crate::torrent::PieceState::Finished);
        }
        self.finished_override.store(true, Ordering::Release);
        self.publish_stats();
    }

    pub(crate) fn is_finished_override(&self) -> bool {
        self.finished_override.load(Ordering::Acquire)
    }

    pub(crate) fn record_request(&self, handle_id: u64, priority: Option<FilePriority>) {
        self.priority_requests.lock().insert(handle_id, priority);
    }

    pub(crate) fn remove_request(&self, handle_id: u64) {
        self.priority_requests.lock().remove(&handle_id);
    }

    /// Highest priority requested by any open handle; `Ignore` when no
    /// handle requests one.
    pub(crate) fn effective_priority(&self) -> FilePriority {
        self.priority_requests
            .lock()
            .values()
            .max()
            .copied()
            .flatten()
            .unwrap_or(FilePriority::Ignore)
    }
}

impl std::fmt::Debug for FileEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEntry")
            .field("index", &self.index)
            .field("path", &self.path())
            .field("length", &self.length())
            .field("span", &self.layout.span)
            .finish()
    }
}

/// Open read handle on a file; the unit of download scheduling.
///
/// The first handle opened for a file resumes the transfer and raises the
/// file's piece deadlines; closing the last handle anywhere pauses the
/// engine again. `close` is idempotent and also runs on drop, so a
/// panicking consumer cannot leak the refcount.
pub struct FileHandle {
    inner: Arc<SessionInner>,
    entry: Arc<FileEntry>,
    id: u64,
    closed: bool,
}

impl FileHandle {
    pub(crate) fn new(inner: Arc<SessionInner>, entry: Arc<FileEntry>, id: u64) -> Self {
        Self {
            inner,
            entry,
            id,
            closed: false,
        }
    }

    pub fn entry(&self) -> &Arc<FileEntry> {
        &self.entry
    }

    /// Subscribes to the file's progress snapshots.
    pub fn stats(&self) -> watch::Receiver<FileStats> {
        self.entry.stats()
    }

    /// Requests a download priority and (re)starts the transfer with the
    /// file's head pieces deadline-raised.
    ///
    /// # Errors
    ///
    /// [`SessionError::HandleClosed`] after `close()`.
    pub fn resume(&self, priority: FilePriority) -> Result<(), SessionError> {
        self.check_open()?;
        self.entry.record_request(self.id, Some(priority));
        self.inner
            .apply_file_priority(self.entry.index(), self.entry.effective_priority());
        self.inner.schedule_span_deadlines(self.entry.span());
        self.inner.activate_transfer();
        Ok(())
    }

    /// Withdraws this handle's priority vote without closing it. Other
    /// handles on the same file keep the download going.
    ///
    /// # Errors
    ///
    /// [`SessionError::HandleClosed`] after `close()`.
    pub fn pause(&self) -> Result<(), SessionError> {
        self.check_open()?;
        self.entry.record_request(self.id, None);
        self.inner
            .apply_file_priority(self.entry.index(), self.entry.effective_priority());
        Ok(())
    }

    /// Opens a buffered reader over the file's on-disk bytes.
    ///
    /// Waits for the engine to materialize the file on disk (it appears
    /// once the first piece is flushed), then wires the reader's stall
    /// hook to deadline escalation.
    ///
    /// # Errors
    ///
    /// [`SessionError::HandleClosed`] after `close()`,
    /// [`SessionError::Reader`] on coverage mismatch,
    /// [`SessionError::Io`] on open failure.
    pub async fn open_reader(&self) -> Result<BufferedPieceReader, SessionError> {
        self.check_open()?;

        let path = self.inner.resolve_file_path(&self.entry);
        let file = self.inner.wait_for_file(&path).await?;

        let scheduler = Arc::clone(&self.inner);
        let span = self.entry.span();
        let reader = BufferedPieceReader::new(
            file,
            Arc::clone(&self.inner.pieces),
            self.entry.offset(),
            self.entry.length(),
            self.inner.config.reader.buffer_per_direction,
        )?
        .with_stall_hook(Box::new(move |piece| {
            scheduler.escalate_stalled_piece(span, piece);
        }));

        Ok(reader)
    }

    /// Closes the handle. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        tracing::info!(
            file = self.entry.path(),
            "closing file handle, withdrawing priority request"
        );
        self.entry.remove_request(self.id);
        self.inner.release_handle(&self.entry);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::HandleClosed);
        }
        Ok(())
    }

    /// Resolved on-disk path of the file, which may not exist yet.
    pub fn file_path(&self) -> PathBuf {
        self.inner.resolve_file_path(&self.entry)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("file", &self.entry.path())
            .field("closed", &self.closed)
            .finish()
    }
}
