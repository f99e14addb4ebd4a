//! Torrent download session: file entries, handles, stats, and event
//! orchestration over one native-engine torrent.
//!
//! A session owns the piece list and the per-file layout, hands out
//! reference-counted [`FileHandle`]s that gate the engine's transfer
//! state, and applies engine events through its [`EventOrchestrator`].

pub mod file_entry;
pub mod orchestrator;
pub mod stats;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub use file_entry::{FileEntry, FileHandle};
pub use orchestrator::{EventOrchestrator, spawn_event_pump};
pub use stats::{FileStats, TorrentStats};

use crate::config::UndertowConfig;
use crate::engine::{EngineError, EngineEvent, NativeEngine};
use crate::streaming::ReaderError;
use crate::torrent::{
    FilePriority, PieceCoverageError, PieceIndex, PieceList, PieceSpan, TorrentId, assign_pieces,
};

/// Errors from session construction and handle operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("file handle is closed")]
    HandleClosed,

    #[error("no file at index {index}")]
    UnknownFile { index: usize },

    #[error("invalid torrent metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("piece coverage error: {0}")]
    Coverage(#[from] PieceCoverageError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open-handle bookkeeping. Side effects on the native engine fire only
/// on 0→1 and 1→0 transitions of these counters.
struct HandleRegistry {
    next_id: u64,
    total_open: usize,
    per_entry: Vec<usize>,
    /// Whether the engine was told to transfer since the last pause.
    transfer_active: bool,
}

/// State shared by the session facade, its handles, and the orchestrator.
pub(crate) struct SessionInner {
    pub(crate) torrent_id: TorrentId,
    pub(crate) engine: Arc<dyn NativeEngine>,
    pub(crate) pieces: Arc<PieceList>,
    pub(crate) entries: Vec<Arc<FileEntry>>,
    pub(crate) config: UndertowConfig,
    save_directory: PathBuf,
    registry: Mutex<HandleRegistry>,
    overall_tx: watch::Sender<TorrentStats>,
    closed: AtomicBool,
}

impl SessionInner {
    pub(crate) fn publish_overall(&self) {
        self.overall_tx.send_replace(TorrentStats::recompute(&self.pieces));
    }

    pub(crate) fn resolve_file_path(&self, entry: &FileEntry) -> PathBuf {
        self.save_directory.join(entry.path())
    }

    /// Polls until the engine materializes the file on disk with at least
    /// one byte, then opens it read-only.
    pub(crate) async fn wait_for_file(&self, path: &Path) -> Result<std::fs::File, SessionError> {
        loop {
            if let Ok(metadata) = std::fs::metadata(path)
                && metadata.is_file()
                && metadata.len() > 0
            {
                return Ok(std::fs::File::open(path)?);
            }
            tracing::debug!(path = %path.display(), "waiting for file to appear on disk");
            tokio::time::sleep(self.config.scheduler.file_poll_interval).await;
        }
    }

    pub(crate) fn apply_file_priority(&self, file_index: usize, priority: FilePriority) {
        tracing::info!(file_index, ?priority, "setting file priority");
        self.engine.set_file_priority(file_index, priority);
    }

    /// Raises deadlines on the span's head and tail so playback can start
    /// (head) and container metadata at the end of the file (tail) arrives
    /// early.
    pub(crate) fn schedule_span_deadlines(&self, span: PieceSpan) {
        let (Some(first), Some(last)) = (span.first(), span.last()) else {
            return;
        };

        self.set_deadline(first, 0);
        self.set_deadline(last, 1);
        if first.as_u32() + 1 <= last.as_u32() {
            self.set_deadline(PieceIndex::new(first.as_u32() + 1), 2);
        }
        if first.as_u32() + 2 <= last.as_u32() {
            self.set_deadline(PieceIndex::new(first.as_u32() + 2), 3);
        }
    }

    /// A reader hit an unfinished piece: make it most urgent and pull the
    /// next few pieces forward in request order.
    pub(crate) fn escalate_stalled_piece(&self, span: PieceSpan, piece: PieceIndex) {
        tracing::debug!(piece = %piece, "read stalled on unfinished piece, raising deadline");
        self.set_deadline(piece, 0);
        for shift in 1..=self.config.scheduler.stall_readahead_pieces {
            let next = PieceIndex::new(piece.as_u32() + shift);
            if span.contains(next) {
                self.set_deadline(next, deadline_by_request_time(shift as i32));
            }
        }
    }

    fn set_deadline(&self, piece: PieceIndex, deadline: i32) {
        self.pieces.record_deadline(piece, deadline);
        self.engine.set_piece_deadline(piece, deadline);
    }

    /// Tells the engine to transfer unless it already is.
    pub(crate) fn activate_transfer(&self) {
        {
            let mut registry = self.registry.lock();
            if registry.transfer_active {
                return;
            }
            registry.transfer_active = true;
        }
        tracing::info!(torrent = %self.torrent_id, "resuming transfer");
        self.engine.resume();
    }

    /// Handle closed: drop the refcounts and pause the engine when the
    /// last handle anywhere went away.
    pub(crate) fn release_handle(&self, entry: &Arc<FileEntry>) {
        let (last_for_file, deactivate) = {
            let mut registry = self.registry.lock();
            registry.per_entry[entry.index()] -= 1;
            registry.total_open -= 1;
            let deactivate = registry.total_open == 0 && registry.transfer_active;
            if deactivate {
                registry.transfer_active = false;
            }
            (registry.per_entry[entry.index()] == 0, deactivate)
        };

        if last_for_file {
            self.apply_file_priority(entry.index(), entry.effective_priority());
        }
        if deactivate {
            tracing::info!(torrent = %self.torrent_id, "last handle closed, pausing transfer");
            self.engine.pause();
        }
    }
}

/// One torrent download, exposed to the media/cache layer.
///
/// Constructed once the native engine has metadata; hands out file
/// entries, read handles, reactive stats, and the event orchestrator the
/// engine's notifications are fed into.
pub struct TorrentSession {
    inner: Arc<SessionInner>,
    orchestrator: EventOrchestrator,
}

impl TorrentSession {
    /// Builds a session over `engine`'s torrent.
    ///
    /// Awaits the engine's metadata, derives the piece list from the
    /// reported geometry, and matches every file to its piece span.
    ///
    /// # Errors
    ///
    /// - `SessionError::Engine` - metadata unavailable
    /// - `SessionError::InvalidMetadata` - zero total or piece size
    /// - `SessionError::Coverage` - file extends past piece coverage
    pub async fn new(
        torrent_id: TorrentId,
        engine: Arc<dyn NativeEngine>,
        save_directory: impl Into<PathBuf>,
        config: UndertowConfig,
    ) -> Result<Self, SessionError> {
        let files = engine.files().await?;
        let geometry = engine.piece_geometry()?;
        if geometry.total_size == 0 || geometry.piece_size == 0 {
            return Err(SessionError::InvalidMetadata {
                reason: format!(
                    "degenerate piece geometry: total_size={}, piece_size={}",
                    geometry.total_size, geometry.piece_size
                ),
            });
        }

        let pieces = Arc::new(PieceList::new(
            geometry.total_size,
            geometry.piece_size,
            geometry.initial_data_offset,
        ));
        let layouts = assign_pieces(files, &pieces)?;

        let entries: Vec<Arc<FileEntry>> = layouts
            .into_iter()
            .enumerate()
            .map(|(index, layout)| {
                tracing::info!(
                    torrent = %torrent_id,
                    file = %layout.file.path,
                    pieces = layout.span.len(),
                    "matched file to piece span"
                );
                Arc::new(FileEntry::new(index, layout, Arc::clone(&pieces)))
            })
            .collect();

        let per_entry = vec![0; entries.len()];
        let overall_tx = watch::channel(TorrentStats::recompute(&pieces)).0;

        let inner = Arc::new(SessionInner {
            torrent_id,
            engine,
            pieces,
            entries,
            config,
            save_directory: save_directory.into(),
            registry: Mutex::new(HandleRegistry {
                next_id: 0,
                total_open: 0,
                per_entry,
                transfer_active: false,
            }),
            overall_tx,
            closed: AtomicBool::new(false),
        });
        let orchestrator = EventOrchestrator::new(Arc::clone(&inner));

        Ok(Self {
            inner,
            orchestrator,
        })
    }

    pub fn torrent_id(&self) -> TorrentId {
        self.inner.torrent_id
    }

    /// Files of the torrent, in declaration order.
    pub fn files(&self) -> &[Arc<FileEntry>] {
        &self.inner.entries
    }

    pub fn file(&self, index: usize) -> Option<&Arc<FileEntry>> {
        self.inner.entries.get(index)
    }

    /// Opens a read handle on a file.
    ///
    /// The first handle for a file raises the file's priority and piece
    /// deadlines; the first handle session-wide resumes the transfer.
    ///
    /// # Errors
    ///
    /// - `SessionError::Closed` - session closed
    /// - `SessionError::UnknownFile` - index out of range
    pub fn open_file(&self, index: usize) -> Result<FileHandle, SessionError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let entry = self
            .inner
            .entries
            .get(index)
            .ok_or(SessionError::UnknownFile { index })?;

        let (id, first_for_file) = {
            let mut registry = self.inner.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.per_entry[index] += 1;
            registry.total_open += 1;
            (id, registry.per_entry[index] == 1)
        };

        entry.record_request(id, Some(FilePriority::Normal));
        if first_for_file {
            self.inner
                .apply_file_priority(index, entry.effective_priority());
            self.inner.schedule_span_deadlines(entry.span());
        }
        self.inner.activate_transfer();

        tracing::info!(
            torrent = %self.inner.torrent_id,
            file = entry.path(),
            "opened file handle"
        );
        Ok(FileHandle::new(
            Arc::clone(&self.inner),
            Arc::clone(entry),
            id,
        ))
    }

    /// Subscribes to session-wide progress snapshots.
    pub fn overall_stats(&self) -> watch::Receiver<TorrentStats> {
        self.inner.overall_tx.subscribe()
    }

    /// Latest session-wide progress snapshot.
    pub fn current_overall_stats(&self) -> TorrentStats {
        *self.inner.overall_tx.borrow()
    }

    /// The single writer of piece state; feed engine events here.
    pub fn orchestrator(&self) -> EventOrchestrator {
        self.orchestrator.clone()
    }

    /// Spawns a task draining `events` into the orchestrator.
    pub fn spawn_event_pump(
        &self,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> JoinHandle<()> {
        spawn_event_pump(self.orchestrator.clone(), events)
    }

    /// Pauses the transfer, if any handle keeps it active. With no open
    /// handle this never reaches the engine.
    pub fn pause(&self) {
        let should_pause = {
            let mut registry = self.inner.registry.lock();
            let pause = registry.total_open > 0 && registry.transfer_active;
            if pause {
                registry.transfer_active = false;
            }
            pause
        };
        if should_pause {
            tracing::info!(torrent = %self.inner.torrent_id, "pausing transfer");
            self.inner.engine.pause();
        }
    }

    /// Resumes the transfer for files that have open handles. With no
    /// open handle this never reaches the engine.
    pub fn resume(&self) {
        let open_entries: Vec<Arc<FileEntry>> = {
            let registry = self.inner.registry.lock();
            if registry.total_open == 0 {
                return;
            }
            self.inner
                .entries
                .iter()
                .filter(|entry| registry.per_entry[entry.index()] > 0)
                .cloned()
                .collect()
        };

        for entry in &open_entries {
            self.inner
                .apply_file_priority(entry.index(), entry.effective_priority());
            self.inner.schedule_span_deadlines(entry.span());
        }
        self.inner.activate_transfer();
    }

    /// Closes the session for new handles. Existing handles keep working
    /// until closed.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Deletes the download from disk.
    ///
    /// Refuses while any handle is open and returns `Ok(false)`. On
    /// success the session is closed and the save directory removed.
    ///
    /// # Errors
    ///
    /// - `SessionError::Io` - removal failed for reasons other than the
    ///   directory already being gone
    pub async fn delete(&self) -> Result<bool, SessionError> {
        {
            let registry = self.inner.registry.lock();
            if registry.total_open > 0 {
                return Ok(false);
            }
        }
        self.close();

        tracing::info!(torrent = %self.inner.torrent_id, "deleting download directory");
        match tokio::fs::remove_dir_all(&self.inner.save_directory).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(error) => Err(error.into()),
        }
    }
}

impl std::fmt::Debug for TorrentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentSession")
            .field("torrent", &self.inner.torrent_id.to_string())
            .field("files", &self.inner.entries.len())
            .finish()
    }
}

/// Deadline that orders stall requests by wall-clock time: an earlier
/// request beats a later one, and the shift breaks ties within one
/// escalation. Bounded so the scaled value stays well inside `i32`.
fn deadline_by_request_time(shift: i32) -> i32 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0);
    ((millis % 20_000_000) as i32) * 100 + shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{EngineCall, MockEngine};
    use crate::engine::PieceGeometry;
    use crate::torrent::{PieceState, TorrentFile};

    const TORRENT: TorrentId = TorrentId::new([7u8; 20]);

    fn two_piece_engine() -> Arc<MockEngine> {
        Arc::new(MockEngine::new(
            vec![TorrentFile::new("1.mp4", 1000)],
            PieceGeometry {
                total_size: 1000,
                piece_size: 500,
                initial_data_offset: 0,
            },
        ))
    }

    async fn session_over(engine: Arc<MockEngine>) -> TorrentSession {
        TorrentSession::new(
            TORRENT,
            engine,
            std::env::temp_dir().join("undertow-session-tests"),
            UndertowConfig::default(),
        )
        .await
        .unwrap()
    }

    fn piece_finished(piece: u32) -> EngineEvent {
        EngineEvent::PieceFinished {
            torrent: TORRENT,
            piece: PieceIndex::new(piece),
        }
    }

    #[tokio::test]
    async fn test_not_finished_on_creation() {
        let session = session_over(two_piece_engine()).await;
        let handle = session.open_file(0).unwrap();
        assert!(!handle.entry().current_stats().is_finished);
    }

    #[tokio::test]
    async fn test_not_finished_when_one_piece_done() {
        let session = session_over(two_piece_engine()).await;
        let handle = session.open_file(0).unwrap();

        session.orchestrator().apply(piece_finished(0));
        assert!(!handle.entry().current_stats().is_finished);
    }

    #[tokio::test]
    async fn test_finished_when_all_pieces_done() {
        let session = session_over(two_piece_engine()).await;
        let handle = session.open_file(0).unwrap();
        let orchestrator = session.orchestrator();

        orchestrator.apply(piece_finished(0));
        assert!(!handle.entry().current_stats().is_finished);
        orchestrator.apply(piece_finished(1));
        assert!(handle.entry().current_stats().is_finished);
    }

    #[tokio::test]
    async fn test_overall_stats_finish_with_all_pieces() {
        let session = session_over(two_piece_engine()).await;
        let _handle = session.open_file(0).unwrap();
        let orchestrator = session.orchestrator();

        assert!(!session.current_overall_stats().is_finished);
        orchestrator.apply(piece_finished(0));
        assert!(!session.current_overall_stats().is_finished);
        orchestrator.apply(piece_finished(1));
        assert!(session.current_overall_stats().is_finished);
        assert_eq!(session.current_overall_stats().progress, 1.0);
    }

    #[tokio::test]
    async fn test_stats_progress_through_piece_events() {
        let session = session_over(two_piece_engine()).await;
        let handle = session.open_file(0).unwrap();
        let orchestrator = session.orchestrator();

        let stats = handle.entry().current_stats();
        assert_eq!(stats.downloaded_bytes, 0);
        assert_eq!(stats.total_bytes, 1000);
        assert_eq!(stats.progress, 0.0);

        orchestrator.apply(piece_finished(0));
        let stats = handle.entry().current_stats();
        assert_eq!(stats.downloaded_bytes, 500);
        assert_eq!(stats.progress, 0.5);
        assert!(!stats.is_finished);

        orchestrator.apply(piece_finished(1));
        let stats = handle.entry().current_stats();
        assert_eq!(stats.downloaded_bytes, 1000);
        assert_eq!(stats.progress, 1.0);
        assert!(stats.is_finished);
    }

    #[tokio::test]
    async fn test_watch_subscribers_observe_stats_changes() {
        let session = session_over(two_piece_engine()).await;
        let handle = session.open_file(0).unwrap();
        let mut stats = handle.stats();

        session.orchestrator().apply(piece_finished(0));
        stats.changed().await.unwrap();
        assert_eq!(stats.borrow().downloaded_bytes, 500);
    }

    #[tokio::test]
    async fn test_torrent_finished_verifies_byte_count() {
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;
        let handle = session.open_file(0).unwrap();

        engine.report_file_progress(0, 1000);
        session.orchestrator().apply(EngineEvent::TorrentFinished { torrent: TORRENT });

        let stats = handle.entry().current_stats();
        assert!(stats.is_finished);
        assert_eq!(stats.downloaded_bytes, 1000);
        assert_eq!(stats.progress, 1.0);
        assert!(session.inner.pieces.all_finished());
    }

    #[tokio::test]
    async fn test_torrent_finished_with_some_pieces_already_done() {
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;
        let handle = session.open_file(0).unwrap();
        let orchestrator = session.orchestrator();

        orchestrator.apply(piece_finished(0));
        engine.report_file_progress(0, 1000);
        orchestrator.apply(EngineEvent::TorrentFinished { torrent: TORRENT });

        assert!(handle.entry().current_stats().is_finished);
        assert!(session.inner.pieces.all_finished());
    }

    #[tokio::test]
    async fn test_torrent_finished_short_count_changes_nothing() {
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;
        let handle = session.open_file(0).unwrap();

        engine.report_file_progress(0, 500);
        session.orchestrator().apply(EngineEvent::TorrentFinished { torrent: TORRENT });

        let stats = handle.entry().current_stats();
        assert!(!stats.is_finished);
        assert_eq!(stats.downloaded_bytes, 0);
        assert_eq!(stats.progress, 0.0);
        assert_eq!(
            session.inner.pieces.state(PieceIndex::new(0)),
            PieceState::Pending
        );
        assert_eq!(
            session.inner.pieces.state(PieceIndex::new(1)),
            PieceState::Pending
        );
    }

    #[tokio::test]
    async fn test_torrent_finished_finalizes_piecewise_complete_files() {
        // Progress report misses the file, but every piece finished
        // individually.
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;
        let handle = session.open_file(0).unwrap();
        let orchestrator = session.orchestrator();

        orchestrator.apply(piece_finished(0));
        orchestrator.apply(piece_finished(1));
        engine.report_file_progress(0, 500); // stale short report
        orchestrator.apply(EngineEvent::TorrentFinished { torrent: TORRENT });

        assert!(handle.entry().current_stats().is_finished);
    }

    #[tokio::test]
    async fn test_events_for_other_torrents_are_ignored() {
        let session = session_over(two_piece_engine()).await;
        let _handle = session.open_file(0).unwrap();

        session.orchestrator().apply(EngineEvent::PieceFinished {
            torrent: TorrentId::new([9u8; 20]),
            piece: PieceIndex::new(0),
        });
        assert_eq!(
            session.inner.pieces.state(PieceIndex::new(0)),
            PieceState::Pending
        );
    }

    #[tokio::test]
    async fn test_finished_piece_never_regresses() {
        let session = session_over(two_piece_engine()).await;
        let orchestrator = session.orchestrator();

        orchestrator.apply(piece_finished(0));
        orchestrator.apply(EngineEvent::PieceDownloading {
            torrent: TORRENT,
            piece: PieceIndex::new(0),
        });
        assert_eq!(
            session.inner.pieces.state(PieceIndex::new(0)),
            PieceState::Finished
        );
    }

    #[tokio::test]
    async fn test_no_handles_means_no_engine_toggles() {
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;
        let orchestrator = session.orchestrator();

        orchestrator.apply(piece_finished(0));
        orchestrator.apply(piece_finished(1));
        engine.report_file_progress(0, 1000);
        orchestrator.apply(EngineEvent::TorrentFinished { torrent: TORRENT });
        session.pause();
        session.resume();

        assert_eq!(engine.resume_count(), 0);
        assert_eq!(engine.pause_count(), 0);
    }

    #[tokio::test]
    async fn test_first_open_resumes_and_raises_deadlines() {
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;
        let _handle = session.open_file(0).unwrap();

        assert_eq!(engine.resume_count(), 1);
        assert_eq!(
            engine.piece_deadlines(),
            vec![(PieceIndex::new(0), 0), (PieceIndex::new(1), 1)]
        );
        assert!(
            engine
                .calls()
                .contains(&EngineCall::FilePriority(0, FilePriority::Normal))
        );
    }

    #[tokio::test]
    async fn test_head_deadlines_cover_four_pieces_on_long_spans() {
        let engine = Arc::new(MockEngine::new(
            vec![TorrentFile::new("1.mp4", 5000)],
            PieceGeometry {
                total_size: 5000,
                piece_size: 500,
                initial_data_offset: 0,
            },
        ));
        let session = session_over(Arc::clone(&engine)).await;
        let _handle = session.open_file(0).unwrap();

        assert_eq!(
            engine.piece_deadlines(),
            vec![
                (PieceIndex::new(0), 0),
                (PieceIndex::new(9), 1),
                (PieceIndex::new(1), 2),
                (PieceIndex::new(2), 3),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_open_does_not_resume_again() {
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;
        let _first = session.open_file(0).unwrap();
        let _second = session.open_file(0).unwrap();

        assert_eq!(engine.resume_count(), 1);
    }

    #[tokio::test]
    async fn test_last_close_pauses_and_deprioritizes() {
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;

        let mut first = session.open_file(0).unwrap();
        let mut second = session.open_file(0).unwrap();

        first.close();
        assert_eq!(engine.pause_count(), 0);

        second.close();
        assert_eq!(engine.pause_count(), 1);
        assert!(
            engine
                .calls()
                .contains(&EngineCall::FilePriority(0, FilePriority::Ignore))
        );
    }

    #[tokio::test]
    async fn test_drop_closes_handle() {
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;

        {
            let _handle = session.open_file(0).unwrap();
        }
        assert_eq!(engine.pause_count(), 1);
    }

    #[tokio::test]
    async fn test_handle_close_is_idempotent() {
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;

        let mut handle = session.open_file(0).unwrap();
        handle.close();
        handle.close();
        drop(handle);
        assert_eq!(engine.pause_count(), 1);
    }

    #[tokio::test]
    async fn test_handle_operations_fail_after_close() {
        let session = session_over(two_piece_engine()).await;
        let mut handle = session.open_file(0).unwrap();
        handle.close();

        assert!(matches!(
            handle.resume(FilePriority::High),
            Err(SessionError::HandleClosed)
        ));
        assert!(matches!(handle.pause(), Err(SessionError::HandleClosed)));
        assert!(matches!(
            handle.open_reader().await,
            Err(SessionError::HandleClosed)
        ));
    }

    #[tokio::test]
    async fn test_highest_priority_request_wins() {
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;

        let first = session.open_file(0).unwrap();
        let second = session.open_file(0).unwrap();

        first.resume(FilePriority::High).unwrap();
        second.pause().unwrap();
        assert!(
            engine
                .calls()
                .iter()
                .rev()
                .find(|call| matches!(call, EngineCall::FilePriority(..)))
                == Some(&EngineCall::FilePriority(0, FilePriority::High))
        );

        first.pause().unwrap();
        assert!(
            engine
                .calls()
                .last()
                == Some(&EngineCall::FilePriority(0, FilePriority::Ignore))
        );
    }

    #[tokio::test]
    async fn test_session_pause_resume_with_open_handle() {
        let engine = two_piece_engine();
        let session = session_over(Arc::clone(&engine)).await;
        let _handle = session.open_file(0).unwrap();

        session.pause();
        assert_eq!(engine.pause_count(), 1);

        session.resume();
        assert_eq!(engine.resume_count(), 2);
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let session = session_over(two_piece_engine()).await;
        session.close();
        assert!(matches!(session.open_file(0), Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_open_unknown_file_fails() {
        let session = session_over(two_piece_engine()).await;
        assert!(matches!(
            session.open_file(5),
            Err(SessionError::UnknownFile { index: 5 })
        ));
    }

    #[tokio::test]
    async fn test_delete_refuses_while_handles_open() {
        let engine = two_piece_engine();
        let save_dir =
            crate::engine::test_support::scripted_save_directory(&[("1.mp4", &[0u8; 1000][..])]);
        let session = TorrentSession::new(
            TORRENT,
            engine,
            save_dir.path(),
            UndertowConfig::default(),
        )
        .await
        .unwrap();

        let mut handle = session.open_file(0).unwrap();
        assert!(!session.delete().await.unwrap());
        assert!(save_dir.path().exists());

        handle.close();
        assert!(session.delete().await.unwrap());
        assert!(!save_dir.path().exists());
        // Deleting again is fine: the directory is already gone.
        assert!(session.delete().await.unwrap());
    }

    #[tokio::test]
    async fn test_event_pump_drains_channel() {
        let session = session_over(two_piece_engine()).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = session.spawn_event_pump(rx);

        tx.send(piece_finished(0)).unwrap();
        tx.send(piece_finished(1)).unwrap();
        drop(tx);
        pump.await.unwrap();

        assert!(session.current_overall_stats().is_finished);
    }

    #[tokio::test]
    async fn test_degenerate_geometry_is_invalid_metadata() {
        let engine = Arc::new(MockEngine::new(
            vec![TorrentFile::new("1.mp4", 0)],
            PieceGeometry {
                total_size: 0,
                piece_size: 0,
                initial_data_offset: 0,
            },
        ));
        let result = TorrentSession::new(
            TORRENT,
            engine,
            std::env::temp_dir(),
            UndertowConfig::default(),
        )
        .await;
        assert!(matches!(
            result,
            Err(SessionError::InvalidMetadata { .. })
        ));
    }

    #[tokio::test]
    async fn test_coverage_shortfall_fails_construction() {
        let engine = Arc::new(MockEngine::new(
            vec![TorrentFile::new("1.mp4", 2000)],
            PieceGeometry {
                total_size: 1000,
                piece_size: 500,
                initial_data_offset: 0,
            },
        ));
        let result = TorrentSession::new(
            TORRENT,
            engine,
            std::env::temp_dir(),
            UndertowConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(SessionError::Coverage(_))));
    }
}
