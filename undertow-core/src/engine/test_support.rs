//! Recording mock of the native engine for tests.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{EngineError, FileProgress, NativeEngine, PieceGeometry};
use crate::torrent::{FilePriority, PieceIndex, TorrentFile};

/// Control calls observed by [`MockEngine`], in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Resume,
    Pause,
    PieceDeadline(PieceIndex, i32),
    FilePriority(usize, FilePriority),
}

/// In-memory [`NativeEngine`] that records every control call and serves
/// configurable metadata and progress values.
pub struct MockEngine {
    files: Vec<TorrentFile>,
    geometry: PieceGeometry,
    progresses: Mutex<Vec<FileProgress>>,
    calls: Mutex<Vec<EngineCall>>,
}

impl MockEngine {
    pub fn new(files: Vec<TorrentFile>, geometry: PieceGeometry) -> Self {
        let progresses = files
            .iter()
            .map(|file| FileProgress {
                path: file.path.clone(),
                downloaded_bytes: 0,
            })
            .collect();
        Self {
            files,
            geometry,
            progresses: Mutex::new(progresses),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Overrides the byte count the engine reports for one file.
    pub fn report_file_progress(&self, file_index: usize, downloaded_bytes: u64) {
        self.progresses.lock()[file_index].downloaded_bytes = downloaded_bytes;
    }

    /// All control calls recorded so far.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn resume_count(&self) -> usize {
        self.count(|call| matches!(call, EngineCall::Resume))
    }

    pub fn pause_count(&self) -> usize {
        self.count(|call| matches!(call, EngineCall::Pause))
    }

    /// Deadlines recorded per piece, in invocation order.
    pub fn piece_deadlines(&self) -> Vec<(PieceIndex, i32)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                EngineCall::PieceDeadline(piece, deadline) => Some((*piece, *deadline)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, matcher: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| matcher(call)).count()
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

/// Writes the given files into a fresh temp directory laid out like an
/// engine save directory.
pub fn scripted_save_directory(files: &[(&str, &[u8])]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("create save directory");
    for (path, bytes) in files {
        let full = dir.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("create parent directories");
        }
        std::fs::write(full, bytes).expect("write file contents");
    }
    dir
}

#[async_trait]
impl NativeEngine for MockEngine {
    async fn files(&self) -> Result<Vec<TorrentFile>, EngineError> {
        Ok(self.files.clone())
    }

    fn piece_geometry(&self) -> Result<PieceGeometry, EngineError> {
        Ok(self.geometry)
    }

    fn file_progresses(&self) -> Vec<FileProgress> {
        self.progresses.lock().clone()
    }

    fn resume(&self) {
        self.record(EngineCall::Resume);
    }

    fn pause(&self) {
        self.record(EngineCall::Pause);
    }

    fn set_piece_deadline(&self, piece: PieceIndex, deadline: i32) {
        self.record(EngineCall::PieceDeadline(piece, deadline));
    }

    fn set_file_priority(&self, file_index: usize, priority: FilePriority) {
        self.record(EngineCall::FilePriority(file_index, priority));
    }
}
