//! The single writer of piece state.
//!
//! All mutation of piece state funnels through [`EventOrchestrator`]:
//! engine events move pieces along the state lattice, trigger stats
//! recomputation for the files a piece touches, and never block the read
//! path beyond a snapshot lock. Readers and stats observers only ever see
//! states the orchestrator wrote.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::SessionInner;
use crate::engine::EngineEvent;
use crate::torrent::{PieceIndex, PieceState};

/// Applies native-engine events to the session's piece states and stats.
///
/// Safe to invoke from any thread, concurrently with reader `seek`/`read`
/// calls; writes are serialized internally. Cloneable so the same
/// orchestrator can be handed to callback-style engines and to the
/// channel pump.
#[derive(Clone)]
pub struct EventOrchestrator {
    inner: Arc<SessionInner>,
    /// Serializes state writes; readers are deliberately not behind this.
    gate: Arc<Mutex<()>>,
}

impl EventOrchestrator {
    pub(crate) fn new(inner: Arc<SessionInner>) -> Self {
        Self {
            inner,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Applies one engine event. Events for other torrents are ignored.
    pub fn apply(&self, event: EngineEvent) {
        if event.torrent() != self.inner.torrent_id {
            tracing::trace!(torrent = %event.torrent(), "ignoring event for foreign torrent");
            return;
        }

        match event {
            EngineEvent::PieceDownloading { piece, .. } => self.on_piece_downloading(piece),
            EngineEvent::PieceFinished { piece, .. } => self.on_piece_finished(piece),
            EngineEvent::TorrentFinished { .. } => self.on_torrent_finished(),
        }
    }

    /// A block of the piece went in flight.
    pub fn on_piece_downloading(&self, piece: PieceIndex) {
        let _gate = self.gate.lock();
        // Advancing refuses regressions, so a late event after the piece
        // finished is absorbed here.
        self.inner.pieces.advance(piece, PieceState::Downloading);
    }

    /// The engine verified and stored a piece.
    pub fn on_piece_finished(&self, piece: PieceIndex) {
        let _gate = self.gate.lock();
        if !self.inner.pieces.advance(piece, PieceState::Finished) {
            // Duplicate or stale notification.
            return;
        }

        for entry in &self.inner.entries {
            if entry.span().contains(piece) {
                entry.publish_stats();
            }
        }
        self.inner.publish_overall();
    }

    /// The engine claims the whole torrent finished.
    ///
    /// Trust, but verify: each file's authoritative downloaded byte count
    /// must equal its declared length before any of its pieces are marked
    /// `Finished`. A short count is a benign race with in-flight piece
    /// events and leaves the file untouched.
    pub fn on_torrent_finished(&self) {
        let _gate = self.gate.lock();
        let progresses = self.inner.engine.file_progresses();

        for entry in &self.inner.entries {
            let reported = progresses
                .iter()
                .find(|progress| progress.path == entry.path())
                .map(|progress| progress.downloaded_bytes);

            match reported {
                Some(bytes) if bytes == entry.length() => {
                    tracing::info!(
                        file = entry.path(),
                        "file verified complete on torrent finish"
                    );
                    entry.mark_finished_verified();
                }
                Some(bytes) => {
                    tracing::debug!(
                        file = entry.path(),
                        reported = bytes,
                        expected = entry.length(),
                        "torrent finish reported short byte count, leaving file as-is"
                    );
                }
                None => {
                    tracing::debug!(
                        file = entry.path(),
                        "torrent finish carried no progress for file"
                    );
                }
            }
        }

        // Files whose pieces all finished individually are complete too,
        // even if the engine's progress report missed them.
        for entry in &self.inner.entries {
            if !entry.is_finished_override()
                && !entry.span().is_empty()
                && self.inner.pieces.all_finished_in(entry.span().index_range())
            {
                entry.mark_finished_verified();
            }
        }

        self.inner.publish_overall();
    }
}

/// Drains an engine event channel into the orchestrator.
///
/// For engines that deliver events over a channel rather than direct
/// callbacks. The task ends when the sender side is dropped.
pub fn spawn_event_pump(
    orchestrator: EventOrchestrator,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            orchestrator.apply(event);
        }
    })
}
