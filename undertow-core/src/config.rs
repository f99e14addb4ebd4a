//! Centralized configuration for Undertow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::streaming::DEFAULT_BUFFER_PER_DIRECTION;

/// Central configuration for all Undertow components.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub reader: ReaderConfig,
    pub scheduler: SchedulerConfig,
}

/// Buffered-reader tuning.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Read-ahead/read-behind budget per direction in bytes. The in-memory
    /// window is at most twice this size.
    pub buffer_per_direction: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            buffer_per_direction: DEFAULT_BUFFER_PER_DIRECTION, // 128 KiB
        }
    }
}

/// Piece deadline scheduling and file materialization.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pieces after a stalled piece that get time-ordered deadlines.
    pub stall_readahead_pieces: u32,
    /// Poll interval while waiting for the engine to create a file on
    /// disk.
    pub file_poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stall_readahead_pieces: 3,
            file_poll_interval: Duration::from_secs(1),
        }
    }
}
