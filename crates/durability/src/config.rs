//! Journal configuration.
//!
//! This module provides configuration for the journal manager and its
//! background flusher and copier.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Journal format version written at the head of every journal file.
pub const JOURNAL_FORMAT_VERSION: u32 = 2;

/// Default journal file name prefix.
pub const DEFAULT_JOURNAL_FILE_NAME: &str = "tessera_journal";

/// Default maximum size of one journal file.
pub const DEFAULT_BLOCK_SIZE: u64 = 1_000_000_000;
/// Smallest accepted journal file size.
pub const MINIMUM_BLOCK_SIZE: u64 = 10_000_000;
/// Largest accepted journal file size.
pub const MAXIMUM_BLOCK_SIZE: u64 = 100_000_000_000;

/// Default write buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;
/// Smallest accepted write buffer.
pub const MINIMUM_BUFFER_SIZE: usize = 65_536;
/// Largest accepted write buffer.
pub const MAXIMUM_BUFFER_SIZE: usize = 160 * 1024 * 1024;

/// Default copier read buffer size.
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Default flusher cycle.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;
/// Default copier cycle.
pub const DEFAULT_COPIER_INTERVAL_MS: u64 = 10_000;
/// Default page images copied per copier cycle.
pub const DEFAULT_PAGES_PER_COPY_CYCLE: usize = 1000;

/// Default interval between repeats of one background failure message.
pub const DEFAULT_LOG_REPEAT_INTERVAL_MS: u64 = 60_000;
/// Shortest accepted log repeat interval.
pub const MINIMUM_LOG_REPEAT_INTERVAL_MS: u64 = 1_000;

/// Default threshold for slow write and force warnings.
pub const DEFAULT_SLOW_IO_ALERT_MS: u64 = 2_000;
/// Shortest accepted slow IO threshold.
pub const MINIMUM_SLOW_IO_ALERT_MS: u64 = 100;

/// A fully copied journal file larger than this is closed so it can be
/// deleted.
pub const DEFAULT_ROLLOVER_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Page map size that counts as one unit of copier urgency.
pub const DEFAULT_PAGE_MAP_SIZE_BASE: usize = 250_000;

/// How long a commit waits before its records are durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitPolicy {
    /// Return once the commit record is buffered. A crash may lose it.
    #[default]
    Soft,
    /// Force the journal before returning.
    Hard,
    /// Wait for the next flusher cycle to make the record durable,
    /// sharing one force among concurrent committers.
    Group,
}

/// Journal configuration parameters.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Path prefix of journal files. File `n` is `{path}.{n:012}`.
    pub path: PathBuf,

    /// Maximum size of one journal file (default: 1 000 000 000).
    ///
    /// Journal addresses are `generation * block_size + offset`.
    pub block_size: u64,

    /// In-memory write buffer size (default: 16MB).
    ///
    /// Appends that would overflow the buffer flush it first.
    pub buffer_size: usize,

    /// Maximum bytes of page images read per copier batch (default: 16MB).
    pub copy_buffer_size: usize,

    /// Milliseconds between flusher cycles (default: 100).
    pub flush_interval_ms: u64,

    /// Milliseconds between copier cycles at zero urgency (default: 10000).
    pub copier_interval_ms: u64,

    /// Page images copied to volumes per copier cycle (default: 1000).
    pub pages_per_copy_cycle: usize,

    /// Writes and forces slower than this are reported (default: 2000).
    pub slow_io_alert_ms: u64,

    /// One background failure is logged at most once per interval
    /// (default: 60000).
    pub log_repeat_interval_ms: u64,

    /// Copied files larger than this roll over (default: 4MB).
    pub rollover_threshold: u64,

    /// Page map size counting as one unit of urgency (default: 250000).
    pub page_map_size_base: usize,

    /// Disable copying of page images to volumes (default: false).
    pub append_only: bool,

    /// Skip records for volumes that are not open instead of failing
    /// (default: false).
    pub ignore_missing_volumes: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            path: PathBuf::from(DEFAULT_JOURNAL_FILE_NAME),
            block_size: DEFAULT_BLOCK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            copier_interval_ms: DEFAULT_COPIER_INTERVAL_MS,
            pages_per_copy_cycle: DEFAULT_PAGES_PER_COPY_CYCLE,
            slow_io_alert_ms: DEFAULT_SLOW_IO_ALERT_MS,
            log_repeat_interval_ms: DEFAULT_LOG_REPEAT_INTERVAL_MS,
            rollover_threshold: DEFAULT_ROLLOVER_THRESHOLD,
            page_map_size_base: DEFAULT_PAGE_MAP_SIZE_BASE,
            append_only: false,
            ignore_missing_volumes: false,
        }
    }
}

impl JournalConfig {
    /// Create a new journal configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the journal path prefix (builder pattern).
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Set block size (builder pattern).
    pub fn with_block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }

    /// Set write buffer size (builder pattern).
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set flusher interval (builder pattern).
    pub fn with_flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }

    /// Set copier interval (builder pattern).
    pub fn with_copier_interval_ms(mut self, ms: u64) -> Self {
        self.copier_interval_ms = ms;
        self
    }

    /// Set pages copied per cycle (builder pattern).
    pub fn with_pages_per_copy_cycle(mut self, pages: usize) -> Self {
        self.pages_per_copy_cycle = pages;
        self
    }

    /// Set slow IO threshold (builder pattern).
    pub fn with_slow_io_alert_ms(mut self, ms: u64) -> Self {
        self.slow_io_alert_ms = ms;
        self
    }

    /// Set log repeat interval (builder pattern).
    pub fn with_log_repeat_interval_ms(mut self, ms: u64) -> Self {
        self.log_repeat_interval_ms = ms;
        self
    }

    /// Set append-only mode (builder pattern).
    pub fn with_append_only(mut self, append_only: bool) -> Self {
        self.append_only = append_only;
        self
    }

    /// Set ignore-missing-volumes (builder pattern).
    pub fn with_ignore_missing_volumes(mut self, ignore: bool) -> Self {
        self.ignore_missing_volumes = ignore;
        self
    }

    /// Path of journal file `generation`.
    pub fn file_path(&self, generation: u64) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{:012}", generation));
        PathBuf::from(name)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), JournalConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(JournalConfigError::EmptyPath);
        }
        if !(MINIMUM_BLOCK_SIZE..=MAXIMUM_BLOCK_SIZE).contains(&self.block_size) {
            return Err(JournalConfigError::BlockSizeOutOfRange(self.block_size));
        }
        if !(MINIMUM_BUFFER_SIZE..=MAXIMUM_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(JournalConfigError::BufferSizeOutOfRange(self.buffer_size));
        }
        if self.buffer_size as u64 > self.block_size {
            return Err(JournalConfigError::BufferExceedsBlock);
        }
        if self.copy_buffer_size < MINIMUM_BUFFER_SIZE {
            return Err(JournalConfigError::CopyBufferTooSmall(self.copy_buffer_size));
        }
        if self.pages_per_copy_cycle == 0 {
            return Err(JournalConfigError::NoPagesPerCycle);
        }
        if self.log_repeat_interval_ms < MINIMUM_LOG_REPEAT_INTERVAL_MS {
            return Err(JournalConfigError::LogRepeatIntervalTooShort(
                self.log_repeat_interval_ms,
            ));
        }
        if self.slow_io_alert_ms < MINIMUM_SLOW_IO_ALERT_MS {
            return Err(JournalConfigError::SlowIoAlertTooShort(self.slow_io_alert_ms));
        }
        if self.page_map_size_base == 0 {
            return Err(JournalConfigError::NoPageMapBase);
        }
        Ok(())
    }

    /// Create a configuration for tests: smallest files and buffers,
    /// background cycles that only run when kicked.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        JournalConfig {
            path: path.into(),
            block_size: MINIMUM_BLOCK_SIZE,
            buffer_size: MINIMUM_BUFFER_SIZE,
            copy_buffer_size: MINIMUM_BUFFER_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            copier_interval_ms: DEFAULT_COPIER_INTERVAL_MS,
            pages_per_copy_cycle: DEFAULT_PAGES_PER_COPY_CYCLE,
            slow_io_alert_ms: DEFAULT_SLOW_IO_ALERT_MS,
            log_repeat_interval_ms: MINIMUM_LOG_REPEAT_INTERVAL_MS,
            rollover_threshold: DEFAULT_ROLLOVER_THRESHOLD,
            page_map_size_base: DEFAULT_PAGE_MAP_SIZE_BASE,
            append_only: false,
            ignore_missing_volumes: false,
        }
    }
}

/// Journal configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalConfigError {
    /// No journal path was given.
    #[error("Journal path must not be empty")]
    EmptyPath,

    /// Block size outside the accepted range.
    #[error("Journal block size {0} must be between 10000000 and 100000000000")]
    BlockSizeOutOfRange(u64),

    /// Write buffer size outside the accepted range.
    #[error("Journal buffer size {0} must be between 65536 and 167772160")]
    BufferSizeOutOfRange(usize),

    /// The write buffer could not fit in one file.
    #[error("Journal buffer size cannot exceed the block size")]
    BufferExceedsBlock,

    /// Copy buffer below the minimum.
    #[error("Copy buffer size {0} must be at least 65536")]
    CopyBufferTooSmall(usize),

    /// The copier would never copy anything.
    #[error("Pages per copy cycle must be at least 1")]
    NoPagesPerCycle,

    /// Log repeat interval below the minimum.
    #[error("Log repeat interval {0}ms must be at least 1000ms")]
    LogRepeatIntervalTooShort(u64),

    /// Slow IO threshold below the minimum.
    #[error("Slow IO alert threshold {0}ms must be at least 100ms")]
    SlowIoAlertTooShort(u64),

    /// Urgency could not be computed.
    #[error("Page map size base must be at least 1")]
    NoPageMapBase,
}

impl From<JournalConfigError> for tessera_core::Error {
    fn from(e: JournalConfigError) -> Self {
        tessera_core::Error::Config(e.to_string())
    }
}
