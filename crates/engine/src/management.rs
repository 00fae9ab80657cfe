//! Runtime inspection and tuning
//!
//! [`ManagementInfo`] gathers the counters of every layer in one snapshot.
//! The setters change journal and task behavior without reopening.

use tessera_concurrency::{RunnerStats, TaskError, TransactionIndexStats};
use tessera_core::Result;
use tessera_durability::{CommitPolicy, JournalInfo};
use tessera_storage::{BufferPoolStats, CleanupStats, TreeStats};

use crate::database::{Database, StartupRecovery};

/// Snapshot of the whole engine.
#[derive(Debug, Clone)]
pub struct ManagementInfo {
    /// Journal state and counters
    pub journal: JournalInfo,
    /// Default commit policy
    pub commit_policy: CommitPolicy,
    /// Whether rollbacks queue their pages for pruning
    pub rollback_pruning: bool,
    /// Transaction index counters
    pub transactions: TransactionIndexStats,
    /// Buffer pool counters
    pub buffer_pool: BufferPoolStats,
    /// Tree counters
    pub trees: TreeStats,
    /// Cleanup queue counters
    pub cleanup: CleanupStats,
    /// Accumulators known
    pub accumulator_count: usize,
    /// Flusher runner, if tasks are running
    pub flusher: Option<RunnerStats>,
    /// Copier runner
    pub copier: Option<RunnerStats>,
    /// Checkpoint runner
    pub checkpointer: Option<RunnerStats>,
    /// Cleanup runner
    pub cleaner: Option<RunnerStats>,
    /// What happened during open
    pub startup: StartupRecovery,
}

impl ManagementInfo {
    /// Most recent failure of each background task that has failed.
    pub fn task_errors(&self) -> Vec<(&'static str, TaskError)> {
        [
            ("journal-flusher", &self.flusher),
            ("journal-copier", &self.copier),
            ("checkpoint", &self.checkpointer),
            ("cleanup", &self.cleaner),
        ]
        .into_iter()
        .filter_map(|(name, stats)| {
            stats
                .as_ref()
                .and_then(|s| s.last_error.clone())
                .map(|e| (name, e))
        })
        .collect()
    }
}

impl Database {
    /// Gather a [`ManagementInfo`] snapshot.
    pub fn management_info(&self) -> ManagementInfo {
        let [flusher, copier, checkpointer, cleaner] = match self.runner_stats() {
            Some(stats) => stats.map(Some),
            None => [None, None, None, None],
        };
        ManagementInfo {
            journal: self.journal.info(),
            commit_policy: self.commit_policy(),
            rollback_pruning: self.rollback_pruning(),
            transactions: self.index.stats(),
            buffer_pool: self.pool.stats(),
            trees: self.trees.stats(),
            cleanup: self.cleanup.stats(),
            accumulator_count: self.accumulators.len(),
            flusher,
            copier,
            checkpointer,
            cleaner,
            startup: self.startup(),
        }
    }

    /// Append-only mode: the copier stops writing pages back to volumes.
    pub fn set_append_only(&self, append_only: bool) {
        self.journal.set_append_only(append_only);
    }

    /// Copy pages back as fast as possible, ignoring the copier's pacing.
    pub fn set_copy_fast(&self, fast: bool) {
        self.journal.set_copy_fast(fast);
        if fast {
            self.kick_copier();
        }
    }

    /// Skip journal records and page images of volumes that are not open.
    pub fn set_ignore_missing_volumes(&self, ignore: bool) {
        self.journal.set_ignore_missing_volumes(ignore);
    }

    /// Milliseconds between flusher cycles.
    pub fn set_flush_interval_ms(&self, ms: u64) {
        self.journal.set_flush_interval_ms(ms);
    }

    /// Milliseconds between copier cycles.
    pub fn set_copier_interval_ms(&self, ms: u64) {
        self.journal.set_copier_interval_ms(ms);
    }

    /// Journal writes slower than this are logged.
    pub fn set_slow_io_alert_ms(&self, ms: u64) {
        self.journal.set_slow_io_alert_ms(ms);
    }

    /// Milliseconds between cleanup cycles; negative waits for kicks.
    pub fn set_cleanup_interval_ms(&self, ms: i64) {
        self.cleanup.set_poll_interval(ms);
        self.kick_cleanup();
    }

    /// Make everything journaled so far durable.
    pub fn force(&self) -> Result<()> {
        self.check_open()?;
        self.journal.force()
    }

    /// Checkpoint, then copy every journaled page back to its volume and
    /// delete journal files no longer needed. Returns pages copied.
    pub fn copy_back(&self) -> Result<usize> {
        self.check_open()?;
        self.write_checkpoint()?;
        self.journal.copy_back()
    }
}
