//! Checkpoints
//!
//! A checkpoint picks a timestamp below every running transaction, journals
//! the image of every dirty page, records committed accumulator values and
//! appends the checkpoint record. Everything journaled before it becomes
//! eligible for copying back to the volumes, and journal files holding
//! nothing newer can be deleted.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tessera_concurrency::{BackgroundTask, TxnOutcome};
use tessera_core::{Result, Timestamp};
use tracing::info;

use crate::database::Database;

/// What one checkpoint did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointSummary {
    /// Checkpoint timestamp
    pub timestamp: Timestamp,
    /// Page images journaled
    pub pages_written: usize,
    /// Accumulator values recorded
    pub accumulators: usize,
    /// Transactions whose journal records are still needed
    pub live_transactions: usize,
}

impl Database {
    /// Write a checkpoint now.
    ///
    /// Returns `None` when nothing can advance: a transaction that started
    /// at or before the last checkpoint is still running.
    pub fn checkpoint(&self) -> Result<Option<CheckpointSummary>> {
        self.check_open()?;
        self.write_checkpoint()
    }

    pub(crate) fn write_checkpoint(&self) -> Result<Option<CheckpointSummary>> {
        let _serial = self.checkpoint_lock.lock();
        let last = self.journal.last_checkpoint().timestamp;

        let timestamp = {
            let _gate = self.commit_gate.write();
            let now = self.index.timestamps().update();
            match self.index.oldest_active() {
                Some(oldest) => now.min(oldest.saturating_sub(1)),
                None => now,
            }
        };
        if timestamp <= last {
            return Ok(None);
        }

        let epoch = self.trees.begin_checkpoint();
        // Outcomes are read before taking the journal's lock: a commit in
        // progress holds that lock while readers wait for its outcome.
        let index = &self.index;
        let released: FxHashSet<Timestamp> = self
            .journal
            .live_transaction_starts()
            .into_iter()
            .filter(|&start| match index.outcome(start) {
                TxnOutcome::Active => false,
                TxnOutcome::Committed(tc) => tc <= timestamp,
                TxnOutcome::Aborted => index.mvv_count(start).map(|n| n <= 0).unwrap_or(true),
            })
            .collect();
        self.journal
            .retain_transactions(|start| !released.contains(&start));
        let live_transactions = self.journal.live_transaction_count();

        let mut pages_written = 0;
        for buffer in self.pool.dirty_buffers() {
            if let Some((page, image)) = buffer.take_dirty_image() {
                if let Err(e) =
                    self.journal
                        .write_page_image(buffer.address(), page.timestamp, image, false)
                {
                    buffer.mark_dirty();
                    return Err(e);
                }
                pages_written += 1;
            }
        }

        let values = self.accumulators.checkpoint_values(timestamp);
        let accumulators = values.len();
        let mark = self.journal.write_checkpoint(timestamp, values)?;

        self.trees.checkpoint_completed(epoch);
        self.index.cleanup();
        let cache = self.index.active_transaction_cache();
        self.accumulators.fold_all(&cache);
        self.kick_copier();

        info!(
            target: "tessera::checkpoint",
            timestamp,
            address = mark.address,
            pages_written,
            accumulators,
            live_transactions,
            "checkpoint written"
        );
        Ok(Some(CheckpointSummary {
            timestamp,
            pages_written,
            accumulators,
            live_transactions,
        }))
    }
}

/// Periodic checkpoint writer.
///
/// Kicks and the runner's first cycle are ignored until a full interval
/// has passed since the last checkpoint this task wrote.
pub(crate) struct CheckpointTask {
    db: Weak<Database>,
    interval_ms: i64,
    last_run: Mutex<Instant>,
}

impl CheckpointTask {
    pub(crate) fn new(db: &Arc<Database>) -> Arc<Self> {
        Arc::new(CheckpointTask {
            db: Arc::downgrade(db),
            interval_ms: i64::try_from(db.config().checkpoint_interval_ms).unwrap_or(i64::MAX),
            last_run: Mutex::new(Instant::now()),
        })
    }
}

impl BackgroundTask for CheckpointTask {
    fn name(&self) -> &str {
        "checkpoint"
    }

    fn run_once(&self) -> Result<()> {
        let db = match self.db.upgrade() {
            Some(db) => db,
            None => return Ok(()),
        };
        if !db.is_open() {
            return Ok(());
        }
        let mut last_run = self.last_run.lock();
        if last_run.elapsed() < Duration::from_millis(self.interval_ms as u64) {
            return Ok(());
        }
        *last_run = Instant::now();
        db.write_checkpoint().map(|_| ())
    }

    fn should_stop(&self) -> bool {
        self.db.upgrade().map(|db| !db.is_open()).unwrap_or(true)
    }

    fn poll_interval(&self) -> i64 {
        self.interval_ms
    }
}
