//! Explicit transactions
//!
//! A [`Transaction`] writes versions into pages as it goes and buffers the
//! matching journal records. The buffer is journaled when it outgrows the
//! configured size, when the caller flushes it, and at commit. Long record
//! pages are journaled as soon as they are written.
//!
//! A transaction that is dropped while still active rolls back.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use tessera_core::{Error, JournalAddress, PageAddress, Result, Timestamp, TreeId};
use tessera_durability::{CommitPolicy, JournalRecord};
use tessera_storage::{Accumulator, AccumulatorKind, Buffer, CleanupAction, VersionBody};
use tracing::{debug, trace, warn};

use crate::database::Database;
use crate::exchange::Exchange;

/// Where a transaction is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Reads and writes are allowed
    Active,
    /// Committed at the given timestamp
    Committed(Timestamp),
    /// Rolled back
    RolledBack,
}

/// A unit of work with snapshot reads and first-writer-wins writes.
pub struct Transaction {
    db: Arc<Database>,
    start: Timestamp,
    state: TransactionState,
    policy: CommitPolicy,
    records: Vec<JournalRecord>,
    buffered_bytes: usize,
    journaled: bool,
    spills: usize,
    touched: FxHashSet<(PageAddress, TreeId)>,
    accumulators: Vec<Arc<Accumulator>>,
}

/// Rough journal footprint of a buffered record.
fn record_size(record: &JournalRecord) -> usize {
    match record {
        JournalRecord::Store { key, body, .. } => {
            let body_len = match body {
                VersionBody::Inline(bytes) => bytes.len(),
                _ => 16,
            };
            32 + key.len() + body_len
        }
        JournalRecord::Remove { key, .. } => 24 + key.len(),
        JournalRecord::Delta { .. } => 40,
        _ => 16,
    }
}

impl Transaction {
    pub(crate) fn begin(db: &Arc<Database>) -> Result<Self> {
        db.check_open()?;
        let start = {
            let _gate = db.commit_gate.read();
            db.index.begin()
        };
        Ok(Transaction {
            db: Arc::clone(db),
            start,
            state: TransactionState::Active,
            policy: db.commit_policy(),
            records: Vec::new(),
            buffered_bytes: 0,
            journaled: false,
            spills: 0,
            touched: FxHashSet::default(),
            accumulators: Vec::new(),
        })
    }

    /// Start timestamp; also the handle of every version this transaction writes.
    pub fn start_timestamp(&self) -> Timestamp {
        self.start
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Whether the transaction can still read and write.
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Commit policy used by [`commit`](Self::commit).
    pub fn commit_policy(&self) -> CommitPolicy {
        self.policy
    }

    /// Override the commit policy for this transaction.
    pub fn set_commit_policy(&mut self, policy: CommitPolicy) {
        self.policy = policy;
    }

    /// Journal records waiting in the transaction buffer.
    pub fn pending_records(&self) -> usize {
        self.records.len()
    }

    /// How many times the buffer was written to the journal before commit.
    pub fn spill_count(&self) -> usize {
        self.spills
    }

    /// Database this transaction belongs to.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// An exchange bound to `tree` that runs inside this transaction.
    pub fn exchange(&mut self, tree: TreeId) -> Exchange<'_> {
        let db = Arc::clone(&self.db);
        Exchange::with_transaction(db, tree, self)
    }

    fn check_active(&self) -> Result<()> {
        match self.state {
            TransactionState::Active => self.db.check_open(),
            TransactionState::Committed(_) => Err(Error::InvalidOperation(format!(
                "transaction {} already committed",
                self.start
            ))),
            TransactionState::RolledBack => Err(Error::Rollback(format!(
                "transaction {} was rolled back",
                self.start
            ))),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value of `key` as of this transaction's snapshot, including its own writes.
    pub fn fetch(&self, tree: TreeId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_active()?;
        match self.db.trees.fetch(tree, key, self.start)? {
            Some(body) => self.db.trees.materialize(tree.volume(), &body),
            None => Ok(None),
        }
    }

    /// Visible keys of `tree` in order.
    pub fn keys(&self, tree: TreeId) -> Result<Vec<Vec<u8>>> {
        self.check_active()?;
        self.db.trees.keys(tree, self.start)
    }

    /// Value of an accumulator as of this transaction's snapshot.
    pub fn accumulator_value(&self, tree: TreeId, index: u8, kind: AccumulatorKind) -> Result<i64> {
        self.check_active()?;
        self.db.volumes.require(tree.volume())?;
        let accumulator = self.db.accumulators.get_or_create(tree, index, kind)?;
        Ok(accumulator.snapshot_value(self.start))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `value` under `key`.
    ///
    /// Fails with `WriteConflict` if a concurrent transaction already wrote
    /// the key. Values above the long record threshold go to a chain of long
    /// record pages that is journaled right away.
    pub fn store(&mut self, tree: TreeId, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_active()?;
        let trees = &self.db.trees;
        let body = if trees.is_long(value.len()) {
            let (body, chain) = trees.write_long_record(tree.volume(), value)?;
            if let Err(e) = self.journal_chain(&chain) {
                if let Some(head) = body.long_record_head() {
                    self.release_chain(tree, head);
                }
                return Err(e);
            }
            body
        } else {
            VersionBody::Inline(value.to_vec())
        };
        self.install(tree, key, body)
    }

    /// Remove `key`. Returns whether a value was visible.
    pub fn remove(&mut self, tree: TreeId, key: &[u8]) -> Result<bool> {
        self.check_active()?;
        if self.db.trees.fetch(tree, key, self.start)?.is_none() {
            return Ok(false);
        }
        self.install(tree, key, VersionBody::AntiValue)?;
        Ok(true)
    }

    /// Remove every visible key of `tree`. Returns how many were removed.
    pub fn remove_all(&mut self, tree: TreeId) -> Result<usize> {
        self.check_active()?;
        let keys = self.db.trees.keys(tree, self.start)?;
        for key in &keys {
            self.install(tree, key, VersionBody::AntiValue)?;
        }
        Ok(keys.len())
    }

    /// Apply `value` to an accumulator and return the value this
    /// transaction now sees. For `Seq` accumulators the result is the
    /// allocated sequence number.
    pub fn update_accumulator(
        &mut self,
        tree: TreeId,
        index: u8,
        kind: AccumulatorKind,
        value: i64,
    ) -> Result<i64> {
        self.check_active()?;
        self.db.volumes.require(tree.volume())?;
        let accumulator = self.db.accumulators.get_or_create(tree, index, kind)?;
        let result = accumulator.update(value, self.start);
        if !self.accumulators.iter().any(|a| Arc::ptr_eq(a, &accumulator)) {
            self.accumulators.push(accumulator);
        }
        self.push(JournalRecord::Delta {
            start: self.start,
            tree,
            index,
            kind,
            value,
        })?;
        Ok(result)
    }

    fn install(&mut self, tree: TreeId, key: &[u8], body: VersionBody) -> Result<()> {
        let outcome = match self.db.trees.store(tree, key, self.start, body.clone(), true) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(head) = body.long_record_head() {
                    self.release_chain(tree, head);
                }
                return Err(e);
            }
        };
        if let Some(head) = outcome.replaced.as_ref().and_then(|b| b.long_record_head()) {
            self.db.trees.free_chain(tree.volume(), head)?;
        }
        self.touched.insert((outcome.page, tree));
        let record = if body.is_anti_value() {
            JournalRecord::Remove {
                start: self.start,
                tree,
                key: key.to_vec(),
            }
        } else {
            JournalRecord::Store {
                start: self.start,
                tree,
                key: key.to_vec(),
                body,
            }
        };
        self.push(record)
    }

    fn release_chain(&self, tree: TreeId, head: u64) {
        if let Err(e) = self.db.trees.free_chain(tree.volume(), head) {
            warn!(target: "tessera::txn", start = self.start, head, error = %e, "failed to free long record chain");
        }
    }

    /// Journal long record pages immediately. Their images stay valid for
    /// recovery regardless of later checkpoints.
    fn journal_chain(&self, chain: &[Arc<Buffer>]) -> Result<()> {
        for buffer in chain {
            if let Some((page, image)) = buffer.take_dirty_image() {
                if let Err(e) =
                    self.db
                        .journal
                        .write_page_image(buffer.address(), page.timestamp, image, true)
                {
                    buffer.mark_dirty();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn push(&mut self, record: JournalRecord) -> Result<()> {
        self.buffered_bytes += record_size(&record);
        self.records.push(record);
        if self.buffered_bytes >= self.db.config().transaction_buffer_size {
            self.flush_transaction_buffer()?;
        }
        Ok(())
    }

    /// Write the buffered records to the journal now.
    ///
    /// The transaction stays active. Recovery ignores the records unless a
    /// commit record follows.
    pub fn flush_transaction_buffer(&mut self) -> Result<()> {
        self.check_active()?;
        if self.records.is_empty() {
            return Ok(());
        }
        let mut frames = Vec::with_capacity(self.records.len() + 1);
        if !self.journaled {
            frames.push(JournalRecord::TxnBegin { start: self.start });
        }
        frames.append(&mut self.records);
        self.db.journal.append_all(&frames)?;
        self.journaled = true;
        self.buffered_bytes = 0;
        self.spills += 1;
        trace!(target: "tessera::txn", start = self.start, records = frames.len(), "flushed transaction buffer");
        Ok(())
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Commit with this transaction's commit policy.
    pub fn commit(&mut self) -> Result<Timestamp> {
        let policy = self.policy;
        self.commit_with_policy(policy)
    }

    /// Commit and wait as `policy` demands. Returns the commit timestamp.
    ///
    /// A transaction that wrote nothing commits without touching the journal.
    /// The commit becomes visible only after its commit record is in the
    /// journal; if appending fails the transaction is rolled back and the
    /// error returned.
    pub fn commit_with_policy(&mut self, policy: CommitPolicy) -> Result<Timestamp> {
        self.check_active()?;
        let db = Arc::clone(&self.db);
        let appended = {
            let _gate = db.commit_gate.read();
            let pending = db.index.prepare_commit(self.start)?;
            let tc = pending.timestamp();
            match self.journal_commit(tc) {
                Ok(address) => {
                    for accumulator in &self.accumulators {
                        accumulator.commit(self.start, tc);
                    }
                    db.index.publish_commit(pending);
                    self.state = TransactionState::Committed(tc);
                    Ok((tc, address))
                }
                Err(e) => {
                    db.index.abandon_commit(pending);
                    if let Err(rollback) = self.discard(&db) {
                        debug!(target: "tessera::txn", start = self.start, error = %rollback, "rollback record not journaled");
                    }
                    Err(e)
                }
            }
        };
        let (tc, address) = match appended {
            Ok(committed) => committed,
            Err(e) => {
                warn!(target: "tessera::txn", start = self.start, error = %e, "commit record not journaled, rolled back");
                self.queue_rollback_pruning(&db);
                return Err(e);
            }
        };
        if let Some(address) = address {
            db.journal.wait_for_durability(address, policy)?;
        }
        trace!(target: "tessera::txn", start = self.start, tc, ?policy, "committed");
        Ok(tc)
    }

    /// Append the buffered records and the commit record. On failure the
    /// buffered records are kept.
    fn journal_commit(&mut self, tc: Timestamp) -> Result<Option<JournalAddress>> {
        if !self.journaled && self.records.is_empty() {
            return Ok(None);
        }
        let mut frames = Vec::with_capacity(self.records.len() + 2);
        if !self.journaled {
            frames.push(JournalRecord::TxnBegin { start: self.start });
        }
        frames.append(&mut self.records);
        frames.push(JournalRecord::TxnCommit {
            start: self.start,
            commit: tc,
        });
        match self.db.journal.append_all(&frames) {
            Ok(address) => {
                self.journaled = true;
                self.buffered_bytes = 0;
                Ok(Some(address))
            }
            Err(e) => {
                self.records = frames
                    .into_iter()
                    .filter(|r| {
                        !matches!(
                            r,
                            JournalRecord::TxnBegin { .. } | JournalRecord::TxnCommit { .. }
                        )
                    })
                    .collect();
                Err(e)
            }
        }
    }

    /// Roll back. Versions written so far become invisible to everyone and
    /// their pages are queued for pruning when rollback pruning is on.
    pub fn rollback(&mut self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::InvalidOperation(format!(
                "transaction {} is not active",
                self.start
            )));
        }
        let db = Arc::clone(&self.db);
        {
            let _gate = db.commit_gate.read();
            db.index.rollback(self.start)?;
            self.discard(&db)?;
        }
        self.queue_rollback_pruning(&db);
        Ok(())
    }

    /// Bookkeeping once the index has resolved this transaction as
    /// aborted: drop accumulator deltas and journal the rollback along with
    /// any sequence deltas, which stay allocated.
    fn discard(&mut self, db: &Database) -> Result<()> {
        self.state = TransactionState::RolledBack;
        for accumulator in &self.accumulators {
            accumulator.abort(self.start);
        }
        let sequences: Vec<JournalRecord> = self
            .records
            .drain(..)
            .filter(|r| {
                matches!(
                    r,
                    JournalRecord::Delta {
                        kind: AccumulatorKind::Seq,
                        ..
                    }
                )
            })
            .collect();
        self.buffered_bytes = 0;
        if (self.journaled || !self.touched.is_empty() || !sequences.is_empty()) && db.is_open() {
            let mut frames = Vec::with_capacity(sequences.len() + 2);
            if !self.journaled {
                frames.push(JournalRecord::TxnBegin { start: self.start });
            }
            frames.extend(sequences);
            frames.push(JournalRecord::TxnRollback { start: self.start });
            self.journaled = true;
            db.journal.append_all(&frames)?;
        }
        Ok(())
    }

    fn queue_rollback_pruning(&mut self, db: &Database) {
        let pages = self.touched.len();
        if db.rollback_pruning() && pages > 0 {
            for (page, tree) in self.touched.drain() {
                db.cleanup.offer(CleanupAction::PrunePage {
                    page,
                    tree: Some(tree),
                });
            }
            db.kick_cleanup();
        }
        debug!(target: "tessera::txn", start = self.start, pages, "rolled back");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            if let Err(e) = self.rollback() {
                warn!(target: "tessera::txn", start = self.start, error = %e, "rollback of dropped transaction failed");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("start", &self.start)
            .field("state", &self.state)
            .field("pending_records", &self.records.len())
            .field("journaled", &self.journaled)
            .finish()
    }
}
