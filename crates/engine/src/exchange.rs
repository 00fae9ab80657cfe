//! Exchange: key/value access to one tree
//!
//! An exchange either runs inside a caller's [`Transaction`] or, when
//! created from the database, wraps every operation in its own implicit
//! transaction that commits on success and rolls back on error.
//!
//! Pruning and page inspection act on pages directly and never need a
//! transaction.

use std::sync::Arc;

use tessera_core::{PageAddress, Result, TreeId};
use tessera_storage::{AccumulatorKind, PageMetrics, PruneOutcome};

use crate::database::Database;
use crate::transaction::Transaction;

/// Cursor-less handle on one tree.
pub struct Exchange<'t> {
    db: Arc<Database>,
    tree: TreeId,
    txn: Option<&'t mut Transaction>,
}

impl Exchange<'static> {
    pub(crate) fn new(db: Arc<Database>, tree: TreeId) -> Self {
        Exchange {
            db,
            tree,
            txn: None,
        }
    }
}

impl<'t> Exchange<'t> {
    pub(crate) fn with_transaction(db: Arc<Database>, tree: TreeId, txn: &'t mut Transaction) -> Self {
        Exchange {
            db,
            tree,
            txn: Some(txn),
        }
    }

    /// Tree this exchange works on.
    pub fn tree(&self) -> TreeId {
        self.tree
    }

    /// Whether operations run in a caller-owned transaction.
    pub fn is_transactional(&self) -> bool {
        self.txn.is_some()
    }

    fn run<R>(&mut self, op: impl FnOnce(&mut Transaction, TreeId) -> Result<R>) -> Result<R> {
        let tree = self.tree;
        match self.txn.as_deref_mut() {
            Some(txn) => op(txn, tree),
            None => {
                let mut txn = Transaction::begin(&self.db)?;
                match op(&mut txn, tree) {
                    Ok(result) => {
                        txn.commit()?;
                        Ok(result)
                    }
                    Err(e) => {
                        txn.rollback()?;
                        Err(e)
                    }
                }
            }
        }
    }

    // =========================================================================
    // Values
    // =========================================================================

    /// Store `value` under `key`.
    pub fn store(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.run(|txn, tree| txn.store(tree, key, value))
    }

    /// Visible value of `key`.
    pub fn fetch(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.run(|txn, tree| txn.fetch(tree, key))
    }

    /// Remove `key`. Returns whether a value was visible.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        self.run(|txn, tree| txn.remove(tree, key))
    }

    /// Remove every visible key. Returns how many were removed.
    pub fn remove_all(&mut self) -> Result<usize> {
        self.run(|txn, tree| txn.remove_all(tree))
    }

    /// Visible keys in order.
    pub fn keys(&mut self) -> Result<Vec<Vec<u8>>> {
        self.run(|txn, tree| txn.keys(tree))
    }

    /// Apply a delta to accumulator `index` of this tree.
    pub fn update_accumulator(&mut self, index: u8, kind: AccumulatorKind, value: i64) -> Result<i64> {
        self.run(|txn, tree| txn.update_accumulator(tree, index, kind, value))
    }

    /// Snapshot value of accumulator `index` of this tree.
    pub fn accumulator_value(&mut self, index: u8, kind: AccumulatorKind) -> Result<i64> {
        self.run(|txn, tree| txn.accumulator_value(tree, index, kind))
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// Leaf page holding `key`.
    pub fn page_of(&self, key: &[u8]) -> Result<PageAddress> {
        self.db.check_open()?;
        self.db.trees.page_of(self.tree, key)
    }

    /// Prune the page holding `key` now. Edge AntiValues it leaves behind
    /// are queued for the cleanup manager.
    pub fn prune(&self, key: &[u8]) -> Result<PruneOutcome> {
        let address = self.page_of(key)?;
        self.db.trees.prune_page(address, Some(self.tree))
    }

    /// Prune every page of the tree. With `enqueue`, edge AntiValues are
    /// queued for the cleanup manager; without it they stay in place.
    pub fn prune_all(&self, enqueue: bool) -> Result<PruneOutcome> {
        self.db.check_open()?;
        let mut total = PruneOutcome::default();
        for address in self.db.trees.data_pages(self.tree)? {
            let tree = if enqueue { Some(self.tree) } else { None };
            total.merge(self.db.trees.prune_page(address, tree)?);
        }
        Ok(total)
    }

    /// Whether the slot of `key` is a multi-version value with at least
    /// one long record version.
    pub fn is_value_long_mvv(&self, key: &[u8]) -> Result<bool> {
        self.db.check_open()?;
        Ok(self
            .db
            .trees
            .slot(self.tree, key)?
            .map(|slot| slot.is_long_mvv())
            .unwrap_or(false))
    }

    /// Statistics of the page holding `key`.
    pub fn page_metrics(&self, key: &[u8]) -> Result<PageMetrics> {
        let address = self.page_of(key)?;
        self.db.trees.page_metrics(address)
    }

    /// Keys physically present in the tree's pages, AntiValues and
    /// invisible versions included.
    pub fn stored_key_count(&self) -> Result<usize> {
        self.db.check_open()?;
        let mut count = 0;
        for address in self.db.trees.data_pages(self.tree)? {
            count += self.db.trees.page_metrics(address)?.key_count;
        }
        Ok(count)
    }
}

impl std::fmt::Debug for Exchange<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("tree", &self.tree)
            .field("transactional", &self.txn.is_some())
            .finish()
    }
}
