//! Applying the recovered journal to trees, accumulators and the
//! transaction index
//!
//! Replay hands every surviving update to [`RecoveryApplier`]. Afterwards
//! [`reconcile_versions`] makes the transaction index agree with the
//! versions actually present in pages and prunes what aborted
//! transactions left behind.

use rustc_hash::FxHashMap;
use tessera_concurrency::{TransactionIndex, TxnOutcome};
use tessera_core::{Error, JournalAddress, PageAddress, Result, Timestamp, TreeId};
use tessera_durability::{
    RecoveredCheckpoint, RecoveryIncident, RecoveryListener, RecoveryReport,
};
use tessera_storage::{
    AccumulatorKind, AccumulatorRegistry, PruneOutcome, TreeStore, VersionBody, VolumeSet,
};
use tracing::{debug, info};

/// Replays journal records into the engine.
pub(crate) struct RecoveryApplier<'a> {
    pub(crate) trees: &'a TreeStore,
    pub(crate) accumulators: &'a AccumulatorRegistry,
    pub(crate) index: &'a TransactionIndex,
    pub(crate) volumes: &'a VolumeSet,
    pub(crate) stores: usize,
    pub(crate) removes: usize,
    pub(crate) deltas: usize,
    broken_chains: FxHashMap<(TreeId, Vec<u8>), RecoveryIncident>,
}

impl<'a> RecoveryApplier<'a> {
    pub(crate) fn new(
        trees: &'a TreeStore,
        accumulators: &'a AccumulatorRegistry,
        index: &'a TransactionIndex,
        volumes: &'a VolumeSet,
    ) -> Self {
        RecoveryApplier {
            trees,
            accumulators,
            index,
            volumes,
            stores: 0,
            removes: 0,
            deltas: 0,
            broken_chains: FxHashMap::default(),
        }
    }

    /// Unreadable long-record chains that no later update of the same key
    /// replaced.
    pub(crate) fn unresolved_chains(&mut self) -> Vec<RecoveryIncident> {
        let mut incidents: Vec<_> = self.broken_chains.drain().map(|(_, v)| v).collect();
        incidents.sort_by_key(|incident| incident.address);
        incidents
    }

    fn require_volume(&self, tree: TreeId) -> Result<()> {
        self.volumes.require(tree.volume()).map(|_| ())
    }
}

impl RecoveryListener for RecoveryApplier<'_> {
    fn start_recovery(&mut self, checkpoint: Option<&RecoveredCheckpoint>) -> Result<()> {
        if let Some(checkpoint) = checkpoint {
            for value in &checkpoint.accumulators {
                if self.volumes.get(value.tree.volume()).is_some() {
                    self.accumulators.restore(*value);
                }
            }
        }
        Ok(())
    }

    fn tree_created(&mut self, tree: TreeId, name: &str) -> Result<()> {
        self.require_volume(tree)?;
        self.trees.ensure_tree(tree, name)
    }

    fn store(
        &mut self,
        address: JournalAddress,
        start: Timestamp,
        tree: TreeId,
        key: &[u8],
        body: &VersionBody,
    ) -> Result<()> {
        self.require_volume(tree)?;
        self.broken_chains.remove(&(tree, key.to_vec()));
        if let Some(head) = body.long_record_head() {
            // A chain replaced by a later update of the key may have been
            // freed and reused. It only counts once nothing replaced it.
            match self.trees.chain_pages(tree.volume(), head) {
                Ok(pages) => self.trees.reserve_pages(tree.volume(), &pages)?,
                Err(e) => {
                    debug!(target: "tessera::recovery", address, head, error = %e, "long record chain unreadable");
                    self.broken_chains.insert(
                        (tree, key.to_vec()),
                        RecoveryIncident {
                            address,
                            kind: e.kind(),
                            message: format!("long record chain at page {} unreadable: {}", head, e),
                        },
                    );
                }
            }
        }
        self.trees.store(tree, key, start, body.clone(), false)?;
        self.stores += 1;
        Ok(())
    }

    fn remove(
        &mut self,
        _address: JournalAddress,
        start: Timestamp,
        tree: TreeId,
        key: &[u8],
    ) -> Result<()> {
        self.require_volume(tree)?;
        self.broken_chains.remove(&(tree, key.to_vec()));
        self.trees.store(tree, key, start, VersionBody::AntiValue, false)?;
        self.removes += 1;
        Ok(())
    }

    fn delta(
        &mut self,
        _address: JournalAddress,
        _start: Timestamp,
        tree: TreeId,
        index: u8,
        kind: AccumulatorKind,
        value: i64,
    ) -> Result<()> {
        self.require_volume(tree)?;
        self.accumulators
            .get_or_create(tree, index, kind)?
            .apply_recovered(value);
        self.deltas += 1;
        Ok(())
    }

    fn transaction_committed(&mut self, start: Timestamp, commit: Timestamp) -> Result<()> {
        self.index.register_recovered(start, TxnOutcome::Committed(commit));
        Ok(())
    }

    fn transaction_aborted(&mut self, start: Timestamp) -> Result<()> {
        self.index.register_recovered(start, TxnOutcome::Aborted);
        Ok(())
    }

    fn end_recovery(&mut self, report: &RecoveryReport) -> Result<()> {
        info!(
            target: "tessera::recovery",
            stores = self.stores,
            removes = self.removes,
            deltas = self.deltas,
            missing_volume_records = report.missing_volume_records,
            "recovered updates applied"
        );
        Ok(())
    }
}

/// What [`reconcile_versions`] found.
#[derive(Debug, Clone, Default)]
pub(crate) struct Reconciled {
    /// Handles found in pages with no journal outcome, treated as aborted
    pub orphaned: usize,
    /// Aborted handles whose versions were pruned at startup
    pub aborted: usize,
    /// Outcome of the startup prune
    pub pruned: PruneOutcome,
}

/// Bring the transaction index in line with the versions in pages.
///
/// Pages journaled but not certified by the checkpoint are dirtied again
/// so the next checkpoint journals them. Every handle carried by a page
/// version advances the timestamp allocator. Handles above the checkpoint
/// timestamp with no recorded outcome belonged to transactions that never
/// finished and count as aborted. If any aborted handle still has versions,
/// every tree is pruned.
pub(crate) fn reconcile_versions(
    trees: &TreeStore,
    index: &TransactionIndex,
    volumes: &VolumeSet,
    checkpoint_ts: Timestamp,
    discarded: &[PageAddress],
) -> Result<Reconciled> {
    for address in discarded {
        if volumes.get(address.volume).is_none() {
            continue;
        }
        match trees.pool().get(*address) {
            Ok(buffer) => buffer.mark_dirty(),
            Err(e) => {
                debug!(target: "tessera::recovery", page = %address, error = %e, "discarded page not readable")
            }
        }
    }

    let mut reconciled = Reconciled::default();
    for (handle, count) in trees.handle_counts()? {
        index.timestamps().bump_to(handle);
        if index.mvv_count(handle).is_none() {
            if handle <= checkpoint_ts {
                continue;
            }
            index.register_recovered(handle, TxnOutcome::Aborted);
            reconciled.orphaned += 1;
        }
        index.set_mvv_count(handle, count);
    }

    reconciled.aborted = index.aborted_handles().len();
    if reconciled.aborted > 0 {
        index.update_active_transaction_cache();
        for tree in trees.all_trees()? {
            match trees.prune_tree(tree) {
                Ok(outcome) => reconciled.pruned.merge(outcome),
                Err(Error::MissingVolume(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
    let dropped = index.cleanup();
    info!(
        target: "tessera::recovery",
        orphaned = reconciled.orphaned,
        aborted = reconciled.aborted,
        versions_removed = reconciled.pruned.versions_removed,
        dropped,
        "transaction index reconciled"
    );
    Ok(reconciled)
}
