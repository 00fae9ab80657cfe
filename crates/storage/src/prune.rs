//! MVV pruning.
//!
//! Pruning rewrites the value slots of one data page so that each keeps only
//! the versions some current or future reader could still resolve to:
//!
//! - versions of aborted transactions are removed
//! - every version older than the newest *settled* committed version is
//!   removed (settled: committed before every active transaction started)
//! - a slot left with one settled version collapses to a plain value
//! - a slot left with one settled AntiValue is removed, unless its key is
//!   the first key on the page; that key keeps a primordial AntiValue
//!   until a tree-level action can remove it
//! - a slot left with nothing (only aborted versions) is removed
//!
//! Settledness is judged against an [`ActiveTransactionCache`]. A stale
//! cache only makes fewer versions prunable.

use crate::page::DataPage;
use crate::value::{StoredValue, Version, VersionBody};
use smallvec::SmallVec;
use tessera_concurrency::{ActiveTransactionCache, TransactionIndex, TxnOutcome};
use tessera_core::{PageId, Timestamp, PRIMORDIAL};

/// Result of pruning one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    /// Whether the page was modified
    pub changed: bool,
    /// Versions discarded
    pub versions_removed: usize,
    /// Keys removed from the page
    pub keys_removed: usize,
    /// Heads of long-record chains no longer referenced
    pub freed_chains: Vec<PageId>,
    /// First-key slots left as a primordial AntiValue
    pub edge_anti_values: Vec<Vec<u8>>,
}

impl PruneOutcome {
    /// Fold another outcome into this one.
    pub fn merge(&mut self, other: PruneOutcome) {
        self.changed |= other.changed;
        self.versions_removed += other.versions_removed;
        self.keys_removed += other.keys_removed;
        self.freed_chains.extend(other.freed_chains);
        self.edge_anti_values.extend(other.edge_anti_values);
    }
}

enum SlotFate {
    Keep,
    Remove,
}

/// Prune every slot of `page`.
pub fn prune_data_page(
    page: &mut DataPage,
    index: &TransactionIndex,
    cache: &ActiveTransactionCache,
) -> PruneOutcome {
    let mut outcome = PruneOutcome::default();
    let first_key = page.entries.keys().next().cloned();
    let mut removed_keys = Vec::new();

    for (key, value) in page.entries.iter_mut() {
        let is_edge = first_key.as_deref() == Some(key.as_slice());
        if let SlotFate::Remove = prune_slot(value, is_edge, index, cache, &mut outcome) {
            removed_keys.push(key.clone());
        }
        if is_edge && value.is_primordial_anti_value() {
            outcome.edge_anti_values.push(key.clone());
        }
    }

    for key in removed_keys {
        page.entries.remove(&key);
        outcome.keys_removed += 1;
        outcome.changed = true;
    }
    outcome
}

fn drop_version(version: &Version, index: &TransactionIndex, outcome: &mut PruneOutcome) {
    if version.handle != PRIMORDIAL {
        index.decrement_mvv_count(version.handle);
    }
    if let Some(head) = version.body.long_record_head() {
        outcome.freed_chains.push(head);
    }
    outcome.versions_removed += 1;
    outcome.changed = true;
}

fn settled_commit(
    handle: Timestamp,
    index: &TransactionIndex,
    cache: &ActiveTransactionCache,
) -> Option<bool> {
    match index.outcome(handle) {
        TxnOutcome::Committed(tc) => Some(cache.is_settled(tc)),
        _ => None,
    }
}

fn prune_slot(
    value: &mut StoredValue,
    is_edge: bool,
    index: &TransactionIndex,
    cache: &ActiveTransactionCache,
    outcome: &mut PruneOutcome,
) -> SlotFate {
    let versions = match value {
        StoredValue::Value(_) => return SlotFate::Keep,
        StoredValue::Mvv(versions) => std::mem::take(versions),
    };

    let mut keep: SmallVec<[Version; 2]> = SmallVec::new();
    let mut settled = false;
    for version in versions {
        if settled {
            drop_version(&version, index, outcome);
            continue;
        }
        match index.outcome(version.handle) {
            TxnOutcome::Aborted => drop_version(&version, index, outcome),
            TxnOutcome::Active => keep.push(version),
            TxnOutcome::Committed(tc) => {
                settled = cache.is_settled(tc);
                keep.push(version);
            }
        }
    }

    if keep.is_empty() {
        *value = StoredValue::Mvv(keep);
        return SlotFate::Remove;
    }

    if keep.len() == 1 && settled_commit(keep[0].handle, index, cache) == Some(true) {
        let only = &keep[0];
        if only.body.is_anti_value() {
            if !is_edge {
                if only.handle != PRIMORDIAL {
                    index.decrement_mvv_count(only.handle);
                }
                *value = StoredValue::Mvv(keep);
                return SlotFate::Remove;
            }
            if only.handle != PRIMORDIAL {
                index.decrement_mvv_count(only.handle);
                outcome.changed = true;
            }
            *value = StoredValue::primordial_anti_value();
            return SlotFate::Keep;
        }
        if only.handle != PRIMORDIAL {
            index.decrement_mvv_count(only.handle);
        }
        outcome.changed = true;
        let body = keep.pop().map(|v| v.body).unwrap_or(VersionBody::AntiValue);
        *value = StoredValue::Value(body);
        return SlotFate::Keep;
    }

    *value = StoredValue::Mvv(keep);
    SlotFate::Keep
}
