//! Transactional accumulators.
//!
//! An accumulator is a 64-bit counter attached to a tree that many
//! transactions update concurrently without conflicting. Each update is
//! recorded as a delta tagged with the writer's handle:
//!
//! - the *live* value folds in every update immediately, including those of
//!   transactions that have not committed
//! - the *snapshot* value seen by a transaction folds in only deltas
//!   committed before it started, plus its own
//!
//! Committed deltas that every current reader can see are periodically
//! folded into the base value. The value written at a checkpoint covers
//! deltas committed at or before the checkpoint timestamp; later deltas are
//! replayed from the journal during recovery.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tessera_concurrency::ActiveTransactionCache;
use tessera_core::{Error, Result, Timestamp, TreeId, PRIMORDIAL};

/// How deltas combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccumulatorKind {
    /// Sum of deltas
    Sum,
    /// Smallest value seen
    Min,
    /// Largest value seen
    Max,
    /// Monotonic sequence; values handed out are never reused
    Seq,
}

impl AccumulatorKind {
    /// Value of an accumulator nobody has updated.
    pub fn identity(self) -> i64 {
        match self {
            AccumulatorKind::Sum | AccumulatorKind::Seq => 0,
            AccumulatorKind::Min => i64::MAX,
            AccumulatorKind::Max => i64::MIN,
        }
    }

    /// Fold `delta` into `value`.
    pub fn combine(self, value: i64, delta: i64) -> i64 {
        match self {
            AccumulatorKind::Sum | AccumulatorKind::Seq => value.wrapping_add(delta),
            AccumulatorKind::Min => value.min(delta),
            AccumulatorKind::Max => value.max(delta),
        }
    }
}

/// Durable value of one accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatorValue {
    /// Owning tree
    pub tree: TreeId,
    /// Accumulator slot within the tree
    pub index: u8,
    /// Kind
    pub kind: AccumulatorKind,
    /// Value
    pub value: i64,
}

#[derive(Debug, Clone, Copy)]
struct Delta {
    handle: Timestamp,
    commit: Option<Timestamp>,
    value: i64,
}

#[derive(Debug)]
struct AccumulatorState {
    base: i64,
    deltas: Vec<Delta>,
}

/// One accumulator.
#[derive(Debug)]
pub struct Accumulator {
    tree: TreeId,
    index: u8,
    kind: AccumulatorKind,
    state: Mutex<AccumulatorState>,
    live: AtomicI64,
}

impl Accumulator {
    /// Create an accumulator starting at `base`.
    pub fn new(tree: TreeId, index: u8, kind: AccumulatorKind, base: i64) -> Self {
        Accumulator {
            tree,
            index,
            kind,
            state: Mutex::new(AccumulatorState {
                base,
                deltas: Vec::new(),
            }),
            live: AtomicI64::new(base),
        }
    }

    /// Owning tree.
    pub fn tree(&self) -> TreeId {
        self.tree
    }

    /// Slot within the tree.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Kind.
    pub fn kind(&self) -> AccumulatorKind {
        self.kind
    }

    /// Apply `value` on behalf of the transaction `handle`. Returns the new
    /// live value, which for a sequence is the allocated number.
    pub fn update(&self, value: i64, handle: Timestamp) -> i64 {
        let mut state = self.state.lock();
        state.deltas.push(Delta {
            handle,
            commit: None,
            value,
        });
        let live = self.kind.combine(self.live.load(Ordering::Acquire), value);
        self.live.store(live, Ordering::Release);
        live
    }

    /// Mark the deltas of `handle` committed at `tc`.
    pub fn commit(&self, handle: Timestamp, tc: Timestamp) {
        let mut state = self.state.lock();
        for delta in state.deltas.iter_mut().filter(|d| d.handle == handle) {
            delta.commit = Some(tc);
        }
    }

    /// Discard the deltas of `handle`. A sequence keeps its deltas as if
    /// committed before everyone, so numbers already handed out are never
    /// reissued, not even after a checkpoint and restart.
    pub fn abort(&self, handle: Timestamp) {
        let mut state = self.state.lock();
        if self.kind == AccumulatorKind::Seq {
            for delta in state.deltas.iter_mut().filter(|d| d.handle == handle) {
                delta.commit = Some(PRIMORDIAL);
            }
            return;
        }
        state.deltas.retain(|d| d.handle != handle);
        let live = state
            .deltas
            .iter()
            .fold(state.base, |acc, d| self.kind.combine(acc, d.value));
        self.live.store(live, Ordering::Release);
    }

    /// Value including every update, committed or not.
    pub fn live_value(&self) -> i64 {
        self.live.load(Ordering::Acquire)
    }

    /// Value seen by the transaction that started at `reader`.
    pub fn snapshot_value(&self, reader: Timestamp) -> i64 {
        let state = self.state.lock();
        state
            .deltas
            .iter()
            .filter(|d| d.handle == reader || d.commit.map(|tc| tc <= reader).unwrap_or(false))
            .fold(state.base, |acc, d| self.kind.combine(acc, d.value))
    }

    /// Value covering deltas committed at or before `ts`.
    pub fn checkpoint_value(&self, ts: Timestamp) -> i64 {
        let state = self.state.lock();
        state
            .deltas
            .iter()
            .filter(|d| d.commit.map(|tc| tc <= ts).unwrap_or(false))
            .fold(state.base, |acc, d| self.kind.combine(acc, d.value))
    }

    /// Fold settled committed deltas into the base. Returns how many.
    pub fn fold(&self, cache: &ActiveTransactionCache) -> usize {
        let mut state = self.state.lock();
        let kind = self.kind;
        let mut base = state.base;
        let before = state.deltas.len();
        state.deltas.retain(|d| match d.commit {
            Some(tc) if cache.is_settled(tc) => {
                base = kind.combine(base, d.value);
                false
            }
            _ => true,
        });
        state.base = base;
        before - state.deltas.len()
    }

    /// Apply a delta replayed from the journal.
    pub fn apply_recovered(&self, value: i64) {
        let mut state = self.state.lock();
        state.base = self.kind.combine(state.base, value);
        let live = self.kind.combine(self.live.load(Ordering::Acquire), value);
        self.live.store(live, Ordering::Release);
    }

    /// Deltas not yet folded.
    pub fn pending_deltas(&self) -> usize {
        self.state.lock().deltas.len()
    }
}

/// All accumulators, keyed by tree and slot.
#[derive(Debug, Default)]
pub struct AccumulatorRegistry {
    accumulators: DashMap<(TreeId, u8), Arc<Accumulator>>,
}

impl AccumulatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The accumulator in `tree` slot `index`, created at its identity
    /// value if absent. Fails if it exists with another kind.
    pub fn get_or_create(
        &self,
        tree: TreeId,
        index: u8,
        kind: AccumulatorKind,
    ) -> Result<Arc<Accumulator>> {
        let entry = self
            .accumulators
            .entry((tree, index))
            .or_insert_with(|| Arc::new(Accumulator::new(tree, index, kind, kind.identity())));
        if entry.kind() != kind {
            return Err(Error::InvalidOperation(format!(
                "accumulator {} of {} is {:?}, not {:?}",
                index,
                tree,
                entry.kind(),
                kind
            )));
        }
        Ok(Arc::clone(entry.value()))
    }

    /// Install a recovered checkpoint value, replacing any accumulator.
    pub fn restore(&self, value: AccumulatorValue) {
        self.accumulators.insert(
            (value.tree, value.index),
            Arc::new(Accumulator::new(value.tree, value.index, value.kind, value.value)),
        );
    }

    /// Existing accumulator, if any.
    pub fn get(&self, tree: TreeId, index: u8) -> Option<Arc<Accumulator>> {
        self.accumulators.get(&(tree, index)).map(|a| Arc::clone(a.value()))
    }

    /// Checkpoint values of every accumulator as of `ts`.
    pub fn checkpoint_values(&self, ts: Timestamp) -> Vec<AccumulatorValue> {
        let mut values: Vec<AccumulatorValue> = self
            .accumulators
            .iter()
            .map(|a| AccumulatorValue {
                tree: a.tree(),
                index: a.index(),
                kind: a.kind(),
                value: a.checkpoint_value(ts),
            })
            .collect();
        values.sort_by_key(|v| (v.tree, v.index));
        values
    }

    /// Fold settled deltas of every accumulator.
    pub fn fold_all(&self, cache: &ActiveTransactionCache) -> usize {
        self.accumulators.iter().map(|a| a.fold(cache)).sum()
    }

    /// Number of accumulators.
    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    /// Whether there are no accumulators.
    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.accumulators.clear();
    }
}
