//! Concurrency layer for Tessera
//!
//! This crate implements the shared-state machinery every other layer leans on:
//! - Claims: reentrant reader/writer holds on shared pages
//! - TaskRunner: the generic poll-or-kick background worker
//! - TransactionIndex: timestamps, visibility and the active transaction cache

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod claim;
pub mod runner;
pub mod transaction_index;

pub use claim::{OwnerId, ReentrantHolder, SharedResource, DEFAULT_CLAIM_TIMEOUT};
pub use runner::{BackgroundTask, RunnerStats, TaskError, TaskRunner};
pub use transaction_index::{
    ActiveTransactionCache, PendingCommit, TransactionIndex, TransactionIndexStats, TxnOutcome,
    TxnStatus,
};
