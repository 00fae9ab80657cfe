//! Storage layer for Tessera
//!
//! This crate implements everything that lives in pages:
//! - Page model and binary page layout
//! - Volume files holding page slots
//! - BufferPool: resident pages guarded by claims
//! - TreeStore: key lookup, MVV installation, splits and long records
//! - Pruning of obsolete versions and the deferred CleanupManager
//! - Transactional accumulators
//!
//! # Pages and versions
//!
//! Every key maps to a value slot that is either a plain value or a
//! multi-version value (MVV). Versions carry the start timestamp of their
//! writer; visibility is decided by the `TransactionIndex`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accumulator;
pub mod buffer;
pub mod cleanup;
pub mod page;
pub mod prune;
pub mod tree;
pub mod value;
pub mod volume;

pub use accumulator::{Accumulator, AccumulatorKind, AccumulatorRegistry, AccumulatorValue};
pub use buffer::{Buffer, BufferPool, BufferPoolConfig, BufferPoolStats, ClaimGuard, PageSource};
pub use cleanup::{CleanupAction, CleanupConfig, CleanupHandler, CleanupManager, CleanupStats};
pub use page::{
    DataPage, DirectoryPage, Leaf, LongRecordPage, Page, PageBody, PageMetrics, TreeDef,
};
pub use prune::{prune_data_page, PruneOutcome};
pub use tree::{transaction_owner, StoreOutcome, TreeConfig, TreeStats, TreeStore};
pub use value::{StoredValue, Version, VersionBody};
pub use volume::{Volume, VolumeSet};
