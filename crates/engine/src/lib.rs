//! Database engine for Tessera
//!
//! This crate orchestrates all lower layers:
//! - Database: open/close, the directory lock and the instance registry
//! - Transactions and exchanges over trees
//! - Recovery integration: replaying the journal into trees and accumulators
//! - Checkpoints and the background tasks that run them
//! - Management: runtime counters and tuning
//!
//! The engine is the only component that knows about:
//! - Cross-layer coordination (storage + journal + recovery)
//! - The commit path from transaction buffer to durable journal record

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod database;
pub mod exchange;
pub mod management;
mod recovery;
pub mod transaction;

pub use checkpoint::CheckpointSummary;
pub use database::{
    Database, RetryConfig, StartupRecovery, TesseraConfig, VolumeSpec, CONFIG_FILE_NAME,
};
pub use exchange::Exchange;
pub use management::ManagementInfo;
pub use transaction::{Transaction, TransactionState};

pub use tessera_durability::CommitPolicy;
pub use tessera_storage::{AccumulatorKind, PageMetrics, PruneOutcome};
