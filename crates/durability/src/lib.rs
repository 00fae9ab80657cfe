//! Durability layer for Tessera
//!
//! This crate handles everything that makes changes survive a crash:
//!
//! - Journal: block-sized files of framed records addressed by a single
//!   64-bit journal address space
//! - Group, hard and soft commit policies
//! - Page map: newest journaled image of every page not yet copied back
//! - Copier and flusher background tasks
//! - Recovery: scan the journal, choose page images, replay transactions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod format;
pub mod journal;
pub mod reader;
pub mod recovery;
pub mod tasks;

pub use config::{CommitPolicy, JournalConfig, JournalConfigError, JOURNAL_FORMAT_VERSION};
pub use format::{JournalFile, JournalHeader, JournalRecord, JournalRecordError};
pub use journal::{CheckpointMark, JournalInfo, JournalManager, JournalPageSource, PageNode};
pub use reader::{list_journal_files, FileScan, JournalReader, ReadRecord, ReadStopReason};
pub use recovery::{
    RecoveredCheckpoint, RecoveredJournal, RecoveredTransaction, RecoveryIncident,
    RecoveryListener, RecoveryManager, RecoveryReport,
};
pub use tasks::{JournalCopier, JournalFlusher, JournalTasks};
