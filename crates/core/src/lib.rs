//! Core types for Tessera
//!
//! This crate defines the foundational types shared by every layer:
//! - Error: error type hierarchy and `Result` alias
//! - Identifiers: volumes, pages, trees, journal addresses, timestamps
//! - TimestampAllocator: the single timestamp sequence, injected by handle

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod timestamp;
pub mod types;

pub use error::{Error, Result};
pub use timestamp::TimestampAllocator;
pub use types::{
    DatabaseId, JournalAddress, PageAddress, PageId, Timestamp, TreeId, VolumeId, PRIMORDIAL,
    UNCOMMITTED,
};
