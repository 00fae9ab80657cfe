//! Tessera - embedded transactional key-value storage engine
//!
//! Tessera stores ordered keys in B-trees spread over fixed-size page
//! volumes. Every change goes through a write-ahead journal first; pages are
//! copied back to their volumes in the background and checkpoints bound how
//! much journal recovery has to replay.
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::{Database, AccumulatorKind};
//!
//! let db = Database::open("/var/lib/app")?;
//!
//! // Implicit transactions: each call commits on its own
//! let mut ex = db.exchange("data", "users")?;
//! ex.store(b"user:123", b"Alice")?;
//! assert_eq!(ex.fetch(b"user:123")?, Some(b"Alice".to_vec()));
//!
//! // Explicit transactions: snapshot reads, all-or-nothing writes
//! let tree = ex.tree();
//! db.transaction(|txn| {
//!     txn.store(tree, b"user:124", b"Bob")?;
//!     txn.update_accumulator(tree, 0, AccumulatorKind::Sum, 1)?;
//!     Ok(())
//! })?;
//!
//! db.close()?;
//! ```
//!
//! # Architecture
//!
//! The engine crate is the public surface. Lower layers (claims and the
//! transaction index, pages and trees, the journal) are reachable through
//! the accessors on [`Database`] for inspection and tests.

pub use tessera_core::{Error, Result, Timestamp, TreeId, VolumeId};
pub use tessera_engine::*;
