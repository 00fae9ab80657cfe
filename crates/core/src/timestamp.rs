//! The timestamp sequence.
//!
//! Transaction start and commit timestamps, checkpoint timestamps and page
//! write stamps all come from one `TimestampAllocator`. It is an owned
//! object: the database creates one and hands an `Arc` to every component
//! that needs timestamps, so tests can construct their own and control the
//! sequence deterministically.

use crate::types::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic timestamp source.
///
/// `update()` is a single atomic increment; concurrent callers never observe
/// the same value.
#[derive(Debug)]
pub struct TimestampAllocator {
    current: AtomicU64,
}

impl TimestampAllocator {
    /// Create an allocator whose next value will be `1`.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create an allocator whose current value is `current`.
    pub fn starting_at(current: Timestamp) -> Self {
        TimestampAllocator {
            current: AtomicU64::new(current),
        }
    }

    /// Allocate and return a fresh timestamp.
    pub fn update(&self) -> Timestamp {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently allocated timestamp.
    pub fn current(&self) -> Timestamp {
        self.current.load(Ordering::SeqCst)
    }

    /// Advance the sequence so that the next allocation is greater than
    /// `ts`. Never moves the sequence backward.
    ///
    /// Recovery calls this with the largest timestamp found in the journal
    /// before any background task may allocate.
    pub fn bump_to(&self, ts: Timestamp) -> Timestamp {
        let prev = self.current.fetch_max(ts, Ordering::SeqCst);
        prev.max(ts)
    }
}

impl Default for TimestampAllocator {
    fn default() -> Self {
        Self::new()
    }
}
