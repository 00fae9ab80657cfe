//! Core identifiers for Tessera
//!
//! This module defines the foundational identifiers:
//! - VolumeId / PageId / PageAddress: where a page lives
//! - TreeId: a B-tree within a volume
//! - Timestamp: values drawn from the [`TimestampAllocator`](crate::TimestampAllocator)
//! - JournalAddress: logical byte offset into the journal stream
//! - DatabaseId: identity stamped into every journal file

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A timestamp drawn from the shared allocator.
///
/// Transaction start timestamps double as version handles: every version in
/// an MVV is tagged with the start timestamp of the transaction that wrote it.
pub type Timestamp = u64;

/// Logical byte offset into the multi-file journal stream.
pub type JournalAddress = u64;

/// Page number within a volume.
pub type PageId = u64;

/// Version handle of values that predate every live transaction.
///
/// A version tagged `PRIMORDIAL` is committed and visible to every reader.
pub const PRIMORDIAL: Timestamp = 0;

/// Commit timestamp of a transaction that has not committed.
pub const UNCOMMITTED: Timestamp = u64::MAX;

/// Identifier of an open volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub u32);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vol{}", self.0)
    }
}

/// Identifier of a tree. Unique across the database.
///
/// The high 16 bits name the volume holding the tree, the low 16 bits
/// number the tree within that volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeId(pub u32);

impl TreeId {
    /// Compose a tree id from its volume and per-volume ordinal.
    pub fn new(volume: VolumeId, ordinal: u16) -> Self {
        TreeId((volume.0 << 16) | ordinal as u32)
    }

    /// Volume holding the tree.
    pub fn volume(&self) -> VolumeId {
        VolumeId(self.0 >> 16)
    }

    /// Ordinal within the volume.
    pub fn ordinal(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.tree{}", self.volume(), self.ordinal())
    }
}

/// Fully qualified page location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageAddress {
    /// Owning volume
    pub volume: VolumeId,
    /// Page number within the volume
    pub page: PageId,
}

impl PageAddress {
    /// Create a page address.
    pub fn new(volume: VolumeId, page: PageId) -> Self {
        PageAddress { volume, page }
    }
}

impl fmt::Display for PageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.volume, self.page)
    }
}

/// Identity of a database, stamped into every journal file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId(Uuid);

impl DatabaseId {
    /// Create a new random identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for DatabaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_address_ordering() {
        let a = PageAddress::new(VolumeId(0), 10);
        let b = PageAddress::new(VolumeId(0), 11);
        let c = PageAddress::new(VolumeId(1), 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_page_address_display() {
        assert_eq!(PageAddress::new(VolumeId(2), 17).to_string(), "vol2:17");
    }

    #[test]
    fn test_tree_id_parts() {
        let id = TreeId::new(VolumeId(3), 9);
        assert_eq!(id.volume(), VolumeId(3));
        assert_eq!(id.ordinal(), 9);
        assert_eq!(id.to_string(), "vol3.tree9");
    }

    #[test]
    fn test_database_id_roundtrip() {
        let id = DatabaseId::new();
        assert_eq!(DatabaseId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_sentinels() {
        assert!(PRIMORDIAL < UNCOMMITTED);
    }
}
