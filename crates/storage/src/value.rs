//! Multi-version values.
//!
//! A key in a data page maps to a [`StoredValue`]. Values written outside of
//! any live transaction's view are stored plainly; everything else is an MVV:
//! a list of [`Version`]s tagged with the start timestamp of their writer.
//!
//! Versions are kept in descending handle order. Two committed versions of
//! one key can only exist if the later writer started after the earlier one
//! committed, so handle order is commit order for every version a reader can
//! see. Aborted versions may interleave but are never visible.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tessera_concurrency::TransactionIndex;
use tessera_core::{PageId, Timestamp, PRIMORDIAL};

/// Payload of one version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionBody {
    /// Value bytes stored in the page
    Inline(Vec<u8>),
    /// Value stored in a chain of long-record pages
    LongRecord {
        /// First page of the chain
        head: PageId,
        /// Total value length in bytes
        size: u64,
    },
    /// Deletion marker
    AntiValue,
}

impl VersionBody {
    /// Whether this is a deletion marker.
    pub fn is_anti_value(&self) -> bool {
        matches!(self, VersionBody::AntiValue)
    }

    /// Head of the long-record chain, if any.
    pub fn long_record_head(&self) -> Option<PageId> {
        match self {
            VersionBody::LongRecord { head, .. } => Some(*head),
            _ => None,
        }
    }
}

/// One entry of an MVV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Start timestamp of the writing transaction
    pub handle: Timestamp,
    /// Payload
    pub body: VersionBody,
}

/// Value slot of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    /// A primordial value visible to everyone. Never an AntiValue.
    Value(VersionBody),
    /// Versions in descending handle order
    Mvv(SmallVec<[Version; 2]>),
}

impl StoredValue {
    /// A single primordial AntiValue: the residue of a deleted key that must
    /// stay in place for now.
    pub fn primordial_anti_value() -> Self {
        let mut versions = SmallVec::new();
        versions.push(Version {
            handle: PRIMORDIAL,
            body: VersionBody::AntiValue,
        });
        StoredValue::Mvv(versions)
    }

    /// Whether the slot is multi-version.
    pub fn is_mvv(&self) -> bool {
        matches!(self, StoredValue::Mvv(_))
    }

    /// Whether the slot is exactly one primordial AntiValue.
    pub fn is_primordial_anti_value(&self) -> bool {
        match self {
            StoredValue::Mvv(v) => {
                v.len() == 1 && v[0].handle == PRIMORDIAL && v[0].body.is_anti_value()
            }
            StoredValue::Value(_) => false,
        }
    }

    /// Number of versions in the slot.
    pub fn version_count(&self) -> usize {
        match self {
            StoredValue::Value(_) => 1,
            StoredValue::Mvv(v) => v.len(),
        }
    }

    /// Iterate versions newest first. A plain value reads as one primordial
    /// version.
    pub fn versions(&self) -> Vec<Version> {
        match self {
            StoredValue::Value(body) => vec![Version {
                handle: PRIMORDIAL,
                body: body.clone(),
            }],
            StoredValue::Mvv(v) => v.to_vec(),
        }
    }

    /// Install `body` as the version written by `handle`.
    ///
    /// A version already written by `handle` is replaced. Returns `Some`
    /// with the replaced body, or `None` when a new version was added.
    pub fn put_version(&mut self, handle: Timestamp, body: VersionBody) -> Option<VersionBody> {
        if let StoredValue::Value(existing) = self {
            let mut versions = SmallVec::new();
            versions.push(Version {
                handle: PRIMORDIAL,
                body: std::mem::replace(existing, VersionBody::AntiValue),
            });
            *self = StoredValue::Mvv(versions);
        }
        let StoredValue::Mvv(versions) = self else {
            unreachable!("converted to an MVV above");
        };
        match versions.iter().position(|v| v.handle <= handle) {
            Some(pos) if versions[pos].handle == handle => {
                Some(std::mem::replace(&mut versions[pos].body, body))
            }
            Some(pos) => {
                versions.insert(pos, Version { handle, body });
                None
            }
            None => {
                versions.push(Version { handle, body });
                None
            }
        }
    }

    /// The version visible to the reader that started at `reader`, which
    /// may be an AntiValue. `None` when no version is visible.
    pub fn resolve(&self, index: &TransactionIndex, reader: Timestamp) -> Option<&VersionBody> {
        match self {
            StoredValue::Value(body) => Some(body),
            StoredValue::Mvv(versions) => versions
                .iter()
                .find(|v| index.is_visible(v.handle, reader))
                .map(|v| &v.body),
        }
    }

    /// Handle of a version that a writer started at `writer` may not
    /// overwrite, if any.
    pub fn conflicting_handle(
        &self,
        index: &TransactionIndex,
        writer: Timestamp,
    ) -> Option<Timestamp> {
        match self {
            StoredValue::Value(_) => None,
            StoredValue::Mvv(versions) => versions
                .iter()
                .map(|v| v.handle)
                .find(|h| index.is_write_conflict(*h, writer)),
        }
    }

    /// Heads of every long-record chain referenced by the slot.
    pub fn long_record_heads(&self) -> Vec<PageId> {
        match self {
            StoredValue::Value(body) => body.long_record_head().into_iter().collect(),
            StoredValue::Mvv(versions) => versions
                .iter()
                .filter_map(|v| v.body.long_record_head())
                .collect(),
        }
    }

    /// Whether the slot is an MVV holding at least one long record.
    pub fn is_long_mvv(&self) -> bool {
        match self {
            StoredValue::Value(_) => false,
            StoredValue::Mvv(versions) => versions
                .iter()
                .any(|v| v.body.long_record_head().is_some()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_core::TimestampAllocator;

    fn inline(s: &str) -> VersionBody {
        VersionBody::Inline(s.as_bytes().to_vec())
    }

    #[test]
    fn test_put_version_keeps_descending_order() {
        let mut v = StoredValue::Value(inline("base"));
        assert!(v.put_version(10, inline("ten")).is_none());
        assert!(v.put_version(5, inline("five")).is_none());
        assert!(v.put_version(20, inline("twenty")).is_none());
        let handles: Vec<_> = v.versions().iter().map(|v| v.handle).collect();
        assert_eq!(handles, vec![20, 10, 5, PRIMORDIAL]);
    }

    #[test]
    fn test_put_version_replaces_own() {
        let mut v = StoredValue::Value(inline("base"));
        v.put_version(7, inline("a"));
        let replaced = v.put_version(7, VersionBody::AntiValue);
        assert_eq!(replaced, Some(inline("a")));
        assert_eq!(v.version_count(), 2);
    }

    #[test]
    fn test_resolve_follows_visibility() {
        let index = TransactionIndex::new(Arc::new(TimestampAllocator::new()));
        let writer = index.begin();
        let mut v = StoredValue::Value(inline("old"));
        v.put_version(writer, inline("new"));

        let other = index.begin();
        assert_eq!(v.resolve(&index, other), Some(&inline("old")));
        assert_eq!(v.resolve(&index, writer), Some(&inline("new")));

        index.commit(writer).unwrap();
        let later = index.begin();
        assert_eq!(v.resolve(&index, later), Some(&inline("new")));
        assert_eq!(v.resolve(&index, other), Some(&inline("old")));
    }

    #[test]
    fn test_conflicting_handle() {
        let index = TransactionIndex::new(Arc::new(TimestampAllocator::new()));
        let early = index.begin();
        let writer = index.begin();
        let mut v = StoredValue::Value(inline("base"));
        assert_eq!(v.conflicting_handle(&index, writer), None);

        v.put_version(early, inline("e"));
        assert_eq!(v.conflicting_handle(&index, writer), Some(early));
        index.commit(early).unwrap();
        assert_eq!(v.conflicting_handle(&index, writer), Some(early));

        let late = index.begin();
        assert_eq!(v.conflicting_handle(&index, late), None);
    }

    #[test]
    fn test_primordial_anti_value() {
        let v = StoredValue::primordial_anti_value();
        assert!(v.is_mvv());
        assert!(v.is_primordial_anti_value());
        assert!(!StoredValue::Value(inline("x")).is_primordial_anti_value());
    }

    #[test]
    fn test_long_mvv_detection() {
        let mut v = StoredValue::Value(VersionBody::LongRecord { head: 9, size: 100 });
        assert!(!v.is_long_mvv());
        v.put_version(3, VersionBody::AntiValue);
        assert!(v.is_long_mvv());
        assert_eq!(v.long_record_heads(), vec![9]);
    }
}
