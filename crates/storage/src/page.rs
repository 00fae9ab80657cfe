//! In-memory page model and its binary layout.
//!
//! # Page Layout
//!
//! ```text
//! ┌──────────┬──────────────┬────────────────┬──────────────────────────┐
//! │ Kind (1) │ PageId (8)   │ Timestamp (8)  │ Body (variable, per kind)│
//! └──────────┴──────────────┴────────────────┴──────────────────────────┘
//!
//! Directory: next_page (8) next_tree (2) garbage_count (4) garbage (8 each)
//!            tree_count (4) { tree_id (4) name_len (2) name leaf_count (4)
//!                             { low_len (2) low page (8) } }
//! Data:      tree_id (4) entry_count (4) { key_len (2) key value }
//! LongRecord next (8) len (4) bytes
//! Garbage:   (empty)
//!
//! value:  0x00 body                      plain value
//!         0x01 count (2) { handle (8) body }   MVV
//! body:   0x01 len (4) bytes | 0x02 head (8) size (8) | 0x03
//! ```
//!
//! All integers are little-endian. The encoded length is exact, so
//! `available_size` is simply `page_size - encoded_len`.

use crate::value::{StoredValue, Version, VersionBody};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use tessera_core::{Error, PageId, Result, Timestamp, TreeId};

const KIND_DIRECTORY: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_LONG_RECORD: u8 = 3;
const KIND_GARBAGE: u8 = 4;

const VALUE_PLAIN: u8 = 0x00;
const VALUE_MVV: u8 = 0x01;

const BODY_INLINE: u8 = 0x01;
const BODY_LONG: u8 = 0x02;
const BODY_ANTI: u8 = 0x03;

/// Size of the common page header.
pub const PAGE_HEADER_SIZE: usize = 17;

/// Bytes a long-record page spends on its own header.
pub const LONG_RECORD_OVERHEAD: usize = PAGE_HEADER_SIZE + 12;

/// One leaf of a tree: the page holding keys `>= low` up to the next leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    /// Smallest key the page may hold
    pub low: Vec<u8>,
    /// Data page
    pub page: PageId,
}

/// Definition of one tree within a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDef {
    /// Tree identifier
    pub id: TreeId,
    /// Tree name, unique within the volume
    pub name: String,
    /// Leaves in key order. The first leaf's low key is empty.
    pub leaves: Vec<Leaf>,
}

impl TreeDef {
    /// Index of the leaf covering `key`.
    pub fn leaf_index(&self, key: &[u8]) -> usize {
        self.leaves
            .partition_point(|leaf| leaf.low.as_slice() <= key)
            .saturating_sub(1)
    }
}

/// Page 0 of every volume: allocation state and tree definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryPage {
    /// Next never-used page number
    pub next_page: PageId,
    /// Next tree ordinal
    pub next_tree: u16,
    /// Deallocated pages available for reuse
    pub garbage: Vec<PageId>,
    /// Trees
    pub trees: Vec<TreeDef>,
}

/// A B-tree leaf holding keys and their value slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPage {
    /// Owning tree
    pub tree: TreeId,
    /// Sorted entries
    pub entries: BTreeMap<Vec<u8>, StoredValue>,
}

/// One link of a long-record chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongRecordPage {
    /// Next page in the chain, 0 at the end
    pub next: PageId,
    /// Payload slice
    pub bytes: Vec<u8>,
}

/// Page contents by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageBody {
    /// Volume directory
    Directory(DirectoryPage),
    /// Tree leaf
    Data(DataPage),
    /// Long-record chain link
    LongRecord(LongRecordPage),
    /// Deallocated
    Garbage,
}

/// Space and version statistics of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMetrics {
    /// Number of keys
    pub key_count: usize,
    /// Number of keys holding an MVV
    pub mvv_count: usize,
    /// Unused bytes
    pub available_size: usize,
}

/// A page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Page number
    pub id: PageId,
    /// Timestamp of the last modification
    pub timestamp: Timestamp,
    /// Contents
    pub body: PageBody,
}

impl Page {
    /// Create a page.
    pub fn new(id: PageId, timestamp: Timestamp, body: PageBody) -> Self {
        Page {
            id,
            timestamp,
            body,
        }
    }

    /// An empty data page for `tree`.
    pub fn new_data(id: PageId, tree: TreeId) -> Self {
        Page::new(
            id,
            0,
            PageBody::Data(DataPage {
                tree,
                entries: BTreeMap::new(),
            }),
        )
    }

    /// Data page contents, if this is a data page.
    pub fn data(&self) -> Option<&DataPage> {
        match &self.body {
            PageBody::Data(d) => Some(d),
            _ => None,
        }
    }

    /// Mutable data page contents.
    pub fn data_mut(&mut self) -> Option<&mut DataPage> {
        match &mut self.body {
            PageBody::Data(d) => Some(d),
            _ => None,
        }
    }

    /// Directory contents, if this is a directory page.
    pub fn directory(&self) -> Option<&DirectoryPage> {
        match &self.body {
            PageBody::Directory(d) => Some(d),
            _ => None,
        }
    }

    /// Mutable directory contents.
    pub fn directory_mut(&mut self) -> Option<&mut DirectoryPage> {
        match &mut self.body {
            PageBody::Directory(d) => Some(d),
            _ => None,
        }
    }

    /// Whether this is a long-record chain page.
    pub fn is_long_record(&self) -> bool {
        matches!(self.body, PageBody::LongRecord(_))
    }

    /// Exact size of [`encode`](Self::encode)'s output.
    pub fn encoded_len(&self) -> usize {
        PAGE_HEADER_SIZE
            + match &self.body {
                PageBody::Directory(d) => {
                    8 + 2
                        + 4
                        + 8 * d.garbage.len()
                        + 4
                        + d.trees
                            .iter()
                            .map(|t| {
                                4 + 2
                                    + t.name.len()
                                    + 4
                                    + t.leaves
                                        .iter()
                                        .map(|l| 2 + l.low.len() + 8)
                                        .sum::<usize>()
                            })
                            .sum::<usize>()
                }
                PageBody::Data(d) => {
                    8 + d
                        .entries
                        .iter()
                        .map(|(k, v)| entry_len(k, v))
                        .sum::<usize>()
                }
                PageBody::LongRecord(l) => 12 + l.bytes.len(),
                PageBody::Garbage => 0,
            }
    }

    /// Free bytes left in a page of `page_size` bytes.
    pub fn available_size(&self, page_size: usize) -> usize {
        page_size.saturating_sub(self.encoded_len())
    }

    /// Key, MVV and space statistics.
    pub fn metrics(&self, page_size: usize) -> PageMetrics {
        let (key_count, mvv_count) = match &self.body {
            PageBody::Data(d) => (
                d.entries.len(),
                d.entries.values().filter(|v| v.is_mvv()).count(),
            ),
            _ => (0, 0),
        };
        PageMetrics {
            key_count,
            mvv_count,
            available_size: self.available_size(page_size),
        }
    }

    /// Serialize the page.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        // Writes into a Vec cannot fail.
        let _ = self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        let kind = match &self.body {
            PageBody::Directory(_) => KIND_DIRECTORY,
            PageBody::Data(_) => KIND_DATA,
            PageBody::LongRecord(_) => KIND_LONG_RECORD,
            PageBody::Garbage => KIND_GARBAGE,
        };
        out.write_u8(kind)?;
        out.write_u64::<LittleEndian>(self.id)?;
        out.write_u64::<LittleEndian>(self.timestamp)?;
        match &self.body {
            PageBody::Directory(d) => {
                out.write_u64::<LittleEndian>(d.next_page)?;
                out.write_u16::<LittleEndian>(d.next_tree)?;
                out.write_u32::<LittleEndian>(d.garbage.len() as u32)?;
                for page in &d.garbage {
                    out.write_u64::<LittleEndian>(*page)?;
                }
                out.write_u32::<LittleEndian>(d.trees.len() as u32)?;
                for tree in &d.trees {
                    out.write_u32::<LittleEndian>(tree.id.0)?;
                    out.write_u16::<LittleEndian>(tree.name.len() as u16)?;
                    out.extend_from_slice(tree.name.as_bytes());
                    out.write_u32::<LittleEndian>(tree.leaves.len() as u32)?;
                    for leaf in &tree.leaves {
                        out.write_u16::<LittleEndian>(leaf.low.len() as u16)?;
                        out.extend_from_slice(&leaf.low);
                        out.write_u64::<LittleEndian>(leaf.page)?;
                    }
                }
            }
            PageBody::Data(d) => {
                out.write_u32::<LittleEndian>(d.tree.0)?;
                out.write_u32::<LittleEndian>(d.entries.len() as u32)?;
                for (key, value) in &d.entries {
                    out.write_u16::<LittleEndian>(key.len() as u16)?;
                    out.extend_from_slice(key);
                    encode_value(out, value)?;
                }
            }
            PageBody::LongRecord(l) => {
                out.write_u64::<LittleEndian>(l.next)?;
                out.write_u32::<LittleEndian>(l.bytes.len() as u32)?;
                out.extend_from_slice(&l.bytes);
            }
            PageBody::Garbage => {}
        }
        Ok(())
    }

    /// Deserialize a page.
    pub fn decode(bytes: &[u8]) -> Result<Page> {
        decode_page(&mut Cursor::new(bytes))
            .map_err(|e| Error::Corruption(format!("malformed page image: {}", e)))
    }
}

fn body_len(body: &VersionBody) -> usize {
    match body {
        VersionBody::Inline(b) => 1 + 4 + b.len(),
        VersionBody::LongRecord { .. } => 1 + 16,
        VersionBody::AntiValue => 1,
    }
}

fn entry_len(key: &[u8], value: &StoredValue) -> usize {
    2 + key.len()
        + 1
        + match value {
            StoredValue::Value(body) => body_len(body),
            StoredValue::Mvv(versions) => {
                2 + versions
                    .iter()
                    .map(|v| 8 + body_len(&v.body))
                    .sum::<usize>()
            }
        }
}

/// Bytes a key/value pair occupies in a data page.
pub fn stored_entry_len(key: &[u8], value: &StoredValue) -> usize {
    entry_len(key, value)
}

fn encode_body(out: &mut Vec<u8>, body: &VersionBody) -> std::io::Result<()> {
    match body {
        VersionBody::Inline(bytes) => {
            out.write_u8(BODY_INLINE)?;
            out.write_u32::<LittleEndian>(bytes.len() as u32)?;
            out.extend_from_slice(bytes);
        }
        VersionBody::LongRecord { head, size } => {
            out.write_u8(BODY_LONG)?;
            out.write_u64::<LittleEndian>(*head)?;
            out.write_u64::<LittleEndian>(*size)?;
        }
        VersionBody::AntiValue => out.write_u8(BODY_ANTI)?,
    }
    Ok(())
}

fn encode_value(out: &mut Vec<u8>, value: &StoredValue) -> std::io::Result<()> {
    match value {
        StoredValue::Value(body) => {
            out.write_u8(VALUE_PLAIN)?;
            encode_body(out, body)
        }
        StoredValue::Mvv(versions) => {
            out.write_u8(VALUE_MVV)?;
            out.write_u16::<LittleEndian>(versions.len() as u16)?;
            for v in versions {
                out.write_u64::<LittleEndian>(v.handle)?;
                encode_body(out, &v.body)?;
            }
            Ok(())
        }
    }
}

fn invalid(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

fn read_bytes(cur: &mut Cursor<&[u8]>, len: usize) -> std::io::Result<Vec<u8>> {
    let remaining = cur.get_ref().len() as u64 - cur.position().min(cur.get_ref().len() as u64);
    if (len as u64) > remaining {
        return Err(invalid(format!("length {} exceeds remaining {}", len, remaining)));
    }
    let mut buf = vec![0u8; len];
    cur.read_exact(&mut buf)?;
    Ok(buf)
}

fn decode_body(cur: &mut Cursor<&[u8]>) -> std::io::Result<VersionBody> {
    match cur.read_u8()? {
        BODY_INLINE => {
            let len = cur.read_u32::<LittleEndian>()? as usize;
            Ok(VersionBody::Inline(read_bytes(cur, len)?))
        }
        BODY_LONG => Ok(VersionBody::LongRecord {
            head: cur.read_u64::<LittleEndian>()?,
            size: cur.read_u64::<LittleEndian>()?,
        }),
        BODY_ANTI => Ok(VersionBody::AntiValue),
        tag => Err(invalid(format!("unknown value body tag {:#x}", tag))),
    }
}

fn decode_value(cur: &mut Cursor<&[u8]>) -> std::io::Result<StoredValue> {
    match cur.read_u8()? {
        VALUE_PLAIN => Ok(StoredValue::Value(decode_body(cur)?)),
        VALUE_MVV => {
            let count = cur.read_u16::<LittleEndian>()? as usize;
            let mut versions = SmallVec::with_capacity(count);
            for _ in 0..count {
                let handle = cur.read_u64::<LittleEndian>()?;
                let body = decode_body(cur)?;
                versions.push(Version { handle, body });
            }
            Ok(StoredValue::Mvv(versions))
        }
        tag => Err(invalid(format!("unknown value tag {:#x}", tag))),
    }
}

fn decode_page(cur: &mut Cursor<&[u8]>) -> std::io::Result<Page> {
    let kind = cur.read_u8()?;
    let id = cur.read_u64::<LittleEndian>()?;
    let timestamp = cur.read_u64::<LittleEndian>()?;
    let body = match kind {
        KIND_DIRECTORY => {
            let next_page = cur.read_u64::<LittleEndian>()?;
            let next_tree = cur.read_u16::<LittleEndian>()?;
            let garbage_count = cur.read_u32::<LittleEndian>()? as usize;
            let mut garbage = Vec::with_capacity(garbage_count.min(4096));
            for _ in 0..garbage_count {
                garbage.push(cur.read_u64::<LittleEndian>()?);
            }
            let tree_count = cur.read_u32::<LittleEndian>()? as usize;
            let mut trees = Vec::with_capacity(tree_count.min(1024));
            for _ in 0..tree_count {
                let id = TreeId(cur.read_u32::<LittleEndian>()?);
                let name_len = cur.read_u16::<LittleEndian>()? as usize;
                let name = String::from_utf8(read_bytes(cur, name_len)?)
                    .map_err(|e| invalid(e.to_string()))?;
                let leaf_count = cur.read_u32::<LittleEndian>()? as usize;
                let mut leaves = Vec::with_capacity(leaf_count.min(4096));
                for _ in 0..leaf_count {
                    let low_len = cur.read_u16::<LittleEndian>()? as usize;
                    let low = read_bytes(cur, low_len)?;
                    let page = cur.read_u64::<LittleEndian>()?;
                    leaves.push(Leaf { low, page });
                }
                trees.push(TreeDef { id, name, leaves });
            }
            PageBody::Directory(DirectoryPage {
                next_page,
                next_tree,
                garbage,
                trees,
            })
        }
        KIND_DATA => {
            let tree = TreeId(cur.read_u32::<LittleEndian>()?);
            let count = cur.read_u32::<LittleEndian>()? as usize;
            let mut entries = BTreeMap::new();
            for _ in 0..count {
                let key_len = cur.read_u16::<LittleEndian>()? as usize;
                let key = read_bytes(cur, key_len)?;
                let value = decode_value(cur)?;
                entries.insert(key, value);
            }
            PageBody::Data(DataPage { tree, entries })
        }
        KIND_LONG_RECORD => {
            let next = cur.read_u64::<LittleEndian>()?;
            let len = cur.read_u32::<LittleEndian>()? as usize;
            PageBody::LongRecord(LongRecordPage {
                next,
                bytes: read_bytes(cur, len)?,
            })
        }
        KIND_GARBAGE => PageBody::Garbage,
        other => return Err(invalid(format!("unknown page kind {}", other))),
    };
    Ok(Page {
        id,
        timestamp,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::VolumeId;

    fn sample_data_page() -> Page {
        let mut page = Page::new_data(4, TreeId::new(VolumeId(0), 1));
        let data = page.data_mut().unwrap();
        data.entries.insert(
            b"alpha".to_vec(),
            StoredValue::Value(VersionBody::Inline(b"one".to_vec())),
        );
        let mut mvv = StoredValue::Value(VersionBody::Inline(b"two".to_vec()));
        mvv.put_version(12, VersionBody::AntiValue);
        mvv.put_version(15, VersionBody::LongRecord { head: 8, size: 40_000 });
        data.entries.insert(b"beta".to_vec(), mvv);
        page.timestamp = 99;
        page
    }

    #[test]
    fn test_data_page_roundtrip() {
        let page = sample_data_page();
        let bytes = page.encode();
        assert_eq!(bytes.len(), page.encoded_len());
        assert_eq!(Page::decode(&bytes).unwrap(), page);
    }

    #[test]
    fn test_directory_page_roundtrip() {
        let page = Page::new(
            0,
            3,
            PageBody::Directory(DirectoryPage {
                next_page: 17,
                next_tree: 2,
                garbage: vec![5, 9],
                trees: vec![TreeDef {
                    id: TreeId::new(VolumeId(1), 1),
                    name: "orders".into(),
                    leaves: vec![
                        Leaf {
                            low: vec![],
                            page: 1,
                        },
                        Leaf {
                            low: b"m".to_vec(),
                            page: 6,
                        },
                    ],
                }],
            }),
        );
        let bytes = page.encode();
        assert_eq!(bytes.len(), page.encoded_len());
        assert_eq!(Page::decode(&bytes).unwrap(), page);
    }

    #[test]
    fn test_metrics() {
        let page = sample_data_page();
        let m = page.metrics(4096);
        assert_eq!(m.key_count, 2);
        assert_eq!(m.mvv_count, 1);
        assert_eq!(m.available_size, 4096 - page.encoded_len());
    }

    #[test]
    fn test_truncated_image_is_corruption() {
        let bytes = sample_data_page().encode();
        let err = Page::decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_leaf_index() {
        let tree = TreeDef {
            id: TreeId(1),
            name: "t".into(),
            leaves: vec![
                Leaf {
                    low: vec![],
                    page: 1,
                },
                Leaf {
                    low: b"g".to_vec(),
                    page: 2,
                },
                Leaf {
                    low: b"p".to_vec(),
                    page: 3,
                },
            ],
        };
        assert_eq!(tree.leaf_index(b""), 0);
        assert_eq!(tree.leaf_index(b"a"), 0);
        assert_eq!(tree.leaf_index(b"g"), 1);
        assert_eq!(tree.leaf_index(b"o"), 1);
        assert_eq!(tree.leaf_index(b"zz"), 2);
    }
}
