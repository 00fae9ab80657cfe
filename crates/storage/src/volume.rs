//! Volume files: fixed-size page slots on disk.
//!
//! Volumes are named `<name>.vol` inside the data directory.
//!
//! # Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Volume Header (64 bytes)           │
//! ├────────────────────────────────────┤
//! │ Slot 0: directory page             │
//! ├────────────────────────────────────┤
//! │ Slot 1 ...                         │
//! └────────────────────────────────────┘
//!
//! Slot (page_size + 8 bytes):
//! ┌─────────────────┬──────────┬─────────────────────────────┐
//! │ Length (4 bytes)│ CRC32 (4)│ Page image (length bytes)   │
//! └─────────────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! A slot with length 0 has never been written. Volumes are only written by
//! the journal copier and at creation; every other page change lives in the
//! journal until it is copied back.

use crate::page::{DirectoryPage, Page, PageBody};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{Error, PageId, Result, VolumeId};

/// Magic bytes identifying a volume file: "TSVL"
pub const VOLUME_MAGIC: [u8; 4] = *b"TSVL";

/// Current volume format version
pub const VOLUME_FORMAT_VERSION: u32 = 1;

/// Size of the volume header in bytes
pub const VOLUME_HEADER_SIZE: u64 = 64;

const SLOT_OVERHEAD: u64 = 8;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 65536;

/// An open volume file.
pub struct Volume {
    id: VolumeId,
    name: String,
    path: PathBuf,
    page_size: usize,
    file: Mutex<File>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl Volume {
    /// Path of the volume file named `name` in `dir`.
    pub fn volume_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.vol", name))
    }

    /// Create a new volume with an empty directory page.
    pub fn create(dir: &Path, id: VolumeId, name: &str, page_size: usize) -> Result<Self> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(Error::Config(format!(
                "page size {} outside {}..={}",
                page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        let path = Self::volume_path(dir, name);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut header = [0u8; VOLUME_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&VOLUME_MAGIC);
        LittleEndian::write_u32(&mut header[4..8], VOLUME_FORMAT_VERSION);
        LittleEndian::write_u32(&mut header[8..12], page_size as u32);
        LittleEndian::write_u32(&mut header[12..16], id.0);
        file.write_all(&header)?;

        let volume = Volume {
            id,
            name: name.to_string(),
            path,
            page_size,
            file: Mutex::new(file),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        };
        let directory = Page::new(
            0,
            0,
            PageBody::Directory(DirectoryPage {
                next_page: 1,
                ..Default::default()
            }),
        );
        volume.write_page(&directory)?;
        volume.sync()?;
        Ok(volume)
    }

    /// Open an existing volume and validate its header.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = Self::volume_path(dir, name);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut header = [0u8; VOLUME_HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if header[0..4] != VOLUME_MAGIC {
            return Err(Error::Corruption(format!(
                "{} is not a volume file",
                path.display()
            )));
        }
        let version = LittleEndian::read_u32(&header[4..8]);
        if version != VOLUME_FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported volume format version {}",
                version
            )));
        }
        let page_size = LittleEndian::read_u32(&header[8..12]) as usize;
        let id = VolumeId(LittleEndian::read_u32(&header[12..16]));
        Ok(Volume {
            id,
            name: name.to_string(),
            path,
            page_size,
            file: Mutex::new(file),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Open the volume if it exists, otherwise create it.
    pub fn open_or_create(dir: &Path, id: VolumeId, name: &str, page_size: usize) -> Result<Self> {
        if Self::volume_path(dir, name).exists() {
            let volume = Self::open(dir, name)?;
            if volume.id != id {
                return Err(Error::Config(format!(
                    "volume '{}' has id {} but is configured as {}",
                    name, volume.id, id
                )));
            }
            Ok(volume)
        } else {
            Self::create(dir, id, name, page_size)
        }
    }

    fn slot_offset(&self, page: PageId) -> u64 {
        VOLUME_HEADER_SIZE + page * (self.page_size as u64 + SLOT_OVERHEAD)
    }

    /// Read a page. `None` if the slot was never written.
    pub fn read_page(&self, page: PageId) -> Result<Option<Page>> {
        let offset = self.slot_offset(page);
        let mut file = self.file.lock();
        let len = file.seek(SeekFrom::End(0))?;
        if offset + SLOT_OVERHEAD > len {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut frame = [0u8; SLOT_OVERHEAD as usize];
        file.read_exact(&mut frame)?;
        let image_len = LittleEndian::read_u32(&frame[0..4]) as usize;
        if image_len == 0 {
            return Ok(None);
        }
        if image_len > self.page_size {
            return Err(Error::Corruption(format!(
                "{} page {}: slot length {} exceeds page size",
                self.name, page, image_len
            )));
        }
        let stored_crc = LittleEndian::read_u32(&frame[4..8]);
        let mut image = vec![0u8; image_len];
        file.read_exact(&mut image)?;
        drop(file);

        if crc32fast::hash(&image) != stored_crc {
            return Err(Error::Corruption(format!(
                "{} page {}: checksum mismatch",
                self.name, page
            )));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        let decoded = Page::decode(&image)?;
        if decoded.id != page {
            return Err(Error::Corruption(format!(
                "{} slot {} holds page {}",
                self.name, page, decoded.id
            )));
        }
        Ok(Some(decoded))
    }

    /// Write a page into its slot. Not synced.
    pub fn write_page(&self, page: &Page) -> Result<()> {
        let image = page.encode();
        self.write_image(page.id, &image)
    }

    /// Write an already-encoded page image into slot `page`. Not synced.
    pub fn write_image(&self, page: PageId, image: &[u8]) -> Result<()> {
        if image.len() > self.page_size {
            return Err(Error::InvalidOperation(format!(
                "{} page {}: image of {} bytes exceeds page size {}",
                self.name,
                page,
                image.len(),
                self.page_size
            )));
        }
        let mut frame = Vec::with_capacity(image.len() + SLOT_OVERHEAD as usize);
        let mut prefix = [0u8; SLOT_OVERHEAD as usize];
        LittleEndian::write_u32(&mut prefix[0..4], image.len() as u32);
        LittleEndian::write_u32(&mut prefix[4..8], crc32fast::hash(image));
        frame.extend_from_slice(&prefix);
        frame.extend_from_slice(image);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.slot_offset(page)))?;
        file.write_all(&frame)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush volume writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Volume id.
    pub fn id(&self) -> VolumeId {
        self.id
    }

    /// Volume name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages read from the file since open.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Pages written to the file since open.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// The open volumes of a database.
#[derive(Debug, Default)]
pub struct VolumeSet {
    volumes: RwLock<BTreeMap<VolumeId, Arc<Volume>>>,
}

impl VolumeSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an open volume.
    pub fn insert(&self, volume: Volume) -> Arc<Volume> {
        let volume = Arc::new(volume);
        self.volumes.write().insert(volume.id(), Arc::clone(&volume));
        volume
    }

    /// Look up by id.
    pub fn get(&self, id: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.read().get(&id).cloned()
    }

    /// Look up by id, failing with `MissingVolume`.
    pub fn require(&self, id: VolumeId) -> Result<Arc<Volume>> {
        self.get(id)
            .ok_or_else(|| Error::MissingVolume(id.to_string()))
    }

    /// Look up by name.
    pub fn by_name(&self, name: &str) -> Option<Arc<Volume>> {
        self.volumes
            .read()
            .values()
            .find(|v| v.name() == name)
            .cloned()
    }

    /// All volumes in id order.
    pub fn all(&self) -> Vec<Arc<Volume>> {
        self.volumes.read().values().cloned().collect()
    }

    /// Sync every volume.
    pub fn sync_all(&self) -> Result<()> {
        for volume in self.all() {
            volume.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::LongRecordPage;
    use tempfile::TempDir;

    #[test]
    fn test_create_writes_directory() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::create(dir.path(), VolumeId(0), "main", 4096).unwrap();
        let page = vol.read_page(0).unwrap().unwrap();
        assert_eq!(page.directory().unwrap().next_page, 1);
        assert!(vol.read_page(1).unwrap().is_none());
    }

    #[test]
    fn test_write_read_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let vol = Volume::create(dir.path(), VolumeId(3), "data", 2048).unwrap();
            let page = Page::new(
                5,
                42,
                PageBody::LongRecord(LongRecordPage {
                    next: 0,
                    bytes: vec![7; 100],
                }),
            );
            vol.write_page(&page).unwrap();
            vol.sync().unwrap();
        }
        let vol = Volume::open(dir.path(), "data").unwrap();
        assert_eq!(vol.id(), VolumeId(3));
        assert_eq!(vol.page_size(), 2048);
        let page = vol.read_page(5).unwrap().unwrap();
        assert_eq!(page.timestamp, 42);
        // Gap slots read as never written
        assert!(vol.read_page(3).unwrap().is_none());
    }

    #[test]
    fn test_oversized_image_rejected() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::create(dir.path(), VolumeId(0), "small", 1024).unwrap();
        let page = Page::new(
            1,
            0,
            PageBody::LongRecord(LongRecordPage {
                next: 0,
                bytes: vec![0; 2000],
            }),
        );
        assert!(matches!(
            vol.write_page(&page),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_corrupt_slot_detected() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::create(dir.path(), VolumeId(0), "main", 1024).unwrap();
        let path = vol.path().to_path_buf();
        drop(vol);

        let mut bytes = std::fs::read(&path).unwrap();
        let idx = VOLUME_HEADER_SIZE as usize + 12;
        bytes[idx] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let vol = Volume::open(dir.path(), "main").unwrap();
        assert!(matches!(vol.read_page(0), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_open_or_create_checks_id() {
        let dir = TempDir::new().unwrap();
        Volume::create(dir.path(), VolumeId(1), "v", 1024).unwrap();
        assert!(Volume::open_or_create(dir.path(), VolumeId(1), "v", 1024).is_ok());
        assert!(matches!(
            Volume::open_or_create(dir.path(), VolumeId(2), "v", 1024),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_volume_set_lookup() {
        let dir = TempDir::new().unwrap();
        let set = VolumeSet::new();
        set.insert(Volume::create(dir.path(), VolumeId(0), "a", 1024).unwrap());
        set.insert(Volume::create(dir.path(), VolumeId(1), "b", 1024).unwrap());
        assert_eq!(set.by_name("b").unwrap().id(), VolumeId(1));
        assert!(matches!(
            set.require(VolumeId(9)),
            Err(Error::MissingVolume(_))
        ));
        assert_eq!(set.all().len(), 2);
    }
}
