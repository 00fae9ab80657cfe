//! Buffer pool: shared in-memory pages guarded by claims.
//!
//! Each [`Buffer`] pairs a page image with the [`SharedResource`] that
//! callers claim before touching it. The `RwLock` inside only protects the
//! memory for the duration of a single read or mutation; the claim is the
//! logical lock that spans a whole operation.
//!
//! Pages missing from the pool are read through a [`PageSource`]. The engine
//! installs a source that prefers the journal's newest image of a page and
//! falls back to the volume.
//!
//! Only clean, unclaimed buffers are evicted. A buffer becomes clean when
//! its image is written to the journal.

use crate::page::{Page, PageMetrics};
use crate::volume::VolumeSet;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_concurrency::{OwnerId, SharedResource};
use tessera_core::{Error, PageAddress, Result};

/// Where pages come from when they are not in the pool.
pub trait PageSource: Send + Sync {
    /// Newest durable image of `address`, or `None` if it was never written.
    fn read_page(&self, address: PageAddress) -> Result<Option<Page>>;
}

impl PageSource for VolumeSet {
    fn read_page(&self, address: PageAddress) -> Result<Option<Page>> {
        self.require(address.volume)?.read_page(address.page)
    }
}

/// Buffer pool configuration.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Page size in bytes (default: 16KB)
    pub page_size: usize,
    /// Number of buffers kept before clean pages are evicted (default: 4096)
    pub capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            page_size: 16 * 1024,
            capacity: 4096,
        }
    }
}

impl BufferPoolConfig {
    /// Set page size (builder pattern).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set capacity (builder pattern).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if !(crate::volume::MIN_PAGE_SIZE..=crate::volume::MAX_PAGE_SIZE).contains(&self.page_size)
            || !self.page_size.is_power_of_two()
        {
            return Err(Error::Config(format!(
                "page size {} must be a power of two between {} and {}",
                self.page_size,
                crate::volume::MIN_PAGE_SIZE,
                crate::volume::MAX_PAGE_SIZE
            )));
        }
        if self.capacity < 16 {
            return Err(Error::Config("buffer pool needs at least 16 buffers".into()));
        }
        Ok(())
    }

    /// Small pool for tests.
    pub fn for_testing() -> Self {
        BufferPoolConfig {
            page_size: 4096,
            capacity: 256,
        }
    }
}

/// One pooled page.
#[derive(Debug)]
pub struct Buffer {
    address: PageAddress,
    resource: SharedResource,
    page: RwLock<Page>,
    dirty: AtomicBool,
}

impl Buffer {
    fn new(address: PageAddress, page: Page, dirty: bool) -> Self {
        Buffer {
            address,
            resource: SharedResource::new(),
            page: RwLock::new(page),
            dirty: AtomicBool::new(dirty),
        }
    }

    /// Page address.
    pub fn address(&self) -> PageAddress {
        self.address
    }

    /// The claim word.
    pub fn resource(&self) -> &SharedResource {
        &self.resource
    }

    /// Claim the buffer for `owner`; `false` on timeout.
    pub fn claim(&self, owner: OwnerId, writer: bool, timeout: Duration) -> bool {
        self.resource.claim(owner, writer, timeout)
    }

    /// Release one claim.
    pub fn release(&self) {
        self.resource.release()
    }

    /// Claim and return a guard that releases on drop.
    pub fn claim_guard(
        &self,
        owner: OwnerId,
        writer: bool,
        timeout: Duration,
    ) -> Result<ClaimGuard<'_>> {
        if self.claim(owner, writer, timeout) {
            Ok(ClaimGuard { buffer: self })
        } else {
            Err(Error::Timeout(format!(
                "{} claim on page {}",
                if writer { "writer" } else { "reader" },
                self.address
            )))
        }
    }

    /// Read access to the page image.
    pub fn page(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    /// Write access to the page image. Marks the buffer dirty.
    ///
    /// The caller must hold the writer claim.
    pub fn page_mut(&self) -> RwLockWriteGuard<'_, Page> {
        let guard = self.page.write();
        self.dirty.store(true, Ordering::Release);
        guard
    }

    /// Mutate the page, marking it dirty only when `f` reports a change.
    ///
    /// The caller must hold the writer claim.
    pub fn update<R>(&self, f: impl FnOnce(&mut Page) -> (R, bool)) -> R {
        let mut guard = self.page.write();
        let (result, changed) = f(&mut guard);
        if changed {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    /// Copy of the current image.
    pub fn snapshot(&self) -> Page {
        self.page.read().clone()
    }

    /// Whether the buffer has changes not yet written to the journal.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// If dirty, encode the image and mark the buffer clean in one step.
    ///
    /// The image and the clean mark are taken under the page read lock, so a
    /// concurrent mutation either lands in the image or re-dirties the buffer.
    pub fn take_dirty_image(&self) -> Option<(Page, Vec<u8>)> {
        let guard = self.page.read();
        if self.dirty.swap(false, Ordering::AcqRel) {
            Some((guard.clone(), guard.encode()))
        } else {
            None
        }
    }

    /// Mark the buffer dirty again (for example after a failed journal write).
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Key, MVV and space statistics.
    pub fn metrics(&self, page_size: usize) -> PageMetrics {
        self.page.read().metrics(page_size)
    }
}

/// Releases a buffer claim on drop.
pub struct ClaimGuard<'a> {
    buffer: &'a Buffer,
}

impl<'a> Drop for ClaimGuard<'a> {
    fn drop(&mut self) {
        self.buffer.release();
    }
}

/// Buffer pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers resident
    pub resident: usize,
    /// Dirty buffers
    pub dirty: usize,
    /// Lookups satisfied from the pool
    pub hits: u64,
    /// Lookups that read through the source
    pub misses: u64,
    /// Buffers evicted
    pub evictions: u64,
}

/// The set of resident buffers.
pub struct BufferPool {
    config: BufferPoolConfig,
    buffers: DashMap<PageAddress, Arc<Buffer>>,
    source: RwLock<Arc<dyn PageSource>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BufferPool {
    /// Create a pool reading missing pages from `source`.
    pub fn new(config: BufferPoolConfig, source: Arc<dyn PageSource>) -> Self {
        BufferPool {
            config,
            buffers: DashMap::new(),
            source: RwLock::new(source),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Replace the page source.
    pub fn set_source(&self, source: Arc<dyn PageSource>) {
        *self.source.write() = source;
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Fetch a page, reading it through the source if necessary.
    pub fn get(&self, address: PageAddress) -> Result<Arc<Buffer>> {
        if let Some(buffer) = self.buffers.get(&address) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(buffer.value()));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let source = Arc::clone(&self.source.read());
        let page = source.read_page(address)?.ok_or_else(|| {
            Error::Corruption(format!("page {} was never written", address))
        })?;
        if self.buffers.len() >= self.config.capacity {
            self.evict();
        }
        let buffer = self
            .buffers
            .entry(address)
            .or_insert_with(|| Arc::new(Buffer::new(address, page, false)));
        Ok(Arc::clone(buffer.value()))
    }

    /// The resident buffer for `address`, without reading.
    pub fn get_if_resident(&self, address: PageAddress) -> Option<Arc<Buffer>> {
        self.buffers.get(&address).map(|b| Arc::clone(b.value()))
    }

    /// Install `page` as the current image of `address`, replacing any
    /// resident copy. The buffer starts dirty.
    pub fn install(&self, address: PageAddress, page: Page) -> Arc<Buffer> {
        let buffer = Arc::new(Buffer::new(address, page, true));
        self.buffers.insert(address, Arc::clone(&buffer));
        buffer
    }

    /// Install `page` as a clean image (its newest copy is already durable).
    pub fn install_clean(&self, address: PageAddress, page: Page) -> Arc<Buffer> {
        let buffer = Arc::new(Buffer::new(address, page, false));
        self.buffers.insert(address, Arc::clone(&buffer));
        buffer
    }

    /// All dirty buffers, in address order.
    pub fn dirty_buffers(&self) -> Vec<Arc<Buffer>> {
        let mut dirty: Vec<Arc<Buffer>> = self
            .buffers
            .iter()
            .filter(|b| b.value().is_dirty())
            .map(|b| Arc::clone(b.value()))
            .collect();
        dirty.sort_by_key(|b| b.address());
        dirty
    }

    /// Addresses of every resident buffer in `volume`.
    pub fn resident_addresses(&self) -> Vec<PageAddress> {
        let mut all: Vec<PageAddress> = self.buffers.iter().map(|b| *b.key()).collect();
        all.sort();
        all
    }

    /// Drop clean, unclaimed buffers nobody else references until the pool
    /// is below capacity. Returns the number evicted.
    pub fn evict(&self) -> usize {
        let target = self.config.capacity.saturating_sub(self.config.capacity / 8).max(1);
        let mut evicted = 0;
        let candidates: Vec<PageAddress> = self
            .buffers
            .iter()
            .filter(|b| {
                let buffer = b.value();
                !buffer.is_dirty() && buffer.resource().is_available()
            })
            .map(|b| *b.key())
            .collect();
        for address in candidates {
            if self.buffers.len() <= target {
                break;
            }
            let removed = self.buffers.remove_if(&address, |_, b| {
                Arc::strong_count(b) == 1 && !b.is_dirty() && b.resource().is_available()
            });
            if removed.is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Forget every buffer. Used when a crash is simulated.
    pub fn invalidate_all(&self) {
        self.buffers.clear();
    }

    /// Pool counters.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            resident: self.buffers.len(),
            dirty: self.buffers.iter().filter(|b| b.value().is_dirty()).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{LongRecordPage, PageBody};
    use crate::volume::Volume;
    use tempfile::TempDir;
    use tessera_core::VolumeId;

    const OWNER: OwnerId = OwnerId(1);
    const SHORT: Duration = Duration::from_millis(20);

    fn setup() -> (TempDir, Arc<VolumeSet>, BufferPool) {
        let dir = TempDir::new().unwrap();
        let volumes = Arc::new(VolumeSet::new());
        volumes.insert(Volume::create(dir.path(), VolumeId(0), "main", 4096).unwrap());
        let pool = BufferPool::new(
            BufferPoolConfig::for_testing().with_capacity(16),
            Arc::clone(&volumes) as Arc<dyn PageSource>,
        );
        (dir, volumes, pool)
    }

    fn long_page(id: u64) -> Page {
        Page::new(
            id,
            0,
            PageBody::LongRecord(LongRecordPage {
                next: 0,
                bytes: vec![1, 2, 3],
            }),
        )
    }

    #[test]
    fn test_get_reads_through_source() {
        let (_dir, _volumes, pool) = setup();
        let dir_page = pool.get(PageAddress::new(VolumeId(0), 0)).unwrap();
        assert!(dir_page.page().directory().is_some());
        assert!(!dir_page.is_dirty());
        let again = pool.get(PageAddress::new(VolumeId(0), 0)).unwrap();
        assert!(Arc::ptr_eq(&dir_page, &again));
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn test_missing_page_is_error() {
        let (_dir, _volumes, pool) = setup();
        assert!(pool.get(PageAddress::new(VolumeId(0), 77)).is_err());
        assert!(matches!(
            pool.get(PageAddress::new(VolumeId(5), 0)),
            Err(Error::MissingVolume(_))
        ));
    }

    #[test]
    fn test_dirty_image_taken_once() {
        let (_dir, _volumes, pool) = setup();
        let addr = PageAddress::new(VolumeId(0), 3);
        let buffer = pool.install(addr, long_page(3));
        assert!(buffer.is_dirty());
        let (page, image) = buffer.take_dirty_image().unwrap();
        assert_eq!(Page::decode(&image).unwrap(), page);
        assert!(buffer.take_dirty_image().is_none());
        buffer.page_mut().timestamp = 9;
        assert!(buffer.is_dirty());
    }

    #[test]
    fn test_claim_guard_releases() {
        let (_dir, _volumes, pool) = setup();
        let buffer = pool.install(PageAddress::new(VolumeId(0), 1), long_page(1));
        {
            let _g = buffer.claim_guard(OWNER, true, SHORT).unwrap();
            assert!(matches!(
                buffer.claim_guard(OwnerId(2), false, SHORT),
                Err(Error::Timeout(_))
            ));
        }
        assert!(buffer.resource().is_available());
    }

    #[test]
    fn test_evicts_only_clean_unclaimed() {
        let (_dir, _volumes, pool) = setup();
        for id in 1..=20u64 {
            let b = pool.install_clean(PageAddress::new(VolumeId(0), id), long_page(id));
            if id <= 4 {
                b.mark_dirty();
            }
        }
        let held = pool.get(PageAddress::new(VolumeId(0), 10)).unwrap();
        assert!(held.claim(OWNER, false, SHORT));

        let evicted = pool.evict();
        assert!(evicted > 0);
        for id in 1..=4u64 {
            assert!(pool.get_if_resident(PageAddress::new(VolumeId(0), id)).is_some());
        }
        assert!(pool.get_if_resident(PageAddress::new(VolumeId(0), 10)).is_some());
        held.release();
    }
}
