//! Trees: key lookup, version installation, splits and long records.
//!
//! A tree is a list of leaves recorded in its volume's directory page. Each
//! leaf is a data page holding a contiguous key range. Lookups take a reader
//! claim on the directory and then a claim on the leaf; structural changes
//! (splits, tree creation, page allocation) take the directory writer
//! claim first. Claims are always acquired directory-then-leaf.
//!
//! # Page reuse
//!
//! Freed pages enter the directory's garbage list at once but may not be
//! reallocated until a checkpoint that started after the free has
//! completed. Until then the newest durable images may still reference
//! them.

use crate::buffer::{Buffer, BufferPool, ClaimGuard};
use crate::cleanup::{CleanupAction, CleanupHandler, CleanupManager};
use crate::page::{
    stored_entry_len, DirectoryPage, Leaf, LongRecordPage, Page, PageBody, PageMetrics, TreeDef,
    LONG_RECORD_OVERHEAD, PAGE_HEADER_SIZE,
};
use crate::prune::{prune_data_page, PruneOutcome};
use crate::value::{StoredValue, VersionBody};
use crate::volume::VolumeSet;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tessera_concurrency::{OwnerId, ReentrantHolder, TransactionIndex, DEFAULT_CLAIM_TIMEOUT};
use tessera_core::{
    Error, PageAddress, PageId, Result, Timestamp, TreeId, VolumeId, PRIMORDIAL,
};
use tracing::{debug, trace};

const MAX_STORE_ATTEMPTS: usize = 64;

/// Claims taken on behalf of a transaction are owned by its start
/// timestamp. Maintenance work (tree creation, pruning, page allocation)
/// gets a fresh owner per call with this bit set, so the two never meet.
const MAINTENANCE_OWNER: u64 = 1 << 63;

/// Claim owner of the transaction that started at `start`.
pub fn transaction_owner(start: Timestamp) -> OwnerId {
    OwnerId(start & !MAINTENANCE_OWNER)
}

/// Tree configuration.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Values longer than this are stored in long-record chains
    /// (default: 2048)
    pub long_record_threshold: usize,
    /// Longest accepted key (default: 2047)
    pub max_key_size: usize,
    /// How long page claims wait (default: 60s)
    pub claim_timeout: Duration,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            long_record_threshold: 2048,
            max_key_size: 2047,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }
}

impl TreeConfig {
    /// Set the long-record threshold (builder pattern).
    pub fn with_long_record_threshold(mut self, threshold: usize) -> Self {
        self.long_record_threshold = threshold;
        self
    }

    /// Set the claim timeout (builder pattern).
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    /// Validate against the page size.
    pub fn validate(&self, page_size: usize) -> Result<()> {
        if self.long_record_threshold == 0 || self.long_record_threshold > page_size / 4 {
            return Err(Error::Config(format!(
                "long record threshold {} must be between 1 and {}",
                self.long_record_threshold,
                page_size / 4
            )));
        }
        if self.max_key_size == 0 || self.max_key_size > page_size / 4 {
            return Err(Error::Config(format!(
                "max key size {} must be between 1 and {}",
                self.max_key_size,
                page_size / 4
            )));
        }
        Ok(())
    }

    /// Settings matching `BufferPoolConfig::for_testing`.
    pub fn for_testing() -> Self {
        TreeConfig {
            long_record_threshold: 512,
            max_key_size: 255,
            claim_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of installing one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    /// Leaf that received the version
    pub page: PageAddress,
    /// Body the same writer had stored before, now replaced
    pub replaced: Option<VersionBody>,
}

/// Tree layer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Leaf splits
    pub splits: u64,
    /// Pages pruned
    pub prunes: u64,
    /// Edge AntiValues removed
    pub anti_values_removed: u64,
    /// Pages allocated
    pub pages_allocated: u64,
    /// Pages returned to the garbage list
    pub pages_freed: u64,
}

enum StoreAttempt {
    Done(StoreOutcome),
    NeedsSplit(PageAddress),
}

/// Every tree of every open volume.
pub struct TreeStore {
    pool: Arc<BufferPool>,
    volumes: Arc<VolumeSet>,
    index: Arc<TransactionIndex>,
    cleanup: Arc<CleanupManager>,
    config: TreeConfig,
    epoch: AtomicU64,
    pending_free: Mutex<FxHashMap<PageAddress, u64>>,
    splits: AtomicU64,
    prunes: AtomicU64,
    anti_values_removed: AtomicU64,
    pages_allocated: AtomicU64,
    pages_freed: AtomicU64,
    next_owner: AtomicU64,
}

fn directory_of(page: &Page) -> Result<&DirectoryPage> {
    page.directory()
        .ok_or_else(|| Error::Corruption(format!("page {} is not a directory", page.id)))
}

fn tree_def(directory: &DirectoryPage, tree: TreeId) -> Result<&TreeDef> {
    directory
        .trees
        .iter()
        .find(|t| t.id == tree)
        .ok_or_else(|| Error::InvalidOperation(format!("no tree {}", tree)))
}

fn leaf_address(directory: &DirectoryPage, tree: TreeId, key: &[u8]) -> Result<PageAddress> {
    let def = tree_def(directory, tree)?;
    let leaf = def
        .leaves
        .get(def.leaf_index(key))
        .ok_or_else(|| Error::Corruption(format!("tree {} has no leaves", tree)))?;
    Ok(PageAddress::new(tree.volume(), leaf.page))
}

impl TreeStore {
    /// Create the tree layer and register it as the cleanup handler.
    pub fn new(
        pool: Arc<BufferPool>,
        volumes: Arc<VolumeSet>,
        index: Arc<TransactionIndex>,
        cleanup: Arc<CleanupManager>,
        config: TreeConfig,
    ) -> Arc<Self> {
        let store = Arc::new(TreeStore {
            pool,
            volumes,
            index,
            cleanup: Arc::clone(&cleanup),
            config,
            epoch: AtomicU64::new(0),
            pending_free: Mutex::new(FxHashMap::default()),
            splits: AtomicU64::new(0),
            prunes: AtomicU64::new(0),
            anti_values_removed: AtomicU64::new(0),
            pages_allocated: AtomicU64::new(0),
            pages_freed: AtomicU64::new(0),
            next_owner: AtomicU64::new(1),
        });
        let weak = Arc::downgrade(&store);
        let handler: Weak<dyn CleanupHandler> = weak;
        cleanup.set_handler(handler);
        store
    }

    /// The buffer pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// The transaction index.
    pub fn index(&self) -> &Arc<TransactionIndex> {
        &self.index
    }

    /// The cleanup manager.
    pub fn cleanup(&self) -> &Arc<CleanupManager> {
        &self.cleanup
    }

    /// Tree settings.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    fn now(&self) -> Timestamp {
        self.index.timestamps().current()
    }

    fn maintenance_owner(&self) -> OwnerId {
        OwnerId(MAINTENANCE_OWNER | self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    fn claim<'a>(&self, buffer: &'a Buffer, owner: OwnerId, writer: bool) -> Result<ClaimGuard<'a>> {
        buffer.claim_guard(owner, writer, self.config.claim_timeout)
    }

    fn directory(&self, volume: VolumeId) -> Result<Arc<Buffer>> {
        self.pool.get(PageAddress::new(volume, 0))
    }

    /// Apply `f` to the directory page of `dir`. The caller holds the
    /// writer claim. Changes that would overflow the page are undone.
    fn update_directory<R>(
        &self,
        dir: &Buffer,
        f: impl FnOnce(&mut DirectoryPage) -> Result<(R, bool)>,
    ) -> Result<R> {
        let ts = self.now();
        let page_size = self.pool.page_size();
        dir.update(|page| {
            let (before, result) = match page.directory_mut() {
                Some(d) => {
                    let before = d.clone();
                    (before, f(d))
                }
                None => {
                    return (
                        Err(Error::Corruption(format!(
                            "page {} is not a directory",
                            dir.address()
                        ))),
                        false,
                    )
                }
            };
            match result {
                Ok((value, true)) if page.encoded_len() > page_size => {
                    page.body = PageBody::Directory(before);
                    drop(value);
                    (
                        Err(Error::InvalidOperation(format!(
                            "directory page of {} is full",
                            dir.address().volume
                        ))),
                        false,
                    )
                }
                Ok((value, changed)) => {
                    if changed {
                        page.timestamp = ts;
                    }
                    (Ok(value), changed)
                }
                Err(e) => {
                    page.body = PageBody::Directory(before);
                    (Err(e), false)
                }
            }
        })
    }

    fn allocate(&self, volume: VolumeId, directory: &mut DirectoryPage) -> PageId {
        self.pages_allocated.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending_free.lock();
        if let Some(pos) = directory
            .garbage
            .iter()
            .position(|p| !pending.contains_key(&PageAddress::new(volume, *p)))
        {
            return directory.garbage.remove(pos);
        }
        let id = directory.next_page;
        directory.next_page += 1;
        id
    }

    fn free_pages(&self, volume: VolumeId, directory: &mut DirectoryPage, pages: &[PageId]) -> bool {
        let epoch = self.epoch.load(Ordering::Acquire);
        let mut pending = self.pending_free.lock();
        let mut changed = false;
        for page in pages {
            if *page == 0 || directory.garbage.contains(page) {
                continue;
            }
            directory.garbage.push(*page);
            pending.insert(PageAddress::new(volume, *page), epoch);
            changed = true;
            self.pages_freed.fetch_add(1, Ordering::Relaxed);
        }
        changed
    }

    /// Start a checkpoint epoch. Pages freed from now on stay unusable until
    /// the next checkpoint completes. Returns the closing epoch.
    pub fn begin_checkpoint(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel)
    }

    /// Release pages freed before the checkpoint that returned `epoch`
    /// from [`begin_checkpoint`](Self::begin_checkpoint).
    pub fn checkpoint_completed(&self, epoch: u64) {
        self.pending_free.lock().retain(|_, freed| *freed > epoch);
    }

    /// Pages freed but not yet reusable.
    pub fn pending_free_count(&self) -> usize {
        self.pending_free.lock().len()
    }

    // =========================================================================
    // Tree definitions
    // =========================================================================

    /// Create the tree `name` in `volume`, or return the existing one.
    pub fn create_tree(&self, volume: VolumeId, name: &str) -> Result<TreeId> {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(Error::InvalidOperation(format!("invalid tree name {:?}", name)));
        }
        let dir = self.directory(volume)?;
        let _claim = self.claim(&dir, self.maintenance_owner(), true)?;
        let (id, leaf) = self.update_directory(&dir, |d| {
            if let Some(existing) = d.trees.iter().find(|t| t.name == name) {
                return Ok(((existing.id, None), false));
            }
            if d.next_tree == u16::MAX {
                return Err(Error::InvalidOperation(format!("{} holds too many trees", volume)));
            }
            let id = TreeId::new(volume, d.next_tree);
            d.next_tree += 1;
            let leaf = self.allocate(volume, d);
            d.trees.push(TreeDef {
                id,
                name: name.to_string(),
                leaves: vec![Leaf { low: vec![], page: leaf }],
            });
            Ok(((id, Some(leaf)), true))
        })?;
        if let Some(leaf) = leaf {
            let mut page = Page::new_data(leaf, id);
            page.timestamp = self.now();
            self.pool.install(PageAddress::new(volume, leaf), page);
            debug!(target: "tessera::db", tree = %id, name, "created tree");
        }
        Ok(id)
    }

    /// Make sure a tree with this exact id exists, creating it if needed.
    pub fn ensure_tree(&self, id: TreeId, name: &str) -> Result<()> {
        let volume = id.volume();
        let dir = self.directory(volume)?;
        let _claim = self.claim(&dir, self.maintenance_owner(), true)?;
        let leaf = self.update_directory(&dir, |d| {
            if d.trees.iter().any(|t| t.id == id) {
                return Ok((None, false));
            }
            d.next_tree = d.next_tree.max(id.ordinal().saturating_add(1));
            let leaf = self.allocate(volume, d);
            d.trees.push(TreeDef {
                id,
                name: name.to_string(),
                leaves: vec![Leaf { low: vec![], page: leaf }],
            });
            Ok((Some(leaf), true))
        })?;
        if let Some(leaf) = leaf {
            self.pool
                .install(PageAddress::new(volume, leaf), Page::new_data(leaf, id));
        }
        Ok(())
    }

    /// Look up a tree by name.
    pub fn tree_id(&self, volume: VolumeId, name: &str) -> Result<Option<TreeId>> {
        let dir = self.directory(volume)?;
        let _claim = self.claim(&dir, self.maintenance_owner(), false)?;
        let page = dir.page();
        Ok(directory_of(&page)?
            .trees
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.id))
    }

    /// Trees of `volume` as (id, name) pairs.
    pub fn trees(&self, volume: VolumeId) -> Result<Vec<(TreeId, String)>> {
        let dir = self.directory(volume)?;
        let _claim = self.claim(&dir, self.maintenance_owner(), false)?;
        let page = dir.page();
        Ok(directory_of(&page)?
            .trees
            .iter()
            .map(|t| (t.id, t.name.clone()))
            .collect())
    }

    /// Every tree of every open volume.
    pub fn all_trees(&self) -> Result<Vec<TreeId>> {
        let mut all = Vec::new();
        for volume in self.volumes.all() {
            all.extend(self.trees(volume.id())?.into_iter().map(|(id, _)| id));
        }
        Ok(all)
    }

    /// Leaf pages of `tree` in key order.
    pub fn data_pages(&self, tree: TreeId) -> Result<Vec<PageAddress>> {
        let dir = self.directory(tree.volume())?;
        let _claim = self.claim(&dir, self.maintenance_owner(), false)?;
        let page = dir.page();
        Ok(tree_def(directory_of(&page)?, tree)?
            .leaves
            .iter()
            .map(|l| PageAddress::new(tree.volume(), l.page))
            .collect())
    }

    /// Statistics of one page.
    pub fn page_metrics(&self, address: PageAddress) -> Result<PageMetrics> {
        let buffer = self.pool.get(address)?;
        let _claim = self.claim(&buffer, self.maintenance_owner(), false)?;
        Ok(buffer.metrics(self.pool.page_size()))
    }

    // =========================================================================
    // Versions
    // =========================================================================

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidOperation("empty key".into()));
        }
        if key.len() > self.config.max_key_size {
            return Err(Error::InvalidOperation(format!(
                "key of {} bytes exceeds {}",
                key.len(),
                self.config.max_key_size
            )));
        }
        Ok(())
    }

    /// Install `body` as the version of `key` written by `handle`.
    ///
    /// With `check_conflict`, fails with `WriteConflict` when another
    /// transaction's version may not be overwritten. Replay passes `false`.
    pub fn store(
        &self,
        tree: TreeId,
        key: &[u8],
        handle: Timestamp,
        body: VersionBody,
        check_conflict: bool,
    ) -> Result<StoreOutcome> {
        self.check_key(key)?;
        let dir = self.directory(tree.volume())?;
        let owner = transaction_owner(handle);
        let mut holder = ReentrantHolder::new(dir.resource(), owner);
        for _ in 0..MAX_STORE_ATTEMPTS {
            if !holder.claim_with_timeout(false, self.config.claim_timeout) {
                return Err(Error::Timeout(format!("directory claim on {}", tree.volume())));
            }
            let attempt = self.store_in_leaf(&dir, owner, tree, key, handle, &body, check_conflict);
            let leaf = match attempt {
                Ok(StoreAttempt::Done(outcome)) => {
                    holder.release();
                    return Ok(outcome);
                }
                Ok(StoreAttempt::NeedsSplit(leaf)) => leaf,
                Err(e) => {
                    holder.release();
                    return Err(e);
                }
            };
            if !holder.upgrade() {
                holder.release();
                if !holder.claim_with_timeout(true, self.config.claim_timeout) {
                    return Err(Error::Timeout(format!("directory claim on {}", tree.volume())));
                }
            }
            let split = self.split_leaf(&dir, owner, tree, leaf, key);
            holder.release();
            holder.verify_released();
            split?;
        }
        Err(Error::InvalidOperation(format!(
            "could not make room for key in {}",
            tree
        )))
    }

    fn store_in_leaf(
        &self,
        dir: &Buffer,
        owner: OwnerId,
        tree: TreeId,
        key: &[u8],
        handle: Timestamp,
        body: &VersionBody,
        check_conflict: bool,
    ) -> Result<StoreAttempt> {
        let address = {
            let page = dir.page();
            leaf_address(directory_of(&page)?, tree, key)?
        };
        let leaf = self.pool.get(address)?;
        let _claim = self.claim(&leaf, owner, true)?;
        let ts = self.now();
        let page_size = self.pool.page_size();
        let index = &self.index;

        leaf.update(|page| {
            let used = page.encoded_len();
            let data = match page.data_mut() {
                Some(d) if d.tree == tree => d,
                _ => {
                    return (
                        Err(Error::Corruption(format!(
                            "page {} is not a leaf of {}",
                            address, tree
                        ))),
                        false,
                    )
                }
            };
            let existing = data.entries.get(key);
            if check_conflict {
                if let Some(other) = existing.and_then(|v| v.conflicting_handle(index, handle)) {
                    return (
                        Err(Error::WriteConflict(format!(
                            "key in {} holds a version of transaction {}",
                            tree, other
                        ))),
                        false,
                    );
                }
            }
            let old_len = existing.map(|v| stored_entry_len(key, v)).unwrap_or(0);
            let mut value = existing
                .cloned()
                .unwrap_or_else(|| StoredValue::Mvv(SmallVec::new()));
            let replaced = value.put_version(handle, body.clone());
            let new_len = stored_entry_len(key, &value);
            if used - old_len + new_len > page_size {
                if PAGE_HEADER_SIZE + 8 + new_len > page_size {
                    return (
                        Err(Error::InvalidOperation(format!(
                            "entry of {} bytes cannot fit in a page",
                            new_len
                        ))),
                        false,
                    );
                }
                return (Ok(StoreAttempt::NeedsSplit(address)), false);
            }
            data.entries.insert(key.to_vec(), value);
            if replaced.is_none() && handle != PRIMORDIAL {
                index.increment_mvv_count(handle);
            }
            page.timestamp = ts;
            (
                Ok(StoreAttempt::Done(StoreOutcome {
                    page: address,
                    replaced,
                })),
                true,
            )
        })
    }

    /// Split the leaf at `address`. The caller holds the directory writer
    /// claim.
    fn split_leaf(
        &self,
        dir: &Buffer,
        owner: OwnerId,
        tree: TreeId,
        address: PageAddress,
        key: &[u8],
    ) -> Result<()> {
        let leaf = self.pool.get(address)?;
        let _claim = self.claim(&leaf, owner, true)?;
        let page_size = self.pool.page_size();

        let split_key = {
            let page = leaf.page();
            if page.encoded_len() < page_size / 2 {
                // Someone else split it while we waited.
                return Ok(());
            }
            let data = page
                .data()
                .ok_or_else(|| Error::Corruption(format!("page {} is not a leaf", address)))?;
            let keys: Vec<&Vec<u8>> = data.entries.keys().collect();
            match keys.len() {
                0 => return Err(Error::InvalidOperation("entry cannot fit in a page".into())),
                1 if key > keys[0].as_slice() => key.to_vec(),
                1 if key < keys[0].as_slice() => keys[0].clone(),
                1 => return Err(Error::InvalidOperation("entry cannot fit in a page".into())),
                n => keys[n / 2].clone(),
            }
        };

        let volume = address.volume;
        let new_page = self.update_directory(dir, |d| {
            let position = {
                let def = d
                    .trees
                    .iter()
                    .find(|t| t.id == tree)
                    .ok_or_else(|| Error::InvalidOperation(format!("no tree {}", tree)))?;
                def.leaves.iter().position(|l| l.page == address.page)
            };
            let position = match position {
                Some(p) => p,
                None => return Ok((None, false)),
            };
            let new_page = self.allocate(volume, d);
            if let Some(def) = d.trees.iter_mut().find(|t| t.id == tree) {
                def.leaves.insert(
                    position + 1,
                    Leaf {
                        low: split_key.clone(),
                        page: new_page,
                    },
                );
            }
            Ok((Some(new_page), true))
        })?;
        let new_page = match new_page {
            Some(p) => p,
            None => return Ok(()),
        };

        let ts = self.now();
        let moved = leaf.update(|page| match page.data_mut() {
            Some(data) => {
                let moved = data.entries.split_off(&split_key);
                page.timestamp = ts;
                (moved, true)
            }
            None => (Default::default(), false),
        });
        let mut page = Page::new_data(new_page, tree);
        page.timestamp = ts;
        if let Some(data) = page.data_mut() {
            data.entries = moved;
        }
        self.pool.install(PageAddress::new(volume, new_page), page);
        self.splits.fetch_add(1, Ordering::Relaxed);
        trace!(target: "tessera::db", %tree, from = %address, to = new_page, "split leaf");
        Ok(())
    }

    /// Leaf page that holds, or would hold, `key`.
    pub fn page_of(&self, tree: TreeId, key: &[u8]) -> Result<PageAddress> {
        let dir = self.directory(tree.volume())?;
        let _dir_claim = self.claim(&dir, self.maintenance_owner(), false)?;
        let address = {
            let page = dir.page();
            leaf_address(directory_of(&page)?, tree, key)?
        };
        Ok(address)
    }

    /// Raw value slot of `key`.
    pub fn slot(&self, tree: TreeId, key: &[u8]) -> Result<Option<StoredValue>> {
        self.slot_for(self.maintenance_owner(), tree, key)
    }

    fn slot_for(&self, owner: OwnerId, tree: TreeId, key: &[u8]) -> Result<Option<StoredValue>> {
        let dir = self.directory(tree.volume())?;
        let _dir_claim = self.claim(&dir, owner, false)?;
        let address = {
            let page = dir.page();
            leaf_address(directory_of(&page)?, tree, key)?
        };
        let leaf = self.pool.get(address)?;
        let _claim = self.claim(&leaf, owner, false)?;
        let page = leaf.page();
        Ok(page.data().and_then(|d| d.entries.get(key).cloned()))
    }

    /// The value of `key` visible to the reader that started at `reader`.
    /// AntiValues read as absent.
    pub fn fetch(&self, tree: TreeId, key: &[u8], reader: Timestamp) -> Result<Option<VersionBody>> {
        Ok(self
            .slot_for(transaction_owner(reader), tree, key)?
            .and_then(|slot| slot.resolve(&self.index, reader).cloned())
            .filter(|body| !body.is_anti_value()))
    }

    /// Every key of `tree` with its visible value, in key order.
    pub fn scan(&self, tree: TreeId, reader: Timestamp) -> Result<Vec<(Vec<u8>, VersionBody)>> {
        let owner = transaction_owner(reader);
        let dir = self.directory(tree.volume())?;
        let _dir_claim = self.claim(&dir, owner, false)?;
        let leaves: Vec<PageId> = {
            let page = dir.page();
            tree_def(directory_of(&page)?, tree)?
                .leaves
                .iter()
                .map(|l| l.page)
                .collect()
        };
        let mut out = Vec::new();
        for page_id in leaves {
            let leaf = self.pool.get(PageAddress::new(tree.volume(), page_id))?;
            let _claim = self.claim(&leaf, owner, false)?;
            let page = leaf.page();
            if let Some(data) = page.data() {
                for (key, slot) in &data.entries {
                    if let Some(body) = slot.resolve(&self.index, reader) {
                        if !body.is_anti_value() {
                            out.push((key.clone(), body.clone()));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Keys of `tree` visible to `reader`, in order.
    pub fn keys(&self, tree: TreeId, reader: Timestamp) -> Result<Vec<Vec<u8>>> {
        Ok(self.scan(tree, reader)?.into_iter().map(|(k, _)| k).collect())
    }

    // =========================================================================
    // Long records
    // =========================================================================

    /// Payload bytes per long-record page.
    pub fn long_record_chunk(&self) -> usize {
        self.pool.page_size() - LONG_RECORD_OVERHEAD
    }

    /// Whether `len` value bytes must go to a long-record chain.
    pub fn is_long(&self, len: usize) -> bool {
        len > self.config.long_record_threshold
    }

    /// Write `bytes` to a new chain in `volume`. Returns the body to store
    /// and the chain's buffers, head first. The buffers start dirty.
    pub fn write_long_record(
        &self,
        volume: VolumeId,
        bytes: &[u8],
    ) -> Result<(VersionBody, Vec<Arc<Buffer>>)> {
        let chunk = self.long_record_chunk();
        let count = ((bytes.len() + chunk - 1) / chunk).max(1);
        let dir = self.directory(volume)?;
        let ids = {
            let _claim = self.claim(&dir, self.maintenance_owner(), true)?;
            self.update_directory(&dir, |d| {
                let ids: Vec<PageId> = (0..count).map(|_| self.allocate(volume, d)).collect();
                Ok((ids, true))
            })?
        };
        let ts = self.now();
        let mut buffers = Vec::with_capacity(count);
        for (i, id) in ids.iter().enumerate() {
            let start = (i * chunk).min(bytes.len());
            let end = ((i + 1) * chunk).min(bytes.len());
            let page = Page::new(
                *id,
                ts,
                PageBody::LongRecord(LongRecordPage {
                    next: ids.get(i + 1).copied().unwrap_or(0),
                    bytes: bytes[start..end].to_vec(),
                }),
            );
            buffers.push(self.pool.install(PageAddress::new(volume, *id), page));
        }
        Ok((
            VersionBody::LongRecord {
                head: ids[0],
                size: bytes.len() as u64,
            },
            buffers,
        ))
    }

    /// Page numbers of the chain starting at `head`.
    pub fn chain_pages(&self, volume: VolumeId, head: PageId) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut seen = FxHashSet::default();
        let mut next = head;
        while next != 0 {
            if !seen.insert(next) {
                return Err(Error::Corruption(format!(
                    "long record chain at {} loops through page {}",
                    head, next
                )));
            }
            let buffer = self.pool.get(PageAddress::new(volume, next))?;
            let page = buffer.page();
            match &page.body {
                PageBody::LongRecord(link) => {
                    pages.push(next);
                    next = link.next;
                }
                _ => {
                    return Err(Error::Corruption(format!(
                        "long record chain at {} reaches non-chain page {}",
                        head, next
                    )))
                }
            }
        }
        Ok(pages)
    }

    /// Read a long record.
    pub fn read_long_record(&self, volume: VolumeId, head: PageId, size: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size as usize);
        for id in self.chain_pages(volume, head)? {
            let buffer = self.pool.get(PageAddress::new(volume, id))?;
            let page = buffer.page();
            if let PageBody::LongRecord(link) = &page.body {
                out.extend_from_slice(&link.bytes);
            }
        }
        if out.len() as u64 != size {
            return Err(Error::Corruption(format!(
                "long record at {}:{} holds {} bytes, expected {}",
                volume,
                head,
                out.len(),
                size
            )));
        }
        Ok(out)
    }

    /// Resolve a body to its bytes. AntiValues yield `None`.
    pub fn materialize(&self, volume: VolumeId, body: &VersionBody) -> Result<Option<Vec<u8>>> {
        match body {
            VersionBody::Inline(bytes) => Ok(Some(bytes.clone())),
            VersionBody::LongRecord { head, size } => {
                self.read_long_record(volume, *head, *size).map(Some)
            }
            VersionBody::AntiValue => Ok(None),
        }
    }

    /// Return a chain's pages to the garbage list.
    pub fn free_chain(&self, volume: VolumeId, head: PageId) -> Result<usize> {
        let pages = self.chain_pages(volume, head)?;
        let dir = self.directory(volume)?;
        let _claim = self.claim(&dir, self.maintenance_owner(), true)?;
        self.update_directory(&dir, |d| {
            let changed = self.free_pages(volume, d, &pages);
            Ok((pages.len(), changed))
        })
    }

    /// Mark pages as in use: drop them from the garbage list and move the
    /// allocation mark past them. Used for chains rebuilt during recovery.
    pub fn reserve_pages(&self, volume: VolumeId, pages: &[PageId]) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let dir = self.directory(volume)?;
        let _claim = self.claim(&dir, self.maintenance_owner(), true)?;
        self.update_directory(&dir, |d| {
            let before = (d.garbage.len(), d.next_page);
            d.garbage.retain(|p| !pages.contains(p));
            if let Some(max) = pages.iter().max() {
                d.next_page = d.next_page.max(max + 1);
            }
            Ok(((), before != (d.garbage.len(), d.next_page)))
        })
    }

    // =========================================================================
    // Pruning
    // =========================================================================

    /// Prune one data page against the published active transaction cache.
    ///
    /// With a tree, edge AntiValues left behind are offered to the cleanup
    /// manager for removal.
    pub fn prune_page(&self, address: PageAddress, tree: Option<TreeId>) -> Result<PruneOutcome> {
        let leaf = self.pool.get(address)?;
        let ts = self.now();
        let outcome = {
            let _claim = self.claim(&leaf, self.maintenance_owner(), true)?;
            let cache = self.index.active_transaction_cache();
            let index = &self.index;
            leaf.update(|page| {
                let data = match page.data_mut() {
                    Some(d) if tree.map(|t| t == d.tree).unwrap_or(true) => d,
                    _ => return (None, false),
                };
                let outcome = prune_data_page(data, index, &cache);
                let changed = outcome.changed;
                if changed {
                    page.timestamp = ts;
                }
                (Some(outcome), changed)
            })
        };
        let outcome = match outcome {
            Some(o) => o,
            None => return Ok(PruneOutcome::default()),
        };
        self.prunes.fetch_add(1, Ordering::Relaxed);
        for head in &outcome.freed_chains {
            self.free_chain(address.volume, *head)?;
        }
        if let Some(tree) = tree {
            for key in &outcome.edge_anti_values {
                self.cleanup.offer(CleanupAction::PruneAntiValue {
                    tree,
                    page: address,
                    key: key.clone(),
                });
            }
        }
        if outcome.changed {
            trace!(
                target: "tessera::cleanup",
                page = %address,
                versions = outcome.versions_removed,
                keys = outcome.keys_removed,
                "pruned page"
            );
        }
        Ok(outcome)
    }

    /// Prune every leaf of `tree`.
    pub fn prune_tree(&self, tree: TreeId) -> Result<PruneOutcome> {
        let mut total = PruneOutcome::default();
        for address in self.data_pages(tree)? {
            total.merge(self.prune_page(address, Some(tree))?);
        }
        Ok(total)
    }

    /// Remove a primordial AntiValue left as the first key of a page.
    /// An emptied leaf other than the tree's first is unlinked and freed.
    pub fn prune_anti_value(&self, tree: TreeId, address: PageAddress, key: &[u8]) -> Result<bool> {
        let owner = self.maintenance_owner();
        let dir = self.directory(tree.volume())?;
        let _dir_claim = self.claim(&dir, owner, true)?;
        let leaf = self.pool.get(address)?;
        let ts = self.now();
        let (removed, emptied) = {
            let _claim = self.claim(&leaf, owner, true)?;
            leaf.update(|page| {
                let data = match page.data_mut() {
                    Some(d) if d.tree == tree => d,
                    _ => return ((false, false), false),
                };
                let removable = data
                    .entries
                    .get(key)
                    .map(|v| v.is_primordial_anti_value())
                    .unwrap_or(false);
                if !removable {
                    return ((false, false), false);
                }
                data.entries.remove(key);
                let emptied = data.entries.is_empty();
                page.timestamp = ts;
                ((true, emptied), true)
            })
        };
        if !removed {
            return Ok(false);
        }
        self.anti_values_removed.fetch_add(1, Ordering::Relaxed);
        if emptied {
            let volume = tree.volume();
            self.update_directory(&dir, |d| {
                let def = match d.trees.iter_mut().find(|t| t.id == tree) {
                    Some(def) => def,
                    None => return Ok(((), false)),
                };
                match def.leaves.iter().position(|l| l.page == address.page) {
                    Some(pos) if pos > 0 => {
                        def.leaves.remove(pos);
                        self.free_pages(volume, d, &[address.page]);
                        Ok(((), true))
                    }
                    _ => Ok(((), false)),
                }
            })?;
        }
        Ok(true)
    }

    /// Count page versions per transaction handle across every tree.
    pub fn handle_counts(&self) -> Result<FxHashMap<Timestamp, i64>> {
        let mut counts = FxHashMap::default();
        for tree in self.all_trees()? {
            for address in self.data_pages(tree)? {
                let leaf = self.pool.get(address)?;
                let _claim = self.claim(&leaf, self.maintenance_owner(), false)?;
                let page = leaf.page();
                if let Some(data) = page.data() {
                    for slot in data.entries.values() {
                        if let StoredValue::Mvv(versions) = slot {
                            for v in versions.iter().filter(|v| v.handle != PRIMORDIAL) {
                                *counts.entry(v.handle).or_insert(0) += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(counts)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TreeStats {
        TreeStats {
            splits: self.splits.load(Ordering::Relaxed),
            prunes: self.prunes.load(Ordering::Relaxed),
            anti_values_removed: self.anti_values_removed.load(Ordering::Relaxed),
            pages_allocated: self.pages_allocated.load(Ordering::Relaxed),
            pages_freed: self.pages_freed.load(Ordering::Relaxed),
        }
    }
}

impl CleanupHandler for TreeStore {
    fn perform(&self, action: &CleanupAction) -> Result<()> {
        match action {
            CleanupAction::PrunePage { page, tree } => self.prune_page(*page, *tree).map(|_| ()),
            CleanupAction::PruneAntiValue { tree, page, key } => {
                self.prune_anti_value(*tree, *page, key).map(|_| ())
            }
        }
    }
}
