//! The journal manager.
//!
//! Every durable change goes through the journal: page images written by
//! checkpoints and long-record writes, transaction records, tree creation
//! and checkpoint records. Records are framed into an in-memory buffer and
//! appended to the current journal file when the buffer fills, when the
//! flusher runs, or when a caller forces the journal.
//!
//! # Addresses
//!
//! ```text
//! base_address <= durable_address <= current_address
//! ```
//!
//! - `current_address`: where the next record will go
//! - `durable_address`: everything below has been synced
//! - `base_address`: everything recovery could need is at or above it;
//!   files wholly below it are deleted
//!
//! # Page map
//!
//! The page map records the newest journaled image of each page. Pages not
//! in the pool are read from it before falling back to their volume. The
//! copier writes images that precede the last checkpoint record back to
//! their volumes and drops them from the map, which lets the base address
//! advance.
//!
//! # Lock order
//!
//! `state` before `page_map` before `live_transactions` before `readers`.

use crate::config::{CommitPolicy, JournalConfig};
use crate::format::{decode_frame, JournalFile, JournalHeader, JournalRecord};
use crate::recovery::RecoveredJournal;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{
    DatabaseId, Error, JournalAddress, PageAddress, Result, Timestamp, VolumeId,
};
use tessera_storage::{AccumulatorValue, Page, PageSource, VolumeSet};
use tracing::{debug, info, warn};

/// Newest journaled image of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageNode {
    /// Address of the image record
    pub address: JournalAddress,
    /// Frame length of the record
    pub length: usize,
    /// Page timestamp of the image
    pub timestamp: Timestamp,
}

/// The most recent checkpoint written or recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointMark {
    /// Checkpoint timestamp
    pub timestamp: Timestamp,
    /// Address of the checkpoint record; images below it are certified
    pub address: JournalAddress,
    /// Base address recorded in the checkpoint
    pub base_address: JournalAddress,
    /// Wall-clock time of the checkpoint (ms)
    pub wall_clock_ms: i64,
}

/// Journal counters.
#[derive(Debug, Default)]
struct JournalCounters {
    appends: AtomicU64,
    bytes_written: AtomicU64,
    writes: AtomicU64,
    syncs: AtomicU64,
    sync_nanos: AtomicU64,
    flush_errors: AtomicU64,
    slow_io_events: AtomicU64,
    read_pages: AtomicU64,
    journaled_pages: AtomicU64,
    copied_pages: AtomicU64,
    dropped_pages: AtomicU64,
    skipped_pages: AtomicU64,
    commits: AtomicU64,
    commit_wait_nanos: AtomicU64,
    deleted_files: AtomicU64,
}

/// Management snapshot of the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalInfo {
    /// Journal path prefix
    pub file_path: String,
    /// Maximum size of one file
    pub block_size: u64,
    /// Lowest address recovery needs
    pub base_address: JournalAddress,
    /// Address of the next record
    pub current_address: JournalAddress,
    /// Everything below is synced
    pub durable_address: JournalAddress,
    /// Generation of the file being written
    pub current_generation: u64,
    /// Journal files on disk
    pub file_count: u64,
    /// Distinct pages with an image in the journal
    pub page_map_size: usize,
    /// Transactions whose records are retained
    pub live_transaction_count: usize,
    /// Copying to volumes disabled
    pub append_only: bool,
    /// Copy as fast as possible
    pub copy_fast: bool,
    /// Records for volumes that are not open are skipped
    pub ignore_missing_volumes: bool,
    /// Whether the journal is closed
    pub closed: bool,
    /// Whether a copy cycle is running
    pub copying: bool,
    /// Copier urgency, 0 to 10
    pub urgency: u32,
    /// Flusher cycle (ms)
    pub flush_interval_ms: u64,
    /// Copier cycle at zero urgency (ms)
    pub copier_interval_ms: u64,
    /// Slow IO threshold (ms)
    pub slow_io_alert_ms: u64,
    /// Records appended
    pub appends: u64,
    /// Bytes written to files
    pub bytes_written: u64,
    /// Syncs performed
    pub syncs: u64,
    /// Failed flushes
    pub flush_errors: u64,
    /// Slow writes or syncs
    pub slow_io_events: u64,
    /// Page images read back from the journal
    pub read_page_count: u64,
    /// Page images written
    pub journaled_page_count: u64,
    /// Page images copied to volumes
    pub copied_page_count: u64,
    /// Page images superseded by newer images before being copied
    pub dropped_page_count: u64,
    /// Page images skipped because their volume is not open
    pub skipped_page_count: u64,
    /// Commit records written
    pub total_completed_commits: u64,
    /// Total time committers waited for durability (ms)
    pub commit_wait_ms: u64,
    /// Files deleted after their contents were no longer needed
    pub deleted_file_count: u64,
    /// Creation time of the journal (ms since epoch)
    pub journal_created_ms: i64,
    /// Timestamp of the last valid checkpoint
    pub last_checkpoint_timestamp: Timestamp,
    /// Wall-clock time of the last valid checkpoint (ms since epoch)
    pub last_checkpoint_ms: i64,
}

/// Logs one message at most once per interval and counts what it dropped.
#[derive(Debug, Default)]
pub(crate) struct LogThrottle {
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl LogThrottle {
    /// Whether a message may be logged now. Returns the number suppressed
    /// since the last one.
    pub(crate) fn permit(&self, interval: Duration) -> Option<u64> {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }
}

struct WriterState {
    file: Option<JournalFile>,
    generation: u64,
    buffer: Vec<u8>,
    /// Address of `buffer[0]`
    buffer_address: JournalAddress,
    durable_address: JournalAddress,
    unsynced: bool,
    closed: bool,
}

impl WriterState {
    fn current_address(&self) -> JournalAddress {
        self.buffer_address + self.buffer.len() as u64
    }
}

/// The journal manager.
pub struct JournalManager {
    config: JournalConfig,
    block_size: u64,
    database_id: DatabaseId,
    journal_created_ms: i64,
    volumes: Arc<VolumeSet>,
    state: Mutex<WriterState>,
    durable: Condvar,
    page_map: RwLock<FxHashMap<PageAddress, PageNode>>,
    live_transactions: Mutex<FxHashMap<Timestamp, JournalAddress>>,
    readers: Mutex<FxHashMap<u64, File>>,
    last_checkpoint: Mutex<CheckpointMark>,
    checkpoint_accumulators: Mutex<Vec<AccumulatorValue>>,
    base_address: AtomicU64,
    first_generation: AtomicU64,
    copy_lock: Mutex<()>,
    append_only: AtomicBool,
    copy_fast: AtomicBool,
    ignore_missing_volumes: AtomicBool,
    flush_interval_ms: AtomicU64,
    copier_interval_ms: AtomicU64,
    slow_io_alert_ms: AtomicU64,
    copying: AtomicBool,
    counters: JournalCounters,
    flush_log: LogThrottle,
    slow_io_log: LogThrottle,
}

impl JournalManager {
    /// Open the journal for writing.
    ///
    /// Writing always starts in a new file after the newest one found by
    /// recovery. The page map, live transaction map and last checkpoint are
    /// seeded from `recovered`. Images of volumes that are not open fail
    /// the open unless missing volumes are ignored.
    pub fn open(
        config: JournalConfig,
        volumes: Arc<VolumeSet>,
        recovered: &RecoveredJournal,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let block_size = recovered.block_size().unwrap_or(config.block_size);
        if block_size != config.block_size {
            warn!(
                target: "tessera::journal",
                configured = config.block_size,
                block_size,
                "keeping the block size of the existing journal"
            );
        }
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if let Some((path, valid_len)) = recovered.partial_tail() {
            let (mut file, _) = JournalFile::open(path)?;
            file.truncate(valid_len)?;
            file.sync()?;
            warn!(
                target: "tessera::journal",
                path = %path.display(),
                valid_len,
                "truncated partial record at the end of the journal"
            );
        }

        let database_id = recovered.database_id().unwrap_or_default();
        let journal_created_ms = recovered
            .journal_created_ms()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let generation = recovered.next_generation();

        let mut page_map = FxHashMap::default();
        let mut skipped = 0u64;
        for (page, node) in recovered.page_images() {
            if volumes.get(page.volume).is_none() {
                if config.ignore_missing_volumes {
                    skipped += 1;
                    continue;
                }
                return Err(Error::MissingVolume(format!(
                    "journal holds page {} of a volume that is not open",
                    page
                )));
            }
            page_map.insert(page, node);
        }

        let start = generation * block_size;
        let header = JournalHeader::new(
            generation,
            block_size,
            recovered.base_address().unwrap_or(start),
            database_id,
            journal_created_ms,
        );
        let file = JournalFile::create(&config.file_path(generation), &header)?;
        file.sync()?;
        let current = start + file.size();
        let base = recovered.base_address().unwrap_or(current);

        let checkpoint = recovered.checkpoint_mark().unwrap_or(CheckpointMark {
            timestamp: 0,
            address: 0,
            base_address: base,
            wall_clock_ms: 0,
        });

        let manager = Arc::new(JournalManager {
            block_size,
            database_id,
            journal_created_ms,
            volumes,
            state: Mutex::new(WriterState {
                file: Some(file),
                generation,
                buffer: Vec::with_capacity(config.buffer_size),
                buffer_address: current,
                durable_address: current,
                unsynced: false,
                closed: false,
            }),
            durable: Condvar::new(),
            page_map: RwLock::new(page_map),
            live_transactions: Mutex::new(recovered.transaction_addresses().collect()),
            readers: Mutex::new(FxHashMap::default()),
            last_checkpoint: Mutex::new(checkpoint),
            checkpoint_accumulators: Mutex::new(
                recovered
                    .checkpoint()
                    .map(|c| c.accumulators.clone())
                    .unwrap_or_default(),
            ),
            base_address: AtomicU64::new(base),
            first_generation: AtomicU64::new(recovered.first_generation().unwrap_or(generation)),
            copy_lock: Mutex::new(()),
            append_only: AtomicBool::new(config.append_only),
            copy_fast: AtomicBool::new(false),
            ignore_missing_volumes: AtomicBool::new(config.ignore_missing_volumes),
            flush_interval_ms: AtomicU64::new(config.flush_interval_ms),
            copier_interval_ms: AtomicU64::new(config.copier_interval_ms),
            slow_io_alert_ms: AtomicU64::new(config.slow_io_alert_ms),
            copying: AtomicBool::new(false),
            counters: JournalCounters::default(),
            flush_log: LogThrottle::default(),
            slow_io_log: LogThrottle::default(),
            config,
        });
        manager
            .counters
            .skipped_pages
            .store(skipped, Ordering::Relaxed);
        info!(
            target: "tessera::journal",
            path = %manager.config.path.display(),
            generation,
            base,
            pages = manager.page_map_size(),
            "journal opened"
        );
        Ok(manager)
    }

    /// Static configuration the journal was opened with.
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Identity stamped into every file.
    pub fn database_id(&self) -> DatabaseId {
        self.database_id
    }

    /// Block size in effect.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    // =========================================================================
    // Appending
    // =========================================================================

    /// Append one record. Returns its address. The record is durable once
    /// the journal is forced past that address.
    pub fn append(&self, record: &JournalRecord) -> Result<JournalAddress> {
        let frame = record.to_frame()?;
        let mut state = self.state.lock();
        let address = self.reserve(&mut state, frame.len())?;
        state.buffer.extend_from_slice(&frame);
        self.note_record(record, address, frame.len());
        Ok(address)
    }

    /// Append records contiguously. Returns the address of the last one.
    pub fn append_all(&self, records: &[JournalRecord]) -> Result<JournalAddress> {
        let frames = records
            .iter()
            .map(|r| r.to_frame())
            .collect::<Result<Vec<_>>>()?;
        let mut state = self.state.lock();
        let mut last = state.current_address();
        for (record, frame) in records.iter().zip(&frames) {
            let address = self.reserve(&mut state, frame.len())?;
            state.buffer.extend_from_slice(frame);
            self.note_record(record, address, frame.len());
            last = address;
        }
        Ok(last)
    }

    /// Journal a page image.
    pub fn write_page_image(
        &self,
        page: PageAddress,
        timestamp: Timestamp,
        image: Vec<u8>,
        always_valid: bool,
    ) -> Result<JournalAddress> {
        self.append(&JournalRecord::PageImage {
            page,
            timestamp,
            image,
            always_valid,
        })
    }

    /// Append a checkpoint record and force the journal. Images journaled
    /// before it become eligible for copying.
    pub fn write_checkpoint(
        &self,
        timestamp: Timestamp,
        accumulators: Vec<AccumulatorValue>,
    ) -> Result<CheckpointMark> {
        let wall_clock_ms = chrono::Utc::now().timestamp_millis();
        let mark = self.append_checkpoint(timestamp, accumulators, wall_clock_ms)?;
        debug!(
            target: "tessera::journal",
            timestamp,
            address = mark.address,
            base_address = mark.base_address,
            "checkpoint written"
        );
        Ok(mark)
    }

    fn append_checkpoint(
        &self,
        timestamp: Timestamp,
        accumulators: Vec<AccumulatorValue>,
        wall_clock_ms: i64,
    ) -> Result<CheckpointMark> {
        let base_address = self.required_address();
        let record = JournalRecord::Checkpoint {
            timestamp,
            base_address,
            accumulators,
            wall_clock_ms,
        };
        let address = self.append(&record)?;
        self.force()?;
        let mark = CheckpointMark {
            timestamp,
            address,
            base_address,
            wall_clock_ms,
        };
        if let JournalRecord::Checkpoint { accumulators, .. } = record {
            *self.checkpoint_accumulators.lock() = accumulators;
        }
        *self.last_checkpoint.lock() = mark;
        self.advance_base();
        Ok(mark)
    }

    fn reserve(&self, state: &mut WriterState, len: usize) -> Result<JournalAddress> {
        if state.closed {
            return Err(Error::Closed);
        }
        let file_start = state.generation * self.block_size;
        if state.current_address() - file_start + len as u64 > self.block_size {
            self.roll(state)?;
            let header_end = state.current_address() - state.generation * self.block_size;
            if header_end + len as u64 > self.block_size {
                return Err(Error::InvalidOperation(format!(
                    "journal record of {} bytes exceeds the block size",
                    len
                )));
            }
        }
        if !state.buffer.is_empty() && state.buffer.len() + len > self.config.buffer_size {
            self.write_buffer(state)?;
        }
        self.counters.appends.fetch_add(1, Ordering::Relaxed);
        Ok(state.current_address())
    }

    fn note_record(&self, record: &JournalRecord, address: JournalAddress, length: usize) {
        match record {
            JournalRecord::PageImage {
                page, timestamp, ..
            } => {
                self.counters.journaled_pages.fetch_add(1, Ordering::Relaxed);
                let node = PageNode {
                    address,
                    length,
                    timestamp: *timestamp,
                };
                if self.page_map.write().insert(*page, node).is_some() {
                    self.counters.dropped_pages.fetch_add(1, Ordering::Relaxed);
                }
            }
            JournalRecord::TxnCommit { .. } => {
                self.counters.commits.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        if let Some(start) = record.transaction() {
            self.live_transactions.lock().entry(start).or_insert(address);
        }
    }

    // =========================================================================
    // Writing and forcing
    // =========================================================================

    fn io_alert(&self, what: &str, started: Instant) {
        let elapsed = started.elapsed();
        let threshold = Duration::from_millis(self.slow_io_alert_ms.load(Ordering::Relaxed));
        if elapsed > threshold {
            self.counters.slow_io_events.fetch_add(1, Ordering::Relaxed);
            if let Some(suppressed) = self.slow_io_log.permit(self.log_repeat_interval()) {
                warn!(
                    target: "tessera::journal",
                    operation = what,
                    elapsed_ms = elapsed.as_millis() as u64,
                    suppressed,
                    "slow journal IO"
                );
            }
        }
    }

    fn log_repeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.log_repeat_interval_ms)
    }

    fn write_buffer(&self, state: &mut WriterState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let file = state.file.as_mut().ok_or(Error::Closed)?;
        file.write(&state.buffer)?;
        let len = state.buffer.len() as u64;
        state.buffer_address += len;
        state.buffer.clear();
        state.unsynced = true;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_written.fetch_add(len, Ordering::Relaxed);
        self.io_alert("write", started);
        Ok(())
    }

    fn sync_file(&self, state: &mut WriterState) -> Result<()> {
        if state.unsynced {
            let started = Instant::now();
            state.file.as_ref().ok_or(Error::Closed)?.sync()?;
            let nanos = started.elapsed().as_nanos() as u64;
            self.counters.syncs.fetch_add(1, Ordering::Relaxed);
            self.counters.sync_nanos.fetch_add(nanos, Ordering::Relaxed);
            state.unsynced = false;
            self.io_alert("sync", started);
        }
        if state.durable_address < state.buffer_address {
            state.durable_address = state.buffer_address;
            self.durable.notify_all();
        }
        Ok(())
    }

    fn roll(&self, state: &mut WriterState) -> Result<()> {
        self.write_buffer(state)?;
        self.sync_file(state)?;
        let generation = state.generation + 1;
        let header = JournalHeader::new(
            generation,
            self.block_size,
            self.base_address(),
            self.database_id,
            self.journal_created_ms,
        );
        let file = JournalFile::create(&self.config.file_path(generation), &header)?;
        file.sync()?;
        state.buffer_address = generation * self.block_size + file.size();
        state.durable_address = state.buffer_address;
        state.generation = generation;
        state.file = Some(file);
        self.durable.notify_all();
        info!(target: "tessera::journal", generation, "journal rolled over to a new file");
        Ok(())
    }

    /// Write buffered records to the current file without syncing.
    /// Returns the current address.
    pub fn flush(&self) -> Result<JournalAddress> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        self.write_buffer(&mut state)?;
        Ok(state.current_address())
    }

    /// Write and sync every buffered record.
    pub fn force(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        self.write_buffer(&mut state)?;
        self.sync_file(&mut state)
    }

    /// Wait until the record at `address` is durable, as far as `policy`
    /// requires.
    pub fn wait_for_durability(&self, address: JournalAddress, policy: CommitPolicy) -> Result<()> {
        let started = Instant::now();
        let result = match policy {
            CommitPolicy::Soft => Ok(()),
            CommitPolicy::Hard => self.force(),
            CommitPolicy::Group => self.wait_for_flusher(address),
        };
        let nanos = started.elapsed().as_nanos() as u64;
        self.counters
            .commit_wait_nanos
            .fetch_add(nanos, Ordering::Relaxed);
        result
    }

    fn wait_for_flusher(&self, address: JournalAddress) -> Result<()> {
        let patience = Duration::from_millis(
            self.flush_interval_ms.load(Ordering::Relaxed).saturating_mul(4) + 10,
        );
        let deadline = Instant::now() + patience;
        {
            let mut state = self.state.lock();
            while state.durable_address <= address {
                if state.closed {
                    return Err(Error::Closed);
                }
                if self.durable.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            if state.durable_address > address {
                return Ok(());
            }
        }
        // No flusher cycle arrived in time.
        self.force()
    }

    /// One flusher cycle: force buffered records. Failures are counted and
    /// logged at most once per log repeat interval.
    pub fn flusher_cycle(&self) -> Result<()> {
        match self.force() {
            Ok(()) | Err(Error::Closed) => Ok(()),
            Err(e) => {
                self.counters.flush_errors.fetch_add(1, Ordering::Relaxed);
                if let Some(suppressed) = self.flush_log.permit(self.log_repeat_interval()) {
                    warn!(
                        target: "tessera::journal",
                        error = %e,
                        suppressed,
                        "journal flush failed"
                    );
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Newest journaled image of `page`, if the journal holds one.
    pub fn read_page_image(&self, page: PageAddress) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock();
        let map = self.page_map.read();
        let node = match map.get(&page) {
            Some(node) => *node,
            None => return Ok(None),
        };
        let frame = if node.address >= state.buffer_address {
            let start = (node.address - state.buffer_address) as usize;
            state
                .buffer
                .get(start..start + node.length)
                .map(|b| b.to_vec())
                .ok_or_else(|| {
                    Error::Corruption(format!("page {} image beyond the journal buffer", page))
                })?
        } else {
            drop(state);
            self.read_frame(node.address, node.length)?
        };
        drop(map);
        let image = self.image_from_frame(page, node.address, &frame)?;
        self.counters.read_pages.fetch_add(1, Ordering::Relaxed);
        Ok(Some(image))
    }

    fn read_frame(&self, address: JournalAddress, length: usize) -> Result<Vec<u8>> {
        let generation = address / self.block_size;
        let offset = address % self.block_size;
        let mut readers = self.readers.lock();
        if !readers.contains_key(&generation) {
            let file = File::open(self.config.file_path(generation))?;
            readers.insert(generation, file);
        }
        let file = readers
            .get_mut(&generation)
            .ok_or_else(|| Error::Corruption(format!("journal file {} vanished", generation)))?;
        let mut frame = vec![0u8; length];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut frame)?;
        Ok(frame)
    }

    fn image_from_frame(&self, page: PageAddress, address: JournalAddress, frame: &[u8]) -> Result<Vec<u8>> {
        let decoded = decode_frame(frame)
            .map_err(|e| Error::Corruption(format!("journal record at {}: {}", address, e)))?;
        match JournalRecord::from_payload(decoded.type_code, decoded.payload) {
            Ok(JournalRecord::PageImage { page: p, image, .. }) if p == page => Ok(image),
            Ok(_) => Err(Error::Corruption(format!(
                "journal record at {} is not an image of {}",
                address, page
            ))),
            Err(e) => Err(Error::Corruption(format!("journal record at {}: {}", address, e))),
        }
    }

    // =========================================================================
    // Transactions and base address
    // =========================================================================

    /// Keep the records of transactions for which `keep` returns true and
    /// release the rest. Returns the number released.
    pub fn retain_transactions(&self, mut keep: impl FnMut(Timestamp) -> bool) -> usize {
        let mut live = self.live_transactions.lock();
        let before = live.len();
        live.retain(|start, _| keep(*start));
        before - live.len()
    }

    /// Start timestamps of the transactions whose records are retained.
    pub fn live_transaction_starts(&self) -> Vec<Timestamp> {
        self.live_transactions.lock().keys().copied().collect()
    }

    /// Release the records of one transaction.
    pub fn forget_transaction(&self, start: Timestamp) {
        self.live_transactions.lock().remove(&start);
    }

    /// Address of the first record of `start`, if it is retained.
    pub fn transaction_address(&self, start: Timestamp) -> Option<JournalAddress> {
        self.live_transactions.lock().get(&start).copied()
    }

    /// Lowest address anything retained refers to: uncopied images,
    /// retained transactions and the last checkpoint record.
    fn required_address(&self) -> JournalAddress {
        let current = self.current_address();
        let images = self.page_map.read().values().map(|n| n.address).min();
        let transactions = self.live_transactions.lock().values().copied().min();
        let checkpoint = {
            let mark = self.last_checkpoint.lock();
            if mark.address == 0 {
                mark.base_address
            } else {
                mark.address
            }
        };
        [Some(current), images, transactions, Some(checkpoint)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(current)
    }

    fn advance_base(&self) -> JournalAddress {
        let required = self.required_address();
        let previous = self.base_address.fetch_max(required, Ordering::AcqRel);
        previous.max(required)
    }

    fn delete_obsolete_files(&self) -> Result<usize> {
        let base = self.base_address();
        let current = self.state.lock().generation;
        let mut deleted = 0;
        let mut generation = self.first_generation.load(Ordering::Acquire);
        while generation < current && (generation + 1) * self.block_size <= base {
            self.readers.lock().remove(&generation);
            let path = self.config.file_path(generation);
            match std::fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            debug!(target: "tessera::journal", generation, "deleted journal file");
            generation += 1;
            self.first_generation.store(generation, Ordering::Release);
        }
        self.counters
            .deleted_files
            .fetch_add(deleted as u64, Ordering::Relaxed);
        Ok(deleted)
    }

    // =========================================================================
    // Copying
    // =========================================================================

    /// Copy up to `limit` certified images to their volumes. Returns the
    /// number copied. Does nothing in append-only mode unless `force`.
    pub fn copy_pages(&self, limit: usize, force: bool) -> Result<usize> {
        if !force && self.is_append_only() {
            return Ok(0);
        }
        let _guard = self.copy_lock.lock();
        self.copying.store(true, Ordering::Release);
        let result = self.copy_batch(limit);
        self.copying.store(false, Ordering::Release);
        let copied = result?;
        self.advance_base();
        self.delete_obsolete_files()?;
        self.maybe_roll_over()?;
        Ok(copied)
    }

    fn copy_batch(&self, limit: usize) -> Result<usize> {
        let cutoff = self.last_checkpoint.lock().address;
        let mut candidates: Vec<(PageAddress, PageNode)> = self
            .page_map
            .read()
            .iter()
            .filter(|(_, node)| node.address < cutoff)
            .map(|(page, node)| (*page, *node))
            .collect();
        candidates.sort_by_key(|(page, _)| *page);

        let mut budget = self.config.copy_buffer_size;
        let mut copied = Vec::new();
        let mut skipped = Vec::new();
        let mut touched: FxHashSet<VolumeId> = FxHashSet::default();
        for (page, node) in candidates.into_iter().take(limit.max(1)) {
            if !copied.is_empty() && node.length > budget {
                break;
            }
            budget = budget.saturating_sub(node.length);
            let volume = match self.volumes.get(page.volume) {
                Some(v) => v,
                None if self.ignore_missing_volumes.load(Ordering::Relaxed) => {
                    skipped.push((page, node));
                    continue;
                }
                None => {
                    return Err(Error::MissingVolume(format!(
                        "cannot copy page {}: volume is not open",
                        page
                    )))
                }
            };
            let frame = self.read_frame(node.address, node.length)?;
            let image = self.image_from_frame(page, node.address, &frame)?;
            volume.write_image(page.page, &image)?;
            touched.insert(page.volume);
            copied.push((page, node));
        }
        for id in touched {
            if let Some(volume) = self.volumes.get(id) {
                volume.sync()?;
            }
        }

        let mut map = self.page_map.write();
        for (page, node) in copied.iter().chain(skipped.iter()) {
            if map.get(page).map(|n| n.address == node.address).unwrap_or(false) {
                map.remove(page);
            }
        }
        drop(map);
        self.counters
            .copied_pages
            .fetch_add(copied.len() as u64, Ordering::Relaxed);
        self.counters
            .skipped_pages
            .fetch_add(skipped.len() as u64, Ordering::Relaxed);
        if !copied.is_empty() {
            debug!(target: "tessera::journal", pages = copied.len(), "copied pages to volumes");
        }
        Ok(copied.len())
    }

    fn maybe_roll_over(&self) -> Result<()> {
        if self.is_append_only() || !self.page_map.read().is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let offset = state.current_address() - state.generation * self.block_size;
        if offset > self.config.rollover_threshold {
            self.roll(&mut state)?;
        }
        Ok(())
    }

    /// Copy every certified image to its volume, then start a new file so
    /// the old ones can be deleted. The last checkpoint is carried into the
    /// new file. Works in append-only mode too.
    pub fn copy_back(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let copied = self.copy_pages(self.config.pages_per_copy_cycle, true)?;
            total += copied;
            if copied == 0 {
                break;
            }
        }
        let rolled = {
            let mut state = self.state.lock();
            let header_only = state.current_address()
                <= state.generation * self.block_size + self.header_len_estimate();
            if state.closed || header_only {
                false
            } else {
                self.roll(&mut state)?;
                true
            }
        };
        let mark = self.last_checkpoint();
        if rolled && mark.address != 0 {
            let accumulators = self.checkpoint_accumulators.lock().clone();
            self.append_checkpoint(mark.timestamp, accumulators, mark.wall_clock_ms)?;
        }
        self.advance_base();
        self.delete_obsolete_files()?;
        info!(target: "tessera::journal", pages = total, base = self.base_address(), "copy back complete");
        Ok(total)
    }

    fn header_len_estimate(&self) -> u64 {
        JournalHeader::new(0, self.block_size, 0, self.database_id, 0)
            .to_frame()
            .map(|f| f.len() as u64)
            .unwrap_or(0)
    }

    /// One copier cycle.
    pub fn copier_cycle(&self) -> Result<()> {
        let limit = if self.is_copy_fast() {
            usize::MAX
        } else {
            self.config.pages_per_copy_cycle
        };
        self.copy_pages(limit, false).map(|_| ())
    }

    /// Milliseconds until the next copier cycle. Shrinks as urgency grows.
    pub fn copier_poll_interval(&self) -> i64 {
        let interval = self.copier_interval_ms.load(Ordering::Relaxed) as i64;
        if self.is_append_only() || !self.has_certified_images() {
            return interval;
        }
        let urgency = self.urgency() as i64;
        interval * (10 - urgency) / 10
    }

    fn has_certified_images(&self) -> bool {
        let cutoff = self.last_checkpoint.lock().address;
        self.page_map.read().values().any(|n| n.address < cutoff)
    }

    /// Copier urgency from 0 to 10.
    ///
    /// Copy-fast is always 10. Otherwise the urgency grows by one per
    /// `page_map_size_base` pages in the page map and, unless append-only,
    /// by one per journal file beyond the first.
    pub fn urgency(&self) -> u32 {
        if self.is_copy_fast() {
            return 10;
        }
        let pages = (self.page_map_size() / self.config.page_map_size_base) as u64;
        let files = if self.is_append_only() {
            0
        } else {
            self.file_count().saturating_sub(1)
        };
        (pages + files).min(10) as u32
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Force everything and close the files. Later appends fail.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        self.write_buffer(&mut state)?;
        self.sync_file(&mut state)?;
        state.closed = true;
        state.file = None;
        self.durable.notify_all();
        drop(state);
        self.readers.lock().clear();
        info!(target: "tessera::journal", "journal closed");
        Ok(())
    }

    /// Abandon the journal as if the process died: buffered records are
    /// discarded and nothing is synced.
    pub fn crash(&self) {
        let mut state = self.state.lock();
        let lost = state.buffer.len();
        state.buffer.clear();
        state.closed = true;
        state.file = None;
        self.durable.notify_all();
        drop(state);
        self.readers.lock().clear();
        warn!(target: "tessera::journal", lost_bytes = lost, "journal crashed");
    }

    /// Whether the journal is closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // =========================================================================
    // Management surface
    // =========================================================================

    /// Address of the next record.
    pub fn current_address(&self) -> JournalAddress {
        self.state.lock().current_address()
    }

    /// Everything below this address is synced.
    pub fn durable_address(&self) -> JournalAddress {
        self.state.lock().durable_address
    }

    /// Lowest address recovery may need.
    pub fn base_address(&self) -> JournalAddress {
        self.base_address.load(Ordering::Acquire)
    }

    /// The last checkpoint written or recovered.
    pub fn last_checkpoint(&self) -> CheckpointMark {
        *self.last_checkpoint.lock()
    }

    /// Distinct pages with an image in the journal.
    pub fn page_map_size(&self) -> usize {
        self.page_map.read().len()
    }

    /// Whether the journal holds an image of `page`.
    pub fn has_page_image(&self, page: PageAddress) -> bool {
        self.page_map.read().contains_key(&page)
    }

    /// Transactions whose records are retained.
    pub fn live_transaction_count(&self) -> usize {
        self.live_transactions.lock().len()
    }

    /// Journal files on disk.
    pub fn file_count(&self) -> u64 {
        let current = self.state.lock().generation;
        current + 1 - self.first_generation.load(Ordering::Acquire).min(current)
    }

    /// Whether copying is disabled.
    pub fn is_append_only(&self) -> bool {
        self.append_only.load(Ordering::Relaxed)
    }

    /// Enable or disable copying.
    pub fn set_append_only(&self, append_only: bool) {
        self.append_only.store(append_only, Ordering::Relaxed);
    }

    /// Whether copy-fast mode is on.
    pub fn is_copy_fast(&self) -> bool {
        self.copy_fast.load(Ordering::Relaxed)
    }

    /// Copy as fast as possible.
    pub fn set_copy_fast(&self, fast: bool) {
        self.copy_fast.store(fast, Ordering::Relaxed);
    }

    /// Whether records of volumes that are not open are skipped.
    pub fn is_ignore_missing_volumes(&self) -> bool {
        self.ignore_missing_volumes.load(Ordering::Relaxed)
    }

    /// Skip records of volumes that are not open.
    pub fn set_ignore_missing_volumes(&self, ignore: bool) {
        self.ignore_missing_volumes.store(ignore, Ordering::Relaxed);
    }

    /// Flusher cycle (ms).
    pub fn flush_interval_ms(&self) -> u64 {
        self.flush_interval_ms.load(Ordering::Relaxed)
    }

    /// Change the flusher cycle.
    pub fn set_flush_interval_ms(&self, ms: u64) {
        self.flush_interval_ms.store(ms, Ordering::Relaxed);
    }

    /// Change the copier cycle.
    pub fn set_copier_interval_ms(&self, ms: u64) {
        self.copier_interval_ms.store(ms, Ordering::Relaxed);
    }

    /// Change the slow IO threshold. Values below the minimum are raised.
    pub fn set_slow_io_alert_ms(&self, ms: u64) {
        self.slow_io_alert_ms.store(
            ms.max(crate::config::MINIMUM_SLOW_IO_ALERT_MS),
            Ordering::Relaxed,
        );
    }

    /// Whether a copy cycle is running.
    pub fn is_copying(&self) -> bool {
        self.copying.load(Ordering::Acquire)
    }

    /// Failed flush cycles.
    pub fn flush_error_count(&self) -> u64 {
        self.counters.flush_errors.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn break_current_file(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.file.as_mut().ok_or(Error::Closed)?.reopen_read_only()
    }

    /// Management snapshot.
    pub fn info(&self) -> JournalInfo {
        let (current, durable, generation, closed) = {
            let state = self.state.lock();
            (
                state.current_address(),
                state.durable_address,
                state.generation,
                state.closed,
            )
        };
        let checkpoint = self.last_checkpoint();
        let c = &self.counters;
        JournalInfo {
            file_path: self.config.path.display().to_string(),
            block_size: self.block_size,
            base_address: self.base_address(),
            current_address: current,
            durable_address: durable,
            current_generation: generation,
            file_count: self.file_count(),
            page_map_size: self.page_map_size(),
            live_transaction_count: self.live_transaction_count(),
            append_only: self.is_append_only(),
            copy_fast: self.is_copy_fast(),
            ignore_missing_volumes: self.is_ignore_missing_volumes(),
            closed,
            copying: self.is_copying(),
            urgency: self.urgency(),
            flush_interval_ms: self.flush_interval_ms(),
            copier_interval_ms: self.copier_interval_ms.load(Ordering::Relaxed),
            slow_io_alert_ms: self.slow_io_alert_ms.load(Ordering::Relaxed),
            appends: c.appends.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            syncs: c.syncs.load(Ordering::Relaxed),
            flush_errors: c.flush_errors.load(Ordering::Relaxed),
            slow_io_events: c.slow_io_events.load(Ordering::Relaxed),
            read_page_count: c.read_pages.load(Ordering::Relaxed),
            journaled_page_count: c.journaled_pages.load(Ordering::Relaxed),
            copied_page_count: c.copied_pages.load(Ordering::Relaxed),
            dropped_page_count: c.dropped_pages.load(Ordering::Relaxed),
            skipped_page_count: c.skipped_pages.load(Ordering::Relaxed),
            total_completed_commits: c.commits.load(Ordering::Relaxed),
            commit_wait_ms: c.commit_wait_nanos.load(Ordering::Relaxed) / 1_000_000,
            deleted_file_count: c.deleted_files.load(Ordering::Relaxed),
            journal_created_ms: self.journal_created_ms,
            last_checkpoint_timestamp: checkpoint.timestamp,
            last_checkpoint_ms: checkpoint.wall_clock_ms,
        }
    }
}

/// Reads pages from the journal's newest images, falling back to their
/// volumes.
pub struct JournalPageSource {
    journal: Arc<JournalManager>,
    volumes: Arc<VolumeSet>,
}

impl JournalPageSource {
    /// Create a source over `journal` and `volumes`.
    pub fn new(journal: Arc<JournalManager>, volumes: Arc<VolumeSet>) -> Self {
        JournalPageSource { journal, volumes }
    }
}

impl PageSource for JournalPageSource {
    fn read_page(&self, address: PageAddress) -> Result<Option<Page>> {
        match self.journal.read_page_image(address)? {
            Some(image) => {
                let page = Page::decode(&image)?;
                if page.id != address.page {
                    return Err(Error::Corruption(format!(
                        "journal image of {} holds page {}",
                        address, page.id
                    )));
                }
                Ok(Some(page))
            }
            None => self.volumes.read_page(address),
        }
    }
}
