//! Database struct and open/close logic
//!
//! This module provides the main Database struct that orchestrates:
//! - Volume and journal initialization
//! - Automatic recovery on startup
//! - Transaction API
//! - Background flusher, copier, checkpoint and cleanup tasks
//!
//! ## Transaction API
//!
//! The Database provides two ways to execute transactions:
//!
//! 1. **Closure API** (recommended): `db.transaction(|txn| { ... })`
//!    - Automatic commit on success, rollback on error
//!    - Returns the closure's return value
//!
//! 2. **Manual API**: `db.begin()` + `txn.commit()`
//!    - For cases requiring external control over commit timing
//!
//! An [`Exchange`] created from the database runs every operation in its
//! own implicit transaction.

pub mod config;
mod registry;
mod transactions;

pub use config::{TesseraConfig, VolumeSpec, CONFIG_FILE_NAME};
pub use registry::OPEN_DATABASES;
pub use transactions::RetryConfig;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tessera_concurrency::{RunnerStats, TaskRunner, TransactionIndex};
use tessera_core::{Error, Result, TimestampAllocator, TreeId};
use tessera_durability::{
    CommitPolicy, JournalManager, JournalPageSource, JournalRecord, JournalTasks, RecoveryManager,
    RecoveryReport,
};
use tessera_storage::{
    AccumulatorRegistry, BufferPool, CleanupManager, TreeStore, Volume, VolumeSet,
};
use tracing::{info, warn};

use crate::checkpoint::CheckpointTask;
use crate::exchange::Exchange;
use crate::recovery::{reconcile_versions, RecoveryApplier};
use crate::transaction::Transaction;

const LOCK_FILE_NAME: &str = ".lock";

/// The runners a database owns.
pub(crate) struct BackgroundTasks {
    pub(crate) journal: JournalTasks,
    pub(crate) checkpoint: TaskRunner,
    pub(crate) cleanup: TaskRunner,
}

impl BackgroundTasks {
    fn stop(&self) {
        self.checkpoint.stop();
        self.cleanup.stop();
        self.journal.stop();
    }

    fn crash(&self) {
        self.checkpoint.crash();
        self.cleanup.crash();
        self.journal.crash();
    }
}

/// Outcome of opening a database.
#[derive(Debug, Clone, Default)]
pub struct StartupRecovery {
    /// What journal replay did
    pub report: RecoveryReport,
    /// Page versions of unfinished transactions found at startup
    pub orphaned_transactions: usize,
    /// Aborted transactions whose versions were pruned at startup
    pub aborted_transactions: usize,
    /// Versions removed by the startup prune
    pub versions_pruned: usize,
}

/// An open database directory.
///
/// Holds the volumes, the journal, the buffer pool and every tree, plus
/// the background tasks that flush, copy, checkpoint and clean up.
pub struct Database {
    data_dir: PathBuf,
    config: TesseraConfig,
    pub(crate) volumes: Arc<VolumeSet>,
    pub(crate) index: Arc<TransactionIndex>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) trees: Arc<TreeStore>,
    pub(crate) cleanup: Arc<CleanupManager>,
    pub(crate) accumulators: Arc<AccumulatorRegistry>,
    pub(crate) journal: Arc<JournalManager>,
    /// Commits and rollbacks hold it shared; a checkpoint holds it
    /// exclusively while choosing its timestamp.
    pub(crate) commit_gate: RwLock<()>,
    pub(crate) checkpoint_lock: Mutex<()>,
    commit_policy: Mutex<CommitPolicy>,
    rollback_pruning: AtomicBool,
    open: AtomicBool,
    pub(crate) tasks: Mutex<Option<BackgroundTasks>>,
    startup: Mutex<StartupRecovery>,
    lock_file: Mutex<Option<File>>,
}

impl Database {
    /// Open (or create) the database in `path`.
    ///
    /// Reads `tessera.toml` from the directory, writing the default file
    /// first if there is none. Opening a directory that is already open in
    /// this process returns the same instance.
    ///
    /// # Flow
    ///
    /// 1. Create data directory if needed
    /// 2. Read or create `tessera.toml`
    /// 3. Check registry for existing instance at this path
    /// 4. Otherwise: lock the directory, open volumes and journal, recover,
    ///    register, start background tasks
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let data_dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let config_path = data_dir.join(CONFIG_FILE_NAME);
        TesseraConfig::write_default_if_missing(&config_path)?;
        let cfg = TesseraConfig::from_file(&config_path)?;

        Self::open_at(&data_dir, cfg)
    }

    /// Open database at the given path with an explicit configuration.
    ///
    /// The supplied config is written to `tessera.toml` so that later
    /// [`open`](Self::open) calls pick up the same settings.
    pub fn open_with_config<P: AsRef<Path>>(path: P, cfg: TesseraConfig) -> Result<Arc<Self>> {
        let data_dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        cfg.validate()?;
        cfg.write_to_file(&data_dir.join(CONFIG_FILE_NAME))?;
        Self::open_at(&data_dir, cfg)
    }

    fn open_at(data_dir: &Path, cfg: TesseraConfig) -> Result<Arc<Self>> {
        cfg.validate()?;
        let canonical_path = data_dir.canonicalize()?;

        let mut registry = OPEN_DATABASES.lock();
        if let Some(weak) = registry.get(&canonical_path) {
            if let Some(db) = weak.upgrade() {
                info!(target: "tessera::db", path = ?canonical_path, "returning existing database instance");
                return Ok(db);
            }
        }

        let lock_path = canonical_path.join(LOCK_FILE_NAME);
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| {
            Error::InvalidOperation(format!(
                "database at '{}' is already in use by another process",
                canonical_path.display()
            ))
        })?;

        let volumes = Arc::new(VolumeSet::new());
        for spec in &cfg.volumes {
            let volume = Volume::open_or_create(&canonical_path, spec.volume_id(), &spec.name, cfg.page_size)?;
            if volume.page_size() != cfg.page_size {
                return Err(Error::Config(format!(
                    "volume '{}' has page size {} but {} is configured",
                    spec.name,
                    volume.page_size(),
                    cfg.page_size
                )));
            }
            volumes.insert(volume);
        }

        let journal_config = cfg.journal_config(&canonical_path);
        let recovered = RecoveryManager::new(journal_config.clone()).scan()?;
        let journal = JournalManager::open(journal_config, Arc::clone(&volumes), &recovered)?;

        let timestamps = Arc::new(TimestampAllocator::new());
        timestamps.bump_to(recovered.max_timestamp());
        let index = Arc::new(TransactionIndex::new(timestamps));
        let pool = Arc::new(BufferPool::new(
            cfg.buffer_pool_config(),
            Arc::new(JournalPageSource::new(Arc::clone(&journal), Arc::clone(&volumes))),
        ));
        let cleanup = Arc::new(CleanupManager::new(cfg.cleanup_config()));
        let trees = TreeStore::new(
            Arc::clone(&pool),
            Arc::clone(&volumes),
            Arc::clone(&index),
            Arc::clone(&cleanup),
            cfg.tree_config(),
        );
        let accumulators = Arc::new(AccumulatorRegistry::new());

        let report = {
            let mut applier = RecoveryApplier::new(&trees, &accumulators, &index, &volumes);
            let mut report = recovered.replay(&mut applier, cfg.ignore_missing_volumes)?;
            for incident in applier.unresolved_chains() {
                warn!(target: "tessera::recovery", address = incident.address, message = %incident.message, "long record lost");
                report.incidents.push(incident);
            }
            report
        };
        let reconciled = reconcile_versions(
            &trees,
            &index,
            &volumes,
            recovered.checkpoint_timestamp(),
            recovered.discarded_pages(),
        )?;
        let startup = StartupRecovery {
            report,
            orphaned_transactions: reconciled.orphaned,
            aborted_transactions: reconciled.aborted,
            versions_pruned: reconciled.pruned.versions_removed,
        };

        let db = Arc::new(Database {
            data_dir: canonical_path.clone(),
            commit_policy: Mutex::new(cfg.commit_policy),
            rollback_pruning: AtomicBool::new(cfg.rollback_pruning),
            config: cfg,
            volumes,
            index,
            pool,
            trees,
            cleanup,
            accumulators,
            journal,
            commit_gate: RwLock::new(()),
            checkpoint_lock: Mutex::new(()),
            open: AtomicBool::new(true),
            tasks: Mutex::new(None),
            startup: Mutex::new(startup),
            lock_file: Mutex::new(Some(lock_file)),
        });
        registry.insert(canonical_path.clone(), Arc::downgrade(&db));
        drop(registry);

        if let Err(e) = db.finish_open() {
            warn!(target: "tessera::db", path = ?canonical_path, error = %e, "failed to start database");
            db.crash();
            return Err(e);
        }
        let startup = db.startup();
        info!(
            target: "tessera::db",
            path = ?canonical_path,
            applied = startup.report.committed_applied,
            aborted = startup.report.aborted,
            incidents = startup.report.error_count(),
            "database opened"
        );
        Ok(db)
    }

    /// Write the recovery checkpoint and start the background tasks.
    fn finish_open(self: &Arc<Self>) -> Result<()> {
        self.write_checkpoint()?;
        let journal = JournalTasks::start(&self.journal)?;
        let checkpoint = TaskRunner::start(CheckpointTask::new(self))?;
        let cleanup = TaskRunner::start(Arc::clone(&self.cleanup))?;
        *self.tasks.lock() = Some(BackgroundTasks {
            journal,
            checkpoint,
            cleanup,
        });
        Ok(())
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Canonical data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Settings the database was opened with.
    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    /// Whether the database accepts work.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// What happened during open.
    pub fn startup(&self) -> StartupRecovery {
        self.startup.lock().clone()
    }

    /// Commit policy new transactions start with.
    pub fn commit_policy(&self) -> CommitPolicy {
        *self.commit_policy.lock()
    }

    /// Change the default commit policy.
    pub fn set_commit_policy(&self, policy: CommitPolicy) {
        *self.commit_policy.lock() = policy;
    }

    /// Whether rolled back transactions queue their pages for pruning.
    pub fn rollback_pruning(&self) -> bool {
        self.rollback_pruning.load(Ordering::Relaxed)
    }

    /// Turn rollback pruning on or off.
    pub fn set_rollback_pruning(&self, enabled: bool) {
        self.rollback_pruning.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn kick_copier(&self) {
        if let Some(tasks) = self.tasks.lock().as_ref() {
            tasks.journal.kick_copier();
        }
    }

    pub(crate) fn kick_cleanup(&self) {
        if let Some(tasks) = self.tasks.lock().as_ref() {
            tasks.cleanup.kick();
        }
    }

    pub(crate) fn runner_stats(&self) -> Option<[RunnerStats; 4]> {
        self.tasks.lock().as_ref().map(|tasks| {
            let (flusher, copier) = tasks.journal.stats();
            [flusher, copier, tasks.checkpoint.stats(), tasks.cleanup.stats()]
        })
    }

    // ========================================================================
    // Components
    // ========================================================================

    /// The transaction index.
    pub fn transaction_index(&self) -> &Arc<TransactionIndex> {
        &self.index
    }

    /// Trees of every volume.
    pub fn tree_store(&self) -> &Arc<TreeStore> {
        &self.trees
    }

    /// The deferred pruning queue.
    pub fn cleanup_manager(&self) -> &Arc<CleanupManager> {
        &self.cleanup
    }

    /// The journal.
    pub fn journal(&self) -> &Arc<JournalManager> {
        &self.journal
    }

    /// Accumulators of every tree.
    pub fn accumulators(&self) -> &Arc<AccumulatorRegistry> {
        &self.accumulators
    }

    /// Open volumes.
    pub fn volumes(&self) -> &Arc<VolumeSet> {
        &self.volumes
    }

    /// The buffer pool.
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    // ========================================================================
    // Trees and transactions
    // ========================================================================

    /// Id of tree `name` in volume `volume`, creating and journaling it
    /// if it does not exist.
    pub fn create_tree(&self, volume: &str, name: &str) -> Result<TreeId> {
        self.check_open()?;
        let volume_id = self
            .volumes
            .by_name(volume)
            .ok_or_else(|| Error::MissingVolume(format!("no volume named '{}'", volume)))?
            .id();
        if let Some(id) = self.trees.tree_id(volume_id, name)? {
            return Ok(id);
        }
        let id = self.trees.create_tree(volume_id, name)?;
        let address = self.journal.append(&JournalRecord::TreeCreate {
            tree: id,
            name: name.to_string(),
        })?;
        self.journal.wait_for_durability(address, self.commit_policy())?;
        info!(target: "tessera::db", tree = %id, volume, name, "created tree");
        Ok(id)
    }

    /// An exchange on tree `name` of volume `volume` whose operations run
    /// in implicit transactions. The tree is created if needed.
    pub fn exchange(self: &Arc<Self>, volume: &str, name: &str) -> Result<Exchange<'static>> {
        let tree = self.create_tree(volume, name)?;
        Ok(Exchange::new(Arc::clone(self), tree))
    }

    /// Begin a transaction for manual control.
    pub fn begin(self: &Arc<Self>) -> Result<Transaction> {
        Transaction::begin(self)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop the background tasks, checkpoint, copy every journaled page
    /// back to its volume and close the journal.
    ///
    /// Transactions still running afterwards fail with `Closed`. Closing
    /// twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = &tasks {
            tasks.stop();
        }
        let result = self
            .write_checkpoint()
            .and_then(|_| self.journal.copy_back())
            .and_then(|_| self.volumes.sync_all());
        let closed = self.journal.close();
        self.release();
        info!(target: "tessera::db", path = ?self.data_dir, ok = result.is_ok(), "database closed");
        result.and(closed)
    }

    /// Stop as if the process died: nothing is flushed, written back or
    /// checkpointed. Only what the journal already holds on disk survives.
    pub fn crash(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.crash();
        }
        self.journal.crash();
        self.pool.invalidate_all();
        self.release();
        warn!(target: "tessera::db", path = ?self.data_dir, "database crashed");
    }

    /// Drop the directory lock and the registry entry.
    fn release(&self) {
        if let Some(file) = self.lock_file.lock().take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                warn!(target: "tessera::db", error = %e, "failed to unlock data directory");
            }
        }
        let mut registry = OPEN_DATABASES.lock();
        let ours = registry
            .get(&self.data_dir)
            .map(|weak| std::ptr::eq(weak.as_ptr(), self))
            .unwrap_or(false);
        if ours {
            registry.remove(&self.data_dir);
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!(target: "tessera::db", path = ?self.data_dir, error = %e, "close on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("data_dir", &self.data_dir)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Arc<Database> {
        Database::open_with_config(dir.path(), TesseraConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_open_creates_files() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        assert!(db.is_open());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
        assert!(Volume::volume_path(dir.path(), "data").exists());
        db.close().unwrap();
    }

    #[test]
    fn test_open_returns_same_instance() {
        let dir = TempDir::new().unwrap();
        let db1 = open(&dir);
        let db2 = Database::open(dir.path()).unwrap();
        assert!(Arc::ptr_eq(&db1, &db2));
        db1.close().unwrap();

        let db3 = Database::open(dir.path()).unwrap();
        assert!(!Arc::ptr_eq(&db1, &db3));
        db3.close().unwrap();
    }

    #[test]
    fn test_operations_after_close_fail() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.close().unwrap();
        assert!(matches!(db.begin(), Err(Error::Closed)));
        assert!(matches!(db.create_tree("data", "t"), Err(Error::Closed)));
        assert!(db.close().is_ok());
    }

    #[test]
    fn test_create_tree_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let a = db.create_tree("data", "accounts").unwrap();
        let b = db.create_tree("data", "accounts").unwrap();
        assert_eq!(a, b);
        assert!(matches!(db.create_tree("nope", "t"), Err(Error::MissingVolume(_))));
        db.close().unwrap();
    }

    #[test]
    fn test_page_size_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        open(&dir).close().unwrap();
        let mut cfg = TesseraConfig::for_testing();
        cfg.page_size = 8192;
        let err = Database::open_with_config(dir.path(), cfg).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    static_assertions::assert_impl_all!(Database: Send, Sync);
}
