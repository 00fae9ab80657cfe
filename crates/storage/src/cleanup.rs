//! Deferred cleanup of obsolete versions.
//!
//! Work that cannot be done where it is discovered (pruning a page touched
//! by a rolled-back transaction, removing a leftover AntiValue that needs
//! tree-level claims) is queued here as a [`CleanupAction`] and performed
//! later by a [`CleanupHandler`], either on the cleanup task's own cycle or
//! synchronously through [`CleanupManager::poll`].
//!
//! Each distinct action is queued at most once at a time. Offers beyond
//! the queue capacity are refused and counted; refused work is simply
//! rediscovered by a later prune.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Weak;
use tessera_concurrency::BackgroundTask;
use tessera_core::{Error, PageAddress, Result, TreeId};
use tracing::{debug, warn};

/// A unit of deferred cleanup work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CleanupAction {
    /// Prune one data page. With a tree, edge AntiValues it leaves behind
    /// are queued for removal as well.
    PrunePage {
        /// Page to prune
        page: PageAddress,
        /// Owning tree, when tree-level follow-up is wanted
        tree: Option<TreeId>,
    },
    /// Remove a primordial AntiValue left as the first key of a page.
    PruneAntiValue {
        /// Owning tree
        tree: TreeId,
        /// Page holding the key
        page: PageAddress,
        /// The key
        key: Vec<u8>,
    },
}

/// Performs queued actions.
pub trait CleanupHandler: Send + Sync {
    /// Carry out one action.
    fn perform(&self, action: &CleanupAction) -> Result<()>;
}

/// Cleanup manager configuration.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Maximum queued actions (default: 10000)
    pub max_queued: usize,
    /// Milliseconds between cleanup cycles; negative waits for a kick
    /// (default: 1000)
    pub poll_interval_ms: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            max_queued: 10_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl CleanupConfig {
    /// Set the queue capacity (builder pattern).
    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = max_queued;
        self
    }

    /// Set the poll interval (builder pattern).
    pub fn with_poll_interval_ms(mut self, poll_interval_ms: i64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_queued == 0 {
            return Err(Error::Config("cleanup queue must hold at least one action".into()));
        }
        Ok(())
    }

    /// Configuration for tests: only runs when polled.
    pub fn for_testing() -> Self {
        CleanupConfig {
            max_queued: 10_000,
            poll_interval_ms: -1,
        }
    }
}

/// Cleanup counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Actions queued
    pub accepted: u64,
    /// Actions rejected (duplicate or queue full)
    pub refused: u64,
    /// Actions completed
    pub performed: u64,
    /// Actions that failed
    pub errors: u64,
    /// Actions waiting
    pub queued: usize,
}

#[derive(Default)]
struct CleanupQueue {
    pending: VecDeque<CleanupAction>,
    members: FxHashSet<CleanupAction>,
}

/// Queue of deferred cleanup work.
pub struct CleanupManager {
    config: CleanupConfig,
    queue: Mutex<CleanupQueue>,
    handler: RwLock<Option<Weak<dyn CleanupHandler>>>,
    poll_interval: AtomicI64,
    accepted: AtomicU64,
    refused: AtomicU64,
    performed: AtomicU64,
    errors: AtomicU64,
}

impl CleanupManager {
    /// Create an idle manager with no handler.
    pub fn new(config: CleanupConfig) -> Self {
        let poll_interval = AtomicI64::new(config.poll_interval_ms);
        CleanupManager {
            config,
            queue: Mutex::new(CleanupQueue::default()),
            handler: RwLock::new(None),
            poll_interval,
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            performed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Install the handler. The manager does not keep it alive.
    pub fn set_handler(&self, handler: Weak<dyn CleanupHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Queue an action. Returns false when it was refused.
    pub fn offer(&self, action: CleanupAction) -> bool {
        let mut queue = self.queue.lock();
        if queue.pending.len() >= self.config.max_queued || queue.members.contains(&action) {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.members.insert(action.clone());
        queue.pending.push_back(action);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn next_action(&self) -> Option<CleanupAction> {
        let mut queue = self.queue.lock();
        let action = queue.pending.pop_front()?;
        queue.members.remove(&action);
        Some(action)
    }

    /// Perform every queued action now, including actions queued while
    /// polling. Returns the number performed.
    pub fn poll(&self) -> usize {
        let handler = match self.handler.read().as_ref().and_then(Weak::upgrade) {
            Some(handler) => handler,
            None => return 0,
        };
        let mut performed = 0;
        while let Some(action) = self.next_action() {
            match handler.perform(&action) {
                Ok(()) => {
                    self.performed.fetch_add(1, Ordering::Relaxed);
                    performed += 1;
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(target: "tessera::cleanup", ?action, error = %e, "cleanup action failed");
                }
            }
        }
        if performed > 0 {
            debug!(target: "tessera::cleanup", performed, "cleanup cycle");
        }
        performed
    }

    /// Drop every queued action.
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.pending.clear();
        queue.members.clear();
    }

    /// Change the poll interval. Negative: run only when kicked or polled.
    pub fn set_poll_interval(&self, ms: i64) {
        self.poll_interval.store(ms, Ordering::Relaxed);
    }

    /// Number of queued actions.
    pub fn queued(&self) -> usize {
        self.queue.lock().pending.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CleanupStats {
        CleanupStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            performed: self.performed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            queued: self.queued(),
        }
    }
}

impl BackgroundTask for CleanupManager {
    fn name(&self) -> &str {
        "cleanup"
    }

    fn run_once(&self) -> Result<()> {
        self.poll();
        Ok(())
    }

    fn poll_interval(&self) -> i64 {
        self.poll_interval.load(Ordering::Relaxed)
    }
}
