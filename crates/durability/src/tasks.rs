//! Background tasks of the journal.
//!
//! The flusher forces buffered records every flush interval so that group
//! commits complete. The copier writes certified page images back to their
//! volumes, polling faster as its urgency grows.
//!
//! Both tasks hold a weak reference to the journal and stop once it is
//! dropped, so the runners never keep the journal alive.

use crate::journal::JournalManager;
use std::sync::{Arc, Weak};
use tessera_concurrency::{BackgroundTask, RunnerStats, TaskError, TaskRunner};
use tessera_core::Result;

/// Forces the journal periodically.
pub struct JournalFlusher {
    journal: Weak<JournalManager>,
}

impl JournalFlusher {
    /// Create a flusher for `journal`.
    pub fn new(journal: &Arc<JournalManager>) -> Arc<Self> {
        Arc::new(JournalFlusher {
            journal: Arc::downgrade(journal),
        })
    }
}

impl BackgroundTask for JournalFlusher {
    fn name(&self) -> &str {
        "journal-flusher"
    }

    fn run_once(&self) -> Result<()> {
        match self.journal.upgrade() {
            Some(journal) => journal.flusher_cycle(),
            None => Ok(()),
        }
    }

    fn should_stop(&self) -> bool {
        self.journal
            .upgrade()
            .map(|j| j.is_closed())
            .unwrap_or(true)
    }

    fn poll_interval(&self) -> i64 {
        self.journal
            .upgrade()
            .map(|j| j.flush_interval_ms() as i64)
            .unwrap_or(-1)
    }
}

/// Copies certified page images to their volumes.
pub struct JournalCopier {
    journal: Weak<JournalManager>,
}

impl JournalCopier {
    /// Create a copier for `journal`.
    pub fn new(journal: &Arc<JournalManager>) -> Arc<Self> {
        Arc::new(JournalCopier {
            journal: Arc::downgrade(journal),
        })
    }
}

impl BackgroundTask for JournalCopier {
    fn name(&self) -> &str {
        "journal-copier"
    }

    fn run_once(&self) -> Result<()> {
        match self.journal.upgrade() {
            Some(journal) => journal.copier_cycle(),
            None => Ok(()),
        }
    }

    fn should_stop(&self) -> bool {
        self.journal
            .upgrade()
            .map(|j| j.is_closed())
            .unwrap_or(true)
    }

    fn poll_interval(&self) -> i64 {
        self.journal
            .upgrade()
            .map(|j| j.copier_poll_interval())
            .unwrap_or(-1)
    }
}

/// The running flusher and copier of one journal.
pub struct JournalTasks {
    flusher: TaskRunner,
    copier: TaskRunner,
}

impl JournalTasks {
    /// Start both tasks.
    pub fn start(journal: &Arc<JournalManager>) -> Result<Self> {
        let flusher = TaskRunner::start(JournalFlusher::new(journal))?;
        let copier = TaskRunner::start(JournalCopier::new(journal))?;
        Ok(JournalTasks { flusher, copier })
    }

    /// Wake the copier early.
    pub fn kick_copier(&self) {
        self.copier.kick();
    }

    /// Wake the flusher early.
    pub fn kick_flusher(&self) {
        self.flusher.kick();
    }

    /// Stop both tasks after their current cycles.
    pub fn stop(&self) {
        self.copier.stop();
        self.flusher.stop();
    }

    /// Abandon both tasks.
    pub fn crash(&self) {
        self.copier.crash();
        self.flusher.crash();
    }

    /// Most recent distinct flusher failure.
    pub fn flusher_error(&self) -> Option<TaskError> {
        self.flusher.last_error()
    }

    /// Most recent distinct copier failure.
    pub fn copier_error(&self) -> Option<TaskError> {
        self.copier.last_error()
    }

    /// Runner metrics as (flusher, copier).
    pub fn stats(&self) -> (RunnerStats, RunnerStats) {
        (self.flusher.stats(), self.copier.stats())
    }
}
