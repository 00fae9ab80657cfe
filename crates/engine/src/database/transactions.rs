//! Transaction retry configuration and the closure transaction API

use std::sync::Arc;
use std::time::Duration;

use tessera_core::{Error, Result};
use tracing::debug;

use super::Database;
use crate::transaction::Transaction;

// ============================================================================
// Retry Configuration
// ============================================================================

/// Configuration for transaction retry behavior
///
/// Transactions that fail with a write-write conflict or a claim timeout
/// are rolled back and may be run again from the start.
///
/// # Example
/// ```ignore
/// let config = RetryConfig::new().with_max_retries(5);
/// db.transaction_with_retry(config, |txn| { ... })?;
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: usize,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Calculate delay for a given attempt (exponential backoff)
    pub(crate) fn calculate_delay(&self, attempt: usize) -> Duration {
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

// ============================================================================
// Closure API
// ============================================================================

impl Database {
    /// Run `f` in a new transaction.
    ///
    /// Commits when `f` returns `Ok` and rolls back when it returns `Err`.
    /// The commit policy is the database default.
    ///
    /// ```text
    /// let n = db.transaction(|txn| {
    ///     txn.store(tree, b"k", b"v")?;
    ///     Ok(1)
    /// })?;
    /// ```
    pub fn transaction<F, T>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut txn = self.begin()?;
        let result = f(&mut txn);
        run_single_attempt(txn, result)
    }

    /// Like [`transaction`](Self::transaction), but runs `f` again when the
    /// attempt fails with a retryable error.
    pub fn transaction_with_retry<F, T>(self: &Arc<Self>, config: RetryConfig, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Transaction) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let mut txn = self.begin()?;
            let result = f(&mut txn);
            match run_single_attempt(txn, result) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < config.max_retries => {
                    debug!(target: "tessera::txn", attempt, error = %e, "retrying transaction");
                    std::thread::sleep(config.calculate_delay(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Commit on success, roll back on error.
fn run_single_attempt<T>(mut txn: Transaction, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            if txn.is_active() {
                txn.commit()?;
            }
            Ok(value)
        }
        Err(e) => {
            if txn.is_active() {
                if let Err(rollback) = txn.rollback() {
                    return Err(rollback_failed(e, rollback));
                }
            }
            Err(e)
        }
    }
}

fn rollback_failed(cause: Error, rollback: Error) -> Error {
    match rollback {
        Error::Closed => Error::Closed,
        other => Error::Rollback(format!("{} (while handling: {})", other, cause)),
    }
}
