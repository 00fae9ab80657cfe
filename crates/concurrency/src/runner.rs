//! Generic poll-or-kick background worker.
//!
//! Every background service (journal flusher, page copier, checkpoint
//! scheduler, cleanup manager) is a [`BackgroundTask`] driven by one
//! [`TaskRunner`]. The runner owns the thread and the loop; the task owns the
//! work and decides its own poll interval each cycle.
//!
//! # Loop
//!
//! ```text
//! loop {
//!     run_once()            errors recorded; a panic is recorded and ends the thread
//!     if stopping: exit
//!     wait until kicked, or until poll_interval ms after the cycle started
//!     (negative interval: wait until kicked)
//! }
//! ```
//!
//! # Error recording
//!
//! Every failure increments the error count. The failure is logged only
//! when its kind differs from the previously recorded one, so a task that
//! fails the same way every cycle does not flood the log.
//!
//! A panic is an invariant violation, not a task failure. It is recorded
//! under the kind `"Panic"` so it shows up in [`RunnerStats`], then the
//! unwind continues and the worker thread dies.
//!
//! # Crash
//!
//! [`TaskRunner::crash`] models a process dying: the loop exits at its next
//! check without running the task again, and the owner is expected to skip
//! every piece of graceful shutdown work.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tessera_core::{Error, Result};
use tracing::{debug, error, warn};

/// The unit of work a [`TaskRunner`] drives.
pub trait BackgroundTask: Send + Sync + 'static {
    /// Thread name suffix and log label.
    fn name(&self) -> &str;

    /// Perform one cycle of work.
    fn run_once(&self) -> Result<()>;

    /// Task-specific stop predicate, checked once per cycle in addition to
    /// the runner's own stop flag.
    fn should_stop(&self) -> bool {
        false
    }

    /// Milliseconds between cycles. Negative: wait until kicked.
    fn poll_interval(&self) -> i64;
}

/// The most recent distinct failure of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    /// Error kind (`Error::kind`), or `"Panic"`
    pub kind: &'static str,
    /// Rendered message
    pub message: String,
    /// Cycle number in which it happened
    pub cycle: u64,
}

/// Runner metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct RunnerStats {
    /// Completed cycles
    pub cycles: u64,
    /// Failed cycles, including repeats of the same kind
    pub error_count: u64,
    /// Most recent distinct failure
    pub last_error: Option<TaskError>,
    /// Whether the worker thread is still looping
    pub running: bool,
}

#[derive(Debug, Default)]
struct Signal {
    notified: bool,
    stop: bool,
    crashed: bool,
}

struct RunnerShared {
    task: Arc<dyn BackgroundTask>,
    signal: Mutex<Signal>,
    wake: Condvar,
    last_error: Mutex<Option<TaskError>>,
    error_count: AtomicU64,
    cycles: AtomicU64,
    running: AtomicBool,
}

impl RunnerShared {
    fn stopping(&self, signal: &Signal) -> bool {
        signal.stop || signal.crashed || self.task.should_stop()
    }

    /// Record a failure. Returns true when its kind is new.
    fn record_error(&self, kind: &'static str, message: String) -> bool {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let cycle = self.cycles.load(Ordering::Relaxed);
        let mut last = self.last_error.lock();
        let is_new = last.as_ref().map(|e| e.kind != kind).unwrap_or(true);
        *last = Some(TaskError {
            kind,
            message,
            cycle,
        });
        is_new
    }
}

/// Drives one [`BackgroundTask`] on a dedicated thread.
pub struct TaskRunner {
    shared: Arc<RunnerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    /// Spawn a worker thread named `tessera-<task name>` and start looping.
    pub fn start<T: BackgroundTask>(task: Arc<T>) -> Result<Self> {
        let shared = Arc::new(RunnerShared {
            task,
            signal: Mutex::new(Signal::default()),
            wake: Condvar::new(),
            last_error: Mutex::new(None),
            error_count: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            running: AtomicBool::new(true),
        });

        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("tessera-{}", shared.task.name()))
            .spawn(move || worker_loop(&worker))
            .map_err(Error::Io)?;

        Ok(TaskRunner {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Wake the worker early.
    ///
    /// Kicks coalesce: several kicks before the worker wakes cause one cycle.
    pub fn kick(&self) {
        let mut signal = self.shared.signal.lock();
        if !signal.notified {
            signal.notified = true;
            self.shared.wake.notify_one();
        }
    }

    /// Ask the loop to exit after its current cycle and wait for the thread.
    pub fn stop(&self) {
        {
            let mut signal = self.shared.signal.lock();
            signal.stop = true;
            self.shared.wake.notify_all();
        }
        self.join();
    }

    /// Abandon the worker as if the process died.
    ///
    /// The task is not run again and no shutdown hook executes.
    pub fn crash(&self) {
        {
            let mut signal = self.shared.signal.lock();
            signal.crashed = true;
            self.shared.wake.notify_all();
        }
        self.join();
    }

    fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            // A task may drop the last owner of its runner from inside run_once.
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(
                    target: "tessera::task",
                    task = self.shared.task.name(),
                    "worker thread terminated abnormally"
                );
            }
        }
    }

    /// Whether [`crash`](Self::crash) was called.
    pub fn is_crashed(&self) -> bool {
        self.shared.signal.lock().crashed
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Most recent distinct failure.
    pub fn last_error(&self) -> Option<TaskError> {
        self.shared.last_error.lock().clone()
    }

    /// Total failed cycles.
    pub fn error_count(&self) -> u64 {
        self.shared.error_count.load(Ordering::Relaxed)
    }

    /// Snapshot of runner metrics.
    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            cycles: self.shared.cycles.load(Ordering::Relaxed),
            error_count: self.error_count(),
            last_error: self.last_error(),
            running: self.is_running(),
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        if self.handle.lock().is_some() {
            self.stop();
        }
    }
}

fn worker_loop(shared: &RunnerShared) {
    loop {
        {
            let mut signal = shared.signal.lock();
            signal.notified = false;
            if signal.crashed {
                break;
            }
        }

        let cycle_start = Instant::now();
        let task = Arc::clone(&shared.task);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run_once()));
        shared.cycles.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if shared.record_error(e.kind(), e.to_string()) {
                    warn!(target: "tessera::task", task = task.name(), error = %e, "background task failed");
                } else {
                    debug!(target: "tessera::task", task = task.name(), error = %e, "background task failed again");
                }
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "(non-string panic)".to_string());
                shared.record_error("Panic", message.clone());
                error!(target: "tessera::task", task = task.name(), panic = %message, "background task panicked");
                shared.running.store(false, Ordering::Release);
                std::panic::resume_unwind(panic);
            }
        }

        let mut signal = shared.signal.lock();
        if shared.stopping(&signal) {
            break;
        }
        loop {
            if signal.notified || shared.stopping(&signal) {
                break;
            }
            let interval = task.poll_interval();
            if interval < 0 {
                shared.wake.wait(&mut signal);
                continue;
            }
            let deadline = cycle_start + Duration::from_millis(interval as u64);
            if Instant::now() >= deadline {
                break;
            }
            // Re-read the interval after every wake: tasks may shorten it.
            shared.wake.wait_until(&mut signal, deadline);
        }
        if shared.stopping(&signal) {
            break;
        }
    }
    shared.running.store(false, Ordering::Release);
}
