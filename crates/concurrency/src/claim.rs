//! Reentrant reader/writer claims on shared resources.
//!
//! A [`SharedResource`] is the lock word embedded in every buffer-pool page.
//! Many readers may hold it at once; a writer excludes everyone else.
//!
//! Callers do not touch the resource directly when they may claim it more
//! than once. They go through a [`ReentrantHolder`], which belongs to one
//! logical owner (a transaction or session, identified by [`OwnerId`]) and
//! counts nested claims so that the underlying resource is acquired once and
//! released once.
//!
//! # Upgrade
//!
//! A nested writer claim on a resource the holder only reads triggers an
//! in-place upgrade. The upgrade never waits: if any other reader is
//! present it fails and the holder's state is left unchanged.
//!
//! # Misuse
//!
//! Releasing a holder that has no outstanding claims panics. Silently
//! ignoring a double release would let another owner write a page this owner
//! still believes it protects.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default time a claim waits before giving up.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity of a logical claim owner.
///
/// Reentrancy is tracked per owner handle, never per OS thread: a
/// transaction that migrates between threads keeps its claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

#[derive(Debug, Default)]
struct ClaimState {
    readers: u32,
    writer: Option<OwnerId>,
}

/// A reader/writer lock word with timeout-bounded acquisition.
///
/// Acquisition returns `false` on timeout and leaves the resource unchanged.
#[derive(Debug, Default)]
pub struct SharedResource {
    state: Mutex<ClaimState>,
    released: Condvar,
}

impl SharedResource {
    /// Create an unclaimed resource.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the resource for `owner`, waiting at most `timeout`.
    pub fn claim(&self, owner: OwnerId, writer: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let available = if writer {
                state.writer.is_none() && state.readers == 0
            } else {
                state.writer.is_none()
            };
            if available {
                if writer {
                    state.writer = Some(owner);
                } else {
                    state.readers += 1;
                }
                return true;
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
    }

    /// Convert the caller's reader claim into a writer claim.
    ///
    /// Succeeds only when the caller is the sole reader. Never waits.
    pub fn upgrade(&self, owner: OwnerId) -> bool {
        let mut state = self.state.lock();
        if state.writer.is_none() && state.readers == 1 {
            state.readers = 0;
            state.writer = Some(owner);
            true
        } else {
            false
        }
    }

    /// Release one claim.
    ///
    /// # Panics
    ///
    /// Panics if the resource is not claimed.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.writer.is_some() {
            state.writer = None;
        } else if state.readers > 0 {
            state.readers -= 1;
        } else {
            panic!("release of a resource that holds no claims");
        }
        drop(state);
        self.released.notify_all();
    }

    /// Whether a writer currently holds the resource.
    pub fn is_writer(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// The owner holding the writer claim, if any.
    pub fn writer(&self) -> Option<OwnerId> {
        self.state.lock().writer
    }

    /// Number of reader claims.
    pub fn reader_count(&self) -> u32 {
        self.state.lock().readers
    }

    /// Whether nobody holds the resource.
    pub fn is_available(&self) -> bool {
        let state = self.state.lock();
        state.writer.is_none() && state.readers == 0
    }
}

/// Per-owner reentrancy counter over one [`SharedResource`].
#[derive(Debug)]
pub struct ReentrantHolder<'a> {
    resource: &'a SharedResource,
    owner: OwnerId,
    count: u32,
}

impl<'a> ReentrantHolder<'a> {
    /// Create a holder for `owner` over `resource`. Holds nothing yet.
    pub fn new(resource: &'a SharedResource, owner: OwnerId) -> Self {
        ReentrantHolder {
            resource,
            owner,
            count: 0,
        }
    }

    /// Claim with the default timeout.
    pub fn claim(&mut self, writer: bool) -> bool {
        self.claim_with_timeout(writer, DEFAULT_CLAIM_TIMEOUT)
    }

    /// Claim, waiting at most `timeout` for the first acquisition.
    ///
    /// Nested claims only bump the count, except a nested writer claim over
    /// a reader hold, which must upgrade.
    pub fn claim_with_timeout(&mut self, writer: bool, timeout: Duration) -> bool {
        if self.count == 0 {
            if !self.resource.claim(self.owner, writer, timeout) {
                return false;
            }
        } else if writer
            && self.resource.writer() != Some(self.owner)
            && !self.resource.upgrade(self.owner)
        {
            return false;
        }
        self.count += 1;
        true
    }

    /// Try to upgrade an existing reader hold without adding a claim.
    pub fn upgrade(&mut self) -> bool {
        self.count > 0 && self.resource.upgrade(self.owner)
    }

    /// Release one claim; the resource is released when the count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics when the holder has no outstanding claims.
    pub fn release(&mut self) {
        if self.count == 0 {
            panic!("owner {:?} holds no claims", self.owner);
        }
        self.count -= 1;
        if self.count == 0 {
            self.resource.release();
        }
    }

    /// Assert that every claim taken through this holder has been released.
    ///
    /// # Panics
    ///
    /// Panics if the count is not zero.
    pub fn verify_released(&self) {
        assert_eq!(
            self.count, 0,
            "owner {:?} still holds {} claims",
            self.owner, self.count
        );
    }

    /// Outstanding claim count.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether this holder's owner holds the writer claim.
    pub fn is_writer(&self) -> bool {
        self.count > 0 && self.resource.writer() == Some(self.owner)
    }
}
