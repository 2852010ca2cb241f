//! Safepoint bookkeeping and the suspendible thread set.
//!
//! Concurrent threads that must stop for a pause (refinement threads) join the
//! [`SuspendibleThreadSet`]. A pause first [`synchronizes`](SuspendibleThreadSet::synchronize)
//! the set, which returns once every joined thread has either left or parked itself in
//! [`yield_now`](SuspendibleThreadSet::yield_now). Joined threads poll
//! [`should_yield`](SuspendibleThreadSet::should_yield) at a fine granularity, so the wait is
//! bounded by the time it takes to refine one card.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

/// A cooperative cancellation token polled by long-running refinement loops.
pub trait YieldPoint {
    /// Return true if the caller should stop what it is doing and yield as soon as possible.
    fn should_yield(&self) -> bool;
}

/// A yield point that never asks to yield. Used by mutators and inside pauses.
pub struct NeverYield;

impl YieldPoint for NeverYield {
    fn should_yield(&self) -> bool {
        false
    }
}

struct StsSync {
    /// Threads currently joined.
    nthreads: usize,
    /// Joined threads parked in `yield_now`.
    nthreads_stopped: usize,
}

pub struct SuspendibleThreadSet {
    sync: Mutex<StsSync>,
    /// Mirrors the synchronize request so joined threads can poll it without the lock.
    suspend_all: AtomicBool,
    /// Notified when a thread joins, leaves or stops, and when a synchronization ends.
    changed: Condvar,
}

impl SuspendibleThreadSet {
    pub fn new() -> Self {
        Self {
            sync: Mutex::new(StsSync {
                nthreads: 0,
                nthreads_stopped: 0,
            }),
            suspend_all: AtomicBool::new(false),
            changed: Condvar::new(),
        }
    }

    /// Join the set, waiting out a synchronization in progress. The thread leaves when the
    /// returned guard is dropped.
    pub fn join(&self) -> SuspendibleThreadSetJoiner<'_> {
        let mut sync = self.sync.lock().unwrap();
        while self.suspend_all.load(Ordering::Relaxed) {
            sync = self.changed.wait(sync).unwrap();
        }
        sync.nthreads += 1;
        SuspendibleThreadSetJoiner { sts: self }
    }

    fn leave(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.nthreads > 0, "invalid leave");
        sync.nthreads -= 1;
        if self.suspend_all.load(Ordering::Relaxed) && sync.nthreads == sync.nthreads_stopped {
            self.changed.notify_all();
        }
    }

    #[inline(always)]
    pub fn should_yield(&self) -> bool {
        self.suspend_all.load(Ordering::Acquire)
    }

    /// Park the calling (joined) thread until the current synchronization ends.
    /// Returns immediately if none is in progress.
    pub fn yield_now(&self) {
        let mut sync = self.sync.lock().unwrap();
        if !self.suspend_all.load(Ordering::Relaxed) {
            return;
        }
        sync.nthreads_stopped += 1;
        if sync.nthreads_stopped == sync.nthreads {
            self.changed.notify_all();
        }
        while self.suspend_all.load(Ordering::Relaxed) {
            sync = self.changed.wait(sync).unwrap();
        }
        debug_assert!(sync.nthreads_stopped > 0);
        sync.nthreads_stopped -= 1;
    }

    /// Ask every joined thread to yield, and wait until all of them did.
    /// Must not be called by a joined thread.
    pub fn synchronize(&self) {
        let mut sync = self.sync.lock().unwrap();
        let was_suspended = self.suspend_all.swap(true, Ordering::AcqRel);
        debug_assert!(!was_suspended, "nested synchronize");
        while sync.nthreads_stopped < sync.nthreads {
            sync = self.changed.wait(sync).unwrap();
        }
    }

    /// Let the yielded threads resume.
    pub fn desynchronize(&self) {
        let _sync = self.sync.lock().unwrap();
        let was_suspended = self.suspend_all.swap(false, Ordering::AcqRel);
        debug_assert!(was_suspended, "desynchronize without synchronize");
        self.changed.notify_all();
    }

    pub fn joined_threads(&self) -> usize {
        self.sync.lock().unwrap().nthreads
    }
}

impl Default for SuspendibleThreadSet {
    fn default() -> Self {
        Self::new()
    }
}

impl YieldPoint for SuspendibleThreadSet {
    fn should_yield(&self) -> bool {
        SuspendibleThreadSet::should_yield(self)
    }
}

/// Membership of a thread in a [`SuspendibleThreadSet`].
#[must_use]
pub struct SuspendibleThreadSetJoiner<'a> {
    sts: &'a SuspendibleThreadSet,
}

impl SuspendibleThreadSetJoiner<'_> {
    pub fn should_yield(&self) -> bool {
        self.sts.should_yield()
    }

    pub fn yield_now(&self) {
        self.sts.yield_now()
    }
}

impl Drop for SuspendibleThreadSetJoiner<'_> {
    fn drop(&mut self) {
        self.sts.leave();
    }
}

/// The safepoint generation counter.
///
/// `safepoint_id` grows by one each time a safepoint begins. Work tagged with the current id
/// was recorded since the last safepoint, i.e. it is waiting for the next one.
pub struct Safepoint {
    safepoint_id: AtomicU64,
    at_safepoint: AtomicBool,
    sts: SuspendibleThreadSet,
}

impl Safepoint {
    pub fn new() -> Self {
        Self {
            safepoint_id: AtomicU64::new(0),
            at_safepoint: AtomicBool::new(false),
            sts: SuspendibleThreadSet::new(),
        }
    }

    pub fn sts(&self) -> &SuspendibleThreadSet {
        &self.sts
    }

    pub fn safepoint_id(&self) -> u64 {
        self.safepoint_id.load(Ordering::Acquire)
    }

    pub fn is_at_safepoint(&self) -> bool {
        self.at_safepoint.load(Ordering::Acquire)
    }

    /// Stop the suspendible threads and enter a new safepoint generation.
    /// The caller is responsible for having stopped its mutators.
    pub fn begin(&self) {
        self.sts.synchronize();
        let was_at = self.at_safepoint.swap(true, Ordering::AcqRel);
        debug_assert!(!was_at, "nested safepoint");
        let id = self.safepoint_id.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Safepoint {} begins", id);
    }

    pub fn end(&self) {
        let was_at = self.at_safepoint.swap(false, Ordering::AcqRel);
        debug_assert!(was_at, "not at a safepoint");
        debug!("Safepoint {} ends", self.safepoint_id());
        self.sts.desynchronize();
    }
}

impl Default for Safepoint {
    fn default() -> Self {
        Self::new()
    }
}
