//! Parking and waking of refinement threads.
//!
//! The primary thread (worker 0) is woken by the dirty card queue set when the number of
//! pending cards crosses its activation threshold. Every other thread is woken by its
//! predecessor when that thread finds more work than it can handle alone.

use crossbeam::utils::CachePadded;
use probe::probe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// A counting semaphore.
struct Semaphore {
    permits: Mutex<usize>,
    signalled: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            signalled: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.signalled.notify_one();
    }

    fn wait(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.signalled.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Forget all pending signals.
    fn drain(&self) {
        *self.permits.lock().unwrap() = 0;
    }
}

/// Wakes the primary refinement thread.
///
/// `active` doubles as the notification enable: while it is set, notifications are no-ops.
/// A notification that flips it signals the semaphore, so the primary thread is woken at
/// most once per activation.
pub struct PrimaryNotifier {
    semaphore: Semaphore,
    active: CachePadded<AtomicBool>,
}

impl PrimaryNotifier {
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(),
            active: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Is the primary thread active (or about to be)?
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Wake the primary thread unless it is already active.
    pub fn notify(&self) {
        if !self.active.load(Ordering::Relaxed)
            && self
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            probe!(g1_refine, primary_notified);
            self.semaphore.signal();
        }
    }

    /// Block the primary thread until it is notified.
    pub(crate) fn wait(&self) {
        self.semaphore.wait();
    }

    /// Called by the primary thread when it ran out of work: drop stale signals and
    /// re-enable notification.
    pub(crate) fn reset(&self) {
        self.semaphore.drain();
        self.active.store(false, Ordering::SeqCst);
    }

    /// Called by the primary thread after [`reset`](Self::reset) when it found work again.
    /// Returns false if a concurrent notification won the race. That notification has
    /// signalled the semaphore, so the thread will not stay parked.
    pub(crate) fn try_reactivate(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Wake the primary thread unconditionally, for shutdown.
    pub(crate) fn wake(&self) {
        self.semaphore.signal();
    }
}

impl Default for PrimaryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Wakes one secondary refinement thread.
pub(crate) struct SecondaryNotifier {
    requested_active: Mutex<bool>,
    changed: Condvar,
}

impl SecondaryNotifier {
    pub fn new() -> Self {
        Self {
            requested_active: Mutex::new(false),
            changed: Condvar::new(),
        }
    }

    pub fn activate(&self) {
        let mut requested = self.requested_active.lock().unwrap();
        if !*requested {
            *requested = true;
            self.changed.notify_one();
        }
    }

    /// Block until activation is requested or `should_terminate` is set.
    pub fn wait(&self, should_terminate: &AtomicBool) {
        let mut requested = self.requested_active.lock().unwrap();
        while !*requested && !should_terminate.load(Ordering::Acquire) {
            requested = self.changed.wait(requested).unwrap();
        }
    }

    /// Clear the request. Returns false if activation was requested since the last call, in
    /// which case the thread should check for work once more before going idle.
    pub fn maybe_deactivate(&self) -> bool {
        let mut requested = self.requested_active.lock().unwrap();
        let was_requested = *requested;
        *requested = false;
        !was_requested
    }

    /// Wake the thread for shutdown. `should_terminate` must already be set.
    pub fn wake(&self) {
        let _requested = self.requested_active.lock().unwrap();
        self.changed.notify_all();
    }
}
