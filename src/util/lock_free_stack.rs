//! An intrusive Treiber stack of `u32` node ids.
//!
//! The links live outside the stack, in whatever arena owns the nodes (see [`StackLinks`]).
//! The stack itself is a single atomic word, so every transition is one CAS.
//!
//! `pop` reads the link of the current top before swinging the top to it. That read is only
//! sound against ABA if the top node cannot be popped, recycled and pushed again while we
//! look at it. Callers guarantee that by popping while pinned with [`epoch::pin`] and by only
//! recycling popped nodes after [`synchronize`].

use crossbeam::epoch;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// The "no node" id.
pub const NIL: u32 = u32::MAX;

/// Access to the intrusive `next` link of each node.
pub trait StackLinks {
    fn next(&self, id: u32) -> u32;
    fn set_next(&self, id: u32, next: u32);
}

pub struct LockFreeStack {
    top: AtomicU32,
}

impl LockFreeStack {
    pub const fn new() -> Self {
        Self {
            top: AtomicU32::new(NIL),
        }
    }

    pub fn push(&self, links: &impl StackLinks, id: u32) {
        self.prepend(links, id, id);
    }

    /// Push the chain `first ..= last`, already linked through `next`, in one step.
    pub fn prepend(&self, links: &impl StackLinks, first: u32, last: u32) {
        debug_assert_ne!(first, NIL);
        debug_assert_ne!(last, NIL);
        let mut cur = self.top.load(Ordering::Relaxed);
        loop {
            links.set_next(last, cur);
            match self
                .top
                .compare_exchange_weak(cur, first, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Pop one node. The caller must be pinned.
    pub fn pop(&self, links: &impl StackLinks) -> Option<u32> {
        let mut result = self.top.load(Ordering::Acquire);
        loop {
            if result == NIL {
                return None;
            }
            let next = links.next(result);
            match self
                .top
                .compare_exchange_weak(result, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    links.set_next(result, NIL);
                    return Some(result);
                }
                Err(actual) => result = actual,
            }
        }
    }

    /// Detach the whole stack. The returned chain is linked through `next` and ends with [`NIL`].
    pub fn pop_all(&self) -> u32 {
        self.top.swap(NIL, Ordering::AcqRel)
    }

    pub fn top(&self) -> u32 {
        self.top.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.top() == NIL
    }
}

impl Default for LockFreeStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until every thread that was pinned when this was called has unpinned.
///
/// Afterwards no `pop` that started earlier can still be looking at a node popped before the
/// call, so such nodes may be pushed again. The calling thread must not be pinned.
pub fn synchronize() {
    debug_assert!(!epoch::is_pinned(), "synchronize while pinned would never return");
    let done = Arc::new(AtomicBool::new(false));
    {
        let guard = epoch::pin();
        let done = done.clone();
        guard.defer(move || done.store(true, Ordering::Release));
        guard.flush();
    }
    let backoff = Backoff::new();
    while !done.load(Ordering::Acquire) {
        backoff.snooze();
        // Give the collector a chance to advance the epoch and run our deferred function.
        epoch::pin().flush();
    }
}

/// Iterate over a detached chain. The chain must not be modified while iterating.
pub struct ChainIter<'a, L: StackLinks> {
    links: &'a L,
    cur: u32,
}

impl<'a, L: StackLinks> ChainIter<'a, L> {
    pub fn new(links: &'a L, head: u32) -> Self {
        Self { links, cur: head }
    }
}

impl<L: StackLinks> Iterator for ChainIter<'_, L> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cur == NIL {
            None
        } else {
            let id = self.cur;
            self.cur = self.links.next(id);
            Some(id)
        }
    }
}
