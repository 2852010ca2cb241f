//! Buffers whose refinement was interrupted by a pending safepoint.
//!
//! A partially refined buffer cannot go back onto the completed list right away: a thread
//! popping that list may still be looking at the node as the old top, and pushing it again
//! would be an ABA hazard. Instead it is parked here, in a list tagged with the safepoint id
//! current when it was parked (the "next" safepoint from the parker's point of view).
//! Once that safepoint has begun the list belongs to a previous safepoint and any thread may
//! take it; at a safepoint every list can be taken.

use super::buffer::BufferArena;
use crate::util::lock_free_stack::{synchronize, StackLinks, NIL};
use crossbeam::epoch;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// The head and tail of a detached chain of buffers, or `(NIL, NIL)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct HeadTail {
    pub head: u32,
    pub tail: u32,
}

impl HeadTail {
    pub const EMPTY: HeadTail = HeadTail {
        head: NIL,
        tail: NIL,
    };

    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }
}

struct PausedList {
    head: AtomicU32,
    tail: AtomicU32,
    safepoint_id: u64,
}

impl PausedList {
    fn new(safepoint_id: u64) -> Self {
        Self {
            head: AtomicU32::new(NIL),
            tail: AtomicU32::new(NIL),
            safepoint_id,
        }
    }

    /// Was this list created since the last safepoint began?
    fn is_next(&self, current_safepoint_id: u64) -> bool {
        self.safepoint_id == current_safepoint_id
    }

    fn add(&self, arena: &BufferArena, id: u32) {
        let old_head = self.head.swap(id, Ordering::AcqRel);
        arena.set_next(id, old_head);
        if old_head == NIL {
            debug_assert_eq!(self.tail.load(Ordering::Relaxed), NIL);
            self.tail.store(id, Ordering::Relaxed);
        }
    }

    fn take(&self) -> HeadTail {
        let head = self.head.swap(NIL, Ordering::AcqRel);
        let tail = self.tail.swap(NIL, Ordering::Relaxed);
        HeadTail { head, tail }
    }
}

pub(crate) struct PausedBuffers {
    plist: AtomicPtr<PausedList>,
}

impl PausedBuffers {
    pub fn new() -> Self {
        Self {
            plist: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plist.load(Ordering::Acquire).is_null()
    }

    /// Park `id` until the next safepoint has begun. Not at a safepoint.
    pub fn add(&self, arena: &BufferArena, id: u32, current_safepoint_id: u64) {
        let mut plist = self.plist.load(Ordering::Acquire);
        if plist.is_null() {
            // Try to install a new list for the next safepoint.
            let new_plist = Box::into_raw(Box::new(PausedList::new(current_safepoint_id)));
            match self.plist.compare_exchange(
                std::ptr::null_mut(),
                new_plist,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => plist = new_plist,
                Err(installed) => {
                    // Some other thread installed one first.
                    drop(unsafe { Box::from_raw(new_plist) });
                    plist = installed;
                }
            }
        }
        // SAFETY: a list is only freed after it stopped being "next", which needs a safepoint
        // to begin, and the caller is not at or past one.
        let plist = unsafe { &*plist };
        debug_assert!(
            plist.is_next(current_safepoint_id),
            "paused list from an earlier safepoint was not taken"
        );
        plist.add(arena, id);
    }

    /// Take the buffers paused before the latest safepoint began, if any. Not at a safepoint.
    pub fn take_previous(&self, current_safepoint_id: u64) -> HeadTail {
        let previous = {
            // Examine the list while pinned so a concurrent taker cannot free it under us.
            let _guard = epoch::pin();
            let previous = self.plist.load(Ordering::Acquire);
            if previous.is_null() {
                return HeadTail::EMPTY;
            }
            // SAFETY: freed only after a `synchronize` following its removal.
            if unsafe { &*previous }.is_next(current_safepoint_id) {
                return HeadTail::EMPTY;
            }
            if self
                .plist
                .compare_exchange(
                    previous,
                    std::ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                // Someone else took it.
                return HeadTail::EMPTY;
            }
            previous
        };
        // We own `previous` now.
        let result = unsafe { &*previous }.take();
        // Other takers may still be examining it.
        synchronize();
        drop(unsafe { Box::from_raw(previous) });
        result
    }

    /// Take every paused buffer. Only at a safepoint.
    pub fn take_all(&self) -> HeadTail {
        let plist = self.plist.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if plist.is_null() {
            return HeadTail::EMPTY;
        }
        // SAFETY: at a safepoint there are no concurrent users of the list.
        let plist = unsafe { Box::from_raw(plist) };
        plist.take()
    }

    /// Visit the paused buffers without taking them. Only at a safepoint.
    pub fn for_each(&self, arena: &BufferArena, mut f: impl FnMut(u32)) {
        let plist = self.plist.load(Ordering::Acquire);
        if plist.is_null() {
            return;
        }
        // SAFETY: at a safepoint there are no concurrent users of the list.
        let mut cur = unsafe { &*plist }.head.load(Ordering::Acquire);
        while cur != NIL {
            let next = arena.next(cur);
            f(cur);
            cur = next;
        }
    }
}

impl Drop for PausedBuffers {
    fn drop(&mut self) {
        let plist = *self.plist.get_mut();
        if !plist.is_null() {
            drop(unsafe { Box::from_raw(plist) });
        }
    }
}
