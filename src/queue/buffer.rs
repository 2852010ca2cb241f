//! Log buffers and their allocator.
//!
//! Buffers live in a segmented arena and are named by `u32` ids. A [`BufferHandle`] is the
//! move-only proof of ownership of one buffer: whoever holds it may read and write the
//! buffer's entries, and it is consumed when the buffer is released to the allocator or
//! published on a list. Lists store bare ids; turning an id popped from a list back into a
//! handle is crate-private.
//!
//! Released buffers first go to a pending list. They reach the free list only after every
//! thread pinned at the time of the transfer has unpinned (see [`synchronize`]), so a
//! concurrent `pop` that is still looking at a node can never see it reappear at the top of
//! a stack (the ABA problem).

use crate::util::lock_free_stack::{synchronize, ChainIter, LockFreeStack, StackLinks, NIL};
use crate::util::rust_util::atomic_box::OnceOptionBox;
use atomic::Atomic;
use bytemuck::NoUninit;
use crossbeam::epoch;
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

const LOG_NODES_IN_SEGMENT: u32 = 6;
const NODES_IN_SEGMENT: u32 = 1 << LOG_NODES_IN_SEGMENT;
const LOG_MAX_SEGMENTS: u32 = 14;
const MAX_SEGMENTS: usize = 1 << LOG_MAX_SEGMENTS;
/// Upper bound on the number of buffers one allocator can hand out.
pub const MAX_BUFFERS: usize = MAX_SEGMENTS << LOG_NODES_IN_SEGMENT;

const_assert!(MAX_BUFFERS < NIL as usize);

/// Which structure currently owns a buffer. Tracked only in debug builds.
#[repr(u8)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, NoUninit, strum_macros::Display, strum_macros::EnumIter,
)]
pub enum NodeState {
    /// On the allocator's free list, or never handed out.
    Free,
    /// Released, waiting on the pending list.
    Pending,
    /// Held through a [`BufferHandle`]: a thread-local queue or a refining thread.
    Owned,
    /// On a queue set's completed list.
    Completed,
    /// On the paused list of a dirty card queue set.
    Paused,
}

pub(crate) struct BufferNode {
    next: AtomicU32,
    index: AtomicUsize,
    entries: UnsafeCell<Box<[usize]>>,
    #[cfg(debug_assertions)]
    state: Atomic<NodeState>,
}

// Entries are only accessed through a `BufferHandle`, which is unique per node.
unsafe impl Sync for BufferNode {}

impl BufferNode {
    fn new(capacity: usize) -> Self {
        Self {
            next: AtomicU32::new(NIL),
            index: AtomicUsize::new(capacity),
            entries: UnsafeCell::new(vec![0usize; capacity].into_boxed_slice()),
            #[cfg(debug_assertions)]
            state: Atomic::new(NodeState::Free),
        }
    }

    #[inline(always)]
    fn set_state(&self, _expected: NodeState, _new: NodeState) {
        #[cfg(debug_assertions)]
        {
            let old = self.state.swap(_new, Ordering::AcqRel);
            assert_eq!(
                old, _expected,
                "buffer ownership violated: moving to {} from {}, expected {}",
                _new, old, _expected
            );
        }
    }

    #[cfg(debug_assertions)]
    fn state(&self) -> NodeState {
        self.state.load(Ordering::Acquire)
    }
}

struct Segment {
    nodes: Box<[BufferNode]>,
}

/// Backing store of all buffers of one allocator.
pub(crate) struct BufferArena {
    buffer_size: usize,
    segments: Box<[OnceOptionBox<Segment>]>,
    /// Ids below this have been handed out at least once.
    next_fresh: AtomicUsize,
}

impl BufferArena {
    fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            segments: (0..MAX_SEGMENTS).map(|_| OnceOptionBox::new()).collect(),
            next_fresh: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    pub(crate) fn node(&self, id: u32) -> &BufferNode {
        let segment = self.segments[(id >> LOG_NODES_IN_SEGMENT) as usize]
            .get(Ordering::Acquire)
            .unwrap_or_else(|| panic!("buffer {} was never allocated", id));
        &segment.nodes[(id & (NODES_IN_SEGMENT - 1)) as usize]
    }

    fn allocate_fresh(&self, allocator_name: &str) -> u32 {
        let id = self.next_fresh.fetch_add(1, Ordering::Relaxed);
        if id >= MAX_BUFFERS {
            error!(
                "{} buffer allocator exhausted all {} buffers",
                allocator_name, MAX_BUFFERS
            );
            panic!("Out of memory allocating a {} log buffer", allocator_name);
        }
        let buffer_size = self.buffer_size;
        self.segments[id >> LOG_NODES_IN_SEGMENT].get_or_init(
            Ordering::Acquire,
            Ordering::AcqRel,
            || Segment {
                nodes: (0..NODES_IN_SEGMENT)
                    .map(|_| BufferNode::new(buffer_size))
                    .collect(),
            },
        );
        id as u32
    }

    fn allocated(&self) -> usize {
        self.next_fresh.load(Ordering::Relaxed).min(MAX_BUFFERS)
    }
}

impl StackLinks for BufferArena {
    #[inline(always)]
    fn next(&self, id: u32) -> u32 {
        self.node(id).next.load(Ordering::Relaxed)
    }
    #[inline(always)]
    fn set_next(&self, id: u32, next: u32) {
        self.node(id).next.store(next, Ordering::Relaxed)
    }
}

/// Exclusive ownership of one log buffer.
///
/// A handle must end in [`BufferAllocator::release`] or on a queue set's list. Dropping it
/// loses the buffer and whatever entries it logged; debug builds treat that as a bug.
#[must_use]
pub struct BufferHandle {
    id: u32,
}

impl BufferHandle {
    /// # Safety (logical)
    /// The caller must own the node: it was just allocated or just popped from a list.
    pub(crate) fn from_id(id: u32) -> Self {
        debug_assert_ne!(id, NIL);
        Self { id }
    }

    pub(crate) fn into_id(self) -> u32 {
        let id = self.id;
        std::mem::forget(self);
        id
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(false, "buffer {} dropped without being released", self.id);
        }
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferHandle({})", self.id)
    }
}

/// A detached chain of buffers with the number of entries they hold.
#[must_use]
#[derive(Debug)]
pub struct BufferNodeList {
    pub(crate) head: u32,
    pub(crate) tail: u32,
    pub(crate) entry_count: usize,
}

impl BufferNodeList {
    pub(crate) const fn empty() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            entry_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

/// A lock-free allocator of fixed-capacity log buffers.
pub struct BufferAllocator {
    name: &'static str,
    arena: BufferArena,
    free_list: LockFreeStack,
    pending_list: LockFreeStack,
    free_count: CachePadded<AtomicUsize>,
    pending_count: CachePadded<AtomicUsize>,
    transfer_lock: AtomicBool,
}

impl BufferAllocator {
    pub fn new(name: &'static str, buffer_size: usize) -> Self {
        assert!(buffer_size > 0);
        Self {
            name,
            arena: BufferArena::new(buffer_size),
            free_list: LockFreeStack::new(),
            pending_list: LockFreeStack::new(),
            free_count: CachePadded::new(AtomicUsize::new(0)),
            pending_count: CachePadded::new(AtomicUsize::new(0)),
            transfer_lock: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Capacity of every buffer, in entries.
    pub fn buffer_size(&self) -> usize {
        self.arena.buffer_size
    }

    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::Relaxed)
    }

    /// Number of distinct buffers ever handed out by this allocator.
    pub fn allocated_count(&self) -> usize {
        self.arena.allocated()
    }

    pub(crate) fn arena(&self) -> &BufferArena {
        &self.arena
    }

    /// Get a buffer, from the free list if possible. Its index is reset to the capacity
    /// (empty). Running out of buffers is fatal.
    pub fn allocate(&self) -> BufferHandle {
        let id = {
            let _guard = epoch::pin();
            self.free_list.pop(&self.arena)
        };
        let id = match id {
            Some(id) => {
                // Decrement after the pop, matching the increment before the push,
                // so the count never underflows.
                self.free_count.fetch_sub(1, Ordering::Relaxed);
                self.arena.node(id).set_state(NodeState::Free, NodeState::Owned);
                id
            }
            None => {
                let id = self.arena.allocate_fresh(self.name);
                self.arena.node(id).set_state(NodeState::Free, NodeState::Owned);
                id
            }
        };
        let node = self.arena.node(id);
        node.index.store(self.buffer_size(), Ordering::Relaxed);
        BufferHandle::from_id(id)
    }

    /// Return a buffer. It becomes reusable after the next pending transfer.
    pub fn release(&self, node: BufferHandle) {
        let id = node.into_id();
        let n = self.arena.node(id);
        n.set_state(NodeState::Owned, NodeState::Pending);
        n.next.store(NIL, Ordering::Relaxed);
        // Increment before pushing so a transfer never drives the count below zero.
        let pending = self.pending_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending_list.push(&self.arena, id);
        if pending > crate::util::constants::TRANSFER_PENDING_THRESHOLD {
            self.try_transfer_pending();
        }
    }

    /// Move the pending list to the free list, unless another thread is already doing so.
    /// Returns false if the transfer was skipped.
    pub fn try_transfer_pending(&self) -> bool {
        if self.transfer_lock.load(Ordering::Relaxed)
            || self
                .transfer_lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return false;
        }

        let first = self.pending_list.pop_all();
        if first != NIL {
            let mut last = first;
            let mut count = 1;
            for id in ChainIter::new(&self.arena, first).skip(1) {
                last = id;
                count += 1;
            }
            self.pending_count.fetch_sub(count, Ordering::Relaxed);

            // Wait for any in-progress pops, to avoid ABA for them.
            synchronize();

            for id in ChainIter::new(&self.arena, first) {
                self.arena
                    .node(id)
                    .set_state(NodeState::Pending, NodeState::Free);
            }
            // Increment before the push, so allocate never underflows the count.
            self.free_count.fetch_add(count, Ordering::Relaxed);
            self.free_list.prepend(&self.arena, first, last);
            trace!(
                "{} allocator: transferred {} buffers to the free list",
                self.name,
                count
            );
        }

        self.transfer_lock.store(false, Ordering::Release);
        true
    }

    /// The current fill index of a buffer (entries live in `index..capacity`).
    pub fn index(&self, node: &BufferHandle) -> usize {
        self.arena.node(node.id).index.load(Ordering::Relaxed)
    }

    pub fn set_index(&self, node: &BufferHandle, index: usize) {
        debug_assert!(index <= self.buffer_size());
        self.arena.node(node.id).index.store(index, Ordering::Relaxed)
    }

    /// Number of entries a buffer holds, judging by its stored index.
    pub fn entry_count(&self, node: &BufferHandle) -> usize {
        self.entry_count_of(node.id)
    }

    /// Like [`entry_count`](Self::entry_count), for a node sitting on a list.
    pub(crate) fn entry_count_of(&self, id: u32) -> usize {
        self.buffer_size() - self.arena.node(id).index.load(Ordering::Relaxed)
    }

    /// The whole entry array of a buffer.
    pub fn entries_mut<'a>(&'a self, node: &'a mut BufferHandle) -> &'a mut [usize] {
        let n = self.arena.node(node.id);
        // SAFETY: `node` is the unique handle of this buffer and is mutably borrowed for 'a.
        unsafe { &mut *n.entries.get() }
    }

    pub fn entries<'a>(&'a self, node: &'a BufferHandle) -> &'a [usize] {
        let n = self.arena.node(node.id);
        // SAFETY: only the handle holder writes, and the handle is borrowed for 'a.
        unsafe { &*n.entries.get() }
    }

    /// The logged entries of a buffer, `entries[index..]`.
    pub fn logged_entries<'a>(&'a self, node: &'a BufferHandle) -> &'a [usize] {
        let index = self.index(node);
        &self.entries(node)[index..]
    }

    /// Mark an owned node as pushed on a completed list.
    pub(crate) fn publish(&self, node: BufferHandle, state: NodeState) -> u32 {
        let id = node.into_id();
        self.arena.node(id).set_state(NodeState::Owned, state);
        id
    }

    /// Take ownership of a node popped from a completed or paused list.
    pub(crate) fn adopt(&self, id: u32, state: NodeState) -> BufferHandle {
        self.arena.node(id).set_state(state, NodeState::Owned);
        BufferHandle::from_id(id)
    }

    /// Move a detached chain between list kinds (debug bookkeeping only).
    pub(crate) fn retag_chain(&self, head: u32, _from: NodeState, _to: NodeState) {
        #[cfg(debug_assertions)]
        for id in ChainIter::new(&self.arena, head) {
            self.arena.node(id).set_state(_from, _to);
        }
        let _ = head;
    }

    /// Release every node of a detached chain that sits in state `from`.
    pub(crate) fn release_chain(&self, head: u32, from: NodeState) -> usize {
        let mut released = 0;
        let mut cur = head;
        while cur != NIL {
            let next = self.arena.next(cur);
            self.arena.set_next(cur, NIL);
            self.release(self.adopt(cur, from));
            released += 1;
            cur = next;
        }
        released
    }

    /// Count nodes per ownership state, with an entry for every state. Debug builds only.
    #[cfg(debug_assertions)]
    pub fn debug_state_census(&self) -> std::collections::HashMap<NodeState, usize> {
        use strum::IntoEnumIterator;
        let mut census: std::collections::HashMap<NodeState, usize> =
            NodeState::iter().map(|state| (state, 0)).collect();
        for id in 0..self.allocated_count() as u32 {
            *census.entry(self.arena.node(id).state()).or_insert(0) += 1;
        }
        census
    }
}
