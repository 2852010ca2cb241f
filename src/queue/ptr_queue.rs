//! The per-thread append-only log and the queue set operations shared by the SATB and
//! dirty card queues.

use super::buffer::{BufferAllocator, BufferHandle};
use crate::util::rust_util::unlikely;

/// A thread-local log. It holds at most one buffer, which is filled from the end toward
/// index zero.
///
/// An index of zero means "no room": either the buffer is full or there is no buffer yet.
/// Either way the owning queue set's slow path takes over.
pub struct PtrQueue {
    pub(crate) buf: Option<BufferHandle>,
    pub(crate) index: usize,
    capacity: usize,
}

impl PtrQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: None,
            index: 0,
            capacity,
        }
    }

    /// The current index. Logged entries live in `index..capacity` of the buffer.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_index(&mut self, index: usize) {
        debug_assert!(index <= self.capacity);
        self.index = index;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer(&self) -> Option<&BufferHandle> {
        self.buf.as_ref()
    }

    /// Number of entries logged in the current buffer.
    pub fn size(&self) -> usize {
        if self.buf.is_some() {
            self.capacity - self.index
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn set_buffer(&mut self, buf: Option<BufferHandle>) {
        debug_assert!(self.buf.is_none(), "overwriting a live buffer");
        self.buf = buf;
    }
}

impl std::fmt::Debug for PtrQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtrQueue")
            .field("buf", &self.buf)
            .field("index", &self.index)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Operations every queue set offers on the thread-local queues it manages.
///
/// Implementors provide the allocator backing their buffers and a policy for completed
/// buffers. The default methods implement the buffer hand-off protocol in terms of those.
pub trait PtrQueueSet {
    fn allocator(&self) -> &BufferAllocator;

    /// Take ownership of a buffer that a thread has finished with.
    fn enqueue_completed_buffer(&self, node: BufferHandle);

    fn buffer_size(&self) -> usize {
        self.allocator().buffer_size()
    }

    fn allocate_buffer(&self) -> BufferHandle {
        self.allocator().allocate()
    }

    fn deallocate_buffer(&self, node: BufferHandle) {
        self.allocator().release(node)
    }

    /// Append `value` if there is room. Returns false, without side effects, if the queue's
    /// buffer is full or absent.
    #[inline(always)]
    fn try_enqueue(&self, queue: &mut PtrQueue, value: usize) -> bool {
        let index = queue.index;
        if unlikely(index == 0) {
            return false;
        }
        let Some(buf) = queue.buf.as_mut() else {
            debug_assert!(false, "non-zero index without a buffer");
            return false;
        };
        let new_index = index - 1;
        self.allocator().entries_mut(buf)[new_index] = value;
        queue.index = new_index;
        true
    }

    /// Append `value` after the slow path made room. This must succeed.
    fn retry_enqueue(&self, queue: &mut PtrQueue, value: usize) {
        debug_assert!(queue.index != 0, "no room after making room");
        debug_assert!(queue.buf.is_some(), "no buffer after making room");
        let enqueued = self.try_enqueue(queue, value);
        debug_assert!(enqueued);
    }

    /// Give a queue without a buffer a fresh, empty one.
    fn install_new_buffer(&self, queue: &mut PtrQueue) {
        queue.set_buffer(Some(self.allocate_buffer()));
        queue.index = self.buffer_size();
    }

    /// Swap the queue's buffer for a fresh one, returning the old one (if any) with its
    /// index recorded.
    fn exchange_buffer_with_new(&self, queue: &mut PtrQueue) -> Option<BufferHandle> {
        let node = queue.buf.take();
        if let Some(node) = node.as_ref() {
            self.allocator().set_index(node, queue.index);
        }
        self.install_new_buffer(queue);
        node
    }

    /// Discard the queue's entries but keep its buffer.
    fn reset_queue(&self, queue: &mut PtrQueue) {
        if queue.buf.is_some() {
            queue.index = self.buffer_size();
        }
    }

    /// Remove the queue's buffer. A non-empty buffer becomes a completed buffer, an empty one
    /// is released.
    fn flush_queue(&self, queue: &mut PtrQueue) {
        if let Some(node) = queue.buf.take() {
            let index = queue.index;
            queue.index = 0;
            self.allocator().set_index(&node, index);
            if index == self.buffer_size() {
                self.deallocate_buffer(node);
            } else {
                self.enqueue_completed_buffer(node);
            }
        }
    }
}
