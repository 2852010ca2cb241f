use super::ptr_queue::{PtrQueue, PtrQueueSet};
use std::sync::Mutex;

/// A dirty card queue shared by all refining threads.
///
/// A card that could not be refined is logged again, but never in the queue being refined:
/// a mutator refining its own queue's buffer would append to the very buffer it is walking.
/// This queue takes those cards instead.
pub struct SharedDirtyCardQueue {
    queue: Mutex<PtrQueue>,
}

impl SharedDirtyCardQueue {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            queue: Mutex::new(PtrQueue::new(buffer_size)),
        }
    }

    pub fn enqueue(&self, qset: &impl PtrQueueSet, card: usize) {
        let mut queue = self.queue.lock().unwrap();
        if !qset.try_enqueue(&mut queue, card) {
            qset.flush_queue(&mut queue);
            qset.install_new_buffer(&mut queue);
            qset.retry_enqueue(&mut queue, card);
        }
    }

    /// Hand the current buffer to `qset` as a completed buffer.
    pub fn flush(&self, qset: &impl PtrQueueSet) {
        qset.flush_queue(&mut self.queue.lock().unwrap());
    }

    /// Discard the logged cards. Only at a safepoint.
    pub fn reset(&self, qset: &impl PtrQueueSet) {
        qset.reset_queue(&mut self.queue.lock().unwrap());
    }

    /// Return the buffer to the allocator, discarding its cards.
    pub fn release(&self, qset: &impl PtrQueueSet) {
        let mut queue = self.queue.lock().unwrap();
        qset.reset_queue(&mut queue);
        // An empty buffer is released rather than enqueued.
        qset.flush_queue(&mut queue);
    }

    pub fn size(&self) -> usize {
        self.queue.lock().unwrap().size()
    }
}
