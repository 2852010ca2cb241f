//! The snapshot-at-the-beginning (SATB) mark queues.
//!
//! While concurrent marking runs, the pre-barrier logs the old value of every overwritten
//! reference. The marker drains the completed buffers and marks what they hold, so that
//! every object reachable at the start of marking is found even if the mutator unlinks it.

use super::buffer::{BufferAllocator, BufferHandle, NodeState};
use super::ptr_queue::{PtrQueue, PtrQueueSet};
use super::registry::MutatorRegistry;
use crate::util::lock_free_stack::LockFreeStack;
use crate::util::ObjectReference;
use crate::vm::VMBinding;
use crossbeam::epoch;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A mutator's SATB log.
pub struct SATBMarkQueue {
    queue: PtrQueue,
    /// Whether marking is active for this thread. Flipped only at safepoints.
    active: bool,
}

impl SATBMarkQueue {
    pub fn new(buffer_size: usize, active: bool) -> Self {
        Self {
            queue: PtrQueue::new(buffer_size),
            active,
        }
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn ptr_queue(&self) -> &PtrQueue {
        &self.queue
    }

    pub fn ptr_queue_mut(&mut self) -> &mut PtrQueue {
        &mut self.queue
    }
}

/// The completed-buffer count and the "process completed buffers" flag, packed into one word
/// as `count << 1 | flag`.
mod count_and_flag {
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Add one buffer, setting the flag if the new value exceeds `threshold`
    /// (a packed value, see `scale_threshold`).
    pub fn increment(cfptr: &AtomicUsize, threshold: usize) -> usize {
        let mut value = cfptr.load(Ordering::Relaxed);
        loop {
            let old = value;
            value += 2;
            debug_assert!(value > old, "overflow");
            if value > threshold {
                value |= 1;
            }
            match cfptr.compare_exchange(old, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return value,
                Err(actual) => value = actual,
            }
        }
    }

    /// Remove one buffer. The flag is cleared when the count reaches zero.
    pub fn decrement(cfptr: &AtomicUsize) -> usize {
        let mut value = cfptr.load(Ordering::Relaxed);
        loop {
            let old = value;
            debug_assert!(value >> 1 > 0, "underflow");
            value -= 2;
            if value <= 1 {
                value = 0;
            }
            match cfptr.compare_exchange(old, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return value,
                Err(actual) => value = actual,
            }
        }
    }

    /// Scale a threshold in buffers to compare against a packed value, saturating.
    pub fn scale_threshold(threshold: usize) -> usize {
        if threshold > (usize::MAX >> 1) {
            usize::MAX
        } else {
            (threshold << 1) | 1
        }
    }
}

pub struct SATBMarkQueueSet<VM: VMBinding> {
    vm: Arc<VM>,
    allocator: BufferAllocator,
    list: LockFreeStack,
    count_and_process_flag: CachePadded<AtomicUsize>,
    process_completed_buffers_threshold: usize,
    buffer_enqueue_threshold: usize,
    all_active: AtomicBool,
}

impl<VM: VMBinding> SATBMarkQueueSet<VM> {
    /// * `process_completed_buffers_threshold`: number of completed buffers above which
    ///   [`process_completed_buffers`](Self::process_completed_buffers) becomes true.
    /// * `buffer_enqueue_threshold_percentage`: a filtered buffer is only handed off if less
    ///   than this percentage of it is free.
    pub fn new(
        vm: Arc<VM>,
        buffer_size: usize,
        process_completed_buffers_threshold: usize,
        buffer_enqueue_threshold_percentage: usize,
    ) -> Self {
        assert!(buffer_enqueue_threshold_percentage <= 100);
        let enqueue_qty = buffer_size * buffer_enqueue_threshold_percentage / 100;
        Self {
            vm,
            allocator: BufferAllocator::new("SATB", buffer_size),
            list: LockFreeStack::new(),
            count_and_process_flag: CachePadded::new(AtomicUsize::new(0)),
            process_completed_buffers_threshold: count_and_flag::scale_threshold(
                process_completed_buffers_threshold,
            ),
            buffer_enqueue_threshold: std::cmp::max(buffer_size - enqueue_qty, 1),
            all_active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.all_active.load(Ordering::Relaxed)
    }

    /// Number of completed buffers.
    pub fn completed_buffers_num(&self) -> usize {
        self.count_and_process_flag.load(Ordering::Relaxed) >> 1
    }

    /// Have enough buffers completed that the marker should start processing them?
    pub fn process_completed_buffers(&self) -> bool {
        (self.count_and_process_flag.load(Ordering::Relaxed) & 1) != 0
    }

    pub fn buffer_enqueue_threshold(&self) -> usize {
        self.buffer_enqueue_threshold
    }

    /// Log `obj`. The caller has checked that the queue is active.
    #[inline(always)]
    pub fn enqueue_known_active(&self, queue: &mut SATBMarkQueue, obj: ObjectReference) {
        debug_assert!(queue.is_active(), "SATB enqueue on an inactive queue");
        let value = obj.value();
        if !self.try_enqueue(&mut queue.queue, value) {
            self.handle_zero_index(queue);
            self.retry_enqueue(&mut queue.queue, value);
        }
    }

    /// Log `obj` if marking is active for this queue.
    pub fn enqueue(&self, queue: &mut SATBMarkQueue, obj: ObjectReference) {
        if queue.is_active() {
            self.enqueue_known_active(queue, obj);
        }
    }

    #[cold]
    fn handle_zero_index(&self, queue: &mut SATBMarkQueue) {
        debug_assert_eq!(queue.queue.index(), 0);
        if queue.queue.buffer().is_none() {
            self.install_new_buffer(&mut queue.queue);
            return;
        }
        self.filter(&mut queue.queue);
        if self.should_enqueue_buffer(&queue.queue) {
            if let Some(node) = self.exchange_buffer_with_new(&mut queue.queue) {
                self.enqueue_completed_buffer(node);
            }
        }
        // Otherwise filtering freed up enough room to keep filling the same buffer.
    }

    fn should_enqueue_buffer(&self, queue: &PtrQueue) -> bool {
        queue.index() < self.buffer_enqueue_threshold
    }

    /// Should the marker ignore `obj`? Objects allocated since marking started and objects
    /// already marked need no further work.
    fn discard_entry(&self, entry: usize) -> bool {
        let obj = ObjectReference::from_raw_address(crate::util::Address::from_usize(entry));
        !self.vm.is_below_tams(obj) || self.vm.is_marked(obj)
    }

    /// Compact the entries the marker still needs to the end of the buffer, and move the
    /// index up past the discarded ones.
    pub fn filter(&self, queue: &mut PtrQueue) {
        let Some(node) = queue.buf.as_mut() else {
            return;
        };
        let capacity = self.buffer_size();
        let buf = self.allocator.entries_mut(node);
        let mut src = queue.index;
        let mut dst = capacity;
        'outer: while src < dst {
            let entry = buf[src];
            if !self.discard_entry(entry) {
                // Found a keeper. Search high to low for an entry to discard.
                loop {
                    dst -= 1;
                    if src >= dst {
                        break 'outer;
                    }
                    if self.discard_entry(buf[dst]) {
                        buf[dst] = entry;
                        break;
                    }
                }
            }
            src += 1;
        }
        // Entries in dst..capacity are all keepers.
        queue.index = dst;
    }

    /// Flush with filtering, so only entries the marker needs are handed off.
    pub fn flush_satb_queue(&self, queue: &mut SATBMarkQueue) {
        self.filter(&mut queue.queue);
        self.flush_queue(&mut queue.queue);
    }

    /// Pop a completed buffer, if any.
    pub fn get_completed_buffer(&self) -> Option<BufferHandle> {
        let id = {
            let _guard = epoch::pin();
            self.list.pop(self.allocator.arena())
        }?;
        count_and_flag::decrement(&self.count_and_process_flag);
        Some(self.allocator.adopt(id, NodeState::Completed))
    }

    /// Apply `cl` to the entries of one completed buffer and release the buffer.
    /// Returns false if there was no completed buffer.
    pub fn apply_closure_to_completed_buffer<F>(&self, mut cl: F) -> bool
    where
        F: FnMut(&[ObjectReference]),
    {
        match self.get_completed_buffer() {
            Some(node) => {
                let entries = self.allocator.logged_entries(&node);
                cl(bytemuck::cast_slice(entries));
                self.deallocate_buffer(node);
                true
            }
            None => false,
        }
    }

    /// Drop all completed buffers.
    pub fn abandon_completed_buffers(&self) {
        let head = self.list.pop_all();
        self.count_and_process_flag.store(0, Ordering::Relaxed);
        let released = self.allocator.release_chain(head, NodeState::Completed);
        debug!("Abandoned {} completed SATB buffers", released);
    }

    /// Drop everything logged so far: completed buffers and the entries in every mutator's
    /// queue. Only at a safepoint.
    pub fn abandon_partial_marking(&self, registry: &MutatorRegistry) {
        self.abandon_completed_buffers();
        registry.for_each(|queues| {
            let mut satb = queues.satb.borrow_mut();
            self.reset_queue(&mut satb.queue);
        });
    }

    /// Hand every mutator's partially filled buffer to the marker. Only at a safepoint.
    pub fn flush_all_queues(&self, registry: &MutatorRegistry) {
        registry.for_each(|queues| {
            let mut satb = queues.satb.borrow_mut();
            self.flush_satb_queue(&mut satb);
        });
    }

    /// Activate or deactivate the pre-barrier for every mutator. Only at a safepoint.
    ///
    /// Every queue must currently be in state `expected_active`, and queues being activated
    /// must be empty.
    pub fn set_active_all_threads(
        &self,
        registry: &MutatorRegistry,
        active: bool,
        expected_active: bool,
    ) {
        #[cfg(debug_assertions)]
        self.verify_active_states(registry, expected_active);
        registry.with_locked(|mutators| {
            for queues in mutators.iter() {
                let mut satb = queues.satb.borrow_mut();
                if satb.queue.buffer().is_some() {
                    debug_assert!(
                        !active || satb.queue.index() == self.buffer_size(),
                        "SATB queues should be empty when activated"
                    );
                    satb.queue.set_index(self.buffer_size());
                }
                satb.active = active;
            }
            // Mutators registering later pick the new state up from here.
            self.all_active.store(active, Ordering::Relaxed);
        });
        debug!("SATB marking {}", if active { "activated" } else { "deactivated" });
    }

    #[cfg(debug_assertions)]
    fn verify_active_states(&self, registry: &MutatorRegistry, expected_active: bool) {
        assert_eq!(
            self.is_active(),
            expected_active,
            "SATB queue set is {}active, expected the opposite",
            if self.is_active() { "" } else { "in" }
        );
        registry.for_each(|queues| {
            let satb = queues.satb.borrow();
            assert_eq!(
                satb.active, expected_active,
                "thread SATB queue has an unexpected active state"
            );
        });
    }
}

impl<VM: VMBinding> PtrQueueSet for SATBMarkQueueSet<VM> {
    fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    fn enqueue_completed_buffer(&self, node: BufferHandle) {
        count_and_flag::increment(
            &self.count_and_process_flag,
            self.process_completed_buffers_threshold,
        );
        let id = self.allocator.publish(node, NodeState::Completed);
        self.list.push(self.allocator.arena(), id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::mock_vm::MockVM;

    fn obj(vm: &MockVM, region: usize, offset: usize) -> ObjectReference {
        ObjectReference::from_raw_address(vm.region_start(region) + offset)
    }

    fn qset(vm: Arc<MockVM>, size: usize, percent: usize) -> SATBMarkQueueSet<MockVM> {
        SATBMarkQueueSet::new(vm, size, 2, percent)
    }

    #[test]
    fn enqueue_threshold() {
        let vm = Arc::new(MockVM::new(4));
        assert_eq!(qset(vm.clone(), 1024, 60).buffer_enqueue_threshold(), 410);
        assert_eq!(qset(vm.clone(), 10, 100).buffer_enqueue_threshold(), 1);
        assert_eq!(qset(vm, 10, 0).buffer_enqueue_threshold(), 10);
    }

    #[test]
    fn inactive_queue_ignores_enqueue() {
        let vm = Arc::new(MockVM::new(4));
        let qset = qset(vm.clone(), 4, 100);
        let mut queue = SATBMarkQueue::new(4, false);
        qset.enqueue(&mut queue, obj(&vm, 0, 8));
        assert!(queue.ptr_queue().buffer().is_none());
    }

    #[test]
    fn filter_drops_marked_and_new_objects() {
        let vm = Arc::new(MockVM::new(4));
        let qset = qset(vm.clone(), 8, 100);
        let mut queue = SATBMarkQueue::new(8, true);

        let keep1 = obj(&vm, 1, 0x100);
        let keep2 = obj(&vm, 1, 0x200);
        let marked = obj(&vm, 1, 0x300);
        vm.mark(marked);
        // Allocated after marking started.
        vm.set_tams(2, vm.region_start(2) + 0x1000usize);
        let fresh = obj(&vm, 2, 0x2000);
        for o in [fresh, keep1, marked, keep2, fresh] {
            qset.enqueue_known_active(&mut queue, o);
        }
        qset.filter(queue.ptr_queue_mut());
        assert_eq!(queue.ptr_queue().size(), 2);

        qset.flush_satb_queue(&mut queue);
        let mut seen = vec![];
        assert!(qset.apply_closure_to_completed_buffer(|objs| seen.extend_from_slice(objs)));
        seen.sort();
        assert_eq!(seen, vec![keep1, keep2]);
        assert!(!qset.apply_closure_to_completed_buffer(|_| unreachable!()));
    }

    #[test]
    fn mostly_filtered_buffer_is_reused() {
        let vm = Arc::new(MockVM::new(4));
        // Hand off only if less than 50% is free after filtering.
        let qset = qset(vm.clone(), 4, 50);
        let mut queue = SATBMarkQueue::new(4, true);
        let m = obj(&vm, 0, 0x10);
        vm.mark(m);
        for _ in 0..5 {
            qset.enqueue_known_active(&mut queue, m);
        }
        // The full buffer was filtered down to nothing and kept.
        assert_eq!(qset.completed_buffers_num(), 0);
        assert_eq!(queue.ptr_queue().size(), 1);

        let live = obj(&vm, 0, 0x20);
        for _ in 0..8 {
            qset.enqueue_known_active(&mut queue, live);
        }
        assert_eq!(qset.completed_buffers_num(), 2);
        qset.abandon_completed_buffers();
        assert_eq!(qset.completed_buffers_num(), 0);
        qset.flush_satb_queue(&mut queue);
        qset.abandon_completed_buffers();
    }

    #[test]
    fn process_flag_follows_threshold() {
        let vm = Arc::new(MockVM::new(4));
        let qset = qset(vm.clone(), 2, 100);
        let mut queue = SATBMarkQueue::new(2, true);
        let live = obj(&vm, 0, 0x40);
        // Threshold is two buffers: the flag is set once there are three.
        for n in 1..=3 {
            for _ in 0..2 {
                qset.enqueue_known_active(&mut queue, live);
            }
            qset.flush_satb_queue(&mut queue);
            assert_eq!(qset.completed_buffers_num(), n);
            assert_eq!(qset.process_completed_buffers(), n > 2);
        }
        while qset.apply_closure_to_completed_buffer(|objs| assert_eq!(objs.len(), 2)) {}
        assert_eq!(qset.completed_buffers_num(), 0);
        assert!(!qset.process_completed_buffers());
    }

    #[test]
    fn packed_count() {
        let cf = AtomicUsize::new(0);
        let threshold = count_and_flag::scale_threshold(1);
        assert_eq!(count_and_flag::increment(&cf, threshold), 2);
        assert_eq!(count_and_flag::increment(&cf, threshold), 5);
        assert_eq!(count_and_flag::decrement(&cf), 3);
        assert_eq!(count_and_flag::decrement(&cf), 0);
        assert_eq!(count_and_flag::scale_threshold(usize::MAX), usize::MAX);
    }
}
