//! Dirty card queues and their refinement.
//!
//! The post-barrier logs the card table entry of every card it dirties. Full buffers are
//! pushed on a lock-free completed list, from which refinement threads (and, under
//! pressure, mutators) pop them and update the remembered sets.
//!
//! `num_cards` counts the cards in the completed list and in paused buffers. It is bumped
//! before a buffer becomes visible and dropped only after the buffer is removed, so
//! concurrent readers may overestimate the pending work but never underestimate it.

use super::buffer::{BufferAllocator, BufferHandle, BufferNodeList, NodeState};
use super::free_id_set::FreeIdSet;
use super::paused::PausedBuffers;
use super::ptr_queue::{PtrQueue, PtrQueueSet};
use super::registry::MutatorRegistry;
use super::shared_dirty_card_queue::SharedDirtyCardQueue;
use crate::barrier::card_table::CardValue;
use crate::refine::notifier::PrimaryNotifier;
use crate::refine::rem_set::CardRefiner;
use crate::refine::stats::RefinementStats;
use crate::util::constants::THRESHOLD_NEVER;
use crate::util::lock_free_stack::{ChainIter, LockFreeStack, StackLinks, NIL};
use crate::util::safepoint::{NeverYield, Safepoint, YieldPoint};
use crate::util::Address;
use crate::vm::VMBinding;
use crossbeam::epoch;
use crossbeam::utils::CachePadded;
use probe::probe;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// No limit on the number of pending cards before mutators refine.
pub const MAX_CARDS_UNLIMITED: usize = usize::MAX;

/// A mutator's dirty card log, with the refinement statistics of that mutator.
pub struct DirtyCardQueue {
    queue: PtrQueue,
    refinement_stats: RefinementStats,
}

impl DirtyCardQueue {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            queue: PtrQueue::new(buffer_size),
            refinement_stats: RefinementStats::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn ptr_queue(&self) -> &PtrQueue {
        &self.queue
    }

    pub fn refinement_stats(&self) -> &RefinementStats {
        &self.refinement_stats
    }

    pub fn refinement_stats_mut(&mut self) -> &mut RefinementStats {
        &mut self.refinement_stats
    }
}

/// How far [`DirtyCardQueueSet::refine_buffer`] got.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefinementResult {
    /// Every card was handled. The buffer can be released.
    Completed,
    /// A safepoint is pending. The cards in `resume_index..` are still to be refined and
    /// have been dirtied again.
    Paused { resume_index: usize },
}

pub struct DirtyCardQueueSet<VM: VMBinding> {
    allocator: BufferAllocator,
    completed: LockFreeStack,
    num_cards: CachePadded<AtomicUsize>,
    paused: PausedBuffers,
    /// Worker ids for mutators refining a buffer themselves.
    free_ids: FreeIdSet,
    /// Cards at which a mutator wakes refinement thread 0. Starts at "never"; the refinement
    /// controller sets it to thread 0's activation threshold, not to the yellow zone.
    process_cards_threshold: AtomicUsize,
    max_cards: AtomicUsize,
    padded_max_cards: AtomicUsize,
    detached_refinement_stats: Mutex<RefinementStats>,
    shared_queue: SharedDirtyCardQueue,
    refiner: CardRefiner<VM>,
    primary: Arc<PrimaryNotifier>,
    safepoint: Arc<Safepoint>,
}

impl<VM: VMBinding> DirtyCardQueueSet<VM> {
    pub fn new(
        buffer_size: usize,
        refiner: CardRefiner<VM>,
        primary: Arc<PrimaryNotifier>,
        safepoint: Arc<Safepoint>,
        free_ids: FreeIdSet,
    ) -> Self {
        Self {
            allocator: BufferAllocator::new("DirtyCard", buffer_size),
            completed: LockFreeStack::new(),
            num_cards: CachePadded::new(AtomicUsize::new(0)),
            paused: PausedBuffers::new(),
            free_ids,
            process_cards_threshold: AtomicUsize::new(THRESHOLD_NEVER),
            max_cards: AtomicUsize::new(MAX_CARDS_UNLIMITED),
            padded_max_cards: AtomicUsize::new(MAX_CARDS_UNLIMITED),
            detached_refinement_stats: Mutex::new(RefinementStats::new()),
            shared_queue: SharedDirtyCardQueue::new(buffer_size),
            refiner,
            primary,
            safepoint,
        }
    }

    pub fn refiner(&self) -> &CardRefiner<VM> {
        &self.refiner
    }

    pub fn shared_queue(&self) -> &SharedDirtyCardQueue {
        &self.shared_queue
    }

    pub fn free_ids(&self) -> &FreeIdSet {
        &self.free_ids
    }

    /// Number of cards in completed and paused buffers. May be an overestimate while
    /// buffers are being added or removed.
    pub fn num_cards(&self) -> usize {
        self.num_cards.load(Ordering::Relaxed)
    }

    pub fn process_cards_threshold(&self) -> usize {
        self.process_cards_threshold.load(Ordering::Relaxed)
    }

    /// Wake the primary refinement thread once more than `threshold` cards are pending.
    pub fn set_process_cards_threshold(&self, threshold: usize) {
        self.process_cards_threshold
            .store(threshold, Ordering::Relaxed);
    }

    pub fn max_cards(&self) -> usize {
        self.max_cards.load(Ordering::Relaxed)
    }

    /// Mutators refine buffers themselves while more than `max_cards` (plus padding) cards
    /// are pending. Clears the padding.
    pub fn set_max_cards(&self, max_cards: usize) {
        self.max_cards.store(max_cards, Ordering::Relaxed);
        self.padded_max_cards.store(max_cards, Ordering::Relaxed);
    }

    pub fn padded_max_cards(&self) -> usize {
        self.padded_max_cards.load(Ordering::Relaxed)
    }

    /// Temporarily raise the mutator refinement limit by `padding`, e.g. right after a pause
    /// left many cards behind.
    pub fn set_max_cards_padding(&self, padding: usize) {
        let limit = self.max_cards().saturating_add(padding);
        self.padded_max_cards.store(limit, Ordering::Relaxed);
    }

    pub fn discard_max_cards_padding(&self) {
        // Racing threads all store the same value.
        let max_cards = self.max_cards();
        if self.padded_max_cards.load(Ordering::Relaxed) != max_cards {
            self.padded_max_cards.store(max_cards, Ordering::Relaxed);
        }
    }

    pub fn notify_if_necessary(&self) {
        if self.num_cards() > self.process_cards_threshold() {
            self.primary.notify();
        }
    }

    /// Log the card table entry `card`.
    #[inline(always)]
    pub fn enqueue(&self, queue: &mut DirtyCardQueue, card: Address) {
        let value = card.as_usize();
        if !self.try_enqueue(&mut queue.queue, value) {
            self.handle_zero_index(queue);
            self.retry_enqueue(&mut queue.queue, value);
        }
    }

    #[cold]
    fn handle_zero_index(&self, queue: &mut DirtyCardQueue) {
        debug_assert_eq!(queue.queue.index(), 0);
        if let Some(old) = self.exchange_buffer_with_new(&mut queue.queue) {
            queue.refinement_stats.inc_dirtied_cards(self.buffer_size());
            self.handle_completed_buffer(old, &mut queue.refinement_stats);
        }
    }

    /// Hand a mutator's partially filled buffer over, e.g. when the mutator detaches.
    pub fn flush_dirty_card_queue(&self, queue: &mut DirtyCardQueue) {
        let size = queue.queue.size();
        queue.refinement_stats.inc_dirtied_cards(size);
        self.flush_queue(&mut queue.queue);
    }

    /// Enqueue a full mutator buffer and, if too many cards are pending, make the mutator
    /// refine one buffer before it returns to its own work.
    fn handle_completed_buffer(&self, node: BufferHandle, stats: &mut RefinementStats) {
        self.enqueue_completed_buffer(node);

        if self.num_cards() <= self.padded_max_cards() {
            return;
        }
        // The buffer would only get paused right away.
        if self.safepoint.sts().should_yield() {
            return;
        }
        let Some(mut node) = self.get_completed_buffer() else {
            return;
        };
        let worker_id = self.free_ids.claim_par_id();
        let result = self.refine_buffer(&mut node, worker_id, stats, &NeverYield);
        self.free_ids.release_par_id(worker_id);
        // Release the id first, so another mutator can use it.
        self.handle_refined_buffer(node, result);
    }

    fn pop_completed(&self) -> Option<u32> {
        let _guard = epoch::pin();
        self.completed.pop(self.allocator.arena())
    }

    /// Pop a completed buffer. Buffers paused before the latest safepoint are made available
    /// first if the list is empty. A `None` does not mean the list is empty: a racing push
    /// may not be visible yet.
    pub fn get_completed_buffer(&self) -> Option<BufferHandle> {
        let id = match self.pop_completed() {
            Some(id) => id,
            None => {
                self.enqueue_previous_paused_buffers();
                self.pop_completed()?
            }
        };
        let node = self.allocator.adopt(id, NodeState::Completed);
        self.num_cards
            .fetch_sub(self.allocator.entry_count(&node), Ordering::SeqCst);
        Some(node)
    }

    /// Move a detached chain of paused buffers to the completed list. Their cards are
    /// already counted.
    fn append_paused(&self, head: u32, tail: u32) {
        self.allocator
            .retag_chain(head, NodeState::Paused, NodeState::Completed);
        self.completed.prepend(self.allocator.arena(), head, tail);
    }

    fn enqueue_previous_paused_buffers(&self) {
        let paused = self.paused.take_previous(self.safepoint.safepoint_id());
        if !paused.is_empty() {
            trace!(
                "Resuming buffers paused before safepoint {}",
                self.safepoint.safepoint_id()
            );
            self.append_paused(paused.head, paused.tail);
        }
    }

    /// Move every paused buffer to the completed list. Only at a safepoint.
    pub fn enqueue_all_paused_buffers(&self) {
        debug_assert!(self.safepoint.is_at_safepoint(), "not at a safepoint");
        let paused = self.paused.take_all();
        if !paused.is_empty() {
            self.append_paused(paused.head, paused.tail);
        }
    }

    fn record_paused_buffer(&self, node: BufferHandle) {
        debug_assert!(
            !self.safepoint.is_at_safepoint(),
            "buffers are not paused at a safepoint"
        );
        // There must be no paused buffers from an earlier safepoint left when a list for the
        // next one is created.
        self.enqueue_previous_paused_buffers();
        // Paused cards stay counted, so a safepoint that does not collect still sees them.
        self.num_cards
            .fetch_add(self.allocator.entry_count(&node), Ordering::SeqCst);
        let id = self.allocator.publish(node, NodeState::Paused);
        self.paused
            .add(self.allocator.arena(), id, self.safepoint.safepoint_id());
    }

    /// Refine one completed buffer, if more than `stop_at` cards are pending.
    /// Returns false if there was nothing to do.
    pub fn refine_completed_buffer_concurrently<Y: YieldPoint + ?Sized>(
        &self,
        worker_id: usize,
        stop_at: usize,
        stats: &mut RefinementStats,
        yield_point: &Y,
    ) -> bool {
        if self.num_cards() <= stop_at {
            return false;
        }
        let Some(mut node) = self.get_completed_buffer() else {
            return false;
        };
        let result = self.refine_buffer(&mut node, worker_id, stats, yield_point);
        self.handle_refined_buffer(node, result);
        true
    }

    /// Release a fully refined buffer, or park a paused one until the next safepoint.
    pub fn handle_refined_buffer(&self, node: BufferHandle, result: RefinementResult) {
        match result {
            RefinementResult::Completed => {
                debug_assert_eq!(
                    self.allocator.index(&node),
                    self.buffer_size(),
                    "buffer not fully consumed"
                );
                self.deallocate_buffer(node);
            }
            RefinementResult::Paused { resume_index } => {
                debug_assert_eq!(self.allocator.index(&node), resume_index);
                self.record_paused_buffer(node);
            }
        }
    }

    /// Refine the cards of `node`.
    ///
    /// First every card is cleaned, dropping the ones that need no work. The rest are
    /// sorted by decreasing address and refined one by one, checking `yield_point` before
    /// each. On a yield the remaining cards are dirtied again and the buffer's index is left
    /// at the first of them.
    pub fn refine_buffer<Y: YieldPoint + ?Sized>(
        &self,
        node: &mut BufferHandle,
        worker_id: usize,
        stats: &mut RefinementStats,
        yield_point: &Y,
    ) -> RefinementResult {
        let start_time = Instant::now();
        let buffer_size = self.buffer_size();
        let start = self.allocator.index(node);
        let buf = self.allocator.entries_mut(node);

        let first_clean = self.clean_cards(buf, start);
        // Dropped cards count as refined.
        stats.inc_refined_cards(first_clean - start);
        stats.inc_precleaned_cards(first_clean - start);

        let result = if first_clean == buffer_size {
            RefinementResult::Completed
        } else {
            // The cards must be clean before their contents are examined, and the regions'
            // tops read while cleaning must not be reordered with the scans below.
            fence(Ordering::SeqCst);
            buf[first_clean..].sort_unstable_by(|a, b| b.cmp(a));
            self.refine_cleaned_cards(buf, first_clean, worker_id, yield_point)
        };

        let index = match result {
            RefinementResult::Completed => buffer_size,
            RefinementResult::Paused { resume_index } => resume_index,
        };
        self.allocator.set_index(node, index);
        stats.inc_refined_cards(index - first_clean);
        stats.inc_refinement_time(start_time.elapsed());
        probe!(g1_refine, buffer_refined, worker_id, index - start);
        trace!(
            "Worker {} refined {} of {} cards ({} precleaned)",
            worker_id,
            index - start,
            buffer_size - start,
            first_clean - start
        );
        result
    }

    /// Two-finger compaction of the cards still needing refinement toward the end of `buf`.
    /// Returns the index of the first kept card.
    fn clean_cards(&self, buf: &mut [usize], start: usize) -> usize {
        let mut src = start;
        let mut dst = buf.len();
        'outer: while src < dst {
            if self.refiner.clean_card_before_refine(&mut buf[src]) {
                // Found a keeper. Search high to low for a card to drop.
                loop {
                    dst -= 1;
                    if src >= dst {
                        break 'outer;
                    }
                    if !self.refiner.clean_card_before_refine(&mut buf[dst]) {
                        buf[dst] = buf[src];
                        break;
                    }
                }
            }
            src += 1;
        }
        dst
    }

    fn refine_cleaned_cards<Y: YieldPoint + ?Sized>(
        &self,
        buf: &[usize],
        start_index: usize,
        worker_id: usize,
        yield_point: &Y,
    ) -> RefinementResult {
        for i in start_index..buf.len() {
            if yield_point.should_yield() {
                self.redirty_unrefined_cards(&buf[i..]);
                return RefinementResult::Paused { resume_index: i };
            }
            if self.refiner.refine_card_concurrently(buf[i], worker_id) {
                self.shared_queue.enqueue(self, buf[i]);
            }
        }
        RefinementResult::Completed
    }

    fn redirty_unrefined_cards(&self, cards: &[usize]) {
        let card_table = self.refiner.card_table();
        for &card in cards {
            card_table.set(Address::from_usize(card), CardValue::Dirty);
        }
    }

    /// Detach the whole completed list, paused buffers included, and reset `num_cards`.
    /// Only at a safepoint.
    pub fn take_all_completed_buffers(&self) -> BufferNodeList {
        self.enqueue_all_paused_buffers();
        self.verify_num_cards();
        let head = self.completed.pop_all();
        let tail = ChainIter::new(self.allocator.arena(), head)
            .last()
            .unwrap_or(NIL);
        let entry_count = self.num_cards.swap(0, Ordering::SeqCst);
        BufferNodeList {
            head,
            tail,
            entry_count,
        }
    }

    /// Put back buffers taken with [`take_all_completed_buffers`](Self::take_all_completed_buffers).
    pub fn merge_bufferlists(&self, list: BufferNodeList) {
        if !list.is_empty() {
            self.num_cards
                .fetch_add(list.entry_count, Ordering::SeqCst);
            self.completed
                .prepend(self.allocator.arena(), list.head, list.tail);
        }
    }

    /// Visit the cards of every buffer in `list` and release the buffers.
    pub fn release_bufferlist<F: FnMut(Address)>(&self, list: BufferNodeList, mut f: F) -> usize {
        let mut cur = list.head;
        let mut released = 0;
        while cur != NIL {
            let next = self.allocator.arena().next(cur);
            let node = self.allocator.adopt(cur, NodeState::Completed);
            for &card in self.allocator.logged_entries(&node) {
                f(Address::from_usize(card));
            }
            self.deallocate_buffer(node);
            released += 1;
            cur = next;
        }
        released
    }

    /// Drop every completed and paused buffer. Only at a safepoint.
    pub fn abandon_completed_buffers(&self) {
        let list = self.take_all_completed_buffers();
        let released = self.release_bufferlist(list, |_| {});
        debug!("Abandoned {} dirty card buffers", released);
    }

    /// Drop all logged cards, in the completed list and in every queue, and reset the
    /// refinement stats. Only at a safepoint, before a full collection.
    pub fn abandon_logs(&self, registry: &MutatorRegistry) {
        debug_assert!(self.safepoint.is_at_safepoint(), "not at a safepoint");
        self.abandon_completed_buffers();
        self.detached_refinement_stats.lock().unwrap().reset();
        registry.for_each(|queues| {
            let mut dcq = queues.dirty.borrow_mut();
            self.reset_queue(&mut dcq.queue);
            dcq.refinement_stats.reset();
        });
        self.shared_queue.reset(self);
    }

    /// Collect the partial buffers of every queue and all paused buffers in the completed
    /// list. Only at a safepoint.
    pub fn concatenate_logs(&self, registry: &MutatorRegistry) {
        debug_assert!(self.safepoint.is_at_safepoint(), "not at a safepoint");
        let old_limit = self.max_cards();
        self.set_max_cards(MAX_CARDS_UNLIMITED);
        registry.for_each(|queues| {
            let mut dcq = queues.dirty.borrow_mut();
            if !dcq.is_empty() {
                self.flush_dirty_card_queue(&mut dcq);
            }
        });
        self.shared_queue.flush(self);
        self.enqueue_all_paused_buffers();
        self.verify_num_cards();
        self.set_max_cards(old_limit);
    }

    /// Sum up and reset the refinement stats of all mutators, attached or detached.
    /// Only at a safepoint.
    pub fn get_and_reset_refinement_stats(&self, registry: &MutatorRegistry) -> RefinementStats {
        let mut total = RefinementStats::new();
        registry.for_each(|queues| {
            let mut dcq = queues.dirty.borrow_mut();
            total += dcq.refinement_stats;
            dcq.refinement_stats.reset();
        });
        let mut detached = self.detached_refinement_stats.lock().unwrap();
        total += *detached;
        detached.reset();
        total
    }

    /// Keep the stats of a detaching mutator.
    pub fn record_detached_refinement_stats(&self, stats: &mut RefinementStats) {
        let mut detached = self.detached_refinement_stats.lock().unwrap();
        *detached += *stats;
        stats.reset();
    }

    /// Check `num_cards` against the buffers actually queued. Only at a safepoint.
    ///
    /// This walks every queued buffer, so it only runs in debug builds or with the
    /// `extreme_assertions` feature.
    pub fn verify_num_cards(&self) {
        if !(cfg!(debug_assertions) || cfg!(feature = "extreme_assertions")) {
            return;
        }
        let arena = self.allocator.arena();
        let mut actual: usize = ChainIter::new(arena, self.completed.top())
            .map(|id| self.allocator.entry_count_of(id))
            .sum();
        self.paused
            .for_each(arena, |id| actual += self.allocator.entry_count_of(id));
        assert_eq!(
            actual,
            self.num_cards(),
            "num_cards does not match the queued buffers"
        );
    }
}

impl<VM: VMBinding> PtrQueueSet for DirtyCardQueueSet<VM> {
    fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    fn enqueue_completed_buffer(&self, node: BufferHandle) {
        let entries = self.allocator.entry_count(&node);
        // Count the cards before they become visible.
        let new_num_cards = self.num_cards.fetch_add(entries, Ordering::SeqCst) + entries;
        let id = self.allocator.publish(node, NodeState::Completed);
        self.completed.push(self.allocator.arena(), id);
        if new_num_cards > self.process_cards_threshold() {
            self.primary.notify();
        }
    }
}

impl<VM: VMBinding> Drop for DirtyCardQueueSet<VM> {
    fn drop(&mut self) {
        self.shared_queue.release(&*self);
    }
}
