use super::card_table::{CardTable, CardValue};
use crate::queue::registry::MutatorQueues;
use crate::queue::{DirtyCardQueueSet, SATBMarkQueueSet};
use crate::util::rust_util::likely;
use crate::util::{Address, ObjectReference};
use crate::vm::VMBinding;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

/// A write barrier, run by a mutator around each reference store.
pub trait Barrier: 'static + Send {
    /// Hand the mutator's partially filled log buffers to their queue sets.
    fn flush(&mut self);

    /// Run before `slot` is overwritten. `old` is the value being overwritten, if the caller
    /// has it at hand.
    fn object_reference_write_pre(&mut self, slot: Address, old: Option<ObjectReference>);

    /// Run after `new` has been stored into `slot`.
    fn object_reference_write_post(&mut self, slot: Address, new: ObjectReference);

    /// The pre-barrier, the store of `new` into `slot`, and the post-barrier.
    fn object_reference_write(&mut self, slot: Address, new: ObjectReference);
}

/// The G1 barriers: the SATB pre-barrier and the card-marking post-barrier.
pub struct G1Barrier<VM: VMBinding> {
    vm: Arc<VM>,
    card_table: Arc<CardTable>,
    satb: Arc<SATBMarkQueueSet<VM>>,
    dcqs: Arc<DirtyCardQueueSet<VM>>,
    queues: Arc<MutatorQueues>,
}

impl<VM: VMBinding> G1Barrier<VM> {
    pub fn new(
        vm: Arc<VM>,
        card_table: Arc<CardTable>,
        satb: Arc<SATBMarkQueueSet<VM>>,
        dcqs: Arc<DirtyCardQueueSet<VM>>,
        queues: Arc<MutatorQueues>,
    ) -> Self {
        Self {
            vm,
            card_table,
            satb,
            dcqs,
            queues,
        }
    }

    pub fn queues(&self) -> &Arc<MutatorQueues> {
        &self.queues
    }

    pub(crate) fn dirty_card_queue_set(&self) -> &DirtyCardQueueSet<VM> {
        &self.dcqs
    }

    /// Does a store of `new` into `slot` need a card? Only non-null references that cross
    /// regions do.
    #[inline(always)]
    pub fn is_cross_region(slot: Address, new: ObjectReference) -> bool {
        !new.is_null() && (slot ^ new.to_raw_address()) >> VM::LOG_BYTES_IN_REGION as usize != 0
    }

    #[cold]
    fn post_barrier_slow(&self, card: Address) {
        self.card_table.set(card, CardValue::Dirty);
        let mut queue = self.queues.dirty.borrow_mut();
        self.dcqs.enqueue(&mut queue, card);
    }
}

impl<VM: VMBinding> Barrier for G1Barrier<VM> {
    fn flush(&mut self) {
        self.satb.flush_satb_queue(&mut self.queues.satb.borrow_mut());
        self.dcqs
            .flush_dirty_card_queue(&mut self.queues.dirty.borrow_mut());
    }

    #[inline(always)]
    fn object_reference_write_pre(&mut self, slot: Address, old: Option<ObjectReference>) {
        let mut queue = self.queues.satb.borrow_mut();
        if likely(!queue.is_active()) {
            return;
        }
        let old = old.unwrap_or_else(|| self.vm.load_reference(slot));
        if old.is_null() {
            return;
        }
        self.satb.enqueue_known_active(&mut queue, old);
    }

    #[inline(always)]
    fn object_reference_write_post(&mut self, slot: Address, new: ObjectReference) {
        if likely(!Self::is_cross_region(slot, new)) {
            return;
        }
        let card = self.card_table.byte_for(slot);
        if self.card_table.get(card) == CardValue::Young {
            return;
        }
        // Order the store before re-reading the card. Refinement cleans the card before it
        // scans the card's objects, so either it sees the new value or we see the clean card.
        fence(Ordering::SeqCst);
        if likely(self.card_table.get(card) == CardValue::Dirty) {
            return;
        }
        self.post_barrier_slow(card);
    }

    #[inline(always)]
    fn object_reference_write(&mut self, slot: Address, new: ObjectReference) {
        self.object_reference_write_pre(slot, None);
        self.vm.store_reference(slot, new);
        self.object_reference_write_post(slot, new);
    }
}
