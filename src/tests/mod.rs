// Tests that drive several components together over a `MockVM` heap.
// Each test builds its own runtime, so they can run in parallel.

// Common includes for mock tests.
pub(crate) mod mock_test_prelude {
    pub use crate::memory_manager;
    pub use crate::queue::PtrQueueSet;
    pub use crate::util::test_util::fixtures::*;
    pub use crate::util::test_util::mock_vm::*;
    pub use crate::util::test_util::{panic_after, CountdownYield, Gate};
    pub use crate::util::{Address, ObjectReference};
    pub use crate::vm::*;
    pub use crate::Mutator;

    use crate::barrier::card_table::CardValue;
    use crate::util::constants::BYTES_IN_CARD;

    /// Dirty card `i` of `region` and log it through `mutator`'s queue, the way the
    /// post-barrier slow path does.
    pub fn log_card(rt: &RuntimeFixture, mutator: &mut Mutator<MockVM>, region: usize, i: usize) {
        let card = card_entry(rt, region, i);
        rt.card_table().set(card, CardValue::Dirty);
        let mut queue = mutator.queues().dirty.borrow_mut();
        rt.dirty_card_queue_set().enqueue(&mut queue, card);
    }

    /// The card table entry of card `i` of `region`.
    pub fn card_entry(rt: &RuntimeFixture, region: usize, i: usize) -> Address {
        rt.card_table()
            .byte_for(rt.vm().region_start(region) + i * BYTES_IN_CARD)
    }

    /// Cards per region.
    pub const CARDS_PER_REGION: usize = MOCK_BYTES_IN_REGION / BYTES_IN_CARD;
}

mod mock_test_activation_cascade;
mod mock_test_pause_lifecycle;
mod mock_test_satb_marking;
mod mock_test_zone_adjustment;
