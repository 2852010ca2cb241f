use super::mock_test_prelude::*;
use crate::barrier::card_table::CardValue;
use crate::refine::RefinementStats;
use crate::util::safepoint::NeverYield;

fn refine_all(rt: &RuntimeFixture) -> RefinementStats {
    let mut stats = RefinementStats::new();
    while rt
        .dirty_card_queue_set()
        .refine_completed_buffer_concurrently(0, 0, &mut stats, &NeverYield)
    {}
    stats
}

#[test]
fn abandon_logs_drops_everything() {
    let rt = RuntimeFixture::new(4);
    let mut mutator = memory_manager::bind_mutator(&rt);
    for i in 0..10 {
        log_card(&rt, &mut mutator, 1, i);
    }
    assert_eq!(memory_manager::num_logged_cards(&rt), 8);

    rt.at_safepoint(memory_manager::abandon_logs);
    assert_eq!(memory_manager::num_logged_cards(&rt), 0);
    assert!(mutator.queues().dirty.borrow().is_empty());
    assert_eq!(
        mutator.queues().dirty.borrow().refinement_stats().dirtied_cards(),
        0
    );
    // The mutator keeps logging into its old buffer.
    log_card(&rt, &mut mutator, 2, 0);
    assert_eq!(mutator.queues().dirty.borrow().ptr_queue().size(), 1);
    memory_manager::destroy_mutator(mutator);
    assert_eq!(memory_manager::num_logged_cards(&rt), 1);
}

#[test]
fn take_and_merge_completed_buffers() {
    let rt = RuntimeFixture::new(4);
    let mut mutator = memory_manager::bind_mutator(&rt);
    for i in 0..10 {
        log_card(&rt, &mut mutator, 1, i);
    }

    rt.at_safepoint(|rt| {
        memory_manager::concatenate_logs(rt);
        // The partial buffer was collected too.
        assert_eq!(memory_manager::num_logged_cards(rt), 10);
        let list = memory_manager::take_all_completed_buffers(rt);
        assert_eq!(list.entry_count(), 10);
        assert_eq!(memory_manager::num_logged_cards(rt), 0);
        memory_manager::merge_completed_buffers(rt, list);
        assert_eq!(memory_manager::num_logged_cards(rt), 10);
    });
    assert!(mutator.queues().dirty.borrow().is_empty());

    let stats = refine_all(&rt);
    assert_eq!(stats.refined_cards(), 10);
    assert_eq!(rt.vm().refined_cards().len(), 10);
    memory_manager::destroy_mutator(mutator);
}

#[test]
fn unparsable_card_is_logged_again() {
    let rt = RuntimeFixture::new(4);
    let card = card_entry(&rt, 1, 3);
    let unparsable = rt.card_table().addr_for(card);
    rt.vm()
        .set_refine_hook(move |start, _, _| start != unparsable);

    let mut mutator = memory_manager::bind_mutator(&rt);
    for i in 0..RuntimeFixture::BUFFER_SIZE {
        log_card(&rt, &mut mutator, 1, i);
    }
    memory_manager::destroy_mutator(mutator);
    refine_all(&rt);
    assert_eq!(rt.card_table().get(card), CardValue::Dirty);
    assert_eq!(rt.dirty_card_queue_set().shared_queue().size(), 1);
    assert_eq!(memory_manager::num_logged_cards(&rt), 0);

    let list = rt.at_safepoint(|rt| {
        memory_manager::concatenate_logs(rt);
        memory_manager::take_all_completed_buffers(rt)
    });
    let mut cards = vec![];
    memory_manager::release_completed_buffers(&rt, list, |c| cards.push(c));
    assert_eq!(cards, vec![card]);
}

fn hot_card_fixture() -> RuntimeFixture {
    RuntimeFixture::with_options(4, |builder| {
        assert!(builder.set_options_bulk_by_str(
            "conc_rs_log_cache_size=4 conc_rs_hot_card_limit=1"
        ));
    })
}

/// Refine card 0 of region 1 twice, so that the second refinement parks it in the hot card
/// cache. Returns the parked card.
fn park_hot_card(rt: &RuntimeFixture, mutator: &mut Mutator<MockVM>) -> Address {
    // First refinement: not hot yet.
    log_card(rt, mutator, 1, 0);
    memory_manager::flush_mutator(mutator);
    refine_all(rt);
    assert_eq!(rt.vm().refined_cards().len(), 1);

    // Second: parked in the cache instead.
    log_card(rt, mutator, 1, 0);
    memory_manager::flush_mutator(mutator);
    let stats = refine_all(rt);
    assert_eq!(stats.precleaned_cards(), 1);
    assert_eq!(rt.vm().refined_cards().len(), 1);
    card_entry(rt, 1, 0)
}

fn drain_at_safepoint(rt: &RuntimeFixture) -> Vec<Address> {
    rt.at_safepoint(|rt| {
        let mut drained = vec![];
        memory_manager::drain_hot_card_cache(rt, 0, |card| drained.push(card));
        drained
    })
}

#[test]
fn hot_cards_are_left_to_the_pause() {
    let rt = hot_card_fixture();
    assert!(rt.hot_card_cache().use_cache());
    let mut mutator = memory_manager::bind_mutator(&rt);
    let hot = park_hot_card(&rt, &mut mutator);

    let drained = rt.at_safepoint(|rt| {
        assert!(!rt.hot_card_cache().use_cache());
        let mut drained = vec![];
        memory_manager::drain_hot_card_cache(rt, 0, |card| drained.push(card));
        // Already claimed.
        memory_manager::drain_hot_card_cache(rt, 1, |card| drained.push(card));
        drained
    });
    assert_eq!(drained, vec![hot]);
    assert!(rt.hot_card_cache().use_cache());

    // The ring is empty after the pause.
    assert!(drain_at_safepoint(&rt).is_empty());
    drop(mutator);
}

#[test]
fn hot_cards_survive_pauses_that_do_not_drain() {
    let rt = hot_card_fixture();
    let mut mutator = memory_manager::bind_mutator(&rt);
    let hot = park_hot_card(&rt, &mut mutator);

    // A pause that takes the logs but leaves the cache alone.
    let cards = rt.at_safepoint(|rt| {
        memory_manager::concatenate_logs(rt);
        let list = memory_manager::take_all_completed_buffers(rt);
        let mut cards = vec![];
        memory_manager::release_completed_buffers(rt, list, |card| cards.push(card));
        cards
    });
    assert!(cards.is_empty());
    // Pauses that only toggle marking.
    rt.set_marking_active_at_safepoint(true);
    rt.set_marking_active_at_safepoint(false);

    assert_eq!(rt.card_table().get(hot), CardValue::Dirty);
    assert_eq!(drain_at_safepoint(&rt), vec![hot]);
    assert!(drain_at_safepoint(&rt).is_empty());
    drop(mutator);
}

#[test]
fn abandon_logs_forgets_hot_cards() {
    let rt = hot_card_fixture();
    let mut mutator = memory_manager::bind_mutator(&rt);
    park_hot_card(&rt, &mut mutator);

    rt.at_safepoint(memory_manager::abandon_logs);
    assert!(drain_at_safepoint(&rt).is_empty());

    // The refinement counts were dropped too: the card is cold again.
    log_card(&rt, &mut mutator, 1, 0);
    memory_manager::flush_mutator(&mut mutator);
    let stats = refine_all(&rt);
    assert_eq!(stats.refined_cards(), 1);
    assert_eq!(rt.vm().refined_cards().len(), 2);
    drop(mutator);
}

#[test]
fn mutators_refine_above_the_red_zone() {
    // Green 8, yellow 24, red 40 cards.
    let rt = RuntimeFixture::new(4);
    assert_eq!(rt.dirty_card_queue_set().max_cards(), 40);
    let mut mutator = memory_manager::bind_mutator(&rt);
    for i in 0..45 {
        log_card(&rt, &mut mutator, 1, i);
    }
    // The 11th full buffer took the count to 44 and was refined on the spot.
    assert_eq!(memory_manager::num_logged_cards(&rt), 40);
    assert_eq!(rt.vm().refined_cards().len(), 4);
    let stats = mutator.queues().dirty.borrow().refinement_stats().refined_cards();
    assert_eq!(stats, 4);

    let summary = rt.at_safepoint(|rt| {
        memory_manager::abandon_logs(rt);
        memory_manager::get_and_reset_refinement_stats(rt)
    });
    // Abandoning the logs resets the mutator stats too.
    assert_eq!(summary.total().refined_cards(), 0);
    drop(mutator);
}
