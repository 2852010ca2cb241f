use criterion::Criterion;

use g1_refine::barrier::CardValue;
use g1_refine::memory_manager;
use g1_refine::refine::RefinementStats;
use g1_refine::util::constants::BYTES_IN_CARD;
use g1_refine::util::safepoint::NeverYield;
use g1_refine::util::test_util::fixtures::*;

/// Log and refine one full buffer of distinct cards per iteration.
pub fn bench(c: &mut Criterion) {
    let rt = RuntimeFixture::new(8);
    let mut mutator = memory_manager::bind_mutator(&rt);
    let cards: Vec<_> = (0..RuntimeFixture::BUFFER_SIZE)
        .map(|i| {
            rt.card_table()
                .byte_for(rt.vm().region_start(1) + i * BYTES_IN_CARD)
        })
        .collect();
    let mut stats = RefinementStats::new();

    c.bench_function("log and refine a buffer", |b| {
        b.iter(|| {
            let dcqs = rt.dirty_card_queue_set();
            for &card in cards.iter() {
                rt.card_table().set(card, CardValue::Dirty);
                dcqs.enqueue(&mut mutator.queues().dirty.borrow_mut(), card);
            }
            memory_manager::flush_mutator(&mut mutator);
            while dcqs.refine_completed_buffer_concurrently(0, 0, &mut stats, &NeverYield) {}
            rt.vm().clear_refined_cards();
        })
    });
    memory_manager::destroy_mutator(mutator);
}
