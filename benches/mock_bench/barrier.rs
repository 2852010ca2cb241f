use criterion::black_box;
use criterion::Criterion;

use g1_refine::memory_manager;
use g1_refine::util::test_util::fixtures::*;
use g1_refine::util::ObjectReference;

pub fn bench(c: &mut Criterion) {
    let rt = RuntimeFixture::with_options(4, |builder| {
        assert!(builder.set_option("update_buffer_size", "256"));
    });
    let mut mutator = memory_manager::bind_mutator(&rt);
    let slot = rt.vm().region_start(1) + 64usize;
    let same_region = ObjectReference::from_raw_address(rt.vm().region_start(1) + 128usize);
    let cross_region = ObjectReference::from_raw_address(rt.vm().region_start(2));

    c.bench_function("post barrier, same region", |b| {
        b.iter(|| {
            memory_manager::object_reference_write_post(
                &mut mutator,
                black_box(slot),
                black_box(same_region),
            )
        })
    });

    // The first store dirties the card. Every later one finds it dirty.
    c.bench_function("post barrier, dirty card", |b| {
        b.iter(|| {
            memory_manager::object_reference_write_post(
                &mut mutator,
                black_box(slot),
                black_box(cross_region),
            )
        })
    });

    c.bench_function("pre barrier, marking inactive", |b| {
        b.iter(|| {
            memory_manager::object_reference_write_pre(
                &mut mutator,
                black_box(slot),
                black_box(Some(cross_region)),
            )
        })
    });

    // A marked object is filtered out when the buffer fills, so the same buffer is reused
    // instead of piling up completed buffers.
    rt.vm().mark(cross_region);
    rt.set_marking_active_at_safepoint(true);
    c.bench_function("pre barrier, marking active", |b| {
        b.iter(|| {
            memory_manager::object_reference_write_pre(
                &mut mutator,
                black_box(slot),
                black_box(Some(cross_region)),
            )
        })
    });
    rt.at_safepoint(|rt| {
        memory_manager::abandon_partial_marking(rt);
        memory_manager::set_marking_active(rt, false);
    });
    memory_manager::destroy_mutator(mutator);
}
