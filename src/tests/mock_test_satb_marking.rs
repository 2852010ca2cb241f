use super::mock_test_prelude::*;
use std::collections::HashSet;

fn obj(rt: &RuntimeFixture, region: usize, offset: usize) -> ObjectReference {
    ObjectReference::from_raw_address(rt.vm().region_start(region) + offset)
}

fn drain_satb(rt: &RuntimeFixture) -> Vec<ObjectReference> {
    let mut seen = vec![];
    while memory_manager::satb_apply_closure_to_completed_buffer(rt, |objs| {
        seen.extend_from_slice(objs)
    }) {}
    seen
}

#[test]
fn overwritten_references_reach_the_marker() {
    let rt = RuntimeFixture::new(4);
    let mut mutator = memory_manager::bind_mutator(&rt);
    let slots: Vec<Address> = (0..6).map(|i| rt.vm().region_start(0) + i * 8).collect();
    // Initial graph, before marking: nothing is logged.
    for (i, &slot) in slots.iter().enumerate() {
        memory_manager::object_reference_write(&mut mutator, slot, obj(&rt, 1, 0x100 * (i + 1)));
    }
    assert!(mutator.queues().satb.borrow().ptr_queue().is_empty());

    rt.set_marking_active_at_safepoint(true);
    assert!(memory_manager::is_marking_active(&rt));
    // Region 2 is allocated into during marking, and one old object is already marked.
    rt.vm().set_tams(2, rt.vm().region_start(2));
    let marked = obj(&rt, 1, 0x300);
    rt.vm().mark(marked);

    let mut expected = HashSet::new();
    for (i, &slot) in slots.iter().enumerate() {
        let old = obj(&rt, 1, 0x100 * (i + 1));
        if old != marked {
            expected.insert(old);
        }
        memory_manager::object_reference_write(&mut mutator, slot, obj(&rt, 2, 0x100 * (i + 1)));
    }
    // The new values are overwritten too, but they were allocated since marking started.
    for &slot in slots.iter() {
        memory_manager::object_reference_write(&mut mutator, slot, ObjectReference::NULL);
    }
    // Null old values are not logged.
    memory_manager::object_reference_write(&mut mutator, slots[0], obj(&rt, 3, 0));

    rt.at_safepoint(memory_manager::satb_flush_all_queues);
    let seen: HashSet<ObjectReference> = drain_satb(&rt).into_iter().collect();
    assert_eq!(seen, expected);

    rt.set_marking_active_at_safepoint(false);
    memory_manager::object_reference_write(&mut mutator, slots[0], ObjectReference::NULL);
    assert!(mutator.queues().satb.borrow().ptr_queue().is_empty());
    assert!(drain_satb(&rt).is_empty());
    memory_manager::destroy_mutator(mutator);
}

#[test]
fn mutator_attached_during_marking_logs() {
    let rt = RuntimeFixture::new(4);
    rt.set_marking_active_at_safepoint(true);
    let mut mutator = memory_manager::bind_mutator(&rt);
    assert!(mutator.queues().satb.borrow().is_active());
    let slot = rt.vm().region_start(0);
    memory_manager::object_reference_write_pre(&mut mutator, slot, Some(obj(&rt, 1, 0x40)));
    // Detaching hands the partial buffer over.
    memory_manager::destroy_mutator(mutator);
    assert_eq!(drain_satb(&rt), vec![obj(&rt, 1, 0x40)]);
    rt.set_marking_active_at_safepoint(false);
}

#[test]
fn completed_buffers_ask_for_processing() {
    let rt = RuntimeFixture::with_options(4, |builder| {
        assert!(builder.set_options_bulk_by_str(
            "satb_process_completed_threshold=1 satb_buffer_enqueueing_threshold_percent=0"
        ));
    });
    rt.set_marking_active_at_safepoint(true);
    let mut mutator = memory_manager::bind_mutator(&rt);
    let slot = rt.vm().region_start(0);
    // Three full buffers of four entries, the last one still with the mutator.
    for i in 0..12 {
        memory_manager::object_reference_write_pre(&mut mutator, slot, Some(obj(&rt, 1, 8 * (i + 1))));
    }
    assert_eq!(rt.satb_mark_queue_set().completed_buffers_num(), 2);
    assert!(memory_manager::satb_process_completed_buffers(&rt));

    assert_eq!(drain_satb(&rt).len(), 8);
    assert!(!memory_manager::satb_process_completed_buffers(&rt));
    drop(mutator);
    rt.set_marking_active_at_safepoint(false);
}

#[test]
fn abandoned_marking_drops_the_logs() {
    let rt = RuntimeFixture::new(4);
    rt.set_marking_active_at_safepoint(true);
    let mut mutator = memory_manager::bind_mutator(&rt);
    let slot = rt.vm().region_start(0);
    for i in 0..9 {
        memory_manager::object_reference_write_pre(&mut mutator, slot, Some(obj(&rt, 1, 8 * (i + 1))));
    }
    assert!(rt.satb_mark_queue_set().completed_buffers_num() > 0);

    rt.at_safepoint(|rt| {
        memory_manager::abandon_partial_marking(rt);
        memory_manager::set_marking_active(rt, false);
    });
    assert_eq!(rt.satb_mark_queue_set().completed_buffers_num(), 0);
    assert!(mutator.queues().satb.borrow().ptr_queue().is_empty());
    memory_manager::flush_mutator(&mut mutator);
    assert!(drain_satb(&rt).is_empty());
    drop(mutator);
}
