use super::mock_test_prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Four refinement threads over green 10 and yellow 90 cards, i.e. activation thresholds
/// 30, 50, 70 and 90.
fn fixture() -> RuntimeFixture {
    RuntimeFixture::with_options(8, |builder| {
        assert!(builder.set_options_bulk_by_str(
            "conc_refinement_threads=4 update_buffer_size=2 parallel_gc_threads=32 \
             conc_refinement_green_zone=5 conc_refinement_yellow_zone=45"
        ));
    })
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting until {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn thresholds() {
    let rt = fixture();
    let cr = rt.concurrent_refine();
    assert_eq!(cr.num_threads(), 4);
    let activation: Vec<usize> = (0..4).map(|i| cr.activation_threshold(i)).collect();
    let deactivation: Vec<usize> = (0..4).map(|i| cr.deactivation_threshold(i)).collect();
    assert_eq!(activation, vec![30, 50, 70, 90]);
    assert_eq!(deactivation, vec![10, 30, 50, 70]);
    assert_eq!(rt.dirty_card_queue_set().process_cards_threshold(), 30);
}

#[test]
fn without_threads_mutators_never_notify() {
    let rt = RuntimeFixture::new(4);
    assert_eq!(rt.concurrent_refine().num_threads(), 0);
    assert_eq!(
        rt.dirty_card_queue_set().process_cards_threshold(),
        crate::util::constants::THRESHOLD_NEVER
    );
}

#[test]
fn activation_cascades_up_to_the_pending_cards() {
    panic_after(20_000, || {
        let rt = fixture();
        let gate = Arc::new(Gate::new());
        {
            let gate = gate.clone();
            rt.vm().set_refine_hook(move |_, _, _| {
                gate.pass();
                true
            });
        }

        // 88 cards: above thread 2's threshold, below thread 3's.
        let mut mutator = memory_manager::bind_mutator(&rt);
        for i in 0..88 {
            log_card(&rt, &mut mutator, 1, i);
        }
        memory_manager::flush_mutator(&mut mutator);
        assert_eq!(memory_manager::num_logged_cards(&rt), 88);

        memory_manager::start_refinement(&rt);
        // Each active thread blocks on the first card of its first buffer.
        gate.wait_for_arrivals(3);
        let cr = rt.concurrent_refine();
        let active: Vec<bool> = (0..4).map(|i| cr.is_thread_active(i)).collect();
        assert_eq!(active, vec![true, true, true, false]);
        assert_eq!(gate.arrivals(), 3);

        gate.open();
        wait_until("all threads are idle", || cr.num_active_threads() == 0);
        let remaining = memory_manager::num_logged_cards(&rt);
        assert!(remaining <= cr.green_zone(), "{} cards left", remaining);
        assert_eq!(rt.vm().refined_cards().len(), 88 - remaining);

        memory_manager::stop_refinement(&rt);
        let stats = rt.at_safepoint(memory_manager::get_and_reset_refinement_stats);
        assert_eq!(stats.concurrent.refined_cards(), 88 - remaining);
        assert_eq!(stats.mutator.refined_cards(), 0);
        drop(mutator);
    });
}

#[test]
fn idle_below_the_primary_threshold() {
    panic_after(20_000, || {
        let rt = fixture();
        memory_manager::start_refinement(&rt);
        let mut mutator = memory_manager::bind_mutator(&rt);
        for i in 0..30 {
            log_card(&rt, &mut mutator, 1, i);
        }
        memory_manager::flush_mutator(&mut mutator);
        // Nothing wakes the primary thread at exactly its threshold.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(rt.concurrent_refine().num_active_threads(), 0);
        assert!(rt.vm().refined_cards().is_empty());

        // One more buffer crosses it.
        for i in 30..33 {
            log_card(&rt, &mut mutator, 1, i);
        }
        wait_until("the primary thread caught up", || {
            memory_manager::num_logged_cards(&rt) <= 10
                && rt.concurrent_refine().num_active_threads() == 0
        });
        assert!(!rt.vm().refined_cards().is_empty());
        memory_manager::stop_refinement(&rt);
        drop(mutator);
    });
}

#[test]
fn stop_wakes_idle_threads() {
    panic_after(10_000, || {
        let rt = fixture();
        memory_manager::start_refinement(&rt);
        memory_manager::stop_refinement(&rt);
        assert!(rt.concurrent_refine().should_terminate());
        // Restartable.
        memory_manager::start_refinement(&rt);
    });
}
