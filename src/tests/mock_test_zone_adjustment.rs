use super::mock_test_prelude::*;
use crate::refine::{ZonePolicy, Zones};
use crate::util::options::Options;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Green 10, yellow 20 and red 30 cards, with buffers of two cards.
fn fixture() -> RuntimeFixture {
    RuntimeFixture::with_options(4, |builder| {
        assert!(builder.set_options_bulk_by_str(
            "update_buffer_size=2 conc_refinement_green_zone=5 \
             conc_refinement_yellow_zone=10 conc_refinement_red_zone=15"
        ));
    })
}

#[test]
fn configured_zones() {
    let rt = fixture();
    assert_eq!(
        rt.concurrent_refine().zones(),
        Zones {
            green: 10,
            yellow: 20,
            red: 30
        }
    );
    assert_eq!(rt.dirty_card_queue_set().max_cards(), 30);
}

#[test]
fn slow_scans_shrink_green_to_zero() {
    let rt = fixture();
    let goal = rt.options().logged_cards_scan_goal_ms();
    let mut previous = rt.concurrent_refine().zones();
    for _ in 0..20 {
        rt.at_safepoint(|rt| memory_manager::adjust_refinement(rt, goal * 2.0, 1000));
        let zones = rt.concurrent_refine().zones();
        assert!(zones.is_ordered(), "{:?}", zones);
        assert!(zones.green <= previous.green);
        if previous.green > 0 {
            assert!(zones.green < previous.green);
        }
        assert_eq!(zones.red - zones.yellow, zones.yellow - zones.green);
        assert_eq!(rt.dirty_card_queue_set().max_cards(), zones.red);
        previous = zones;
    }
    assert_eq!(
        previous,
        Zones {
            green: 0,
            yellow: 0,
            red: 0
        }
    );
}

#[test]
fn fast_scans_grow_green() {
    let rt = fixture();
    let grown = ((10.0 * rt.options().conc_refinement_inc_factor).ceil() as usize).max(11);
    rt.at_safepoint(|rt| memory_manager::adjust_refinement(rt, 0.0, 100));
    assert_eq!(rt.concurrent_refine().green_zone(), grown);
    // Too few cards processed to tell.
    rt.at_safepoint(|rt| memory_manager::adjust_refinement(rt, 0.0, 0));
    assert_eq!(rt.concurrent_refine().green_zone(), grown);
}

#[test]
fn fixed_zones_are_not_adjusted() {
    let rt = RuntimeFixture::with_options(4, |builder| {
        assert!(builder.set_option("use_adaptive_conc_refinement", "false"));
    });
    let zones = rt.concurrent_refine().zones();
    rt.at_safepoint(|rt| memory_manager::adjust_refinement(rt, 1000.0, 1000));
    assert_eq!(rt.concurrent_refine().zones(), zones);
}

#[test]
fn cards_left_in_the_yellow_zone_pad_the_mutator_limit() {
    let rt = RuntimeFixture::with_options(4, |builder| {
        assert!(builder.set_options_bulk_by_str(
            "update_buffer_size=2 conc_refinement_green_zone=5 conc_refinement_yellow_zone=10 \
             conc_refinement_red_zone=15 use_adaptive_conc_refinement=false"
        ));
    });
    let mut mutator = memory_manager::bind_mutator(&rt);
    // 24 cards: between yellow and red, with one more left in the mutator's buffer.
    for i in 0..25 {
        log_card(&rt, &mut mutator, 1, i);
    }
    assert_eq!(memory_manager::num_logged_cards(&rt), 24);
    let goal = rt.options().logged_cards_scan_goal_ms();
    rt.at_safepoint(|rt| memory_manager::adjust_refinement(rt, goal, 0));
    let dcqs = rt.dirty_card_queue_set();
    assert_eq!(dcqs.max_cards(), 30);
    assert_eq!(dcqs.padded_max_cards(), 54);
    rt.at_safepoint(memory_manager::abandon_logs);
    drop(mutator);
}

#[test]
fn random_adjustments_keep_zones_ordered() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x61_7265_6669_6e65);
    for _ in 0..50 {
        let mut options = Options::without_env();
        options.conc_refinement_threads = rng.random_range(0..16);
        options.parallel_gc_threads = rng.random_range(1..64);
        options.update_buffer_size = rng.random_range(1..1024);
        options.conc_refinement_green_zone = rng.random_range(0..64);
        let policy = ZonePolicy::new(&options);
        let mut zones = policy.initial_zones(&options);
        assert!(zones.is_ordered(), "{:?}", zones);

        for _ in 0..200 {
            let goal_ms = if rng.random_bool(0.1) {
                0.0
            } else {
                rng.random_range(0.0..50.0)
            };
            let scan_ms = match rng.random_range(0..4) {
                0 => 0.0,
                1 => goal_ms,
                _ => rng.random_range(0.0..100.0),
            };
            let processed = match rng.random_range(0..3) {
                0 => 0,
                1 => zones.green,
                _ => rng.random_range(0..1_000_000),
            };
            zones = policy.update(zones, scan_ms, processed, goal_ms);
            assert!(
                zones.is_ordered(),
                "{:?} after scan {} of {} for {} cards",
                zones,
                scan_ms,
                goal_ms,
                processed
            );
            assert!(zones.green <= policy.max_green);
            assert!(zones.red <= policy.max_red);
        }
    }
}
