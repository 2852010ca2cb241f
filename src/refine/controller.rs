//! The concurrent refinement controller.
//!
//! Pending cards are measured against three zones:
//!
//! * below green, refinement threads stay idle and the cards are left for the next pause,
//! * between green and yellow, more threads are activated the more cards are pending,
//! * between yellow and red, all threads run,
//! * above red, mutators refine buffers themselves.
//!
//! Thread `i` is activated once the pending cards exceed its activation threshold and
//! goes idle once they drop to its deactivation threshold. Only the primary thread (0) is
//! woken by the queue set; every other thread is woken by its predecessor.

use super::notifier::PrimaryNotifier;
use super::stats::RefinementStats;
use super::thread::{self, RefineThread};
use crate::queue::DirtyCardQueueSet;
use crate::util::constants::{MAX_GREEN_ZONE, MAX_RED_ZONE, MAX_YELLOW_ZONE, THRESHOLD_NEVER};
use crate::util::options::Options;
use crate::util::safepoint::{Safepoint, YieldPoint};
use crate::vm::VMBinding;
use probe::probe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Zone boundaries, in cards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Zones {
    pub green: usize,
    pub yellow: usize,
    pub red: usize,
}

impl Zones {
    pub fn is_ordered(&self) -> bool {
        self.green <= self.yellow && self.yellow <= self.red
    }
}

/// Activation and deactivation thresholds of one refinement thread, in cards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Thresholds {
    pub activation: usize,
    pub deactivation: usize,
}

/// How zones are derived from the options and updated after each pause.
#[derive(Clone, Debug)]
pub struct ZonePolicy {
    pub num_threads: usize,
    pub use_adaptive: bool,
    pub inc_factor: f64,
    pub dec_factor: f64,
    /// Smallest distance between green and yellow.
    pub min_yellow_size: usize,
    /// Upper bound of thread 0's threshold step.
    pub primary_step_limit: f64,
    pub max_green: usize,
    pub max_yellow: usize,
    pub max_red: usize,
}

impl ZonePolicy {
    pub fn new(options: &Options) -> Self {
        let num_threads = options.conc_refinement_threads;
        let step = options.buffers_to_cards(
            options.conc_refinement_threshold_step,
            "conc_refinement_threshold_step",
        );
        let min_yellow_size = if num_threads > 0 && MAX_YELLOW_ZONE / step < num_threads {
            MAX_YELLOW_ZONE
        } else {
            step * num_threads
        };
        let parallel_gc_cards =
            options.buffers_to_cards(options.parallel_gc_threads, "parallel_gc_threads");
        Self {
            num_threads,
            use_adaptive: options.use_adaptive_conc_refinement,
            inc_factor: options.conc_refinement_inc_factor,
            dec_factor: options.conc_refinement_dec_factor,
            min_yellow_size,
            primary_step_limit: parallel_gc_cards as f64 / 2.0,
            max_green: MAX_GREEN_ZONE,
            max_yellow: MAX_YELLOW_ZONE,
            max_red: MAX_RED_ZONE,
        }
    }

    /// The zones at startup.
    pub fn initial_zones(&self, options: &Options) -> Zones {
        let green = if options.conc_refinement_green_zone == 0 {
            options.buffers_to_cards(options.parallel_gc_threads, "parallel_gc_threads")
        } else {
            options.buffers_to_cards(
                options.conc_refinement_green_zone,
                "conc_refinement_green_zone",
            )
        };
        let green = green.min(self.max_green);

        let yellow_config = options.buffers_to_cards(
            options.conc_refinement_yellow_zone,
            "conc_refinement_yellow_zone",
        );
        let yellow_size = if options.conc_refinement_yellow_zone == 0 {
            green.saturating_mul(2)
        } else {
            yellow_config.saturating_sub(green)
        };
        let yellow_size = yellow_size.max(self.min_yellow_size).min(self.max_yellow);
        let yellow = green.saturating_add(yellow_size).min(self.max_yellow);

        let red = if options.conc_refinement_red_zone == 0 {
            yellow.saturating_add(yellow - green)
        } else {
            options
                .buffers_to_cards(options.conc_refinement_red_zone, "conc_refinement_red_zone")
                .max(yellow)
        };
        let red = red.min(self.max_red);

        let zones = Zones { green, yellow, red };
        debug_assert!(zones.is_ordered(), "{:?}", zones);
        zones
    }

    /// Recompute the zones from the last pause: shrink green when scanning the logged cards
    /// took longer than the goal, grow it when it was faster and more cards than green
    /// were processed. Yellow and red follow green.
    pub fn update(
        &self,
        zones: Zones,
        logged_cards_scan_time_ms: f64,
        processed_logged_cards: usize,
        goal_ms: f64,
    ) -> Zones {
        let mut green = zones.green;
        if logged_cards_scan_time_ms > goal_ms {
            green = (green as f64 * self.dec_factor) as usize;
        } else if logged_cards_scan_time_ms < goal_ms && processed_logged_cards > green {
            let grown = (green as f64 * self.inc_factor).ceil() as usize;
            green = grown.max(green + 1).min(self.max_green);
        }
        let yellow = green
            .saturating_add(green.saturating_mul(2).max(self.min_yellow_size))
            .min(self.max_yellow);
        let red = yellow.saturating_add(yellow - green).min(self.max_red);
        Zones { green, yellow, red }
    }

    /// Thresholds for thread `worker_id`: the yellow zone is split into one step per
    /// thread. Thread 0 uses a smaller step if the yellow zone is large, so that refinement
    /// starts before many more than green cards have piled up.
    pub fn thresholds(&self, zones: &Zones, worker_id: usize) -> Thresholds {
        debug_assert!(self.num_threads > 0);
        let yellow_size = (zones.yellow - zones.green) as f64;
        let mut step = yellow_size / self.num_threads as f64;
        if worker_id == 0 {
            step = step.min(self.primary_step_limit);
        }
        let activate_offset = (step * (worker_id + 1) as f64).ceil() as usize;
        let deactivate_offset = (step * worker_id as f64).floor() as usize;
        Thresholds {
            activation: zones.green.saturating_add(activate_offset),
            deactivation: zones.green.saturating_add(deactivate_offset),
        }
    }
}

pub struct ConcurrentRefine<VM: VMBinding> {
    dcqs: Arc<DirtyCardQueueSet<VM>>,
    safepoint: Arc<Safepoint>,
    policy: ZonePolicy,
    green_zone: AtomicUsize,
    yellow_zone: AtomicUsize,
    red_zone: AtomicUsize,
    threads: Vec<RefineThread>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    should_terminate: AtomicBool,
}

impl<VM: VMBinding> ConcurrentRefine<VM> {
    pub fn new(
        dcqs: Arc<DirtyCardQueueSet<VM>>,
        safepoint: Arc<Safepoint>,
        primary: Arc<PrimaryNotifier>,
        options: &Options,
    ) -> Self {
        let policy = ZonePolicy::new(options);
        let zones = policy.initial_zones(options);
        Self::with_zones(dcqs, safepoint, primary, policy, zones)
    }

    pub fn with_zones(
        dcqs: Arc<DirtyCardQueueSet<VM>>,
        safepoint: Arc<Safepoint>,
        primary: Arc<PrimaryNotifier>,
        policy: ZonePolicy,
        zones: Zones,
    ) -> Self {
        assert!(zones.is_ordered(), "zones out of order: {:?}", zones);
        let threads = (0..policy.num_threads)
            .map(|worker_id| {
                if worker_id == 0 {
                    RefineThread::primary(primary.clone())
                } else {
                    RefineThread::secondary(worker_id)
                }
            })
            .collect();
        let cr = Self {
            dcqs,
            safepoint,
            policy,
            green_zone: AtomicUsize::new(zones.green),
            yellow_zone: AtomicUsize::new(zones.yellow),
            red_zone: AtomicUsize::new(zones.red),
            threads,
            handles: Mutex::new(vec![]),
            should_terminate: AtomicBool::new(false),
        };
        info!(
            "Concurrent refinement: {} threads, zones green {} yellow {} red {}",
            cr.num_threads(),
            zones.green,
            zones.yellow,
            zones.red
        );
        // Mutators start handing buffers to thread 0 at its activation threshold.
        cr.update_queue_thresholds();
        cr.dcqs.set_max_cards(zones.red);
        cr
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn policy(&self) -> &ZonePolicy {
        &self.policy
    }

    pub fn dirty_card_queue_set(&self) -> &DirtyCardQueueSet<VM> {
        &self.dcqs
    }

    pub(crate) fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    pub fn green_zone(&self) -> usize {
        self.green_zone.load(Ordering::Relaxed)
    }

    pub fn yellow_zone(&self) -> usize {
        self.yellow_zone.load(Ordering::Relaxed)
    }

    pub fn red_zone(&self) -> usize {
        self.red_zone.load(Ordering::Relaxed)
    }

    pub fn zones(&self) -> Zones {
        Zones {
            green: self.green_zone(),
            yellow: self.yellow_zone(),
            red: self.red_zone(),
        }
    }

    fn thresholds(&self, worker_id: usize) -> Thresholds {
        self.policy.thresholds(&self.zones(), worker_id)
    }

    pub fn activation_threshold(&self, worker_id: usize) -> usize {
        self.thresholds(worker_id).activation
    }

    pub fn deactivation_threshold(&self, worker_id: usize) -> usize {
        self.thresholds(worker_id).deactivation
    }

    fn update_queue_thresholds(&self) {
        if self.num_threads() == 0 {
            // Nobody to notify.
            self.dcqs.set_process_cards_threshold(THRESHOLD_NEVER);
        } else {
            self.dcqs
                .set_process_cards_threshold(self.activation_threshold(0));
        }
    }

    /// Feed back the timing of the last pause. Only at a safepoint.
    ///
    /// `logged_cards_scan_time_ms` is the time the pause spent on the `processed_logged_cards`
    /// logged cards, and `goal_ms` the budget it had for them.
    pub fn adjust(
        &self,
        logged_cards_scan_time_ms: f64,
        processed_logged_cards: usize,
        goal_ms: f64,
    ) {
        if self.policy.use_adaptive {
            let old = self.zones();
            let new = self.policy.update(
                old,
                logged_cards_scan_time_ms,
                processed_logged_cards,
                goal_ms,
            );
            debug_assert!(new.is_ordered(), "{:?}", new);
            self.green_zone.store(new.green, Ordering::Relaxed);
            self.yellow_zone.store(new.yellow, Ordering::Relaxed);
            self.red_zone.store(new.red, Ordering::Relaxed);
            debug!(
                "Updated refinement zones: green {} yellow {} red {} (was {} {} {}; scan {:.3}ms of {:.3}ms for {} cards)",
                new.green,
                new.yellow,
                new.red,
                old.green,
                old.yellow,
                old.red,
                logged_cards_scan_time_ms,
                goal_ms,
                processed_logged_cards
            );
            probe!(g1_refine, zones_adjusted, new.green, new.yellow, new.red);
            self.update_queue_thresholds();
            self.dcqs.set_max_cards(new.red);
        }

        let curr_cards = self.dcqs.num_cards();
        if self.dcqs.max_cards() > 0 && curr_cards >= self.yellow_zone() {
            self.dcqs.set_max_cards_padding(curr_cards);
        } else {
            self.dcqs.set_max_cards_padding(0);
        }
        self.dcqs.notify_if_necessary();
    }

    /// One step of thread `worker_id`: wake the next thread if there is more work than this
    /// one should handle, then refine one buffer unless the pending cards are at or below
    /// this thread's deactivation threshold. Returns false if no buffer was refined.
    pub fn do_refinement_step<Y: YieldPoint + ?Sized>(
        &self,
        worker_id: usize,
        stats: &mut RefinementStats,
        yield_point: &Y,
    ) -> bool {
        let curr_cards = self.dcqs.num_cards();
        // Back in the yellow zone: the transition period after a pause is over.
        if curr_cards <= self.yellow_zone() {
            self.dcqs.discard_max_cards_padding();
        }
        self.maybe_activate_more_threads(worker_id, curr_cards);
        self.dcqs.refine_completed_buffer_concurrently(
            worker_id,
            self.deactivation_threshold(worker_id),
            stats,
            yield_point,
        )
    }

    fn maybe_activate_more_threads(&self, worker_id: usize, curr_cards: usize) {
        let next = worker_id + 1;
        if next < self.num_threads() && curr_cards > self.activation_threshold(next) {
            let thread = &self.threads[next];
            if !thread.is_active() {
                debug!(
                    "Worker {} activating worker {} at {} cards",
                    worker_id, next, curr_cards
                );
            }
            thread.activate();
        }
    }

    /// Spawn the refinement threads.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().unwrap();
        assert!(handles.is_empty(), "refinement threads already started");
        self.should_terminate.store(false, Ordering::Release);
        for worker_id in 0..self.num_threads() {
            let cr = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("G1 Refine#{}", worker_id))
                .spawn(move || thread::run(cr, worker_id))
                .unwrap_or_else(|e| {
                    error!("Failed to spawn refinement thread {}: {}", worker_id, e);
                    panic!("Failed to spawn refinement thread {}", worker_id);
                });
            handles.push(handle);
        }
        info!("Started {} concurrent refinement threads", handles.len());
    }

    /// Ask the refinement threads to exit and wait for them. Not at a safepoint.
    pub fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        self.should_terminate.store(true, Ordering::Release);
        for thread in self.threads.iter() {
            thread.wake_for_shutdown();
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("A concurrent refinement thread panicked");
            }
        }
        info!("Stopped concurrent refinement threads");
    }

    pub fn should_terminate(&self) -> bool {
        self.should_terminate.load(Ordering::Acquire)
    }

    pub(crate) fn should_terminate_flag(&self) -> &AtomicBool {
        &self.should_terminate
    }

    pub(crate) fn thread(&self, worker_id: usize) -> &RefineThread {
        &self.threads[worker_id]
    }

    pub fn is_thread_active(&self, worker_id: usize) -> bool {
        self.threads[worker_id].is_active()
    }

    pub fn num_active_threads(&self) -> usize {
        self.threads.iter().filter(|t| t.is_active()).count()
    }

    /// Sum up and reset the stats of all refinement threads. Only at a safepoint, or with
    /// the threads stopped.
    pub fn get_and_reset_refinement_stats(&self) -> RefinementStats {
        let mut total = RefinementStats::new();
        for thread in self.threads.iter() {
            total += thread.take_stats();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(num_threads: usize) -> ZonePolicy {
        let mut options = Options::without_env();
        options.conc_refinement_threads = num_threads;
        options.parallel_gc_threads = 8;
        options.update_buffer_size = 4;
        ZonePolicy::new(&options)
    }

    #[test]
    fn derived_initial_zones() {
        let mut options = Options::without_env();
        options.conc_refinement_threads = 2;
        options.parallel_gc_threads = 8;
        options.update_buffer_size = 4;
        let policy = ZonePolicy::new(&options);
        assert_eq!(policy.min_yellow_size, 2 * 4 * 2);
        let zones = policy.initial_zones(&options);
        assert_eq!(
            zones,
            Zones {
                green: 32,
                yellow: 96,
                red: 160
            }
        );
    }

    #[test]
    fn configured_initial_zones() {
        let mut options = Options::without_env();
        options.conc_refinement_threads = 2;
        options.update_buffer_size = 4;
        options.conc_refinement_green_zone = 1;
        options.conc_refinement_yellow_zone = 3;
        options.conc_refinement_red_zone = 100;
        let policy = ZonePolicy::new(&options);
        let zones = policy.initial_zones(&options);
        // Yellow is widened to the minimum yellow size.
        assert_eq!(zones.green, 4);
        assert_eq!(zones.yellow, 4 + 16);
        assert_eq!(zones.red, 400);
    }

    #[test]
    fn thresholds_split_yellow() {
        let policy = policy(4);
        let zones = Zones {
            green: 10,
            yellow: 90,
            red: 170,
        };
        let t: Vec<Thresholds> = (0..4).map(|i| policy.thresholds(&zones, i)).collect();
        assert_eq!(
            t.iter().map(|t| t.activation).collect::<Vec<_>>(),
            vec![26, 50, 70, 90]
        );
        assert_eq!(
            t.iter().map(|t| t.deactivation).collect::<Vec<_>>(),
            vec![10, 30, 50, 70]
        );
    }

    #[test]
    fn green_shrinks_and_grows() {
        let policy = policy(1);
        let zones = Zones {
            green: 100,
            yellow: 200,
            red: 300,
        };
        let slow = policy.update(zones, 30.0, 1000, 20.0);
        assert_eq!(slow.green, 90);
        let fast = policy.update(zones, 10.0, 1000, 20.0);
        assert_eq!(fast.green, 110);
        // Fast, but not more cards than green were processed.
        let idle = policy.update(zones, 10.0, 50, 20.0);
        assert_eq!(idle.green, 100);
        // Small greens still grow.
        let tiny = policy.update(Zones { green: 1, yellow: 10, red: 20 }, 1.0, 5, 20.0);
        assert_eq!(tiny.green, 2);
        for z in [slow, fast, idle, tiny] {
            assert!(z.is_ordered());
            assert_eq!(z.red - z.yellow, z.yellow - z.green);
        }
    }

    #[test]
    fn green_is_capped() {
        let policy = policy(1);
        let zones = Zones {
            green: policy.max_green,
            yellow: policy.max_yellow,
            red: policy.max_yellow,
        };
        let next = policy.update(zones, 0.0, usize::MAX, 1.0);
        assert_eq!(next.green, policy.max_green);
        assert_eq!(next.yellow, policy.max_yellow);
        assert!(next.red <= policy.max_red);
    }
}
