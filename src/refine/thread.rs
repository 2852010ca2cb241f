use super::controller::ConcurrentRefine;
use super::notifier::{PrimaryNotifier, SecondaryNotifier};
use super::stats::RefinementStats;
use crate::vm::VMBinding;
use atomic_refcell::AtomicRefCell;
use probe::probe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How a refinement thread is woken up.
enum Activation {
    /// Thread 0, woken by the dirty card queue set.
    Primary(Arc<PrimaryNotifier>),
    /// Every other thread, woken by its predecessor.
    Secondary(SecondaryNotifier),
}

/// The state of one concurrent refinement thread shared with the controller.
pub(crate) struct RefineThread {
    worker_id: usize,
    active: AtomicBool,
    activation: Activation,
    /// Borrowed by the thread for one refinement step at a time, and by a pause in between.
    stats: AtomicRefCell<RefinementStats>,
}

impl RefineThread {
    pub fn primary(notifier: Arc<PrimaryNotifier>) -> Self {
        Self::new(0, Activation::Primary(notifier))
    }

    pub fn secondary(worker_id: usize) -> Self {
        debug_assert!(worker_id > 0);
        Self::new(worker_id, Activation::Secondary(SecondaryNotifier::new()))
    }

    fn new(worker_id: usize, activation: Activation) -> Self {
        Self {
            worker_id,
            active: AtomicBool::new(false),
            activation,
            stats: AtomicRefCell::new(RefinementStats::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Request activation.
    pub fn activate(&self) {
        match &self.activation {
            Activation::Primary(notifier) => notifier.notify(),
            Activation::Secondary(notifier) => notifier.activate(),
        }
    }

    fn wait_for_activation(&self, should_terminate: &AtomicBool) {
        match &self.activation {
            Activation::Primary(notifier) => notifier.wait(),
            Activation::Secondary(notifier) => notifier.wait(should_terminate),
        }
    }

    /// Called after a step found nothing to do. Returns true if the thread should go idle.
    fn maybe_deactivate<VM: VMBinding>(&self, cr: &ConcurrentRefine<VM>) -> bool {
        match &self.activation {
            Activation::Primary(notifier) => {
                notifier.reset();
                // Cards enqueued before notification was enabled again did not notify.
                let dcqs = cr.dirty_card_queue_set();
                !(dcqs.num_cards() > dcqs.process_cards_threshold() && notifier.try_reactivate())
            }
            Activation::Secondary(notifier) => notifier.maybe_deactivate(),
        }
    }

    pub fn wake_for_shutdown(&self) {
        match &self.activation {
            Activation::Primary(notifier) => notifier.wake(),
            Activation::Secondary(notifier) => notifier.wake(),
        }
    }

    pub fn take_stats(&self) -> RefinementStats {
        std::mem::take(&mut *self.stats.borrow_mut())
    }
}

/// The body of refinement thread `worker_id`.
pub(crate) fn run<VM: VMBinding>(cr: Arc<ConcurrentRefine<VM>>, worker_id: usize) {
    let thread = cr.thread(worker_id);
    debug_assert_eq!(thread.worker_id, worker_id);
    let sts = cr.safepoint().sts();
    while !cr.should_terminate() {
        thread.wait_for_activation(cr.should_terminate_flag());
        if cr.should_terminate() {
            break;
        }
        thread.active.store(true, Ordering::Release);
        debug!(
            "Activated worker {}, on threshold {}, current {}",
            worker_id,
            cr.activation_threshold(worker_id),
            cr.dirty_card_queue_set().num_cards()
        );
        probe!(g1_refine, thread_activated, worker_id);

        {
            let joiner = sts.join();
            while !cr.should_terminate() {
                if joiner.should_yield() {
                    joiner.yield_now();
                    continue;
                }
                let refined = {
                    let mut stats = thread.stats.borrow_mut();
                    cr.do_refinement_step(worker_id, &mut stats, sts)
                };
                if !refined && thread.maybe_deactivate(&cr) {
                    break;
                }
            }
        }

        thread.active.store(false, Ordering::Release);
        debug!(
            "Deactivated worker {}, off threshold {}, current {}",
            worker_id,
            cr.deactivation_threshold(worker_id),
            cr.dirty_card_queue_set().num_cards()
        );
        probe!(g1_refine, thread_deactivated, worker_id);
    }
    trace!("Refinement thread {} exits", worker_id);
}
