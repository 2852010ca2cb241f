use crate::barrier::card_table::CardTable;
use crate::queue::free_id_set::FreeIdSet;
use crate::queue::registry::MutatorRegistry;
use crate::queue::{DirtyCardQueueSet, SATBMarkQueueSet};
use crate::refine::stats::RefinementStatsSummary;
use crate::refine::{CardRefiner, ConcurrentRefine, HotCardCache, PrimaryNotifier};
use crate::util::options::Options;
use crate::util::safepoint::Safepoint;
use crate::vm::VMBinding;
use std::sync::Arc;

/// Build a [`G1Runtime`]. Options are read from `G1_`-prefixed environment variables first,
/// then from [`set_option`](Self::set_option) calls.
pub struct G1RuntimeBuilder {
    pub options: Options,
}

impl G1RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
        }
    }

    /// A builder that ignores environment variables.
    pub fn new_no_env_vars() -> Self {
        Self {
            options: Options::without_env(),
        }
    }

    /// Set an option by name. Returns false, keeping the old value, if it is rejected.
    pub fn set_option(&mut self, name: &str, val: &str) -> bool {
        self.options.set_from_str(name, val)
    }

    /// Set options from a whitespace separated list of `key=value` pairs.
    pub fn set_options_bulk_by_str(&mut self, options: &str) -> bool {
        self.options.set_bulk_from_str(options)
    }

    pub fn build<VM: VMBinding>(&self, vm: VM) -> G1Runtime<VM> {
        G1Runtime::new(Arc::new(self.options.clone()), vm)
    }
}

impl Default for G1RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One instance of the barrier and refinement machinery, for one heap.
pub struct G1Runtime<VM: VMBinding> {
    pub(crate) options: Arc<Options>,
    pub(crate) vm: Arc<VM>,
    pub(crate) card_table: Arc<CardTable>,
    pub(crate) safepoint: Arc<Safepoint>,
    pub(crate) hot_card_cache: Arc<HotCardCache>,
    pub(crate) satb: Arc<SATBMarkQueueSet<VM>>,
    pub(crate) dcqs: Arc<DirtyCardQueueSet<VM>>,
    pub(crate) refine: Arc<ConcurrentRefine<VM>>,
    pub(crate) registry: Arc<MutatorRegistry>,
}

impl<VM: VMBinding> G1Runtime<VM> {
    fn new(options: Arc<Options>, vm: VM) -> Self {
        let vm = Arc::new(vm);
        let (heap_start, heap_end) = vm.reserved_heap();
        let card_table = Arc::new(CardTable::new(heap_start, heap_end));
        let hot_card_cache = Arc::new(HotCardCache::new(
            card_table.num_cards(),
            options.conc_rs_log_cache_size,
            options.conc_rs_hot_card_limit,
        ));
        let safepoint = Arc::new(Safepoint::new());
        let primary = Arc::new(PrimaryNotifier::new());

        let satb = Arc::new(SATBMarkQueueSet::new(
            vm.clone(),
            options.satb_buffer_size,
            options.satb_process_completed_threshold,
            options.satb_buffer_enqueueing_threshold_percent,
        ));
        // Refinement threads use ids 0..n, mutators refining for themselves the ones after.
        let free_ids = FreeIdSet::new(options.conc_refinement_threads, num_cpus::get());
        let dcqs = Arc::new(DirtyCardQueueSet::new(
            options.update_buffer_size,
            CardRefiner::new(vm.clone(), card_table.clone(), hot_card_cache.clone()),
            primary.clone(),
            safepoint.clone(),
            free_ids,
        ));
        let refine = Arc::new(ConcurrentRefine::new(
            dcqs.clone(),
            safepoint.clone(),
            primary,
            &options,
        ));
        info!(
            "G1 runtime for heap {}..{}: update buffer {} cards, SATB buffer {} entries",
            heap_start, heap_end, options.update_buffer_size, options.satb_buffer_size
        );

        Self {
            options,
            vm,
            card_table,
            safepoint,
            hot_card_cache,
            satb,
            dcqs,
            refine,
            registry: Arc::new(MutatorRegistry::new()),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn vm(&self) -> &VM {
        &self.vm
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    pub fn hot_card_cache(&self) -> &HotCardCache {
        &self.hot_card_cache
    }

    pub fn satb_mark_queue_set(&self) -> &SATBMarkQueueSet<VM> {
        &self.satb
    }

    pub fn dirty_card_queue_set(&self) -> &DirtyCardQueueSet<VM> {
        &self.dcqs
    }

    pub fn concurrent_refine(&self) -> &ConcurrentRefine<VM> {
        &self.refine
    }

    pub fn registry(&self) -> &MutatorRegistry {
        &self.registry
    }

    pub(crate) fn start_refinement(&self) {
        self.refine.start();
    }

    pub(crate) fn stop_refinement(&self) {
        self.refine.stop();
    }

    pub(crate) fn set_marking_active(&self, active: bool) {
        debug_assert!(self.safepoint.is_at_safepoint(), "not at a safepoint");
        self.satb
            .set_active_all_threads(&self.registry, active, !active);
    }

    pub(crate) fn safepoint_begin(&self) {
        self.safepoint.begin();
        // Cards parked in the hot card cache are handed to the pause from now on.
        self.hot_card_cache.set_use_cache(false);
        self.hot_card_cache.reset_hot_cache_claimed_index();
    }

    pub(crate) fn safepoint_end(&self) {
        // A pause that did not drain the cache leaves its cards parked for a later one.
        if self.hot_card_cache.was_drained() {
            self.hot_card_cache.reset_hot_cache();
        }
        self.hot_card_cache.set_use_cache(true);
        self.safepoint.end();
    }

    pub(crate) fn abandon_logs(&self) {
        debug_assert!(self.safepoint.is_at_safepoint(), "not at a safepoint");
        self.dcqs.abandon_logs(&self.registry);
        self.hot_card_cache.reset_hot_cache();
        self.hot_card_cache.reset_card_counts();
    }

    pub(crate) fn adjust_refinement(
        &self,
        logged_cards_scan_time_ms: f64,
        processed_logged_cards: usize,
    ) {
        debug_assert!(self.safepoint.is_at_safepoint(), "not at a safepoint");
        self.refine.adjust(
            logged_cards_scan_time_ms,
            processed_logged_cards,
            self.options.logged_cards_scan_goal_ms(),
        );
    }

    pub(crate) fn get_and_reset_refinement_stats(&self) -> RefinementStatsSummary {
        debug_assert!(self.safepoint.is_at_safepoint(), "not at a safepoint");
        RefinementStatsSummary {
            mutator: self.dcqs.get_and_reset_refinement_stats(&self.registry),
            concurrent: self.refine.get_and_reset_refinement_stats(),
        }
    }
}

impl<VM: VMBinding> Drop for G1Runtime<VM> {
    fn drop(&mut self) {
        self.refine.stop();
    }
}
