//! VM-to-g1-refine interface: safe Rust APIs.
//!
//! This module provides the entry points an embedding runtime calls. We expect the binding to
//! wrap them, adding what is specific to the runtime, and to expose them to native code if
//! necessary, in which case the binding manages the unsafety of doing so.
//!
//! The functions fall into four groups:
//!
//! 1. lifecycle: [`g1_init`], [`start_refinement`], [`stop_refinement`], [`bind_mutator`],
//!    [`destroy_mutator`], [`flush_mutator`];
//! 2. barriers, called by mutators around reference stores;
//! 3. marking: switching the SATB pre-barrier on and off and consuming its logs;
//! 4. pauses: functions that may only be called between [`safepoint_begin`] and
//!    [`safepoint_end`], with every mutator stopped.

use crate::barrier::g1_barrier::Barrier;
use crate::mutator::Mutator;
use crate::queue::BufferNodeList;
use crate::refine::stats::RefinementStatsSummary;
use crate::runtime::{G1Runtime, G1RuntimeBuilder};
use crate::util::{Address, ObjectReference};
use crate::vm::VMBinding;

/// Create a runtime for the heap of `vm`, with the options set on `builder`.
///
/// This attempts to initialize a logger. If the VM would like to use its own logger, it
/// should initialize it before calling this function.
///
/// Refinement threads are not started yet: call [`start_refinement`] once the VM is ready
/// for background threads. Until then, pending cards are left for pauses and, above the red
/// zone, refined by mutators.
///
/// Arguments:
/// * `builder`: The builder holding the options.
/// * `vm`: The binding for the heap this runtime serves.
pub fn g1_init<VM: VMBinding>(builder: &G1RuntimeBuilder, vm: VM) -> Box<G1Runtime<VM>> {
    crate::util::logger::init();
    let runtime = builder.build(vm);
    info!(
        "Initialized g1-refine with {} refinement threads",
        runtime.options().conc_refinement_threads
    );
    #[cfg(feature = "extreme_assertions")]
    warn!("The feature 'extreme_assertions' is enabled. Every pause will verify the dirty card count, which is slow.");
    Box::new(runtime)
}

/// Spawn the concurrent refinement threads.
pub fn start_refinement<VM: VMBinding>(runtime: &G1Runtime<VM>) {
    runtime.start_refinement();
}

/// Stop the concurrent refinement threads and wait for them to exit. Must not be called at
/// a safepoint.
pub fn stop_refinement<VM: VMBinding>(runtime: &G1Runtime<VM>) {
    debug_assert!(!runtime.safepoint().is_at_safepoint());
    runtime.stop_refinement();
}

/// Create the context of a new application thread. The VM should keep the mutator where
/// the thread's barrier code can reach it cheaply, e.g. in thread local storage.
///
/// Arguments:
/// * `runtime`: The runtime the thread attaches to.
pub fn bind_mutator<VM: VMBinding>(runtime: &G1Runtime<VM>) -> Box<Mutator<VM>> {
    Box::new(Mutator::new(runtime))
}

/// Detach a thread. Its logs are handed to the queue sets.
pub fn destroy_mutator<VM: VMBinding>(mutator: Box<Mutator<VM>>) {
    drop(mutator);
}

/// Hand the mutator's partially filled log buffers to the queue sets.
pub fn flush_mutator<VM: VMBinding>(mutator: &mut Mutator<VM>) {
    mutator.flush()
}

/// The SATB pre-barrier. Call it *before* overwriting the reference in `slot`.
///
/// Arguments:
/// * `mutator`: The mutator for the current thread.
/// * `slot`: The location about to be overwritten.
/// * `old`: The reference currently in `slot`, if the caller has already loaded it.
///   Otherwise it is loaded through [`VMBinding::load_reference`] when marking is active.
#[inline(always)]
pub fn object_reference_write_pre<VM: VMBinding>(
    mutator: &mut Mutator<VM>,
    slot: Address,
    old: Option<ObjectReference>,
) {
    mutator.barrier.object_reference_write_pre(slot, old);
}

/// The card-marking post-barrier. Call it *after* storing `target` into `slot`.
#[inline(always)]
pub fn object_reference_write_post<VM: VMBinding>(
    mutator: &mut Mutator<VM>,
    slot: Address,
    target: ObjectReference,
) {
    mutator.barrier.object_reference_write_post(slot, target);
}

/// The subsuming barrier: pre-barrier, the store itself through
/// [`VMBinding::store_reference`], and post-barrier.
#[inline(always)]
pub fn object_reference_write<VM: VMBinding>(
    mutator: &mut Mutator<VM>,
    slot: Address,
    target: ObjectReference,
) {
    mutator.barrier.object_reference_write(slot, target);
}

/// Switch the SATB pre-barrier of every mutator on (at the start of concurrent marking) or off.
/// Only at a safepoint.
pub fn set_marking_active<VM: VMBinding>(runtime: &G1Runtime<VM>, active: bool) {
    runtime.set_marking_active(active);
}

/// Is the SATB pre-barrier on?
pub fn is_marking_active<VM: VMBinding>(runtime: &G1Runtime<VM>) -> bool {
    runtime.satb_mark_queue_set().is_active()
}

/// Hand the entries of one completed SATB buffer to `f`. Returns false if there was none.
/// Entries the marker does not need, objects allocated since marking started and objects
/// already marked, were filtered out when the buffer was completed.
pub fn satb_apply_closure_to_completed_buffer<VM: VMBinding, F>(
    runtime: &G1Runtime<VM>,
    f: F,
) -> bool
where
    F: FnMut(&[ObjectReference]),
{
    runtime
        .satb_mark_queue_set()
        .apply_closure_to_completed_buffer(f)
}

/// Are enough completed SATB buffers pending that the marker should process them?
pub fn satb_process_completed_buffers<VM: VMBinding>(runtime: &G1Runtime<VM>) -> bool {
    runtime.satb_mark_queue_set().process_completed_buffers()
}

/// Hand the partial SATB buffer of every mutator to the marker, e.g. at the remark pause.
/// Only at a safepoint.
pub fn satb_flush_all_queues<VM: VMBinding>(runtime: &G1Runtime<VM>) {
    debug_assert!(runtime.safepoint().is_at_safepoint());
    runtime
        .satb_mark_queue_set()
        .flush_all_queues(runtime.registry());
}

/// Drop everything the SATB pre-barrier has logged, e.g. when marking is aborted. Only at a
/// safepoint.
pub fn abandon_partial_marking<VM: VMBinding>(runtime: &G1Runtime<VM>) {
    debug_assert!(runtime.safepoint().is_at_safepoint());
    runtime
        .satb_mark_queue_set()
        .abandon_partial_marking(runtime.registry());
}

/// Begin a pause. Refinement threads are stopped on return; the caller is responsible for
/// stopping its own mutators before calling this.
pub fn safepoint_begin<VM: VMBinding>(runtime: &G1Runtime<VM>) {
    runtime.safepoint_begin();
}

/// End a pause and let refinement threads resume.
pub fn safepoint_end<VM: VMBinding>(runtime: &G1Runtime<VM>) {
    runtime.safepoint_end();
}

/// Feed back how long the pause took to scan the logged cards, so that the refinement zones
/// can be recomputed. Only at a safepoint.
///
/// Arguments:
/// * `logged_cards_scan_time_ms`: Time spent scanning the logged cards in this pause.
/// * `processed_logged_cards`: Number of logged cards scanned in this pause.
pub fn adjust_refinement<VM: VMBinding>(
    runtime: &G1Runtime<VM>,
    logged_cards_scan_time_ms: f64,
    processed_logged_cards: usize,
) {
    runtime.adjust_refinement(logged_cards_scan_time_ms, processed_logged_cards);
}

/// Drop every logged card, e.g. before a full collection rebuilds the remembered sets.
/// Cards parked in the hot card cache and the per-card refinement counts are dropped too.
/// Only at a safepoint.
pub fn abandon_logs<VM: VMBinding>(runtime: &G1Runtime<VM>) {
    runtime.abandon_logs();
}

/// Move all logged cards, including partial buffers and paused buffers, to the completed
/// list. Only at a safepoint. Cards parked in the hot card cache are not included; they stay
/// parked until a pause calls [`drain_hot_card_cache`].
pub fn concatenate_logs<VM: VMBinding>(runtime: &G1Runtime<VM>) {
    runtime
        .dirty_card_queue_set()
        .concatenate_logs(runtime.registry());
}

/// Take all completed dirty card buffers for the pause to process. Only at a safepoint,
/// usually after [`concatenate_logs`].
pub fn take_all_completed_buffers<VM: VMBinding>(runtime: &G1Runtime<VM>) -> BufferNodeList {
    runtime.dirty_card_queue_set().take_all_completed_buffers()
}

/// Put back buffers taken with [`take_all_completed_buffers`].
pub fn merge_completed_buffers<VM: VMBinding>(runtime: &G1Runtime<VM>, list: BufferNodeList) {
    runtime.dirty_card_queue_set().merge_bufferlists(list)
}

/// Hand every card in `list` to `f` and free the buffers. Returns the number of buffers.
pub fn release_completed_buffers<VM: VMBinding, F: FnMut(Address)>(
    runtime: &G1Runtime<VM>,
    list: BufferNodeList,
    f: F,
) -> usize {
    runtime.dirty_card_queue_set().release_bufferlist(list, f)
}

/// Hand cards parked in the hot card cache to `f`. Several workers may drain in parallel,
/// each with its own `worker_id`. Only at a safepoint. The ring is emptied when a pause
/// that drained it ends; a pause that never calls this leaves the cards parked.
pub fn drain_hot_card_cache<VM: VMBinding, F: FnMut(Address)>(
    runtime: &G1Runtime<VM>,
    worker_id: usize,
    mut f: F,
) {
    debug_assert!(runtime.safepoint().is_at_safepoint());
    runtime
        .hot_card_cache()
        .drain(worker_id, |card, _| f(card));
}

/// Sum up and reset the refinement stats of mutators and refinement threads.
/// Only at a safepoint.
pub fn get_and_reset_refinement_stats<VM: VMBinding>(
    runtime: &G1Runtime<VM>,
) -> RefinementStatsSummary {
    runtime.get_and_reset_refinement_stats()
}

/// Number of logged cards waiting for refinement, as far as the queue set knows.
pub fn num_logged_cards<VM: VMBinding>(runtime: &G1Runtime<VM>) -> usize {
    runtime.dirty_card_queue_set().num_cards()
}

/// The version, git commit and features of this build, e.g. for the VM's version output.
pub fn g1_refine_build_info() -> String {
    crate::build_info::banner()
}
