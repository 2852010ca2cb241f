use crate::barrier::g1_barrier::{Barrier, G1Barrier};
use crate::queue::registry::{MutatorQueues, MutatorRegistry};
use crate::queue::{DirtyCardQueue, SATBMarkQueue};
use crate::runtime::G1Runtime;
use crate::vm::VMBinding;
use std::sync::Arc;

/// The per-thread context of an application thread: its barrier and log queues.
///
/// Created by [`crate::memory_manager::bind_mutator`]. Dropping it flushes the queues and
/// detaches the thread.
pub struct Mutator<VM: VMBinding> {
    pub barrier: G1Barrier<VM>,
    registry: Arc<MutatorRegistry>,
}

impl<VM: VMBinding> Mutator<VM> {
    pub(crate) fn new(runtime: &G1Runtime<VM>) -> Self {
        let satb = runtime.satb.clone();
        let buffer_size = runtime.options.update_buffer_size;
        let satb_buffer_size = runtime.options.satb_buffer_size;
        // Registration is serialized with marking (de)activation, so the queue starts in the
        // current state.
        let queues = runtime.registry.register(|| {
            MutatorQueues::new(
                SATBMarkQueue::new(satb_buffer_size, satb.is_active()),
                DirtyCardQueue::new(buffer_size),
            )
        });
        trace!("Mutator bound, {} attached", runtime.registry.len());
        Self {
            barrier: G1Barrier::new(
                runtime.vm.clone(),
                runtime.card_table.clone(),
                satb,
                runtime.dcqs.clone(),
                queues,
            ),
            registry: runtime.registry.clone(),
        }
    }

    pub fn queues(&self) -> &MutatorQueues {
        self.barrier.queues()
    }

    /// Hand the partially filled log buffers over.
    pub fn flush(&mut self) {
        self.barrier.flush();
    }
}

impl<VM: VMBinding> Drop for Mutator<VM> {
    fn drop(&mut self) {
        self.barrier.flush();
        {
            let mut dirty = self.barrier.queues().dirty.borrow_mut();
            self.barrier
                .dirty_card_queue_set()
                .record_detached_refinement_stats(dirty.refinement_stats_mut());
        }
        self.registry.unregister(self.barrier.queues());
        trace!("Mutator unbound, {} attached", self.registry.len());
    }
}
