use super::dirty_card::DirtyCardQueue;
use super::satb::SATBMarkQueue;
use atomic_refcell::AtomicRefCell;
use std::sync::{Arc, Mutex};

/// The thread-local queues of one mutator.
///
/// The owning mutator borrows them on every barrier slow path. Other threads only touch them
/// while the mutator is stopped (at a safepoint) or detaching.
pub struct MutatorQueues {
    pub satb: AtomicRefCell<SATBMarkQueue>,
    pub dirty: AtomicRefCell<DirtyCardQueue>,
}

impl MutatorQueues {
    pub fn new(satb: SATBMarkQueue, dirty: DirtyCardQueue) -> Self {
        Self {
            satb: AtomicRefCell::new(satb),
            dirty: AtomicRefCell::new(dirty),
        }
    }
}

/// All attached mutators' queues.
#[derive(Default)]
pub struct MutatorRegistry {
    mutators: Mutex<Vec<Arc<MutatorQueues>>>,
}

impl MutatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new mutator. `init` runs under the registry lock, so it sees a state that
    /// cannot change until the mutator is visible to [`for_each`](Self::for_each).
    pub fn register(&self, init: impl FnOnce() -> MutatorQueues) -> Arc<MutatorQueues> {
        let mut mutators = self.mutators.lock().unwrap();
        let queues = Arc::new(init());
        mutators.push(queues.clone());
        queues
    }

    pub fn unregister(&self, queues: &Arc<MutatorQueues>) {
        let mut mutators = self.mutators.lock().unwrap();
        let before = mutators.len();
        mutators.retain(|q| !Arc::ptr_eq(q, queues));
        debug_assert_eq!(mutators.len() + 1, before, "mutator was not registered");
    }

    /// Visit every registered mutator. New mutators are held off until the visit ends.
    pub fn for_each(&self, mut f: impl FnMut(&MutatorQueues)) {
        self.with_locked(|mutators| {
            for queues in mutators.iter() {
                f(queues);
            }
        })
    }

    /// Run `f` on the registered mutators with registration locked.
    pub fn with_locked<R>(&self, f: impl FnOnce(&[Arc<MutatorQueues>]) -> R) -> R {
        let mutators = self.mutators.lock().unwrap();
        f(&mutators)
    }

    pub fn len(&self) -> usize {
        self.mutators.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
