// Some tests are conditionally compiled. So not all the code in this module will be used. We simply allow dead code in this module.
#![allow(dead_code)]

use crate::memory_manager;
use crate::runtime::{G1Runtime, G1RuntimeBuilder};
use crate::util::test_util::mock_vm::MockVM;
use std::ops::Deref;

/// A runtime over a [`MockVM`] heap, with small buffers and no refinement threads unless the
/// test asks for them.
pub struct RuntimeFixture {
    runtime: Box<G1Runtime<MockVM>>,
}

impl RuntimeFixture {
    pub const BUFFER_SIZE: usize = 4;

    pub fn new(num_regions: usize) -> Self {
        Self::with_options(num_regions, |_| {})
    }

    /// `configure` runs after the fixture's defaults have been set.
    pub fn with_options<F: FnOnce(&mut G1RuntimeBuilder)>(num_regions: usize, configure: F) -> Self {
        let mut builder = G1RuntimeBuilder::new_no_env_vars();
        assert!(builder.set_options_bulk_by_str(
            "conc_refinement_threads=0 parallel_gc_threads=2 update_buffer_size=4 \
             satb_buffer_size=4 conc_rs_log_cache_size=0"
        ));
        configure(&mut builder);
        Self {
            runtime: memory_manager::g1_init(&builder, MockVM::new(num_regions)),
        }
    }

    /// Run `f` inside a safepoint.
    pub fn at_safepoint<R>(&self, f: impl FnOnce(&G1Runtime<MockVM>) -> R) -> R {
        memory_manager::safepoint_begin(&self.runtime);
        let result = f(&self.runtime);
        memory_manager::safepoint_end(&self.runtime);
        result
    }

    pub fn set_marking_active_at_safepoint(&self, active: bool) {
        self.at_safepoint(|rt| memory_manager::set_marking_active(rt, active));
    }
}

impl Deref for RuntimeFixture {
    type Target = G1Runtime<MockVM>;

    fn deref(&self) -> &G1Runtime<MockVM> {
        &self.runtime
    }
}
