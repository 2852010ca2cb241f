//! g1-refine implements the write-barrier side of a G1-style garbage collector:
//! the SATB pre-barrier, the card-marking post-barrier, the per-thread log buffers
//! backing them, and the concurrent refinement threads that drain dirty cards.
//!
//! A runtime embeds the crate by:
//!
//! * implementing [`vm::VMBinding`] for the heap layout and remembered set it owns,
//! * building a [`G1Runtime`] through [`G1RuntimeBuilder`] and [`memory_manager::g1_init`],
//! * binding one [`Mutator`] per application thread and calling the barrier entry points
//!   in [`memory_manager`] around every reference store,
//! * bracketing each GC pause with [`memory_manager::safepoint_begin`] and
//!   [`memory_manager::safepoint_end`], and feeding pause timings back through
//!   [`memory_manager::adjust_refinement`].

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod barrier;
pub mod build_info;
pub mod memory_manager;
mod mutator;
pub mod queue;
pub mod refine;
mod runtime;
pub mod util;
pub mod vm;

#[cfg(test)]
mod tests;

pub use crate::mutator::Mutator;
pub use crate::runtime::{G1Runtime, G1RuntimeBuilder};
