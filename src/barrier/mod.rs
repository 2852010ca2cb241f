//! The card table and the G1 write barriers.

/// The card table: one byte per card of the reserved heap.
pub mod card_table;
pub mod g1_barrier;

pub use self::card_table::{CardTable, CardValue};
pub use self::g1_barrier::{Barrier, G1Barrier};
