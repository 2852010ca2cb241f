//! Per-thread log buffers and the queue sets that collect them.

/// Log buffers, their handles and the lock-free buffer allocator.
pub mod buffer;
/// Dirty card queues and buffer refinement.
pub mod dirty_card;
/// Worker ids for mutators that refine buffers themselves.
pub mod free_id_set;
mod paused;
/// The per-thread append-only log and the hand-off protocol shared by all queue sets.
pub mod ptr_queue;
/// The registry of attached mutators' queues.
pub mod registry;
/// SATB mark queues.
pub mod satb;
pub mod shared_dirty_card_queue;

pub use self::buffer::{BufferAllocator, BufferHandle, BufferNodeList};
pub use self::dirty_card::{DirtyCardQueue, DirtyCardQueueSet, RefinementResult};
pub use self::ptr_queue::{PtrQueue, PtrQueueSet};
pub use self::satb::{SATBMarkQueue, SATBMarkQueueSet};
