//! The interface between this crate and the runtime that embeds it.
//!
//! The embedding runtime owns the heap. It tells us where regions start and end,
//! what kind each region is, what concurrent marking currently knows about an
//! object, and how to update a region's remembered set for one card.

mod vmbinding;

pub use self::vmbinding::HeapRegionInfo;
pub use self::vmbinding::RegionKind;
pub use self::vmbinding::VMBinding;
