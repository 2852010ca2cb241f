use crate::util::constants::DEFAULT_LOG_BYTES_IN_REGION;
use crate::util::{Address, ObjectReference};
use bytemuck::NoUninit;

/// What a heap region is currently used for.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit, strum_macros::Display)]
pub enum RegionKind {
    /// Not allocated.
    Free,
    /// Part of the young generation. Its cards are pre-tagged young and never refined.
    Young,
    /// Old generation.
    Old,
    /// Holds (part of) one humongous object.
    Humongous,
    /// Read-only archive region.
    Archive,
}

impl RegionKind {
    /// Regions whose remembered sets are maintained by refinement.
    pub fn is_old_or_humongous_or_archive(self) -> bool {
        matches!(
            self,
            RegionKind::Old | RegionKind::Humongous | RegionKind::Archive
        )
    }
}

/// A snapshot of the region that contains a card.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapRegionInfo {
    pub kind: RegionKind,
    /// First address of the region.
    pub bottom: Address,
    /// Allocation top. Cards at or above it have no objects to scan.
    pub top: Address,
}

/// The `VMBinding` trait connects the barriers and the refinement pipeline to the heap
/// of the embedding runtime.
///
/// Every method may be called concurrently from mutator threads and refinement threads.
pub trait VMBinding
where
    Self: Sized + 'static + Send + Sync,
{
    /// log2 of the region size in bytes. Stores within one region never need a card.
    const LOG_BYTES_IN_REGION: u8 = DEFAULT_LOG_BYTES_IN_REGION;

    /// The reserved heap range `[start, end)`. The card table covers exactly this range.
    fn reserved_heap(&self) -> (Address, Address);

    /// The region containing `addr`, or `None` if there is no such region (yet).
    fn heap_region_containing(&self, addr: Address) -> Option<HeapRegionInfo>;

    /// Is `object` below the top-at-mark-start of its region? Objects above it were allocated
    /// during marking and are implicitly live.
    fn is_below_tams(&self, object: ObjectReference) -> bool;

    /// Is `object` already marked in the current marking cycle?
    fn is_marked(&self, object: ObjectReference) -> bool;

    /// Load the reference stored in the slot. Used by the pre-barrier when the caller did not
    /// provide the old value.
    fn load_reference(&self, slot: Address) -> ObjectReference;

    /// Store `value` into the slot.
    fn store_reference(&self, slot: Address, value: ObjectReference);

    /// Scan the objects overlapping `[start, end)` and add their cross-region references to
    /// the remembered sets of the target regions.
    ///
    /// Return false if the range could not be parsed (e.g. an object in it is still being
    /// initialized). The card is then re-dirtied and refined again later.
    fn refine_card(&self, start: Address, end: Address, worker_id: usize) -> bool;
}
