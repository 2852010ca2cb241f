//! A mock heap for the crate's own tests.
//!
//! The heap is a fixed run of small regions at a made-up address; nothing is mapped. Region
//! kinds, tops, TAMS and mark bits are plain fields the test sets up, reference slots live in
//! a map, and every card handed to [`VMBinding::refine_card`] is recorded. A test can replace
//! the remembered set update with a hook, e.g. to make cards unparsable or to block a
//! refinement thread.

// Not every test uses every helper.
#![allow(dead_code)]

use crate::util::{Address, ObjectReference};
use crate::vm::{HeapRegionInfo, RegionKind, VMBinding};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

/// log2 of the mock region size (64KB).
pub const MOCK_LOG_BYTES_IN_REGION: u8 = 16;
pub const MOCK_BYTES_IN_REGION: usize = 1 << MOCK_LOG_BYTES_IN_REGION;
/// Where the mock heap starts.
pub const MOCK_HEAP_START: Address = Address::from_usize(0x1000_0000);

/// Called with `(start, end, worker_id)` instead of the default remembered set update, which
/// accepts every card.
pub type RefineHook = dyn Fn(Address, Address, usize) -> bool + Send + Sync;

#[derive(Copy, Clone, Debug)]
struct MockRegion {
    kind: RegionKind,
    top: Address,
    tams: Address,
}

pub struct MockVM {
    num_regions: usize,
    regions: RwLock<Vec<MockRegion>>,
    marked: Mutex<HashSet<ObjectReference>>,
    slots: Mutex<HashMap<Address, ObjectReference>>,
    refined: Mutex<Vec<Address>>,
    refine_hook: Mutex<Option<Arc<RefineHook>>>,
}

impl MockVM {
    /// A heap of `num_regions` old regions, each full (top and TAMS at the region end).
    pub fn new(num_regions: usize) -> Self {
        assert!(num_regions > 0);
        let regions = (0..num_regions)
            .map(|i| {
                let end = MOCK_HEAP_START + (i + 1) * MOCK_BYTES_IN_REGION;
                MockRegion {
                    kind: RegionKind::Old,
                    top: end,
                    tams: end,
                }
            })
            .collect();
        Self {
            num_regions,
            regions: RwLock::new(regions),
            marked: Mutex::new(HashSet::new()),
            slots: Mutex::new(HashMap::new()),
            refined: Mutex::new(vec![]),
            refine_hook: Mutex::new(None),
        }
    }

    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    pub fn region_start(&self, region: usize) -> Address {
        assert!(region < self.num_regions);
        MOCK_HEAP_START + region * MOCK_BYTES_IN_REGION
    }

    pub fn region_end(&self, region: usize) -> Address {
        self.region_start(region) + MOCK_BYTES_IN_REGION
    }

    fn region_index(&self, addr: Address) -> Option<usize> {
        if addr < MOCK_HEAP_START {
            return None;
        }
        let index = (addr - MOCK_HEAP_START) >> MOCK_LOG_BYTES_IN_REGION;
        (index < self.num_regions).then_some(index)
    }

    pub fn set_kind(&self, region: usize, kind: RegionKind) {
        self.regions.write().unwrap()[region].kind = kind;
    }

    pub fn set_top(&self, region: usize, top: Address) {
        debug_assert!(top >= self.region_start(region) && top <= self.region_end(region));
        self.regions.write().unwrap()[region].top = top;
    }

    pub fn set_tams(&self, region: usize, tams: Address) {
        debug_assert!(tams >= self.region_start(region) && tams <= self.region_end(region));
        self.regions.write().unwrap()[region].tams = tams;
    }

    pub fn mark(&self, object: ObjectReference) {
        self.marked.lock().unwrap().insert(object);
    }

    /// Heap addresses of the cards refined so far, in the order they were refined.
    pub fn refined_cards(&self) -> Vec<Address> {
        self.refined.lock().unwrap().clone()
    }

    pub fn clear_refined_cards(&self) {
        self.refined.lock().unwrap().clear();
    }

    pub fn set_refine_hook<F>(&self, hook: F)
    where
        F: Fn(Address, Address, usize) -> bool + Send + Sync + 'static,
    {
        *self.refine_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn clear_refine_hook(&self) {
        *self.refine_hook.lock().unwrap() = None;
    }
}

impl VMBinding for MockVM {
    const LOG_BYTES_IN_REGION: u8 = MOCK_LOG_BYTES_IN_REGION;

    fn reserved_heap(&self) -> (Address, Address) {
        (MOCK_HEAP_START, self.region_end(self.num_regions - 1))
    }

    fn heap_region_containing(&self, addr: Address) -> Option<HeapRegionInfo> {
        let index = self.region_index(addr)?;
        let region = self.regions.read().unwrap()[index];
        if region.kind == RegionKind::Free {
            return None;
        }
        Some(HeapRegionInfo {
            kind: region.kind,
            bottom: self.region_start(index),
            top: region.top,
        })
    }

    fn is_below_tams(&self, object: ObjectReference) -> bool {
        let addr = object.to_raw_address();
        match self.region_index(addr) {
            Some(index) => addr < self.regions.read().unwrap()[index].tams,
            None => false,
        }
    }

    fn is_marked(&self, object: ObjectReference) -> bool {
        self.marked.lock().unwrap().contains(&object)
    }

    fn load_reference(&self, slot: Address) -> ObjectReference {
        self.slots
            .lock()
            .unwrap()
            .get(&slot)
            .copied()
            .unwrap_or(ObjectReference::NULL)
    }

    fn store_reference(&self, slot: Address, value: ObjectReference) {
        self.slots.lock().unwrap().insert(slot, value);
    }

    fn refine_card(&self, start: Address, end: Address, worker_id: usize) -> bool {
        self.refined.lock().unwrap().push(start);
        // Call the hook without holding the lock: it may block.
        let hook = self.refine_hook.lock().unwrap().clone();
        match hook {
            Some(hook) => hook(start, end, worker_id),
            None => true,
        }
    }
}
