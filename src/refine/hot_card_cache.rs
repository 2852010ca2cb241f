//! A cache for cards that are refined over and over again.
//!
//! Each card has a saturating refinement counter. Once a card has been refined
//! `hot_limit` times it is "hot": instead of refining it again, refinement parks it in a
//! ring buffer and refines whichever card it displaces. Cards in the ring stay there until a
//! pause drains it, so a card dirtied many times between pauses is refined far fewer times.
//! A pause that does not drain the ring leaves the parked cards for a later one.

use crate::barrier::card_table::CardTable;
use crate::util::Address;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Number of ring entries a draining worker claims at a time.
const CLAIM_CHUNK_SIZE: usize = 32;

pub struct HotCardCache {
    use_cache: AtomicBool,
    hot_limit: u8,
    /// Refinement counts, one per card of the card table.
    card_counts: Box<[AtomicU8]>,
    /// The ring. Zero means empty.
    hot_cache: Box<[AtomicUsize]>,
    hot_cache_idx: CachePadded<AtomicUsize>,
    par_claimed_idx: CachePadded<AtomicUsize>,
    wrapped_around: AtomicBool,
    /// Set once a drain has started since the claim index was last reset.
    drained: AtomicBool,
}

impl HotCardCache {
    /// A cache for a table of `num_cards` cards with a ring of `1 << log_size` entries.
    /// A `log_size` of zero disables the cache.
    pub fn new(num_cards: usize, log_size: usize, hot_limit: u8) -> Self {
        let enabled = log_size > 0;
        let size = if enabled { 1usize << log_size } else { 0 };
        Self {
            use_cache: AtomicBool::new(enabled),
            hot_limit,
            card_counts: if enabled {
                (0..num_cards).map(|_| AtomicU8::new(0)).collect()
            } else {
                Box::new([])
            },
            hot_cache: (0..size).map(|_| AtomicUsize::new(0)).collect(),
            hot_cache_idx: CachePadded::new(AtomicUsize::new(0)),
            par_claimed_idx: CachePadded::new(AtomicUsize::new(0)),
            wrapped_around: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        }
    }

    /// Is the cache configured at all?
    pub fn is_enabled(&self) -> bool {
        !self.hot_cache.is_empty()
    }

    /// Is the cache currently accepting cards? It is switched off while it is drained.
    pub fn use_cache(&self) -> bool {
        self.use_cache.load(Ordering::Relaxed)
    }

    pub fn set_use_cache(&self, b: bool) {
        self.use_cache.store(b && self.is_enabled(), Ordering::Relaxed);
    }

    pub fn size(&self) -> usize {
        self.hot_cache.len()
    }

    /// Has the ring been filled completely since the last reset?
    pub fn wrapped_around(&self) -> bool {
        self.wrapped_around.load(Ordering::Relaxed)
    }

    /// Has the ring been handed out by [`drain`](Self::drain) since the claim index was reset?
    pub fn was_drained(&self) -> bool {
        self.drained.load(Ordering::Relaxed)
    }

    /// Bump the refinement count of `card` and return the count before the increment.
    /// The count saturates at the hot limit.
    fn add_card_count(&self, card_table: &CardTable, card: Address) -> u8 {
        let counter = &self.card_counts[card_table.index_for_card(card)];
        // Racing increments may lose counts; that only delays a card becoming hot.
        let count = counter.load(Ordering::Relaxed);
        if count < self.hot_limit {
            counter.store(count + 1, Ordering::Relaxed);
        }
        count
    }

    fn is_hot(&self, count: u8) -> bool {
        count >= self.hot_limit
    }

    /// Offer a card for refinement.
    ///
    /// Returns the card to refine now: `card` itself if it is not hot, the card evicted
    /// from the ring if `card` took its place, or `None` if `card` went into an empty slot.
    pub fn insert(&self, card_table: &CardTable, card: Address) -> Option<Address> {
        let count = self.add_card_count(card_table, card);
        if !self.is_hot(count) {
            return Some(card);
        }

        let index = self.hot_cache_idx.fetch_add(1, Ordering::Relaxed);
        if index == self.size() {
            self.wrapped_around.store(true, Ordering::Relaxed);
        }
        let slot = &self.hot_cache[index & (self.size() - 1)];
        let current = slot.load(Ordering::Relaxed);
        // If another thread raced us into this slot, refine our own card instead of
        // retrying; it is likely the older of the two anyway.
        match slot.compare_exchange(
            current,
            card.as_usize(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(0) => None,
            Ok(previous) => Some(Address::from_usize(previous)),
            Err(_) => Some(card),
        }
    }

    /// Hand the cached cards to `f`, in chunks claimed in parallel with other drainers.
    /// The cache must be switched off first.
    pub fn drain<F: FnMut(Address, usize)>(&self, worker_id: usize, mut f: F) {
        debug_assert!(!self.use_cache(), "draining a cache that is in use");
        self.drained.store(true, Ordering::Relaxed);
        let size = self.size();
        while self.par_claimed_idx.load(Ordering::Relaxed) < size {
            let end_idx = self
                .par_claimed_idx
                .fetch_add(CLAIM_CHUNK_SIZE, Ordering::Relaxed)
                + CLAIM_CHUNK_SIZE;
            let start_idx = end_idx - CLAIM_CHUNK_SIZE;
            for slot in &self.hot_cache[start_idx.min(size)..end_idx.min(size)] {
                let card = slot.load(Ordering::Acquire);
                if card == 0 {
                    // The ring fills from the start, so the rest is empty too.
                    break;
                }
                f(Address::from_usize(card), worker_id);
            }
        }
    }

    /// Empty the ring. Only at a safepoint.
    pub fn reset_hot_cache(&self) {
        self.hot_cache_idx.store(0, Ordering::Relaxed);
        self.wrapped_around.store(false, Ordering::Relaxed);
        for slot in self.hot_cache.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// Allow the ring to be drained again.
    pub fn reset_hot_cache_claimed_index(&self) {
        self.par_claimed_idx.store(0, Ordering::Relaxed);
        self.drained.store(false, Ordering::Relaxed);
    }

    /// Forget all refinement counts, e.g. after a full collection.
    pub fn reset_card_counts(&self) {
        for count in self.card_counts.iter() {
            count.store(0, Ordering::Relaxed);
        }
    }

    /// Forget the refinement counts of the cards `[first, last]`, e.g. when a region is freed.
    pub fn reset_card_counts_in(&self, card_table: &CardTable, first: Address, last: Address) {
        if self.card_counts.is_empty() {
            return;
        }
        let from = card_table.index_for_card(first);
        let to = card_table.index_for_card(last);
        for count in &self.card_counts[from..=to] {
            count.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_CARD;

    fn setup() -> (CardTable, HotCardCache) {
        let start = Address::from_usize(0x4000_0000);
        let ct = CardTable::new(start, start + (1usize << 20));
        let hcc = HotCardCache::new(ct.num_cards(), 2, 2);
        (ct, hcc)
    }

    fn card(ct: &CardTable, i: usize) -> Address {
        ct.byte_for(Address::from_usize(0x4000_0000 + i * BYTES_IN_CARD))
    }

    #[test]
    fn cold_cards_pass_through() {
        let (ct, hcc) = setup();
        let c = card(&ct, 5);
        assert_eq!(hcc.insert(&ct, c), Some(c));
        assert_eq!(hcc.insert(&ct, c), Some(c));
        // Third refinement: hot, parked in an empty slot.
        assert_eq!(hcc.insert(&ct, c), None);
    }

    #[test]
    fn hot_cards_evict_in_ring_order() {
        let (ct, hcc) = setup();
        let cards: Vec<Address> = (0..5).map(|i| card(&ct, i)).collect();
        for &c in cards.iter() {
            hcc.insert(&ct, c);
            hcc.insert(&ct, c);
        }
        for &c in cards.iter().take(4) {
            assert_eq!(hcc.insert(&ct, c), None);
        }
        // The ring has four slots; the fifth hot card evicts the first.
        assert_eq!(hcc.insert(&ct, cards[4]), Some(cards[0]));
        assert!(hcc.wrapped_around());
    }

    #[test]
    fn drain_and_reset() {
        let (ct, hcc) = setup();
        let c = card(&ct, 9);
        for _ in 0..3 {
            hcc.insert(&ct, c);
        }
        hcc.set_use_cache(false);
        let mut drained = vec![];
        hcc.drain(0, |card, _| drained.push(card));
        assert_eq!(drained, vec![c]);

        hcc.reset_hot_cache();
        hcc.reset_hot_cache_claimed_index();
        hcc.set_use_cache(true);
        let mut drained = vec![];
        hcc.set_use_cache(false);
        hcc.drain(0, |card, _| drained.push(card));
        assert!(drained.is_empty());
    }

    #[test]
    fn undrained_ring_keeps_its_cards() {
        let (ct, hcc) = setup();
        let c = card(&ct, 7);
        for _ in 0..3 {
            hcc.insert(&ct, c);
        }
        // A pause that never drains.
        hcc.set_use_cache(false);
        hcc.reset_hot_cache_claimed_index();
        assert!(!hcc.was_drained());
        hcc.set_use_cache(true);

        // The next pause still finds the card.
        hcc.set_use_cache(false);
        hcc.reset_hot_cache_claimed_index();
        let mut drained = vec![];
        hcc.drain(0, |card, _| drained.push(card));
        assert!(hcc.was_drained());
        assert_eq!(drained, vec![c]);
    }

    #[test]
    fn disabled_cache() {
        let start = Address::from_usize(0x4000_0000);
        let ct = CardTable::new(start, start + (1usize << 20));
        let hcc = HotCardCache::new(ct.num_cards(), 0, 4);
        assert!(!hcc.is_enabled());
        assert!(!hcc.use_cache());
        hcc.set_use_cache(true);
        assert!(!hcc.use_cache());
    }
}
