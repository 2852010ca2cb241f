use super::hot_card_cache::HotCardCache;
use crate::barrier::card_table::{CardTable, CardValue};
use crate::util::constants::BYTES_IN_CARD;
use crate::util::Address;
use crate::vm::VMBinding;
use std::sync::Arc;

/// Per-card refinement: decides whether a logged card still needs work and, if so, asks the
/// binding to update the remembered sets for it.
pub struct CardRefiner<VM: VMBinding> {
    vm: Arc<VM>,
    card_table: Arc<CardTable>,
    hot_card_cache: Arc<HotCardCache>,
}

impl<VM: VMBinding> CardRefiner<VM> {
    pub fn new(vm: Arc<VM>, card_table: Arc<CardTable>, hot_card_cache: Arc<HotCardCache>) -> Self {
        Self {
            vm,
            card_table,
            hot_card_cache,
        }
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    pub fn hot_card_cache(&self) -> &HotCardCache {
        &self.hot_card_cache
    }

    /// Decide whether the logged card at `*card` must be refined, cleaning it if so.
    ///
    /// Returns false for cards that need no work: cards into a missing region or a region that
    /// is not old, humongous or archive, cards that are no longer dirty, cards parked in the
    /// hot card cache, and cards at or above their region's top. If the hot card cache evicts
    /// another card in exchange, `*card` is replaced by the evicted card.
    pub fn clean_card_before_refine(&self, card: &mut usize) -> bool {
        let mut card_ptr = Address::from_usize(*card);
        let mut start = self.card_table.addr_for(card_ptr);
        let Some(mut region) = self.vm.heap_region_containing(start) else {
            // A stale card into an uncommitted region.
            return false;
        };

        if self.card_table.get(card_ptr) != CardValue::Dirty {
            return false;
        }

        // A young region whose cards are not tagged young yet, or a stale card into a region
        // that was freed and reused.
        if !region.kind.is_old_or_humongous_or_archive() {
            return false;
        }

        if self.hot_card_cache.use_cache() {
            match self.hot_card_cache.insert(&self.card_table, card_ptr) {
                None => return false,
                Some(evicted) if evicted != card_ptr => {
                    card_ptr = evicted;
                    start = self.card_table.addr_for(card_ptr);
                    // The evicted card's region may have been freed while it was cached.
                    match self.vm.heap_region_containing(start) {
                        Some(r) if r.kind.is_old_or_humongous_or_archive() => region = r,
                        _ => return false,
                    }
                    *card = card_ptr.as_usize();
                }
                Some(_) => {}
            }
        }

        // Nothing has been allocated on this card (yet): the card is stale.
        if region.top <= start {
            return false;
        }

        self.card_table.set(card_ptr, CardValue::Clean);
        true
    }

    /// Refine a card that [`clean_card_before_refine`](Self::clean_card_before_refine)
    /// kept.
    ///
    /// Returns true if the binding could not parse the card and the card has been dirtied
    /// again here. The caller must then log it again, in a queue other than the one being
    /// refined.
    pub fn refine_card_concurrently(&self, card: usize, worker_id: usize) -> bool {
        let card_ptr = Address::from_usize(card);
        let start = self.card_table.addr_for(card_ptr);
        let Some(region) = self.vm.heap_region_containing(start) else {
            debug_assert!(false, "cleaned card {} lost its region", card_ptr);
            return false;
        };
        // Top is stable for old, humongous and archive regions between cleaning and here.
        let scan_limit = region.top;
        debug_assert!(scan_limit > start);
        let end = std::cmp::min(scan_limit, start + BYTES_IN_CARD);

        if self.vm.refine_card(start, end, worker_id) {
            return false;
        }

        // We cleaned the card, so we are responsible for it. Another thread may have dirtied
        // and logged it again in the meantime, in which case it is already taken care of.
        if self.card_table.get(card_ptr) == CardValue::Dirty {
            return false;
        }
        trace!("Card {} could not be parsed, logging it again", card_ptr);
        self.card_table.set(card_ptr, CardValue::Dirty);
        true
    }
}
