use crate::util::constants::*;
use crate::util::Address;
use atomic::Atomic;
use bytemuck::NoUninit;
use std::sync::atomic::Ordering;

/// The value of a card table entry.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, NoUninit, strum_macros::Display)]
pub enum CardValue {
    /// A store into the card may have created a cross-region reference.
    Dirty = 0,
    /// The card belongs to a young region. Stores into it never need refinement.
    Young = 2,
    Clean = 0xff,
}

/// One byte per card for the whole reserved heap.
///
/// Dirty card queues log the address of the card table *entry*, not the heap address: the
/// post-barrier computes it with one shift and one add from `byte_map_base`, and refinement
/// maps it back with [`CardTable::addr_for`].
pub struct CardTable {
    heap_start: Address,
    heap_end: Address,
    cards: Box<[Atomic<CardValue>]>,
    /// Biased base: `byte_map_base + (addr >> LOG_BYTES_IN_CARD)` is the entry for `addr`.
    byte_map_base: usize,
}

impl CardTable {
    pub fn new(heap_start: Address, heap_end: Address) -> Self {
        assert!(heap_start < heap_end, "empty heap");
        assert!(heap_start.is_aligned_to(BYTES_IN_CARD));
        let num_cards = (heap_end.align_up(BYTES_IN_CARD) - heap_start) >> LOG_BYTES_IN_CARD;
        let cards: Box<[Atomic<CardValue>]> = (0..num_cards)
            .map(|_| Atomic::new(CardValue::Clean))
            .collect();
        let byte_map_base = (cards.as_ptr() as usize)
            .wrapping_sub(heap_start.as_usize() >> LOG_BYTES_IN_CARD);
        debug!(
            "Card table for {}..{}: {} cards, base {:#x}",
            heap_start, heap_end, num_cards, byte_map_base
        );
        Self {
            heap_start,
            heap_end,
            cards,
            byte_map_base,
        }
    }

    pub fn num_cards(&self) -> usize {
        self.cards.len()
    }

    pub fn byte_map_base(&self) -> usize {
        self.byte_map_base
    }

    pub fn covers(&self, addr: Address) -> bool {
        addr >= self.heap_start && addr < self.heap_end
    }

    /// The entry address for the card containing `addr`.
    #[inline(always)]
    pub fn byte_for(&self, addr: Address) -> Address {
        debug_assert!(self.covers(addr), "{} is outside the heap", addr);
        Address::from_usize(
            self.byte_map_base
                .wrapping_add(addr.as_usize() >> LOG_BYTES_IN_CARD),
        )
    }

    /// The first heap address covered by the card entry `card`.
    #[inline(always)]
    pub fn addr_for(&self, card: Address) -> Address {
        let index = self.index_for_card(card);
        self.heap_start + (index << LOG_BYTES_IN_CARD)
    }

    /// Position of the entry `card` in the table.
    #[inline(always)]
    pub fn index_for_card(&self, card: Address) -> usize {
        let index = card.as_usize().wrapping_sub(self.cards.as_ptr() as usize);
        debug_assert!(index < self.cards.len(), "{} is not a card entry", card);
        index
    }

    #[inline(always)]
    fn entry(&self, card: Address) -> &Atomic<CardValue> {
        &self.cards[self.index_for_card(card)]
    }

    #[inline(always)]
    pub fn get(&self, card: Address) -> CardValue {
        self.entry(card).load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set(&self, card: Address, value: CardValue) {
        self.entry(card).store(value, Ordering::Relaxed)
    }

    /// The card value for a heap address.
    pub fn value_at(&self, addr: Address) -> CardValue {
        self.get(self.byte_for(addr))
    }

    fn set_range(&self, start: Address, end: Address, value: CardValue) {
        if start >= end {
            return;
        }
        let first = self.index_for_card(self.byte_for(start));
        let last = self.index_for_card(self.byte_for(end - 1usize));
        for card in &self.cards[first..=last] {
            card.store(value, Ordering::Relaxed);
        }
    }

    /// Tag the cards of `[start, end)` as young, e.g. when a region becomes a young region.
    pub fn mark_young(&self, start: Address, end: Address) {
        self.set_range(start, end, CardValue::Young)
    }

    /// Reset the cards of `[start, end)` to clean.
    pub fn clear(&self, start: Address, end: Address) {
        self.set_range(start, end, CardValue::Clean)
    }

    /// Number of dirty cards in the table. Linear in the heap size.
    pub fn count_dirty(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == CardValue::Dirty)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP_START: usize = 0x1000_0000;
    const HEAP_SIZE: usize = 4 << 20;

    fn table() -> CardTable {
        let start = Address::from_usize(HEAP_START);
        CardTable::new(start, start + HEAP_SIZE)
    }

    #[test]
    fn byte_for_and_back() {
        let ct = table();
        assert_eq!(ct.num_cards(), HEAP_SIZE >> LOG_BYTES_IN_CARD);
        let addr = Address::from_usize(HEAP_START + 3 * BYTES_IN_CARD + 17);
        let card = ct.byte_for(addr);
        assert_eq!(ct.index_for_card(card), 3);
        assert_eq!(ct.addr_for(card), addr.align_down(BYTES_IN_CARD));
        assert_eq!(ct.get(card), CardValue::Clean);
        ct.set(card, CardValue::Dirty);
        assert_eq!(ct.value_at(addr), CardValue::Dirty);
        assert_eq!(ct.count_dirty(), 1);
    }

    #[test]
    fn young_range() {
        let ct = table();
        let start = Address::from_usize(HEAP_START);
        ct.mark_young(start + BYTES_IN_CARD, start + 3 * BYTES_IN_CARD);
        assert_eq!(ct.value_at(start), CardValue::Clean);
        assert_eq!(ct.value_at(start + BYTES_IN_CARD), CardValue::Young);
        assert_eq!(ct.value_at(start + 2 * BYTES_IN_CARD + 8), CardValue::Young);
        assert_eq!(ct.value_at(start + 3 * BYTES_IN_CARD), CardValue::Clean);
        ct.clear(start, start + HEAP_SIZE);
        assert_eq!(ct.value_at(start + BYTES_IN_CARD), CardValue::Clean);
    }
}
