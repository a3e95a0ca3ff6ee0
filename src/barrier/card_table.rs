//! Card table for remembered set tracking.
//!
//! The card table divides the tracked heap range into fixed-size
//! "cards" (typically 512 bytes). Each card has a corresponding byte
//! that indicates whether the card may contain a pointer into the
//! young generation.
//!
//! During a minor pause, only dirty cards are scanned. Marks are
//! plain relaxed stores; precision comes from the collector clearing
//! cards before rescanning, never from ordering between mutators.

use std::sync::atomic::{AtomicU8, Ordering};

/// Card state value for a clean card.
pub const CARD_CLEAN: u8 = 0;
/// Card state value for a dirty card.
pub const CARD_DIRTY: u8 = 1;

/// Card table for write barrier tracking.
///
/// Each byte in the table represents a card of heap memory. When a
/// pointer is stored into a slot, the barrier sets the byte for the
/// slot's card to dirty. Addresses outside the covered range are
/// ignored by every operation.
pub struct CardTable {
    /// The card bytes.
    cards: Box<[AtomicU8]>,
    /// Start address of the covered region.
    base: usize,
    /// Size of each card in bytes.
    card_size: usize,
    /// Log2 of card size for fast division.
    card_shift: u32,
}

impl CardTable {
    /// Create a new card table covering the given address range.
    ///
    /// # Arguments
    ///
    /// * `base` - Start address of the covered region
    /// * `size` - Size of the covered region in bytes
    /// * `card_size` - Size of each card (must be power of 2)
    pub fn new(base: usize, size: usize, card_size: usize) -> Self {
        assert!(card_size.is_power_of_two(), "Card size must be power of 2");

        let card_shift = card_size.trailing_zeros();
        let num_cards = (size + card_size - 1) / card_size;

        let cards: Vec<AtomicU8> = (0..num_cards).map(|_| AtomicU8::new(CARD_CLEAN)).collect();

        Self {
            cards: cards.into_boxed_slice(),
            base,
            card_size,
            card_shift,
        }
    }

    /// Get the card index for an address.
    #[inline]
    fn card_index(&self, addr: usize) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let offset = addr - self.base;
        let index = offset >> self.card_shift;
        if index < self.cards.len() {
            Some(index)
        } else {
            None
        }
    }

    /// Card indices covering the inclusive address range `[low, high]`,
    /// clamped to the covered region.
    fn card_span(&self, low: usize, high: usize) -> Option<(usize, usize)> {
        let end = self.base + (self.cards.len() << self.card_shift);
        if self.cards.is_empty() || high < self.base || low >= end {
            return None;
        }
        let low = low.max(self.base);
        let high = high.min(end - 1);
        if low > high {
            return None;
        }
        Some((
            (low - self.base) >> self.card_shift,
            (high - self.base) >> self.card_shift,
        ))
    }

    /// Round an address down to the start of its card.
    #[inline]
    pub fn align_down(&self, addr: usize) -> usize {
        addr & !(self.card_size - 1)
    }

    /// Mark the card containing `addr` as dirty.
    #[inline]
    pub fn mark(&self, addr: usize) {
        if let Some(index) = self.card_index(addr) {
            self.cards[index].store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    /// Mark every card touched by `[addr, addr + size)` as dirty.
    ///
    /// The final card is marked even when the range does not end on a
    /// card boundary, so an object spanning into a card always dirties
    /// it. A zero-length range still marks the card containing `addr`.
    pub fn mark_range(&self, addr: usize, size: usize) {
        let last = addr.saturating_add(size.max(1) - 1);
        if let Some((first, last)) = self.card_span(addr, last) {
            for index in first..=last {
                self.cards[index].store(CARD_DIRTY, Ordering::Relaxed);
            }
        }
    }

    /// Check if the card containing `addr` is dirty.
    #[inline]
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.card_index(addr)
            .map(|i| self.cards[i].load(Ordering::Relaxed) == CARD_DIRTY)
            .unwrap_or(false)
    }

    /// Check if any card in the inclusive range `[low, high]` is dirty.
    pub fn is_range_marked(&self, low: usize, high: usize) -> bool {
        let Some((first, last)) = self.card_span(low, high) else {
            return false;
        };
        (first..=last).any(|i| self.cards[i].load(Ordering::Relaxed) == CARD_DIRTY)
    }

    /// Clear a single card.
    #[inline]
    pub fn clear(&self, addr: usize) {
        if let Some(index) = self.card_index(addr) {
            self.cards[index].store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Clear every card touched by `[low, high)`.
    pub fn reset_range(&self, low: usize, high: usize) {
        if high <= low {
            return;
        }
        if let Some((first, last)) = self.card_span(low, high - 1) {
            for index in first..=last {
                self.cards[index].store(CARD_CLEAN, Ordering::Relaxed);
            }
        }
    }

    /// Clear all cards.
    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Iterate over dirty cards, calling the closure with each card's
    /// address range.
    pub fn for_each_dirty<F>(&self, mut f: F)
    where
        F: FnMut(usize, usize), // (card_start, card_end)
    {
        for (i, card) in self.cards.iter().enumerate() {
            if card.load(Ordering::Relaxed) == CARD_DIRTY {
                let card_start = self.base + (i << self.card_shift);
                let card_end = card_start + self.card_size;
                f(card_start, card_end);
            }
        }
    }

    /// Count dirty cards.
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == CARD_DIRTY)
            .count()
    }

    /// Get total number of cards.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Check if the table covers no cards.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Get card size.
    pub fn card_size(&self) -> usize {
        self.card_size
    }

    /// Get the base address.
    pub fn base(&self) -> usize {
        self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_table_creation() {
        let table = CardTable::new(0x1000, 0x10000, 512);
        assert_eq!(table.len(), 0x10000 / 512);
        assert_eq!(table.card_size(), 512);
    }

    #[test]
    fn test_card_marking() {
        let base = 0x1000usize;
        let table = CardTable::new(base, 0x10000, 512);

        assert!(!table.is_dirty(base + 100));

        table.mark(base + 100);
        assert!(table.is_dirty(base + 100));

        table.clear(base + 100);
        assert!(!table.is_dirty(base + 100));
    }

    #[test]
    fn test_card_same_card() {
        let base = 0x1000usize;
        let table = CardTable::new(base, 0x10000, 512);

        table.mark(base + 100);
        assert!(table.is_dirty(base + 200)); // Same card
    }

    #[test]
    fn test_card_different_cards() {
        let base = 0x1000usize;
        let table = CardTable::new(base, 0x10000, 512);

        table.mark(base + 100);
        assert!(!table.is_dirty(base + 600));
    }

    #[test]
    fn test_mark_range_covers_both_cards() {
        // 1024 bytes starting at 0x1000 touch exactly the cards at
        // 0x1000 and 0x1200.
        let table = CardTable::new(0x1000, 0x10000, 512);

        table.mark_range(0x1000, 1024);
        assert!(table.is_dirty(0x1000));
        assert!(table.is_dirty(0x1200));
        assert!(!table.is_dirty(0x1400));
        assert_eq!(table.dirty_count(), 2);

        assert!(table.is_range_marked(0x1000, 0x1400));

        table.reset_range(0x1000, 0x1800);
        assert!(!table.is_range_marked(0x1000, 0x1400));
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_mark_range_covers_unaligned_end() {
        let table = CardTable::new(0x1000, 0x10000, 512);

        // The last byte lands at 0x1400, so the third card must be
        // dirtied even though the range is not card-aligned.
        table.mark_range(0x1001, 1024);
        assert!(table.is_dirty(0x1400));
        assert_eq!(table.dirty_count(), 3);
    }

    #[test]
    fn test_mark_range_zero_length() {
        let table = CardTable::new(0x1000, 0x10000, 512);
        table.mark_range(0x1250, 0);
        assert!(table.is_dirty(0x1200));
        assert_eq!(table.dirty_count(), 1);
    }

    #[test]
    fn test_range_query_is_inclusive() {
        let table = CardTable::new(0x1000, 0x10000, 512);
        table.mark(0x1400);
        // High endpoint 0x1400 falls in the marked card.
        assert!(table.is_range_marked(0x1000, 0x1400));
        // [0x1000, 0x13ff] stops one byte short.
        assert!(!table.is_range_marked(0x1000, 0x13ff));
    }

    #[test]
    fn test_reset_range_excludes_end() {
        let table = CardTable::new(0x1000, 0x10000, 512);
        table.mark(0x1000);
        table.mark(0x1200);
        // [0x1000, 0x1200) only touches the first card.
        table.reset_range(0x1000, 0x1200);
        assert!(!table.is_dirty(0x1000));
        assert!(table.is_dirty(0x1200));
    }

    #[test]
    fn test_out_of_range_addresses_ignored() {
        let table = CardTable::new(0x1000, 0x1000, 512);
        table.mark(0x100);
        table.mark(0x3000);
        table.mark_range(0, 0x800);
        assert_eq!(table.dirty_count(), 0);
        assert!(!table.is_range_marked(0, usize::MAX));

        // A range straddling the base still marks the covered part.
        table.mark_range(0x800, 0x900);
        assert!(table.is_dirty(0x1000));
    }

    #[test]
    fn test_align_down() {
        let table = CardTable::new(0x1000, 0x10000, 512);
        assert_eq!(table.align_down(0x1234), 0x1200);
        assert_eq!(table.align_down(0x1200), 0x1200);
        assert_eq!(table.align_down(0x11ff), 0x1000);
    }

    #[test]
    fn test_for_each_dirty() {
        let base = 0x1000usize;
        let table = CardTable::new(base, 0x10000, 512);

        table.mark(base + 100);
        table.mark(base + 1500);

        let mut dirty_ranges = Vec::new();
        table.for_each_dirty(|start, end| {
            dirty_ranges.push((start, end));
        });

        assert_eq!(dirty_ranges.len(), 2);
        assert_eq!(dirty_ranges[0], (base, base + 512));
    }
}
