//! Write barriers for generational GC.
//!
//! Write barriers track old→young references to enable efficient
//! minor collection. Without barriers, we'd have to scan the entire
//! old generation to find references into the nursery.
//!
//! The barrier records stores at card granularity: a store into an
//! old-generation slot dirties the slot's card, and the collector
//! scans only dirty cards during the next pause. Stores into the
//! nursery need no barrier because the nursery is scanned wholesale.

mod card_table;

pub use card_table::{CardTable, CARD_CLEAN, CARD_DIRTY};

use crate::heap::GcHeap;

// =============================================================================
// Generational Write Barriers
// =============================================================================

/// Write barrier for pointer stores.
///
/// Call this after storing a reference into a heap slot.
///
/// # Arguments
///
/// * `heap` - The GC heap
/// * `slot` - Address of the slot the reference was stored into
///
/// # Performance
///
/// This is called on every pointer store, so it must be fast.
/// The fast path is two comparisons against the nursery bounds.
#[inline(always)]
pub fn write_barrier(heap: &GcHeap, slot: usize) {
    // Nursery slots need no barrier, the whole nursery is scanned.
    if heap.in_nursery(slot) {
        return;
    }
    heap.card_table().mark(slot);
}

/// Unconditional write barrier that always marks the card.
///
/// Used when the caller can't easily determine the slot's generation,
/// for example when copying a range of slots wholesale.
#[inline(always)]
pub fn write_barrier_unconditional(slot: usize, card_table: &CardTable) {
    card_table.mark(slot);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Mutator;
    use crate::object::VTable;
    use crate::GcConfig;
    use std::sync::Arc;

    static PAIR: VTable = VTable::new("pair", 16).with_references();

    #[test]
    fn test_write_barrier_no_panic() {
        let heap = GcHeap::new(GcConfig::default());

        // Addresses outside the tracked range are ignored.
        write_barrier(&heap, 0);
        write_barrier(&heap, usize::MAX);
    }

    #[test]
    fn test_nursery_store_skips_card() {
        let heap = Arc::new(GcHeap::new(GcConfig::default()));
        let mut mutator = Mutator::attach(Arc::clone(&heap));

        let addr = mutator.allocate(&PAIR, 16).unwrap();
        assert!(heap.in_nursery(addr));

        write_barrier(&heap, addr);
        assert!(!heap.card_table().is_dirty(addr));
    }

    #[test]
    fn test_old_generation_store_marks_card() {
        let heap = Arc::new(GcHeap::new(GcConfig::default()));
        let mutator = Mutator::attach(Arc::clone(&heap));

        // Pinned small objects live in the old generation.
        let addr = mutator.allocate_pinned(&PAIR, 16).unwrap();
        assert!(!heap.in_nursery(addr));
        assert!(!heap.card_table().is_dirty(addr));

        write_barrier(&heap, addr);
        assert!(heap.card_table().is_dirty(addr));
    }

    #[test]
    fn test_unconditional_barrier_marks_nursery_slot() {
        let heap = Arc::new(GcHeap::new(GcConfig::default()));
        let mut mutator = Mutator::attach(Arc::clone(&heap));

        let addr = mutator.allocate(&PAIR, 16).unwrap();
        write_barrier_unconditional(addr, heap.card_table());
        assert!(heap.card_table().is_dirty(addr));
    }
}
