//! Old generation with block-based allocation.
//!
//! The old generation serves degraded allocations (nursery overflow
//! routed here) and pinned small objects. It is a slice of the heap
//! arena carved into fixed-size blocks. Objects are segregated by
//! kind so the card scanner can skip blocks that hold no references
//! and the compactor knows which blocks must never move.
//!
//! Reclamation is the collector's business; this space only hands
//! out memory.

use crate::barrier::CardTable;

/// Number of block kinds.
const KIND_COUNT: usize = 3;

/// What a block holds.
///
/// Each kind bumps inside its own current block so a block never
/// mixes pinned with movable objects or scannable with opaque ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    /// Movable objects allocated while the nursery was unavailable.
    Degraded = 0,
    /// Pinned objects without references, skipped by card scans.
    PinnedNoRefs = 1,
    /// Pinned objects holding references.
    PinnedRefs = 2,
}

/// Bump state of a kind's current block.
#[derive(Debug, Clone, Copy)]
struct BlockCursor {
    /// Next free byte.
    next: usize,
    /// One past the last byte of the block.
    end: usize,
}

/// Old generation allocation space.
///
/// Does not own its memory; the heap arena does. Callers serialize
/// access through the heap, so methods take `&mut self`.
pub struct OldSpace {
    /// First byte of the space.
    start: usize,
    /// One past the last byte of the space.
    end: usize,
    /// Base of the next unclaimed block.
    block_cursor: usize,
    /// Size of each block in bytes.
    block_size: usize,
    /// Current block per kind, `None` until the first allocation.
    current: [Option<BlockCursor>; KIND_COUNT],
    /// Total object bytes handed out.
    allocated: usize,
}

impl OldSpace {
    /// Create an old space over `[start, start + size)`.
    pub fn new(start: usize, size: usize, block_size: usize) -> Self {
        Self {
            start,
            end: start + size,
            block_cursor: start,
            block_size,
            current: [None; KIND_COUNT],
            allocated: 0,
        }
    }

    /// Allocate a degraded object of `size` aligned bytes.
    pub fn alloc_degraded(&mut self, size: usize) -> Option<usize> {
        self.alloc_in(BlockKind::Degraded, size)
    }

    /// Allocate a pinned small object of `size` aligned bytes.
    pub fn alloc_pinned(&mut self, size: usize, has_references: bool) -> Option<usize> {
        let kind = if has_references {
            BlockKind::PinnedRefs
        } else {
            BlockKind::PinnedNoRefs
        };
        self.alloc_in(kind, size)
    }

    fn alloc_in(&mut self, kind: BlockKind, size: usize) -> Option<usize> {
        debug_assert!(size % crate::object::ALLOC_ALIGN == 0, "unaligned request");

        if let Some(cursor) = self.current[kind as usize] {
            if cursor.end - cursor.next >= size {
                self.current[kind as usize] = Some(BlockCursor {
                    next: cursor.next + size,
                    end: cursor.end,
                });
                self.allocated += size;
                return Some(cursor.next);
            }
        }

        // The current block is exhausted or was never claimed. Its
        // tail is abandoned; block reuse is the collector's job.
        let span = (size.max(self.block_size) + self.block_size - 1) / self.block_size
            * self.block_size;
        let base = self.block_cursor;
        if self.end - base < span {
            return None;
        }
        self.block_cursor = base + span;
        self.current[kind as usize] = Some(BlockCursor {
            next: base + size,
            end: base + span,
        });
        self.allocated += size;
        Some(base)
    }

    /// Check if an address is in the old space.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Get total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// Get total object bytes handed out.
    #[inline]
    pub fn usage(&self) -> usize {
        self.allocated
    }

    /// Get bytes claimed as blocks, including unfilled block tails.
    #[inline]
    pub fn committed(&self) -> usize {
        self.block_cursor - self.start
    }

    /// Get the number of blocks claimed so far.
    pub fn block_count(&self) -> usize {
        (self.block_cursor - self.start) / self.block_size
    }

    /// Clear every card covering this space's claimed blocks.
    pub fn clear_cards(&self, cards: &CardTable) {
        cards.reset_range(self.start, self.block_cursor);
    }

    /// Visit and clear each dirty card covering this space.
    ///
    /// The closure receives the card's address range. Cards are
    /// cleared as they are visited, so marks arriving during the walk
    /// survive for the next one.
    pub fn scan_cards<F>(&self, cards: &CardTable, mut f: F)
    where
        F: FnMut(usize, usize),
    {
        let card_size = cards.card_size();
        let mut addr = cards.align_down(self.start).max(cards.base());
        while addr < self.block_cursor {
            if cards.is_dirty(addr) {
                f(addr, addr + card_size);
                cards.clear(addr);
            }
            addr += card_size;
        }
    }
}
