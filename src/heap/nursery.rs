//! Nursery (young generation) with bump-pointer allocation.
//!
//! The nursery is a single contiguous slice of the heap arena.
//! Threads carve thread-local buffers out of it and bump inside them;
//! oversize-but-small requests bypass the buffers and bump here
//! directly:
//! ```text
//! cursor += size;
//! return cursor - size;
//! ```
//! Memory handed out is never reused until the collector resets the
//! whole space.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

/// Nursery allocation space.
///
/// Does not own its memory; the heap arena does. All operations are
/// thread-safe, the cursor is claimed by compare-and-swap.
pub struct Nursery {
    /// First byte of the space.
    start: usize,
    /// One past the last byte of the space.
    end: usize,
    /// Current allocation cursor (grows upward).
    cursor: AtomicUsize,
    /// Bytes discarded as buffer tails too small to be useful.
    wasted: AtomicUsize,
    /// Lowest recorded object start per scan chunk, 0 when none.
    scan_starts: Box<[AtomicUsize]>,
    /// Size of each scan chunk in bytes.
    scan_start_increment: usize,
}

impl Nursery {
    /// Create a nursery over `[start, start + size)`.
    pub fn new(start: usize, size: usize, scan_start_increment: usize) -> Self {
        let chunks = (size + scan_start_increment - 1) / scan_start_increment;
        let scan_starts: Vec<AtomicUsize> = (0..chunks).map(|_| AtomicUsize::new(0)).collect();

        Self {
            start,
            end: start + size,
            cursor: AtomicUsize::new(start),
            wasted: AtomicUsize::new(0),
            scan_starts: scan_starts.into_boxed_slice(),
            scan_start_increment,
        }
    }

    /// Reserve a buffer of up to `desired` bytes, at least `min`.
    ///
    /// Returns the buffer base and the size actually granted. The
    /// last buffer before exhaustion may be short. Returns `None`
    /// when fewer than `min` bytes remain.
    pub fn reserve_buffer(&self, desired: usize, min: usize) -> Option<(usize, usize)> {
        debug_assert!(min <= desired, "minimum exceeds desired buffer size");
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            let available = self.end - current;
            if available < min {
                return None;
            }
            let granted = desired.min(available);

            // CAS to claim the range
            match self.cursor.compare_exchange_weak(
                current,
                current + granted,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some((current, granted)),
                Err(observed) => current = observed,
            }
        }
    }

    /// Allocate `size` bytes directly, outside any thread buffer.
    #[inline]
    pub fn allocate_direct(&self, size: usize) -> Option<usize> {
        self.reserve_buffer(size, size).map(|(addr, _)| addr)
    }

    /// Give up the unusable tail of a retired buffer.
    ///
    /// The bytes are not returned to the space; they are counted and
    /// abandoned until the next reset.
    pub fn retire_remainder(&self, addr: usize, len: usize) {
        if len == 0 {
            return;
        }
        trace!("retiring buffer tail {:#x} [{} bytes]", addr, len);
        self.wasted.fetch_add(len, Ordering::Relaxed);
    }

    /// Record an object start as a scan resynchronization hint.
    ///
    /// Each chunk keeps the lowest address reported for it. Hints are
    /// advisory, so plain relaxed updates are enough.
    pub fn record_scan_start(&self, addr: usize) {
        if addr < self.start || addr >= self.end {
            return;
        }
        let chunk = (addr - self.start) / self.scan_start_increment;
        let slot = &self.scan_starts[chunk];
        let mut current = slot.load(Ordering::Relaxed);
        loop {
            if current != 0 && current <= addr {
                return;
            }
            match slot.compare_exchange_weak(current, addr, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Get the scan-start hint for the chunk containing `addr`.
    pub fn scan_start_near(&self, addr: usize) -> Option<usize> {
        if addr < self.start || addr >= self.end {
            return None;
        }
        let chunk = (addr - self.start) / self.scan_start_increment;
        match self.scan_starts[chunk].load(Ordering::Relaxed) {
            0 => None,
            hint => Some(hint),
        }
    }

    /// Check if an address is in the nursery.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Get bytes handed out so far, including wasted tails.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.cursor.load(Ordering::Relaxed) - self.start
    }

    /// Get remaining free bytes.
    #[inline]
    pub fn free(&self) -> usize {
        self.end - self.cursor.load(Ordering::Relaxed)
    }

    /// Get bytes discarded as buffer tails.
    #[inline]
    pub fn wasted(&self) -> usize {
        self.wasted.load(Ordering::Relaxed)
    }

    /// Get the total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// Get the first address of the space.
    #[inline]
    pub fn base(&self) -> usize {
        self.start
    }

    /// Get one past the last address of the space.
    #[inline]
    pub fn limit(&self) -> usize {
        self.end
    }

    /// Make the whole space available again.
    ///
    /// `zero` wipes the memory as well; pass it when the clear policy
    /// defers zeroing to the collection pause.
    ///
    /// # Safety
    ///
    /// Every mutator thread must be stopped with no live references
    /// into the nursery and no buffer still installed. Concurrent
    /// allocation during the reset corrupts the heap.
    pub unsafe fn reset(&self, zero: bool) {
        self.cursor.store(self.start, Ordering::Release);
        self.wasted.store(0, Ordering::Relaxed);
        if zero {
            std::ptr::write_bytes(self.start as *mut u8, 0, self.end - self.start);
        }
        for slot in self.scan_starts.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena(size: usize) -> (Box<[u8]>, usize) {
        let mut mem = vec![0u8; size].into_boxed_slice();
        let base = mem.as_mut_ptr() as usize;
        (mem, base)
    }

    #[test]
    fn test_nursery_creation() {
        let (_mem, base) = test_arena(64 * 1024);
        let nursery = Nursery::new(base, 64 * 1024, 8192);
        assert_eq!(nursery.capacity(), 64 * 1024);
        assert_eq!(nursery.allocated(), 0);
        assert_eq!(nursery.free(), 64 * 1024);
        assert!(nursery.contains(base));
        assert!(!nursery.contains(base + 64 * 1024));
    }

    #[test]
    fn test_reserve_buffer_consecutive() {
        let (_mem, base) = test_arena(4096);
        let nursery = Nursery::new(base, 4096, 8192);

        let (b0, got0) = nursery.reserve_buffer(1024, 64).expect("reserve 1 failed");
        let (b1, got1) = nursery.reserve_buffer(1024, 64).expect("reserve 2 failed");
        assert_eq!(b0, base);
        assert_eq!(got0, 1024);
        assert_eq!(b1, base + 1024);
        assert_eq!(got1, 1024);
        assert_eq!(nursery.allocated(), 2048);
    }

    #[test]
    fn test_reserve_buffer_clamps_to_tail() {
        let (_mem, base) = test_arena(1024);
        let nursery = Nursery::new(base, 1024, 8192);

        let (_, got) = nursery.reserve_buffer(4096, 64).expect("reserve failed");
        assert_eq!(got, 1024);
        assert!(nursery.reserve_buffer(4096, 64).is_none());
    }

    #[test]
    fn test_reserve_respects_minimum() {
        let (_mem, base) = test_arena(1024);
        let nursery = Nursery::new(base, 1024, 8192);

        nursery.allocate_direct(992).expect("fill failed");
        // 32 bytes left, below the minimum.
        assert!(nursery.reserve_buffer(1024, 64).is_none());
        // But a direct allocation that fits still succeeds.
        assert_eq!(nursery.allocate_direct(32), Some(base + 992));
    }

    #[test]
    fn test_retire_counts_waste() {
        let (_mem, base) = test_arena(1024);
        let nursery = Nursery::new(base, 1024, 8192);
        nursery.retire_remainder(base, 48);
        nursery.retire_remainder(base + 48, 0);
        assert_eq!(nursery.wasted(), 48);
    }

    #[test]
    fn test_scan_start_keeps_lowest() {
        let (_mem, base) = test_arena(8192);
        let nursery = Nursery::new(base, 8192, 1024);

        nursery.record_scan_start(base + 256);
        assert_eq!(nursery.scan_start_near(base + 512), Some(base + 256));

        // A lower address in the same chunk wins.
        nursery.record_scan_start(base + 64);
        assert_eq!(nursery.scan_start_near(base + 512), Some(base + 64));

        // A higher one does not.
        nursery.record_scan_start(base + 700);
        assert_eq!(nursery.scan_start_near(base + 512), Some(base + 64));

        // Separate chunk, separate hint.
        assert_eq!(nursery.scan_start_near(base + 2048), None);
        nursery.record_scan_start(base + 2048);
        assert_eq!(nursery.scan_start_near(base + 2500), Some(base + 2048));
    }

    #[test]
    fn test_reset_zeroes_when_asked() {
        let (_mem, base) = test_arena(1024);
        let nursery = Nursery::new(base, 1024, 8192);

        let addr = nursery.allocate_direct(64).expect("alloc failed");
        unsafe { *(addr as *mut u8) = 7 };
        nursery.record_scan_start(addr);

        unsafe { nursery.reset(true) };
        assert_eq!(nursery.allocated(), 0);
        assert_eq!(unsafe { *(addr as *const u8) }, 0);
        assert_eq!(nursery.scan_start_near(addr), None);
    }
}
