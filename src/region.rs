//! Escape-tracking allocation regions.
//!
//! A region brackets a span of allocations in the thread's buffer:
//! [`Mutator::region_enter`] records the bump pointer as a checkpoint
//! and [`Mutator::region_exit`] rewinds to it, reclaiming every object
//! allocated in between. That only works while no such object is
//! reachable from outside the region, so writes that publish a nursery
//! reference must go through [`Mutator::stick`], which raises the
//! escape boundary past the object and drops every checkpoint the
//! boundary subsumes.
//!
//! The escape heuristics are deliberately conservative. A false
//! positive only costs reclamation; a false negative would leave a
//! dangling reference behind a rewound pointer.

use log::trace;

use crate::alloc::{stack_probe, Mutator};
use crate::object::object_end;
use crate::stats::StickReason;

/// Slack above the stack window for frames outside the probed range.
const STACK_SLACK: usize = 64 * 1024;

impl Mutator {
    /// Open a region at the current bump pointer.
    ///
    /// A no-op when no buffer is installed; there is nothing to
    /// rewind over until the next allocation installs one.
    pub fn region_enter(&mut self) {
        let _gc = self.heap.lock_gc();
        self.heap.stats().record_region_enter();
        // Safety: owner thread, and the GC lock holds collections off.
        let tlab = unsafe { self.slot.tlab() };
        if !tlab.has_buffer() {
            assert!(
                tlab.escape_boundary.is_none(),
                "context was reset without clearing region state"
            );
            return;
        }
        let next = tlab.next;
        tlab.push_checkpoint(next);
    }

    /// Close the innermost region, rewinding the bump pointer to its
    /// checkpoint.
    ///
    /// `ret` is the region's escaping result, if any; it is stuck
    /// before the rewind so it survives. When the region was stuck
    /// its checkpoint is already gone and nothing is rewound. Rewound
    /// memory is zeroed so the clearing policy holds for its reuse.
    pub fn region_exit(&mut self, ret: Option<usize>) {
        if let Some(ret) = ret {
            self.stick(ret, None);
        }

        let _gc = self.heap.lock_gc();
        self.heap.stats().record_region_exit();
        // Safety: owner thread, and the GC lock holds collections off.
        let tlab = unsafe { self.slot.tlab() };
        tlab.forget_stuck_checkpoints(self.heap.stats());

        let Some(&checkpoint) = tlab.region_checkpoints.last() else {
            assert!(
                tlab.escape_boundary.is_none(),
                "context was reset without clearing region state"
            );
            return;
        };
        assert!(
            tlab.contains(checkpoint) || checkpoint == tlab.hard_end,
            "region checkpoint {:#x} outside current buffer {:#x}-{:#x}",
            checkpoint,
            tlab.start,
            tlab.hard_end
        );
        if let Some(stuck) = tlab.escape_boundary {
            assert!(
                tlab.contains(stuck),
                "context was reset without clearing region state"
            );
            assert!(checkpoint >= stuck, "stuck regions should not be poppable");
        }
        if !tlab.has_buffer() {
            assert!(
                tlab.escape_boundary.is_none(),
                "context was reset without clearing region state"
            );
            return;
        }

        let next = tlab.next;
        assert!(checkpoint <= next, "region checkpoint past the bump pointer");
        let reclaimed = next - checkpoint;
        if reclaimed > 0 {
            self.heap.stats().record_region_reclaimed(reclaimed);
            // The rewound range must look like it was never allocated.
            unsafe { std::ptr::write_bytes(checkpoint as *mut u8, 0, reclaimed) };
            trace!("Region exit reclaimed {} bytes at {:#x}", reclaimed, checkpoint);
        }
        tlab.next = checkpoint;
        tlab.region_checkpoints.pop();
        if tlab.region_checkpoints.is_empty() {
            tlab.escape_boundary = None;
        }
    }

    /// Abandon region tracking for the current buffer.
    ///
    /// Nothing is rewound; every object allocated so far simply
    /// stays. Used when control flow leaves the bracketed code in a
    /// way that cannot be paired with exits.
    pub fn region_bail(&mut self) {
        let _gc = self.heap.lock_gc();
        self.heap.stats().record_region_bail();
        // Safety: owner thread, and the GC lock holds collections off.
        let tlab = unsafe { self.slot.tlab() };
        tlab.region_checkpoints.clear();
        tlab.escape_boundary = None;
    }

    /// Intercept a write of `src` into the slot `dst`.
    ///
    /// If the write lets `src` outlive the innermost region, the
    /// escape boundary is raised past `src` and every checkpoint at
    /// or below it is dropped, pinning the enclosing regions. `None`
    /// for `dst` means the destination is unknown and always sticks.
    pub fn stick(&mut self, src: usize, dst: Option<usize>) {
        let _gc = self.heap.lock_gc();
        // Safety: owner thread, and the GC lock holds collections off.
        let tlab = unsafe { self.slot.tlab() };
        if !tlab.contains(src) {
            return;
        }
        if tlab.region_checkpoints.is_empty() {
            assert!(
                tlab.escape_boundary.is_none(),
                "region state was not cleared correctly"
            );
            return;
        }
        if let Some(stuck) = tlab.escape_boundary {
            assert!(
                tlab.contains(stuck),
                "region state was not cleared correctly"
            );
        }

        let dst_addr = dst.unwrap_or(0);
        let major_to_minor = !self.heap.in_nursery(dst_addr);
        let old_buffer_to_new_buffer = !tlab.contains(dst_addr);
        let old_region_to_new_region = dst_addr < src;
        let old_frame_to_new_frame = self.on_attached_stack(dst_addr);
        let always_stick = dst.is_none();

        if !(major_to_minor
            || old_buffer_to_new_buffer
            || old_region_to_new_region
            || old_frame_to_new_frame
            || always_stick)
        {
            return;
        }
        let reason = if major_to_minor {
            StickReason::NotInNursery
        } else if old_buffer_to_new_buffer {
            StickReason::DifferentBuffer
        } else if old_region_to_new_region {
            StickReason::LowerAddress
        } else {
            StickReason::EnclosingFrame
        };

        // Safety: src is an allocated object in this thread's buffer.
        let Some(src_end) = (unsafe { object_end(src) }) else {
            panic!("stuck object {:#x} has no published header", src);
        };
        assert!(
            tlab.contains(src_end - 1),
            "stuck object should not extend beyond the end of its buffer"
        );
        let boundary = tlab.escape_boundary.map_or(src_end, |stuck| stuck.max(src_end));
        assert!(
            boundary <= tlab.next,
            "stuck object is not inside the current region"
        );
        tlab.escape_boundary = Some(boundary);
        tlab.forget_stuck_checkpoints(self.heap.stats());
        self.heap.stats().record_stuck(reason);
        trace!("Escape boundary raised to {:#x} ({:?})", boundary, reason);
    }

    /// Whether an address plausibly lies in this thread's live stack.
    ///
    /// The window spans from the current frame up past the attach
    /// anchor; slots written by mutator code sit between the two.
    /// Errs toward `true` above the anchor; a wrong answer only costs
    /// reclamation.
    fn on_attached_stack(&self, addr: usize) -> bool {
        let here = stack_probe();
        let low = here.min(self.stack_anchor);
        let high = here.max(self.stack_anchor).saturating_add(STACK_SLACK);
        addr >= low && addr < high
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::heap::GcHeap;
    use crate::object::{header_vtable, VTable, HEADER_SIZE};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    static NODE: VTable = VTable::new("node", 48);

    fn attach_primed() -> (Arc<GcHeap>, Mutator, usize) {
        let heap = Arc::new(GcHeap::with_defaults());
        let mut mutator = Mutator::attach(Arc::clone(&heap));
        // First allocation installs the buffer the regions live in.
        let primer = mutator.allocate(&NODE, 48).expect("allocation failed");
        (heap, mutator, primer)
    }

    #[test]
    fn test_exit_rewinds_and_zeroes() {
        let (heap, mut mutator, _) = attach_primed();

        mutator.region_enter();
        let a = mutator.allocate(&NODE, 48).expect("allocation failed");
        let b = mutator.allocate(&NODE, 48).expect("allocation failed");
        unsafe {
            std::ptr::write_bytes((a + HEADER_SIZE) as *mut u8, 0xCD, 48 - HEADER_SIZE);
        }
        mutator.region_exit(None);

        // The rewound range is zeroed, headers included.
        assert!(unsafe { header_vtable(a) }.is_none());
        assert!(unsafe { header_vtable(b) }.is_none());

        // The next allocation reuses the rewound space.
        let c = mutator.allocate(&NODE, 48).expect("allocation failed");
        assert_eq!(c, a);
        assert_eq!(
            heap.stats().region_bytes_reclaimed.load(Ordering::Relaxed),
            96
        );
        assert_eq!(heap.stats().regions_entered.load(Ordering::Relaxed), 1);
        assert_eq!(heap.stats().regions_exited.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_region_result_survives_exit() {
        let (heap, mut mutator, _) = attach_primed();

        mutator.region_enter();
        let scratch = mutator.allocate(&NODE, 48).expect("allocation failed");
        let result = mutator.allocate(&NODE, 48).expect("allocation failed");
        mutator.region_exit(Some(result));

        // Everything up to the result is pinned; nothing was rewound.
        assert!(unsafe { header_vtable(scratch) }.is_some());
        assert!(unsafe { header_vtable(result) }.is_some());
        let after = mutator.allocate(&NODE, 48).expect("allocation failed");
        assert_eq!(after, result + 48);
        assert_eq!(heap.stats().regions_stuck.load(Ordering::Relaxed), 1);
        assert_eq!(
            heap.stats().region_bytes_reclaimed.load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn test_stick_pins_enclosing_regions() {
        let (_heap, mut mutator, _) = attach_primed();

        mutator.region_enter();
        let outer = mutator.allocate(&NODE, 48).expect("allocation failed");
        mutator.region_enter();
        let inner = mutator.allocate(&NODE, 48).expect("allocation failed");
        mutator.stick(inner, None);
        mutator.region_exit(None);
        mutator.region_exit(None);

        // Sticking the inner object subsumed both checkpoints, so
        // neither exit rewound anything.
        assert!(unsafe { header_vtable(outer) }.is_some());
        assert!(unsafe { header_vtable(inner) }.is_some());
        let after = mutator.allocate(&NODE, 48).expect("allocation failed");
        assert_eq!(after, inner + 48);
    }

    #[test]
    fn test_forward_store_does_not_stick() {
        let (heap, mut mutator, _) = attach_primed();

        mutator.region_enter();
        let older = mutator.allocate(&NODE, 48).expect("allocation failed");
        let newer = mutator.allocate(&NODE, 48).expect("allocation failed");

        // Storing an older object into a newer one in the same buffer
        // cannot let it escape the region.
        mutator.stick(older, Some(newer + HEADER_SIZE));
        assert_eq!(heap.stats().regions_stuck.load(Ordering::Relaxed), 0);

        mutator.region_exit(None);
        assert!(unsafe { header_vtable(older) }.is_none());
        assert!(unsafe { header_vtable(newer) }.is_none());
    }

    #[test]
    fn test_stick_reasons_are_classified() {
        let config = GcConfig {
            tlab_size: 1024,
            detailed_stats: true,
            ..GcConfig::default()
        };
        let heap = Arc::new(GcHeap::new(config));
        let mut mutator = Mutator::attach(Arc::clone(&heap));
        let lower = mutator.allocate(&NODE, 48).expect("allocation failed");

        // A slot in the old generation.
        let tenured = mutator.allocate_mature(&NODE, 48).expect("allocation failed");
        // A nursery slot outside this thread's buffer.
        let outside = mutator.allocate(&NODE, 2000).expect("allocation failed");

        // Each stick subsumes its own checkpoint, so every case gets
        // a fresh region.
        mutator.region_enter();
        let a = mutator.allocate(&NODE, 48).expect("allocation failed");
        mutator.stick(a, Some(tenured + HEADER_SIZE));

        mutator.region_enter();
        let b = mutator.allocate(&NODE, 48).expect("allocation failed");
        mutator.stick(b, Some(outside + HEADER_SIZE));

        mutator.region_enter();
        let c = mutator.allocate(&NODE, 48).expect("allocation failed");
        mutator.stick(c, Some(lower + HEADER_SIZE));

        let stats = heap.stats();
        assert_eq!(stats.regions_stuck.load(Ordering::Relaxed), 3);
        assert_eq!(stats.stuck_not_in_nursery.load(Ordering::Relaxed), 1);
        assert_eq!(stats.stuck_different_buffer.load(Ordering::Relaxed), 1);
        assert_eq!(stats.stuck_lower_address.load(Ordering::Relaxed), 1);
        assert_eq!(stats.stuck_enclosing_frame.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_bail_abandons_tracking_without_rewind() {
        let (heap, mut mutator, _) = attach_primed();

        mutator.region_enter();
        let a = mutator.allocate(&NODE, 48).expect("allocation failed");
        mutator.region_bail();

        // The exit that would have rewound finds nothing to pop.
        mutator.region_exit(None);
        assert!(unsafe { header_vtable(a) }.is_some());
        let after = mutator.allocate(&NODE, 48).expect("allocation failed");
        assert_eq!(after, a + 48);
        assert_eq!(heap.stats().regions_bailed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_region_ops_without_buffer_are_noops() {
        let heap = Arc::new(GcHeap::with_defaults());
        let mut mutator = Mutator::attach(Arc::clone(&heap));

        mutator.region_enter();
        mutator.region_exit(None);
        mutator.region_bail();
        assert_eq!(heap.stats().regions_entered.load(Ordering::Relaxed), 1);
        assert_eq!(heap.stats().regions_exited.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_finalizable_buffer_start_blocks_rewind() {
        static FINALIZABLE: VTable = VTable::new("finalizable", 48).with_finalizer();

        let heap = Arc::new(GcHeap::with_defaults());
        let mut mutator = Mutator::attach(Arc::clone(&heap));

        // The first allocation installs the buffer; a finalizable
        // object there raises the escape boundary immediately.
        let f = mutator.allocate(&FINALIZABLE, 48).expect("allocation failed");
        mutator.region_enter();
        let a = mutator.allocate(&NODE, 48).expect("allocation failed");
        mutator.region_exit(None);

        // The checkpoint sat at the boundary and was dropped, so the
        // exit rewound nothing.
        assert!(unsafe { header_vtable(f) }.is_some());
        assert!(unsafe { header_vtable(a) }.is_some());
        let after = mutator.allocate(&NODE, 48).expect("allocation failed");
        assert_eq!(after, a + 48);
    }
}
