//! Object allocation.
//!
//! Each thread attaches a [`Mutator`] to the heap and allocates
//! through it. The fast path bumps the thread's buffer without any
//! synchronization; when the buffer runs out the slow path takes the
//! GC lock and either refills the buffer, bumps the nursery directly,
//! collects, or falls back to the old generation (degraded mode).
//!
//! A buffer is only retired when the space left in it is below the
//! configured waste limit; larger remainders stay live and oversize
//! requests go around the buffer instead.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, trace};

use crate::config::ClearPolicy;
use crate::heap::GcHeap;
use crate::object::{align_up, header_vtable, publish_header, VTable, HEADER_SIZE};
use crate::tlab::TlabSlot;
use crate::Generation;

/// Errors surfaced to allocation call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The requested size is zero or not representable once aligned.
    InvalidSize,
    /// The heap could not satisfy the request, even after collecting.
    OutOfMemory,
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocError::InvalidSize => write!(f, "invalid allocation size"),
            AllocError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Align a request, rejecting sizes too small to carry a header.
#[inline]
fn aligned_request(size: usize) -> Result<usize, AllocError> {
    match align_up(size) {
        Some(aligned) if aligned >= HEADER_SIZE => Ok(aligned),
        _ => Err(AllocError::InvalidSize),
    }
}

/// A thread's handle to the heap.
///
/// Owns the thread's allocation context: the current nursery buffer,
/// the region checkpoint stack, and the escape boundary. Not `Send`;
/// the fast path reads and writes the context without synchronization,
/// so a mutator must stay on the thread that attached it.
pub struct Mutator {
    pub(crate) heap: Arc<GcHeap>,
    /// Boxed so the registry can hold a stable pointer to it.
    pub(crate) slot: Box<TlabSlot>,
    /// Conservative upper bound of the attaching thread's stack.
    pub(crate) stack_anchor: usize,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    /// Attach the current thread to the heap.
    pub fn attach(heap: Arc<GcHeap>) -> Self {
        let mutator = Self {
            heap,
            slot: Box::new(TlabSlot::new()),
            stack_anchor: stack_probe(),
            _not_send: PhantomData,
        };
        mutator.heap.register_mutator(NonNull::from(mutator.slot.as_ref()));
        debug!("Mutator attached, stack anchor {:#x}", mutator.stack_anchor);
        mutator
    }

    /// Get the heap this mutator is attached to.
    pub fn heap(&self) -> &Arc<GcHeap> {
        &self.heap
    }

    /// The current buffer as `(start, end)`, if one is installed.
    pub fn buffer(&self) -> Option<(usize, usize)> {
        // Safety: owner thread read of its own context.
        let tlab = unsafe { self.slot.tlab() };
        if tlab.has_buffer() {
            Some((tlab.start, tlab.hard_end))
        } else {
            None
        }
    }

    // =========================================================================
    // Allocation Entry Points
    // =========================================================================

    /// Allocate an object of `size` bytes described by `vtable`.
    ///
    /// Tries the unsynchronized buffer path first, then takes the GC
    /// lock for the slow path. The returned address carries a
    /// published header and zeroed payload.
    pub fn allocate(&mut self, vtable: &'static VTable, size: usize) -> Result<usize, AllocError> {
        let aligned = aligned_request(size)?;

        self.run_allocation_actions();

        self.slot.enter_critical();
        let fast = self.try_alloc_inner(vtable, size, aligned);
        self.slot.exit_critical();
        if let Some(addr) = fast {
            return Ok(addr);
        }

        // The guard must not borrow self while the slow path runs.
        let heap = Arc::clone(&self.heap);
        let _gc = heap.lock_gc();
        match self.alloc_slow_locked(vtable, size, aligned) {
            Ok(addr) => Ok(addr),
            Err(err) => {
                if err == AllocError::OutOfMemory {
                    heap.client().out_of_memory(size);
                }
                Err(err)
            }
        }
    }

    /// Allocation attempt that never blocks.
    ///
    /// No GC lock, no collection, no degraded fallback. Returns
    /// `None` when the request is oversize, invalid, or the nursery
    /// cannot serve it right now.
    pub fn try_allocate_fast(&mut self, vtable: &'static VTable, size: usize) -> Option<usize> {
        let aligned = aligned_request(size).ok()?;
        self.slot.enter_critical();
        let result = self.try_alloc_inner(vtable, size, aligned);
        self.slot.exit_critical();
        result
    }

    /// Allocate an object that will never move.
    ///
    /// Small requests go to pinned old-space blocks, oversize ones to
    /// the large object space. Failure does not trigger a collection.
    pub fn allocate_pinned(
        &self,
        vtable: &'static VTable,
        size: usize,
    ) -> Result<usize, AllocError> {
        let aligned = aligned_request(size)?;
        let _gc = self.heap.lock_gc();

        let addr = if size > self.heap.config().small_object_threshold {
            self.heap.large_objects().alloc(aligned)
        } else {
            self.heap.old_space().alloc_pinned(aligned, vtable.has_references)
        }
        .ok_or(AllocError::OutOfMemory)?;

        trace!(
            "Allocated pinned object {:#x} [{}] ({} bytes)",
            addr,
            vtable.name,
            aligned
        );
        self.heap.observer().alloc_pinned(addr, vtable, aligned);
        // Safety: fresh zeroed memory reserved above.
        unsafe { publish_header(addr, vtable) };
        Ok(addr)
    }

    /// Allocate directly in the old generation.
    ///
    /// May trigger a major collection when the old generation is near
    /// its threshold.
    pub fn allocate_mature(
        &self,
        vtable: &'static VTable,
        size: usize,
    ) -> Result<usize, AllocError> {
        let aligned = aligned_request(size)?;
        let _gc = self.heap.lock_gc();
        self.alloc_degraded_locked(vtable, aligned, true)
    }

    // =========================================================================
    // Fast Path
    // =========================================================================

    /// Buffer-only allocation. Runs inside the critical window; never
    /// takes the GC lock and never triggers a collection.
    fn try_alloc_inner(
        &mut self,
        vtable: &'static VTable,
        size: usize,
        aligned: usize,
    ) -> Option<usize> {
        let config = self.heap.config();
        let tlab_size = config.tlab_size;
        let max_waste = config.max_buffer_waste;
        let increment = config.scan_start_increment;

        if size > config.small_object_threshold {
            return None;
        }

        let addr = if aligned > tlab_size {
            // Oversize for a buffer; bump the nursery directly.
            let p = self.heap.nursery().allocate_direct(aligned)?;
            self.heap.nursery().record_scan_start(p);
            self.clear_for_allocation(p, aligned);
            p
        } else {
            // Safety: owner thread inside its critical window; the
            // collector keeps off per the safepoint contract.
            let tlab = unsafe { self.slot.tlab() };
            let p = tlab.next;
            let new_next = p + aligned;
            let available = tlab.hard_end - p;

            if new_next < tlab.hard_end {
                tlab.next = new_next;
                if new_next >= tlab.soft_end {
                    self.heap.nursery().record_scan_start(p);
                    tlab.soft_end = tlab.hard_end.min(new_next + increment);
                    trace!("Expanding thread buffer: {:#x}-{:#x}", tlab.next, tlab.soft_end);
                }
                p
            } else if available > max_waste {
                // Too much left in the buffer to throw away.
                let p = self.heap.nursery().allocate_direct(aligned)?;
                self.clear_for_allocation(p, aligned);
                p
            } else {
                // Retire the remainder and take a fresh buffer.
                self.heap.nursery().retire_remainder(p, available);
                self.heap.stats().record_buffer_waste(available);
                let (base, len) = self.heap.nursery().reserve_buffer(tlab_size, aligned)?;
                self.heap.stats().record_buffer_issued();
                tlab.install_buffer(base, len, increment);
                tlab.next = base + aligned;
                if self.heap.client().has_finalizer(vtable) {
                    tlab.escape_boundary = Some(tlab.next);
                }
                self.heap.nursery().record_scan_start(base);
                self.clear_for_allocation(base, len);
                base
            }
        };

        self.heap.stats().record_allocation(aligned);
        // Safety: memory reserved above, owned by this thread.
        Some(unsafe { self.commit_object(addr, vtable, aligned) })
    }

    // =========================================================================
    // Slow Path
    // =========================================================================

    /// Locked allocation. May refill the buffer, trigger collections,
    /// or fall back to the old generation. Caller holds the GC lock.
    fn alloc_slow_locked(
        &mut self,
        vtable: &'static VTable,
        size: usize,
        aligned: usize,
    ) -> Result<usize, AllocError> {
        let config = self.heap.config();
        let tlab_size = config.tlab_size;
        let max_waste = config.max_buffer_waste;
        let increment = config.scan_start_increment;
        let nursery_size = config.nursery_size;

        if size > config.small_object_threshold {
            self.heap.stats().record_large_allocation(aligned);
            let addr = self
                .heap
                .large_objects()
                .alloc(aligned)
                .ok_or(AllocError::OutOfMemory)?;
            return Ok(unsafe { self.commit_object(addr, vtable, aligned) });
        }

        self.heap.stats().record_allocation(aligned);

        // Context state is read up front; the borrow cannot be held
        // across a collection, which may reset the context.
        let (p, soft_end, hard_end, start) = {
            // Safety: owner thread, and the GC lock holds collections off.
            let tlab = unsafe { self.slot.tlab() };
            (tlab.next, tlab.soft_end, tlab.hard_end, tlab.start)
        };
        let new_next = p + aligned;

        if new_next < soft_end {
            // Safety: as above.
            unsafe { self.slot.tlab() }.next = new_next;
            return Ok(unsafe { self.commit_object(p, vtable, aligned) });
        }

        if new_next < hard_end {
            // Past the scan checkpoint but still inside the buffer.
            {
                // Safety: as above.
                let tlab = unsafe { self.slot.tlab() };
                tlab.next = new_next;
                tlab.soft_end = hard_end.min(new_next + increment);
                trace!("Expanding thread buffer: {:#x}-{:#x}", tlab.next, tlab.soft_end);
            }
            self.heap.nursery().record_scan_start(p);
            return Ok(unsafe { self.commit_object(p, vtable, aligned) });
        }

        // Buffer exhausted. Once the heap has gone degraded, keep
        // allocating degraded until a collection finishes instead of
        // fighting over the nursery tail.
        let degraded = self.heap.degraded_bytes();
        if degraded > 0 && degraded < nursery_size {
            return self.alloc_degraded_locked(vtable, aligned, false);
        }

        let available = hard_end - p;
        if aligned > tlab_size || available > max_waste {
            let Some((addr, _)) = self.reserve_nursery_or_collect(aligned, aligned) else {
                return self.alloc_degraded_locked(vtable, aligned, false);
            };
            self.clear_for_allocation(addr, aligned);
            return Ok(unsafe { self.commit_object(addr, vtable, aligned) });
        }

        // Retire what is left and move to a fresh buffer.
        if start != 0 {
            debug!("Retire TLAB: {:#x}-{:#x} [{}]", start, hard_end, available);
        }
        self.heap.nursery().retire_remainder(p, available);
        self.heap.stats().record_buffer_waste(available);

        let Some((base, len)) = self.reserve_nursery_or_collect(tlab_size, aligned) else {
            return self.alloc_degraded_locked(vtable, aligned, false);
        };
        self.heap.stats().record_buffer_issued();

        let has_finalizer = self.heap.client().has_finalizer(vtable);
        {
            // Safety: as above. The collection ladder is done, so the
            // context is stable again.
            let tlab = unsafe { self.slot.tlab() };
            tlab.install_buffer(base, len, increment);
            tlab.next = base + aligned;
            if has_finalizer {
                tlab.escape_boundary = Some(tlab.next);
            }
        }
        self.heap.nursery().record_scan_start(base);
        self.clear_for_allocation(base, len);
        Ok(unsafe { self.commit_object(base, vtable, aligned) })
    }

    /// Reserve nursery space, collecting once if the first attempt
    /// fails.
    ///
    /// Even after a collection the space may be gone again; other
    /// threads can consume it ahead of us, and a collection that went
    /// degraded freed nothing. Callers fall back to degraded
    /// allocation on `None`.
    fn reserve_nursery_or_collect(&mut self, desired: usize, min: usize) -> Option<(usize, usize)> {
        if let Some(r) = self.heap.nursery().reserve_buffer(desired, min) {
            return Some(r);
        }
        self.heap
            .run_collection_locked(desired, Generation::Nursery, "nursery is full");
        if self.heap.degraded_bytes() == 0 {
            self.heap.nursery().reserve_buffer(desired, min)
        } else {
            None
        }
    }

    /// Allocate from the old generation. Caller holds the GC lock.
    ///
    /// `for_mature` distinguishes explicit tenured requests from the
    /// degraded fallback; only the latter counts toward degraded mode
    /// and diagnostics.
    fn alloc_degraded_locked(
        &self,
        vtable: &'static VTable,
        aligned: usize,
        for_mature: bool,
    ) -> Result<usize, AllocError> {
        if !for_mature {
            self.heap.client().degraded_allocation(aligned);
            self.heap.note_degraded(aligned);
            if self.heap.needs_major_collection(aligned) {
                self.heap
                    .run_collection_locked(aligned, Generation::Tenured, "degraded allocation");
            }
        } else if self.heap.needs_major_collection(aligned) {
            self.heap.run_collection_locked(
                aligned,
                Generation::Tenured,
                "mature allocation failure",
            );
        }

        let addr = self
            .heap
            .old_space()
            .alloc_degraded(aligned)
            .ok_or(AllocError::OutOfMemory)?;

        if !for_mature {
            self.heap.stats().record_degraded(aligned);
            self.heap.observer().alloc_degraded(addr, vtable, aligned);
        }

        trace!(
            "Allocated old generation object {:#x} [{}] ({} bytes)",
            addr,
            vtable.name,
            aligned
        );
        // Safety: old-space blocks are never reused, so the memory is
        // still zero from the arena mapping.
        unsafe { publish_header(addr, vtable) };
        Ok(addr)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Sampling hooks driven by the shared allocation counter:
    /// forced collections and heap verification for stress testing.
    /// Forcing collections takes precedence.
    fn run_allocation_actions(&mut self) {
        let config = self.heap.config();
        if config.collect_every == 0 && config.verify_every == 0 {
            return;
        }
        let index = self.heap.next_allocation_index();
        if config.collect_every != 0 {
            if index % config.collect_every == 0 {
                let _gc = self.heap.lock_gc();
                self.heap.run_collection_locked(
                    0,
                    Generation::Nursery,
                    "collect-before-alloc-triggered",
                );
            }
        } else if index % config.verify_every == 0 {
            let _gc = self.heap.lock_gc();
            self.heap.delegate().verify_heap(&self.heap);
        }
    }

    /// Apply the configured clearing policy to freshly reserved
    /// memory.
    ///
    /// Under collection-time clearing the payload is already zero;
    /// only the header slot must not leak a stale descriptor.
    fn clear_for_allocation(&self, addr: usize, len: usize) {
        match self.heap.config().clear_policy {
            ClearPolicy::AtBufferCreation | ClearPolicy::AtBufferCreationDebug => unsafe {
                std::ptr::write_bytes(addr as *mut u8, 0, len);
            },
            ClearPolicy::AtCollection => unsafe {
                std::ptr::write_bytes(addr as *mut u8, 0, HEADER_SIZE.min(len));
            },
        }
    }

    /// Record the allocation and publish the object header.
    ///
    /// # Safety
    ///
    /// `addr..addr + aligned` must be memory this thread just
    /// reserved, cleared per policy.
    unsafe fn commit_object(&self, addr: usize, vtable: &'static VTable, aligned: usize) -> usize {
        trace!(
            "Allocated object {:#x} [{}] ({} bytes)",
            addr,
            vtable.name,
            aligned
        );
        self.heap.observer().alloc(addr, vtable, aligned);
        debug_assert!(
            unsafe { header_vtable(addr) }.is_none(),
            "allocation target {:#x} already carries a header",
            addr
        );
        unsafe { publish_header(addr, vtable) };
        addr
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let _gc = self.heap.lock_gc();
        // Safety: this thread owns the slot and the GC lock holds
        // collections off.
        let tlab = unsafe { self.slot.tlab() };
        if tlab.has_buffer() {
            let remaining = tlab.remaining();
            self.heap.nursery().retire_remainder(tlab.next, remaining);
            self.heap.stats().record_buffer_waste(remaining);
        }
        tlab.clear();
        self.heap.unregister_mutator(NonNull::from(self.slot.as_ref()));
        debug!("Mutator detached");
    }
}

/// Read an address inside the caller's stack frame.
#[inline(never)]
pub(crate) fn stack_probe() -> usize {
    let probe: u8 = 0;
    &probe as *const u8 as usize
}
