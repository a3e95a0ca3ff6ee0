//! Per-thread allocation context.
//!
//! Each mutator thread owns one [`Tlab`] describing its current
//! nursery buffer, the checkpoint stack for region-scoped
//! reclamation, and the escape boundary below which rewinding is
//! forbidden. The owning thread mutates it without synchronization;
//! the collector may reset it, but only while the thread is stopped
//! at a safepoint.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::stats::AllocStats;

/// Initial capacity of the region checkpoint stack.
pub(crate) const REGION_STACK_SEED: usize = 1024;

/// Thread-local bump allocation state.
///
/// All addresses are zero when the thread holds no buffer. A fresh
/// buffer is installed by the first allocation after attach or after
/// a collection cleared the context.
#[derive(Debug)]
pub(crate) struct Tlab {
    /// First byte of the current buffer.
    pub(crate) start: usize,
    /// Bump pointer. The next object is placed here.
    pub(crate) next: usize,
    /// Scan-hint checkpoint. Bumping past it takes the slow path once
    /// so a scan start can be recorded, then it advances toward
    /// `hard_end`. It can trail `next` until that happens.
    pub(crate) soft_end: usize,
    /// True end of the buffer.
    pub(crate) hard_end: usize,
    /// Bump positions saved by region enters, non-decreasing, all
    /// within `[start, hard_end]`.
    pub(crate) region_checkpoints: Vec<usize>,
    /// Address below which rewinding is forbidden because an object
    /// may have escaped its region. Subsumed checkpoints are dropped.
    pub(crate) escape_boundary: Option<usize>,
}

impl Tlab {
    pub(crate) const fn new() -> Self {
        Self {
            start: 0,
            next: 0,
            soft_end: 0,
            hard_end: 0,
            region_checkpoints: Vec::new(),
            escape_boundary: None,
        }
    }

    /// Whether an address falls inside the current buffer.
    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.hard_end
    }

    /// Whether the thread currently holds a buffer.
    #[inline]
    pub(crate) fn has_buffer(&self) -> bool {
        self.next != 0
    }

    /// Bytes left between the bump pointer and the true end.
    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.hard_end - self.next
    }

    /// Take ownership of a fresh buffer.
    ///
    /// Resets the bump state and discards all region bookkeeping; the
    /// old buffer's checkpoints are meaningless in the new one.
    pub(crate) fn install_buffer(&mut self, base: usize, len: usize, scan_start_increment: usize) {
        self.start = base;
        self.next = base;
        self.hard_end = base + len;
        self.soft_end = base + scan_start_increment.min(len);
        self.region_checkpoints.clear();
        self.escape_boundary = None;
    }

    /// Drop the current buffer without retiring it.
    ///
    /// Called by the collector between collections; the next
    /// allocation will install a fresh buffer. Keeps the checkpoint
    /// stack's storage for reuse.
    pub(crate) fn clear(&mut self) {
        self.start = 0;
        self.next = 0;
        self.soft_end = 0;
        self.hard_end = 0;
        self.region_checkpoints.clear();
        self.escape_boundary = None;
    }

    /// Push a region checkpoint, growing the stack by 1.5x when full.
    pub(crate) fn push_checkpoint(&mut self, addr: usize) {
        let capacity = self.region_checkpoints.capacity();
        if self.region_checkpoints.len() == capacity {
            let new_capacity = if capacity == 0 {
                REGION_STACK_SEED
            } else {
                capacity + capacity / 2
            };
            self.region_checkpoints.reserve_exact(new_capacity - capacity);
        }
        self.region_checkpoints.push(addr);
    }

    /// Drop every checkpoint at or below the escape boundary.
    ///
    /// Those checkpoints can never be rewound to again; keeping them
    /// would let a later exit reclaim memory that escaped. Clears the
    /// boundary once the stack is empty.
    pub(crate) fn forget_stuck_checkpoints(&mut self, stats: &AllocStats) {
        let Some(stuck) = self.escape_boundary else {
            return;
        };
        if stuck > self.start && stuck <= self.hard_end {
            stats.record_region_bytes_stuck(stuck - self.start);
        }
        let forgotten = self.region_checkpoints.partition_point(|&c| c <= stuck);
        self.region_checkpoints.drain(..forgotten);
        if self.region_checkpoints.is_empty() {
            self.escape_boundary = None;
        }
    }
}

/// Shared cell holding a thread's [`Tlab`].
///
/// The slot is boxed so its address stays stable while registered
/// with the heap. The critical flag marks the window in which the
/// owner runs the lock-free allocation path and must not be asked to
/// stop; the collector reads it before suspending the thread.
pub(crate) struct TlabSlot {
    tlab: UnsafeCell<Tlab>,
    in_critical: AtomicBool,
}

// Safety: the inner Tlab is mutated either by the owning thread or by
// the collector while that thread is stopped at a safepoint, never
// concurrently. The flag is an atomic.
unsafe impl Send for TlabSlot {}
unsafe impl Sync for TlabSlot {}

impl TlabSlot {
    pub(crate) const fn new() -> Self {
        Self {
            tlab: UnsafeCell::new(Tlab::new()),
            in_critical: AtomicBool::new(false),
        }
    }

    /// Get mutable access to the context.
    ///
    /// # Safety
    ///
    /// The caller must be the owning thread, or the collector with
    /// the owning thread stopped, and must not let the reference
    /// outlive that exclusivity. In particular it must be dropped
    /// before anything that can reset thread contexts runs.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn tlab(&self) -> &mut Tlab {
        &mut *self.tlab.get()
    }

    /// Enter the non-suspendable window around the lock-free path.
    #[inline]
    pub(crate) fn enter_critical(&self) {
        self.in_critical.store(true, Ordering::SeqCst);
    }

    /// Leave the non-suspendable window.
    #[inline]
    pub(crate) fn exit_critical(&self) {
        self.in_critical.store(false, Ordering::SeqCst);
    }

    /// Whether the owner is inside the non-suspendable window.
    #[inline]
    pub(crate) fn in_critical(&self) -> bool {
        self.in_critical.load(Ordering::SeqCst)
    }
}
