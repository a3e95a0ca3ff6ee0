//! Object descriptors and header access.
//!
//! Every allocation begins with a single pointer-sized header slot
//! holding the address of its [`VTable`]. The slot is zero until the
//! allocator publishes the descriptor with one sequentially consistent
//! store; a concurrent scanner that reads a nonzero header may rely on
//! the rest of the object being fully allocated.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment of every allocation, in bytes.
pub const ALLOC_ALIGN: usize = 8;

/// Size of the descriptor header at the start of every object.
pub const HEADER_SIZE: usize = std::mem::size_of::<usize>();

/// Type descriptor for allocated objects.
///
/// Descriptors are owned by the client runtime and must outlive every
/// object that references them, which in practice means they are
/// `'static`. The allocator only reads them.
#[derive(Debug)]
pub struct VTable {
    /// Total allocation size for this descriptor's size class.
    pub instance_size: usize,
    /// Whether instances contain pointers the collector must trace.
    pub has_references: bool,
    /// Whether instances must be finalized before being reclaimed.
    pub has_finalizer: bool,
    /// Human-readable type name for diagnostics.
    pub name: &'static str,
}

impl VTable {
    /// Create a descriptor for a pointer-free, finalizer-free type.
    pub const fn new(name: &'static str, instance_size: usize) -> Self {
        Self {
            instance_size,
            has_references: false,
            has_finalizer: false,
            name,
        }
    }

    /// Mark instances as containing traceable pointers.
    pub const fn with_references(mut self) -> Self {
        self.has_references = true;
        self
    }

    /// Mark instances as requiring finalization.
    pub const fn with_finalizer(mut self) -> Self {
        self.has_finalizer = true;
        self
    }
}

/// Round `size` up to [`ALLOC_ALIGN`].
///
/// Returns `None` if the rounded size would overflow `usize`.
#[inline]
pub fn align_up(size: usize) -> Option<usize> {
    let bumped = size.checked_add(ALLOC_ALIGN - 1)?;
    Some(bumped & !(ALLOC_ALIGN - 1))
}

/// Publish an object's descriptor, making the allocation visible.
///
/// This is the single store that turns raw memory into an object. It
/// is sequentially consistent so that all prior initializing writes
/// are ordered before the header becomes readable.
///
/// # Safety
///
/// `addr` must point to at least [`HEADER_SIZE`] writable bytes
/// aligned to [`ALLOC_ALIGN`].
#[inline]
pub unsafe fn publish_header(addr: usize, vtable: &'static VTable) {
    let slot = addr as *const AtomicUsize;
    (*slot).store(vtable as *const VTable as usize, Ordering::SeqCst);
}

/// Read an object's descriptor back from its header.
///
/// Returns `None` if the header slot is still zero.
///
/// # Safety
///
/// `addr` must point to at least [`HEADER_SIZE`] readable bytes
/// aligned to [`ALLOC_ALIGN`], and any nonzero value stored there must
/// have been written by [`publish_header`].
#[inline]
pub unsafe fn header_vtable(addr: usize) -> Option<&'static VTable> {
    let slot = addr as *const AtomicUsize;
    let raw = (*slot).load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        Some(&*(raw as *const VTable))
    }
}

/// Aligned end address of the object at `addr`.
///
/// Returns `None` if the object has no published header yet.
///
/// # Safety
///
/// Same contract as [`header_vtable`].
#[inline]
pub unsafe fn object_end(addr: usize) -> Option<usize> {
    let vtable = header_vtable(addr)?;
    let size = align_up(vtable.instance_size.max(HEADER_SIZE))?;
    addr.checked_add(size)
}
