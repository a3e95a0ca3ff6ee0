//! Large object space for objects above the small-object threshold.
//!
//! Large objects are allocated directly from the system allocator
//! and managed individually. They bypass the nursery entirely and
//! never move, which makes every large object implicitly pinned.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::alloc::Layout;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::ALLOC_ALIGN;

/// Metadata for a large object.
struct LargeObject {
    /// Size of the allocation in bytes.
    size: usize,
}

/// Large object space.
///
/// Internally synchronized; allocation and lookup can be called from
/// any thread.
pub struct LargeObjectSpace {
    /// Map from object address to metadata.
    objects: Mutex<FxHashMap<usize, LargeObject>>,
    /// Total bytes allocated.
    allocated: AtomicUsize,
}

fn object_layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, ALLOC_ALIGN).ok()
}

impl LargeObjectSpace {
    /// Create a new large object space.
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(FxHashMap::default()),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocate a large object of `size` aligned bytes, zeroed.
    ///
    /// Returns `None` when the system allocator refuses the request.
    pub fn alloc(&self, size: usize) -> Option<usize> {
        let layout = object_layout(size)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        let addr = ptr as usize;

        let mut objects = self.objects.lock();
        objects.insert(addr, LargeObject { size });
        self.allocated.fetch_add(size, Ordering::Relaxed);

        Some(addr)
    }

    /// Check if an address is the start of a large object.
    pub fn contains(&self, addr: usize) -> bool {
        self.objects.lock().contains_key(&addr)
    }

    /// Get the size of a large object.
    pub fn size_of(&self, addr: usize) -> Option<usize> {
        self.objects.lock().get(&addr).map(|obj| obj.size)
    }

    /// Get total bytes allocated.
    pub fn usage(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Get the number of live large objects.
    pub fn count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Iterate over all large objects.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(usize, usize),
    {
        let objects = self.objects.lock();
        for (addr, obj) in objects.iter() {
            f(*addr, obj.size);
        }
    }
}

impl Default for LargeObjectSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LargeObjectSpace {
    fn drop(&mut self) {
        let objects = self.objects.get_mut();
        for (addr, obj) in objects.drain() {
            if let Some(layout) = object_layout(obj.size) {
                unsafe {
                    std::alloc::dealloc(addr as *mut u8, layout);
                }
            }
        }
    }
}
