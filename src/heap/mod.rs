//! Heap memory management.
//!
//! The heap owns one contiguous arena split into two spaces, plus a
//! side space for oversize objects:
//! - Nursery: young generation, served through thread-local buffers
//! - Old space: tenured generation for degraded and pinned objects
//! - Large object space: individually allocated, always pinned
//!
//! The card table covers exactly the arena, so a card index is a
//! single subtract and shift away from any nursery or old-space
//! address. Large objects live outside the tracked window.
//!
//! Collection itself is delegated: the heap hands out memory, runs
//! invariant checks, and gives a [`CollectionDelegate`] the chance to
//! reclaim when allocation fails.

mod large_object_space;
mod nursery;
mod old_space;

pub use large_object_space::LargeObjectSpace;
pub use nursery::Nursery;
pub use old_space::OldSpace;

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::barrier::CardTable;
use crate::config::{ClearPolicy, GcConfig};
use crate::object::VTable;
use crate::protocol::{AllocObserver, NoopObserver};
use crate::stats::AllocStats;
use crate::tlab::TlabSlot;
use crate::Generation;

// =============================================================================
// Collaborator Interfaces
// =============================================================================

/// The collector the heap escalates to when allocation fails.
///
/// Both methods are called with the GC lock held and every mutator
/// thread other than the requester stopped at a safepoint outside
/// its critical window. Implementations may reset thread contexts
/// and the nursery under that guarantee.
pub trait CollectionDelegate: Send + Sync {
    /// Reclaim memory from the given generation.
    fn perform_collection(
        &self,
        heap: &GcHeap,
        requested: usize,
        generation: Generation,
        reason: &str,
    );

    /// Check heap invariants, panicking on violation.
    fn verify_heap(&self, _heap: &GcHeap) {}
}

/// Stand-in collector that treats every young object as garbage.
///
/// A minor collection clears all thread contexts and resets the
/// nursery wholesale; nothing survives. Runtimes with real liveness
/// supply their own [`CollectionDelegate`].
pub struct DiscardingCollector;

impl CollectionDelegate for DiscardingCollector {
    fn perform_collection(
        &self,
        heap: &GcHeap,
        requested: usize,
        generation: Generation,
        reason: &str,
    ) {
        debug!(
            "discarding collection of {}: {} bytes requested ({})",
            generation, requested, reason
        );
        // Safety: the trait contract holds every mutator at a
        // safepoint for the duration of this call.
        unsafe {
            heap.reset_thread_contexts();
            heap.reset_nursery();
        }
        if generation.is_old() {
            heap.old_space().clear_cards(heap.card_table());
        }
    }

    fn verify_heap(&self, heap: &GcHeap) {
        heap.verify_integrity();
    }
}

/// Runtime policy hooks consulted by the allocator.
///
/// All methods have workable defaults; embedders override what they
/// need.
pub trait ClientPolicy: Send + Sync {
    /// Allocation failed even after a collection retry.
    ///
    /// Called once per failed request before the error is returned.
    fn out_of_memory(&self, size: usize) {
        log::error!("out of memory allocating {} bytes", size);
    }

    /// An allocation was served from the old generation because the
    /// nursery could not satisfy it.
    fn degraded_allocation(&self, size: usize) {
        log::warn!("degraded allocation of {} bytes, nursery exhausted", size);
    }

    /// Whether instances of this descriptor must be finalized.
    ///
    /// Finalizable objects are exempt from region rewinding; they
    /// must reach the collector to have their finalizer run.
    fn has_finalizer(&self, vtable: &'static VTable) -> bool {
        vtable.has_finalizer
    }
}

/// Policy that keeps every default.
pub struct DefaultClient;

impl ClientPolicy for DefaultClient {}

// =============================================================================
// Arena
// =============================================================================

/// Owner of the contiguous mapping backing the nursery and old space.
struct Arena {
    base: *mut u8,
    size: usize,
}

impl Arena {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, crate::object::ALLOC_ALIGN)
            .expect("Invalid arena layout");

        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            panic!("Failed to allocate heap arena of {} bytes", size);
        }

        Self { base, size }
    }

    #[inline]
    fn base(&self) -> usize {
        self.base as usize
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, crate::object::ALLOC_ALIGN)
            .expect("Invalid arena layout");
        unsafe {
            std::alloc::dealloc(self.base, layout);
        }
    }
}

// Safety: the arena only carries the mapping; access discipline is
// enforced by the spaces carved from it.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

// =============================================================================
// Heap
// =============================================================================

/// Main heap structure managing all memory spaces.
pub struct GcHeap {
    /// Configuration parameters.
    config: GcConfig,

    /// The mapping behind the nursery and old space; unmapped on drop.
    _arena: Arena,

    /// Young generation (thread buffers and direct bumps).
    nursery: Nursery,

    /// Old generation, serialized behind a lock.
    old: Mutex<OldSpace>,

    /// Large object space (internally synchronized).
    large_objects: LargeObjectSpace,

    /// Dirty-card map over the arena.
    cards: CardTable,

    /// The global GC lock. Buffer refills, degraded allocation, and
    /// collections all serialize on it.
    gc_lock: Mutex<()>,

    /// Allocation contexts of every attached mutator thread.
    mutators: Mutex<Vec<NonNull<TlabSlot>>>,

    /// Allocator statistics.
    stats: AllocStats,

    /// Bytes allocated degraded since the last collection. Nonzero
    /// means the heap is in degraded mode.
    degraded_bytes: AtomicUsize,

    /// Allocations observed so far, drives the sampling hooks.
    alloc_counter: AtomicU64,

    /// The collector.
    delegate: Box<dyn CollectionDelegate>,

    /// Runtime policy hooks.
    client: Box<dyn ClientPolicy>,

    /// Diagnostic event sink.
    observer: Box<dyn AllocObserver>,
}

// Safety: the mutator registry's raw slots are dereferenced only at
// safepoints per the delegate contract; all other shared state is
// atomic or behind locks.
unsafe impl Send for GcHeap {}
unsafe impl Sync for GcHeap {}

impl GcHeap {
    /// Create a new heap with the given configuration.
    pub fn new(config: GcConfig) -> Self {
        config.validate().expect("Invalid GC configuration");

        let arena = Arena::new(config.nursery_size + config.old_size);
        let base = arena.base();
        let nursery = Nursery::new(base, config.nursery_size, config.scan_start_increment);
        let old = OldSpace::new(base + config.nursery_size, config.old_size, config.block_size);
        let cards = CardTable::new(base, arena.size, config.card_size);
        let stats = AllocStats::new(config.detailed_stats);

        Self {
            config,
            _arena: arena,
            nursery,
            old: Mutex::new(old),
            large_objects: LargeObjectSpace::new(),
            cards,
            gc_lock: Mutex::new(()),
            mutators: Mutex::new(Vec::new()),
            stats,
            degraded_bytes: AtomicUsize::new(0),
            alloc_counter: AtomicU64::new(0),
            delegate: Box::new(DiscardingCollector),
            client: Box::new(DefaultClient),
            observer: Box::new(NoopObserver),
        }
    }

    /// Create a heap with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(GcConfig::default())
    }

    /// Replace the collector.
    pub fn with_delegate(mut self, delegate: Box<dyn CollectionDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Replace the runtime policy hooks.
    pub fn with_client(mut self, client: Box<dyn ClientPolicy>) -> Self {
        self.client = client;
        self
    }

    /// Replace the diagnostic event sink.
    pub fn with_observer(mut self, observer: Box<dyn AllocObserver>) -> Self {
        self.observer = observer;
        self
    }

    // =========================================================================
    // Space Queries
    // =========================================================================

    /// Check if an address is in the nursery.
    #[inline]
    pub fn in_nursery(&self, addr: usize) -> bool {
        self.nursery.contains(addr)
    }

    /// Check if an address is managed by this heap.
    pub fn contains(&self, addr: usize) -> bool {
        self.nursery.contains(addr)
            || self.old.lock().contains(addr)
            || self.large_objects.contains(addr)
    }

    /// Get the generation an address belongs to.
    pub fn generation_of(&self, addr: usize) -> Option<Generation> {
        if self.nursery.contains(addr) {
            Some(Generation::Nursery)
        } else if self.old.lock().contains(addr) {
            Some(Generation::Tenured)
        } else if self.large_objects.contains(addr) {
            Some(Generation::LargeObject)
        } else {
            None
        }
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Acquire the global GC lock.
    pub fn lock_gc(&self) -> MutexGuard<'_, ()> {
        self.gc_lock.lock()
    }

    /// Check if serving `requested` more old-generation bytes would
    /// push usage past the major collection threshold.
    pub fn needs_major_collection(&self, requested: usize) -> bool {
        let old = self.old.lock();
        let usage = (old.usage() + requested) as f64;
        usage / old.capacity() as f64 >= self.config.major_threshold
    }

    /// Run a collection. The caller must hold the GC lock.
    ///
    /// Degraded mode ends when a collection starts; the delegate
    /// re-enters it by noting degraded bytes if reclamation fails.
    pub fn run_collection_locked(&self, requested: usize, generation: Generation, reason: &str) {
        debug!(
            "collection start: {}, {} bytes requested ({})",
            generation, requested, reason
        );
        self.observer.collection_begin(generation, requested);
        self.reset_degraded_mode();
        self.delegate.perform_collection(self, requested, generation, reason);
        self.observer.collection_end(generation);
        debug!("collection end: {}", generation);
    }

    /// Clear every attached thread's allocation context.
    ///
    /// Buffers are dropped, not retired; the nursery reset reclaims
    /// them wholesale. Each thread installs a fresh buffer on its
    /// next allocation.
    ///
    /// # Safety
    ///
    /// Every attached mutator must be stopped at a safepoint outside
    /// its critical window for the duration of the call.
    pub unsafe fn reset_thread_contexts(&self) {
        let mutators = self.mutators.lock();
        for slot in mutators.iter() {
            slot.as_ref().tlab().clear();
        }
    }

    /// Make the whole nursery available again.
    ///
    /// # Safety
    ///
    /// Same contract as [`GcHeap::reset_thread_contexts`], and no
    /// live references into the nursery may remain.
    pub unsafe fn reset_nursery(&self) {
        let zero = matches!(self.config.clear_policy, ClearPolicy::AtCollection);
        self.nursery.reset(zero);
    }

    // =========================================================================
    // Degraded Mode
    // =========================================================================

    /// Get bytes allocated degraded since the last collection.
    ///
    /// Nonzero means the heap is operating in degraded mode.
    #[inline]
    pub fn degraded_bytes(&self) -> usize {
        self.degraded_bytes.load(Ordering::Relaxed)
    }

    /// Add to the degraded byte count, entering degraded mode.
    pub fn note_degraded(&self, bytes: usize) {
        self.degraded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Leave degraded mode.
    pub fn reset_degraded_mode(&self) {
        self.degraded_bytes.store(0, Ordering::Relaxed);
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check structural invariants of every space and thread context.
    ///
    /// Panics on violation. Callers must guarantee the safepoint
    /// contract of [`CollectionDelegate`] so thread contexts can be
    /// read.
    pub fn verify_integrity(&self) {
        assert!(
            self.nursery.allocated() <= self.nursery.capacity(),
            "nursery cursor past its limit"
        );
        {
            let old = self.old.lock();
            assert!(
                old.usage() <= old.committed(),
                "old space usage exceeds its committed blocks"
            );
            assert!(
                old.committed() <= old.capacity(),
                "old space blocks past its limit"
            );
        }

        let mutators = self.mutators.lock();
        for slot in mutators.iter() {
            // Safety: callers hold every mutator at a safepoint.
            let tlab = unsafe { slot.as_ref().tlab() };
            if !tlab.has_buffer() {
                assert!(
                    tlab.escape_boundary.is_none(),
                    "cleared context still carries an escape boundary"
                );
                continue;
            }
            assert!(
                tlab.start <= tlab.next && tlab.next <= tlab.hard_end,
                "thread buffer bump state out of order"
            );
            assert!(tlab.soft_end <= tlab.hard_end, "scan checkpoint past buffer end");
            assert!(
                self.nursery.contains(tlab.start) && tlab.hard_end <= self.nursery.limit(),
                "thread buffer outside the nursery"
            );
            let mut prev = tlab.start;
            for &checkpoint in &tlab.region_checkpoints {
                assert!(
                    checkpoint >= prev && checkpoint <= tlab.hard_end,
                    "region checkpoints out of order"
                );
                prev = checkpoint;
            }
            if let Some(stuck) = tlab.escape_boundary {
                assert!(
                    stuck >= tlab.start && stuck <= tlab.next,
                    "escape boundary outside the allocated range"
                );
            }
        }
    }

    // =========================================================================
    // Mutator Registry
    // =========================================================================

    pub(crate) fn register_mutator(&self, slot: NonNull<TlabSlot>) {
        self.mutators.lock().push(slot);
    }

    pub(crate) fn unregister_mutator(&self, slot: NonNull<TlabSlot>) {
        self.mutators.lock().retain(|s| s.as_ptr() != slot.as_ptr());
    }

    /// Number of attached mutator threads.
    pub fn mutator_count(&self) -> usize {
        self.mutators.lock().len()
    }

    pub(crate) fn next_allocation_index(&self) -> u64 {
        self.alloc_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Get the configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Get allocator statistics.
    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }

    /// Get the nursery.
    pub fn nursery(&self) -> &Nursery {
        &self.nursery
    }

    /// Get the old space. The guard serializes all old-space access;
    /// hold it briefly.
    pub fn old_space(&self) -> MutexGuard<'_, OldSpace> {
        self.old.lock()
    }

    /// Get the large object space.
    pub fn large_objects(&self) -> &LargeObjectSpace {
        &self.large_objects
    }

    /// Get the card table.
    #[inline]
    pub fn card_table(&self) -> &CardTable {
        &self.cards
    }

    /// Get the collector.
    pub fn delegate(&self) -> &dyn CollectionDelegate {
        self.delegate.as_ref()
    }

    /// Get the runtime policy hooks.
    pub fn client(&self) -> &dyn ClientPolicy {
        self.client.as_ref()
    }

    /// Get the diagnostic event sink.
    pub fn observer(&self) -> &dyn AllocObserver {
        self.observer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_creation() {
        let heap = GcHeap::with_defaults();
        let config = heap.config();

        assert_eq!(heap.nursery().capacity(), config.nursery_size);
        assert_eq!(heap.old_space().capacity(), config.old_size);
        assert_eq!(
            heap.card_table().len(),
            (config.nursery_size + config.old_size) / config.card_size
        );
        assert_eq!(heap.mutator_count(), 0);
        heap.verify_integrity();
    }

    #[test]
    fn test_spaces_are_contiguous() {
        let heap = GcHeap::with_defaults();
        let nursery_base = heap.nursery().base();
        let nursery_limit = heap.nursery().limit();

        assert_eq!(heap.generation_of(nursery_base), Some(Generation::Nursery));
        assert_eq!(heap.generation_of(nursery_limit - 1), Some(Generation::Nursery));
        // The old space starts right where the nursery ends.
        assert_eq!(heap.generation_of(nursery_limit), Some(Generation::Tenured));
        assert_eq!(heap.generation_of(0x10), None);
    }

    #[test]
    fn test_generation_of_large_object() {
        let heap = GcHeap::with_defaults();
        let addr = heap.large_objects().alloc(16 * 1024).expect("alloc failed");
        assert_eq!(heap.generation_of(addr), Some(Generation::LargeObject));
        assert!(heap.contains(addr));
        assert!(!heap.in_nursery(addr));
    }

    #[test]
    fn test_needs_major_collection() {
        let heap = GcHeap::with_defaults();
        assert!(!heap.needs_major_collection(0));
        // A request the size of the whole old space trips it.
        assert!(heap.needs_major_collection(heap.config().old_size));

        let mut old = heap.old_space();
        let span = heap.config().block_size;
        while (old.usage() as f64) < heap.config().old_size as f64 * 0.8 {
            old.alloc_degraded(span).expect("old space fill failed");
        }
        drop(old);
        assert!(heap.needs_major_collection(0));
    }

    #[test]
    fn test_degraded_mode_counter() {
        let heap = GcHeap::with_defaults();
        assert_eq!(heap.degraded_bytes(), 0);
        heap.note_degraded(100);
        heap.note_degraded(28);
        assert_eq!(heap.degraded_bytes(), 128);
        heap.reset_degraded_mode();
        assert_eq!(heap.degraded_bytes(), 0);
    }

    #[test]
    fn test_collection_resets_nursery_and_degraded_mode() {
        let heap = GcHeap::with_defaults();
        heap.nursery().allocate_direct(256).expect("alloc failed");
        heap.note_degraded(64);

        let _gc = heap.lock_gc();
        heap.run_collection_locked(0, Generation::Nursery, "test collection");
        assert_eq!(heap.nursery().allocated(), 0);
        assert_eq!(heap.degraded_bytes(), 0);
    }
}
