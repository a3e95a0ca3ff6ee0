//! Loam Nursery Allocator
//!
//! A generational allocation front end: thread-local bump allocation
//! in a nursery, escape-tracking regions that reclaim short-lived
//! objects without a collection, and a card-marking write barrier
//! over the old generation.
//!
//! # Architecture
//!
//! The heap owns one contiguous arena split into three spaces:
//!
//! - **Nursery (Young Generation)**: Served through per-thread
//!   buffers. Threads bump-allocate without synchronization and fall
//!   back to a locked slow path to refill.
//!
//! - **Old Generation**: Block-structured space for degraded
//!   allocations (when the nursery is exhausted), pinned objects, and
//!   explicit mature allocations.
//!
//! - **Large Object Space**: Objects above the small-object threshold
//!   are allocated individually and never move.
//!
//! # Regions
//!
//! A thread can bracket a span of allocations with
//! [`Mutator::region_enter`] and [`Mutator::region_exit`]; objects
//! allocated in between are reclaimed on exit by rewinding the bump
//! pointer, unless a write published them first. Publishing writes go
//! through [`Mutator::stick`], which pins the object and everything
//! allocated before it in the buffer.
//!
//! # Write Barriers
//!
//! Stores of young references into old objects mark a card in the
//! [`CardTable`] so a minor collection can scan only dirty cards
//! instead of the entire old generation.
//!
//! # Usage
//!
//! ```ignore
//! use loam::{GcConfig, GcHeap, Mutator, VTable};
//!
//! static PAIR: VTable = VTable::new("pair", 24).with_references();
//!
//! let heap = std::sync::Arc::new(GcHeap::new(GcConfig::default()));
//! let mut mutator = Mutator::attach(heap.clone());
//!
//! let obj = mutator.allocate(&PAIR, 24)?;
//!
//! mutator.region_enter();
//! let scratch = mutator.allocate(&PAIR, 24)?;
//! mutator.region_exit(None); // scratch is reclaimed here
//! ```
//!
//! # Safety
//!
//! The allocator hands out raw addresses; the embedding runtime must:
//! - Route reference stores through [`write_barrier`] and
//!   [`Mutator::stick`]
//! - Stop mutators at safepoints, outside their critical windows,
//!   before a [`CollectionDelegate`] touches thread contexts
//! - Keep every [`VTable`] alive for as long as its objects

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod barrier;
pub mod config;
pub mod heap;
pub mod object;
pub mod protocol;

mod alloc;
mod region;
mod stats;
mod tlab;

// Re-exports for convenient access
pub use alloc::{AllocError, Mutator};
pub use barrier::{write_barrier, CardTable};
pub use config::{ClearPolicy, ConfigError, GcConfig};
pub use heap::{
    ClientPolicy, CollectionDelegate, DefaultClient, DiscardingCollector, GcHeap,
};
pub use object::VTable;
pub use protocol::{AllocObserver, BinaryEventLog, NoopObserver};
pub use stats::{AllocStats, StickReason};

/// Generation identifier for generational collection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Generation {
    /// Young generation (nursery) - bump allocation in thread buffers.
    Nursery = 0,
    /// Old generation (tenured) - block-structured, never moved.
    Tenured = 1,
    /// Large object space - direct allocation, never moved.
    LargeObject = 2,
}

impl Generation {
    /// Check if this generation is in the young space.
    #[inline]
    pub fn is_young(self) -> bool {
        matches!(self, Generation::Nursery)
    }

    /// Check if this generation is in the old space.
    #[inline]
    pub fn is_old(self) -> bool {
        matches!(self, Generation::Tenured | Generation::LargeObject)
    }

    /// Short name for logs and summaries.
    pub fn as_str(self) -> &'static str {
        match self {
            Generation::Nursery => "nursery",
            Generation::Tenured => "tenured",
            Generation::LargeObject => "large object",
        }
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
