//! Allocation statistics.
//!
//! Tracks allocation volume, buffer churn, and region activity for
//! monitoring and tuning. All counters are relaxed atomics; readers
//! get a consistent-enough picture without slowing the hot path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Why an object was pinned against region rewinding.
///
/// The checks are deliberately coarse: each reason over-approximates
/// the escape it names, and a write that matches several reasons is
/// attributed to the first in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickReason {
    /// The written slot lies outside the nursery (or is unknown).
    NotInNursery,
    /// The written slot lies outside the writer's current buffer.
    DifferentBuffer,
    /// The written slot lies at a lower address than the object.
    LowerAddress,
    /// The written slot lies on the writer's stack.
    EnclosingFrame,
}

/// Statistics about allocator activity.
#[derive(Debug)]
pub struct AllocStats {
    // =========================================================================
    // Allocation
    // =========================================================================
    /// Total objects allocated since start.
    pub objects_allocated: AtomicU64,
    /// Total small-object bytes allocated since start.
    pub bytes_allocated: AtomicU64,
    /// Total large-object bytes allocated since start.
    pub bytes_allocated_large: AtomicU64,
    /// Total bytes allocated in degraded mode.
    pub bytes_allocated_degraded: AtomicU64,
    /// Total objects allocated in degraded mode.
    pub objects_allocated_degraded: AtomicU64,

    // =========================================================================
    // Buffers
    // =========================================================================
    /// Buffers handed out to threads.
    pub buffers_issued: AtomicU64,
    /// Bytes retired as unusable buffer tails.
    pub buffer_bytes_wasted: AtomicU64,

    // =========================================================================
    // Regions
    // =========================================================================
    /// Region checkpoints pushed.
    pub regions_entered: AtomicU64,
    /// Region checkpoints popped.
    pub regions_exited: AtomicU64,
    /// Region stacks abandoned wholesale.
    pub regions_bailed: AtomicU64,
    /// Escape events that raised a pin boundary.
    pub regions_stuck: AtomicU64,
    /// Bytes reclaimed by region rewinds.
    pub region_bytes_reclaimed: AtomicU64,
    /// Bytes made unreclaimable by pin boundaries (detailed only).
    pub region_bytes_stuck: AtomicU64,

    // =========================================================================
    // Escape Reasons (detailed only)
    // =========================================================================
    /// Escapes attributed to [`StickReason::NotInNursery`].
    pub stuck_not_in_nursery: AtomicU64,
    /// Escapes attributed to [`StickReason::DifferentBuffer`].
    pub stuck_different_buffer: AtomicU64,
    /// Escapes attributed to [`StickReason::LowerAddress`].
    pub stuck_lower_address: AtomicU64,
    /// Escapes attributed to [`StickReason::EnclosingFrame`].
    pub stuck_enclosing_frame: AtomicU64,

    detailed: bool,
}

impl AllocStats {
    /// Create new empty statistics.
    ///
    /// `detailed` enables the per-reason escape counters and the
    /// stuck-byte accounting; everything else is always recorded.
    pub const fn new(detailed: bool) -> Self {
        Self {
            objects_allocated: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            bytes_allocated_large: AtomicU64::new(0),
            bytes_allocated_degraded: AtomicU64::new(0),
            objects_allocated_degraded: AtomicU64::new(0),
            buffers_issued: AtomicU64::new(0),
            buffer_bytes_wasted: AtomicU64::new(0),
            regions_entered: AtomicU64::new(0),
            regions_exited: AtomicU64::new(0),
            regions_bailed: AtomicU64::new(0),
            regions_stuck: AtomicU64::new(0),
            region_bytes_reclaimed: AtomicU64::new(0),
            region_bytes_stuck: AtomicU64::new(0),
            stuck_not_in_nursery: AtomicU64::new(0),
            stuck_different_buffer: AtomicU64::new(0),
            stuck_lower_address: AtomicU64::new(0),
            stuck_enclosing_frame: AtomicU64::new(0),
            detailed,
        }
    }

    /// Whether the detailed counters are being recorded.
    #[inline]
    pub fn detailed(&self) -> bool {
        self.detailed
    }

    /// Record a small-object allocation.
    #[inline]
    pub fn record_allocation(&self, bytes: usize) {
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a large-object allocation.
    #[inline]
    pub fn record_large_allocation(&self, bytes: usize) {
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated_large
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a degraded-mode allocation.
    #[inline]
    pub fn record_degraded(&self, bytes: usize) {
        self.objects_allocated_degraded.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated_degraded
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a buffer handed to a thread.
    #[inline]
    pub fn record_buffer_issued(&self) {
        self.buffers_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retired buffer tail.
    #[inline]
    pub fn record_buffer_waste(&self, bytes: usize) {
        self.buffer_bytes_wasted
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a region checkpoint push.
    #[inline]
    pub fn record_region_enter(&self) {
        self.regions_entered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a region checkpoint pop.
    #[inline]
    pub fn record_region_exit(&self) {
        self.regions_exited.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an abandoned region stack.
    #[inline]
    pub fn record_region_bail(&self) {
        self.regions_bailed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes reclaimed by a region rewind.
    #[inline]
    pub fn record_region_reclaimed(&self, bytes: usize) {
        self.region_bytes_reclaimed
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record bytes held down by a pin boundary.
    #[inline]
    pub fn record_region_bytes_stuck(&self, bytes: usize) {
        if self.detailed {
            self.region_bytes_stuck
                .fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    /// Record an escape event and its primary reason.
    pub fn record_stuck(&self, reason: StickReason) {
        self.regions_stuck.fetch_add(1, Ordering::Relaxed);
        if !self.detailed {
            return;
        }
        let counter = match reason {
            StickReason::NotInNursery => &self.stuck_not_in_nursery,
            StickReason::DifferentBuffer => &self.stuck_different_buffer,
            StickReason::LowerAddress => &self.stuck_lower_address,
            StickReason::EnclosingFrame => &self.stuck_enclosing_frame,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.objects_allocated.store(0, Ordering::Relaxed);
        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.bytes_allocated_large.store(0, Ordering::Relaxed);
        self.bytes_allocated_degraded.store(0, Ordering::Relaxed);
        self.objects_allocated_degraded.store(0, Ordering::Relaxed);
        self.buffers_issued.store(0, Ordering::Relaxed);
        self.buffer_bytes_wasted.store(0, Ordering::Relaxed);
        self.regions_entered.store(0, Ordering::Relaxed);
        self.regions_exited.store(0, Ordering::Relaxed);
        self.regions_bailed.store(0, Ordering::Relaxed);
        self.regions_stuck.store(0, Ordering::Relaxed);
        self.region_bytes_reclaimed.store(0, Ordering::Relaxed);
        self.region_bytes_stuck.store(0, Ordering::Relaxed);
        self.stuck_not_in_nursery.store(0, Ordering::Relaxed);
        self.stuck_different_buffer.store(0, Ordering::Relaxed);
        self.stuck_lower_address.store(0, Ordering::Relaxed);
        self.stuck_enclosing_frame.store(0, Ordering::Relaxed);
    }

    /// Print a summary of allocator statistics.
    pub fn print_summary(&self) {
        eprintln!("=== Allocator Statistics ===");
        eprintln!(
            "Allocations: {} objects, {} small, {} large",
            self.objects_allocated.load(Ordering::Relaxed),
            format_bytes(self.bytes_allocated.load(Ordering::Relaxed)),
            format_bytes(self.bytes_allocated_large.load(Ordering::Relaxed))
        );
        eprintln!(
            "Degraded: {} objects, {}",
            self.objects_allocated_degraded.load(Ordering::Relaxed),
            format_bytes(self.bytes_allocated_degraded.load(Ordering::Relaxed))
        );
        eprintln!(
            "Buffers: {} issued, {} wasted",
            self.buffers_issued.load(Ordering::Relaxed),
            format_bytes(self.buffer_bytes_wasted.load(Ordering::Relaxed))
        );
        eprintln!(
            "Regions: {} entered, {} exited, {} bailed, {} stuck",
            self.regions_entered.load(Ordering::Relaxed),
            self.regions_exited.load(Ordering::Relaxed),
            self.regions_bailed.load(Ordering::Relaxed),
            self.regions_stuck.load(Ordering::Relaxed)
        );
        eprintln!(
            "Region bytes: {} reclaimed, {} stuck",
            format_bytes(self.region_bytes_reclaimed.load(Ordering::Relaxed)),
            format_bytes(self.region_bytes_stuck.load(Ordering::Relaxed))
        );
        if self.detailed {
            eprintln!(
                "Escapes: {} not-in-nursery, {} different-buffer, {} lower-address, {} enclosing-frame",
                self.stuck_not_in_nursery.load(Ordering::Relaxed),
                self.stuck_different_buffer.load(Ordering::Relaxed),
                self.stuck_lower_address.load(Ordering::Relaxed),
                self.stuck_enclosing_frame.load(Ordering::Relaxed)
            );
        }
    }
}

impl Default for AllocStats {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Format bytes in human-readable form.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_recording() {
        let stats = AllocStats::new(false);

        stats.record_allocation(1024);
        stats.record_allocation(2048);
        stats.record_large_allocation(16384);

        assert_eq!(stats.objects_allocated.load(Ordering::Relaxed), 3);
        assert_eq!(stats.bytes_allocated.load(Ordering::Relaxed), 3072);
        assert_eq!(stats.bytes_allocated_large.load(Ordering::Relaxed), 16384);
    }

    #[test]
    fn test_per_reason_counters_honor_toggle() {
        let stats = AllocStats::new(false);
        stats.record_stuck(StickReason::LowerAddress);
        assert_eq!(stats.regions_stuck.load(Ordering::Relaxed), 1);
        assert_eq!(stats.stuck_lower_address.load(Ordering::Relaxed), 0);

        let detailed = AllocStats::new(true);
        detailed.record_stuck(StickReason::LowerAddress);
        detailed.record_stuck(StickReason::NotInNursery);
        assert_eq!(detailed.regions_stuck.load(Ordering::Relaxed), 2);
        assert_eq!(detailed.stuck_lower_address.load(Ordering::Relaxed), 1);
        assert_eq!(detailed.stuck_not_in_nursery.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stuck_bytes_honor_toggle() {
        let stats = AllocStats::new(false);
        stats.record_region_bytes_stuck(100);
        assert_eq!(stats.region_bytes_stuck.load(Ordering::Relaxed), 0);

        let detailed = AllocStats::new(true);
        detailed.record_region_bytes_stuck(100);
        assert_eq!(detailed.region_bytes_stuck.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_reset() {
        let stats = AllocStats::new(true);
        stats.record_allocation(64);
        stats.record_stuck(StickReason::EnclosingFrame);
        stats.reset();
        assert_eq!(stats.objects_allocated.load(Ordering::Relaxed), 0);
        assert_eq!(stats.stuck_enclosing_frame.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }
}
