//! Allocator configuration parameters.
//!
//! All sizes and thresholds are tunable for different workloads.
//! Default values match the behavior of a typical managed runtime.

/// When nursery memory is zeroed.
///
/// Objects must be handed to the mutator with a clean descriptor slot,
/// so the memory backing an allocation has to be zeroed at some point
/// between the collection that reclaimed it and the moment the pointer
/// is returned. The policy decides where that cost is paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearPolicy {
    /// Zero each buffer when it is handed to a thread.
    AtBufferCreation,
    /// Same as [`ClearPolicy::AtBufferCreation`], kept as a distinct
    /// setting so debugging runs can be told apart in diagnostics.
    AtBufferCreationDebug,
    /// Zero the whole nursery during the collection pause. Allocation
    /// then only has to clean the descriptor slot of each object.
    AtCollection,
}

/// Configuration for the allocator.
///
/// # Example
///
/// ```ignore
/// use loam::GcConfig;
///
/// // Small buffers and aggressive sampling for a debugging session
/// let config = GcConfig {
///     tlab_size: 1024,
///     collect_every: 64,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    // =========================================================================
    // Nursery (Young Generation)
    // =========================================================================
    /// Size of the nursery in bytes.
    ///
    /// Every small allocation is served from this region until a
    /// collection empties it. Larger nurseries mean fewer minor
    /// pauses but longer ones.
    ///
    /// Default: 4MB
    pub nursery_size: usize,

    /// Size of each thread-local allocation buffer in bytes.
    ///
    /// Threads carve buffers of this size out of the nursery and bump
    /// inside them without synchronization.
    ///
    /// Default: 4KB
    pub tlab_size: usize,

    /// Largest allocation that is considered "small".
    ///
    /// Requests above this go to the large object space and never
    /// touch the nursery.
    ///
    /// Default: 8000 bytes
    pub small_object_threshold: usize,

    /// Largest buffer tail that may be thrown away on refill.
    ///
    /// When a buffer cannot satisfy a request and this many bytes or
    /// fewer remain, the tail is retired and a fresh buffer is taken.
    /// A larger tail is kept and the request bypasses the buffer.
    ///
    /// Default: 512 bytes
    pub max_buffer_waste: usize,

    /// Spacing of object scan-start hints inside the nursery.
    ///
    /// Roughly one object start address is recorded per this many
    /// bytes so conservative scans can resynchronize quickly.
    ///
    /// Default: 8KB
    pub scan_start_increment: usize,

    /// When nursery memory is zeroed.
    ///
    /// Default: [`ClearPolicy::AtBufferCreation`]
    pub clear_policy: ClearPolicy,

    // =========================================================================
    // Old Generation
    // =========================================================================
    /// Capacity of the old generation arena in bytes.
    ///
    /// Degraded and pinned allocations are served from here. Once the
    /// arena is exhausted, allocation reports out-of-memory.
    ///
    /// Default: 16MB
    pub old_size: usize,

    /// Size of memory blocks carved from the old generation arena.
    ///
    /// Default: 16KB
    pub block_size: usize,

    /// Old generation usage ratio that asks for a major collection.
    ///
    /// Default: 0.75
    pub major_threshold: f64,

    // =========================================================================
    // Card Table
    // =========================================================================
    /// Card granularity for the write barrier.
    ///
    /// Each card covers this many bytes of heap. Smaller cards give
    /// more precise tracking but use more memory.
    ///
    /// Default: 512 bytes
    pub card_size: usize,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Force a nursery collection every N allocations.
    ///
    /// Set to 0 to disable. Used to shake out collector bugs by
    /// collecting far more often than pressure would dictate.
    ///
    /// Default: 0 (disabled)
    pub collect_every: u64,

    /// Verify the whole heap every N allocations.
    ///
    /// Set to 0 to disable. Expensive; the verification itself is
    /// supplied by the collection delegate.
    ///
    /// Default: 0 (disabled)
    pub verify_every: u64,

    /// Keep the per-reason escape counters.
    ///
    /// The basic counters are always maintained; the detailed
    /// breakdown of why objects were stuck is only recorded when this
    /// is set.
    ///
    /// Default: false
    pub detailed_stats: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            // Nursery
            nursery_size: 4 * 1024 * 1024, // 4MB
            tlab_size: 4 * 1024,           // 4KB
            small_object_threshold: 8000,
            max_buffer_waste: 512,
            scan_start_increment: 8 * 1024, // 8KB
            clear_policy: ClearPolicy::AtBufferCreation,

            // Old generation
            old_size: 16 * 1024 * 1024, // 16MB
            block_size: 16 * 1024,      // 16KB
            major_threshold: 0.75,

            // Cards
            card_size: 512,

            // Debugging
            collect_every: 0,
            verify_every: 0,
            detailed_stats: false,
        }
    }
}

impl GcConfig {
    /// Create a configuration optimized for low memory usage.
    pub fn low_memory() -> Self {
        Self {
            nursery_size: 1024 * 1024,     // 1MB
            tlab_size: 2 * 1024,           // 2KB
            old_size: 4 * 1024 * 1024,     // 4MB
            small_object_threshold: 4000,
            ..Default::default()
        }
    }

    /// Create a configuration optimized for high throughput.
    pub fn high_throughput() -> Self {
        Self {
            nursery_size: 16 * 1024 * 1024, // 16MB
            tlab_size: 16 * 1024,           // 16KB
            old_size: 64 * 1024 * 1024,     // 64MB
            major_threshold: 0.85,
            ..Default::default()
        }
    }

    /// Create a configuration for stress-testing a collector.
    ///
    /// Tiny buffers, frequent forced collections, and full statistics.
    pub fn stress() -> Self {
        Self {
            nursery_size: 256 * 1024, // 256KB
            tlab_size: 1024,
            clear_policy: ClearPolicy::AtBufferCreationDebug,
            collect_every: 64,
            detailed_stats: true,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nursery_size < 64 * 1024 {
            return Err(ConfigError::NurseryTooSmall);
        }
        if self.tlab_size < 256 || self.tlab_size > self.nursery_size {
            return Err(ConfigError::InvalidBufferSize);
        }
        if self.small_object_threshold == 0 || self.small_object_threshold > self.nursery_size {
            return Err(ConfigError::InvalidSmallObjectThreshold);
        }
        if self.scan_start_increment == 0 {
            return Err(ConfigError::InvalidScanStartIncrement);
        }
        if self.block_size < 4096 {
            return Err(ConfigError::BlockTooSmall);
        }
        if self.old_size < self.block_size {
            return Err(ConfigError::OldSpaceTooSmall);
        }
        if self.card_size < 64 || !self.card_size.is_power_of_two() {
            return Err(ConfigError::InvalidCardSize);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Nursery size is too small (minimum 64KB).
    NurseryTooSmall,
    /// Buffer size must be at least 256 bytes and fit in the nursery.
    InvalidBufferSize,
    /// Small object threshold must be nonzero and fit in the nursery.
    InvalidSmallObjectThreshold,
    /// Scan start increment must be nonzero.
    InvalidScanStartIncrement,
    /// Block size is too small (minimum 4KB).
    BlockTooSmall,
    /// Old generation must hold at least one block.
    OldSpaceTooSmall,
    /// Card size must be a power of two, minimum 64.
    InvalidCardSize,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NurseryTooSmall => write!(f, "nursery size must be at least 64KB"),
            ConfigError::InvalidBufferSize => {
                write!(f, "buffer size must be at least 256 bytes and fit in the nursery")
            }
            ConfigError::InvalidSmallObjectThreshold => {
                write!(f, "small object threshold must be nonzero and fit in the nursery")
            }
            ConfigError::InvalidScanStartIncrement => {
                write!(f, "scan start increment must be nonzero")
            }
            ConfigError::BlockTooSmall => write!(f, "block size must be at least 4KB"),
            ConfigError::OldSpaceTooSmall => {
                write!(f, "old generation must hold at least one block")
            }
            ConfigError::InvalidCardSize => {
                write!(f, "card size must be a power of two, minimum 64")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(GcConfig::low_memory().validate().is_ok());
        assert!(GcConfig::high_throughput().validate().is_ok());
        assert!(GcConfig::stress().validate().is_ok());
    }

    #[test]
    fn test_invalid_nursery_size() {
        let config = GcConfig {
            nursery_size: 1024,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NurseryTooSmall));
    }

    #[test]
    fn test_invalid_buffer_size() {
        let config = GcConfig {
            tlab_size: 64,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidBufferSize));

        let config = GcConfig {
            nursery_size: 64 * 1024,
            tlab_size: 128 * 1024,
            small_object_threshold: 4000,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidBufferSize));
    }

    #[test]
    fn test_invalid_card_size() {
        let config = GcConfig {
            card_size: 100, // Not power of two
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidCardSize));
    }

    #[test]
    fn test_invalid_scan_start_increment() {
        let config = GcConfig {
            scan_start_increment: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidScanStartIncrement));
    }
}
