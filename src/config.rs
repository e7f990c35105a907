//! Heap tuning parameters.

use crate::{error::ConfigError, utils::ALIGNMENT};

/// Tunable constants of a [`crate::SegHeap`].
///
/// The defaults suit small, mixed-size workloads.
/// Every value is checked by [`HeapConfig::validate`] before the heap
/// touches its arena, and is immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Smallest block the allocator will create, tags included.
    ///
    /// Must be a multiple of 8 and at least 16 so that a free block can
    /// hold its header, footer and both list links.
    pub min_block_size: usize,

    /// Minimum number of bytes requested from the arena source per extension.
    pub growth_quantum: usize,

    /// Number of size-class buckets. The last one is unbounded above.
    pub bucket_count: usize,

    /// `log2` of the first class boundary. With the default of 5 the
    /// classes split at 32, 64, 128, ...
    pub class_shift: u32,

    /// Upper bound on the arena size in bytes.
    pub max_arena_bytes: usize,
}

impl HeapConfig {
    /// Header, footer and two 4-byte list links.
    pub const DEFAULT_MIN_BLOCK_SIZE: usize = 16;

    /// 64 blocks of 8 bytes.
    pub const DEFAULT_GROWTH_QUANTUM: usize = 64 * ALIGNMENT;

    /// Default number of size classes.
    pub const DEFAULT_BUCKET_COUNT: usize = 12;

    /// First class boundary at 32 bytes.
    pub const DEFAULT_CLASS_SHIFT: u32 = 5;

    /// 64 MiB.
    pub const DEFAULT_MAX_ARENA_BYTES: usize = 64 * 1024 * 1024;

    /// Largest arena addressable with 32-bit tags and links.
    pub const ARENA_LIMIT: usize = (u32::MAX as usize) & !(ALIGNMENT - 1);

    /// Create a config with every parameter at its default.
    pub const fn new() -> Self {
        Self {
            min_block_size: Self::DEFAULT_MIN_BLOCK_SIZE,
            growth_quantum: Self::DEFAULT_GROWTH_QUANTUM,
            bucket_count: Self::DEFAULT_BUCKET_COUNT,
            class_shift: Self::DEFAULT_CLASS_SHIFT,
            max_arena_bytes: Self::DEFAULT_MAX_ARENA_BYTES,
        }
    }

    /// Set [`HeapConfig::min_block_size`].
    pub fn with_min_block_size(mut self, bytes: usize) -> Self {
        self.min_block_size = bytes;
        self
    }

    /// Set [`HeapConfig::growth_quantum`].
    pub fn with_growth_quantum(mut self, bytes: usize) -> Self {
        self.growth_quantum = bytes;
        self
    }

    /// Set [`HeapConfig::bucket_count`].
    pub fn with_bucket_count(mut self, count: usize) -> Self {
        self.bucket_count = count;
        self
    }

    /// Set [`HeapConfig::class_shift`].
    pub fn with_class_shift(mut self, shift: u32) -> Self {
        self.class_shift = shift;
        self
    }

    /// Set [`HeapConfig::max_arena_bytes`].
    pub fn with_max_arena_bytes(mut self, bytes: usize) -> Self {
        self.max_arena_bytes = bytes;
        self
    }

    /// Check every parameter, reporting the first rule that is violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_block_size < Self::DEFAULT_MIN_BLOCK_SIZE
            || self.min_block_size % ALIGNMENT != 0
        {
            return Err(ConfigError::MinBlockSize(self.min_block_size));
        }
        // The initial extension must fit the prologue, one minimum block and the epilogue.
        if self.growth_quantum % ALIGNMENT != 0
            || self.growth_quantum < self.min_block_size + ALIGNMENT
        {
            return Err(ConfigError::GrowthQuantum {
                quantum: self.growth_quantum,
                min_block_size: self.min_block_size,
            });
        }
        if self.bucket_count == 0 || self.bucket_count > 32 {
            return Err(ConfigError::BucketCount(self.bucket_count));
        }
        if self.class_shift >= 31 {
            return Err(ConfigError::ClassShift(self.class_shift));
        }
        if self.max_arena_bytes < self.growth_quantum || self.max_arena_bytes > Self::ARENA_LIMIT {
            return Err(ConfigError::MaxArenaBytes {
                bytes: self.max_arena_bytes,
                limit: Self::ARENA_LIMIT,
            });
        }

        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HeapConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.growth_quantum, 512);
        assert_eq!(config.bucket_count, 12);
    }

    #[test]
    fn rejects_small_or_misaligned_min_block() {
        let config = HeapConfig::new().with_min_block_size(8);
        assert_eq!(config.validate(), Err(ConfigError::MinBlockSize(8)));

        let config = HeapConfig::new().with_min_block_size(20);
        assert_eq!(config.validate(), Err(ConfigError::MinBlockSize(20)));
    }

    #[test]
    fn rejects_quantum_smaller_than_first_block() {
        let config = HeapConfig::new().with_growth_quantum(16);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::GrowthQuantum { quantum: 16, .. })
        ));
    }

    #[test]
    fn rejects_bucket_count_and_shift_out_of_range() {
        assert_eq!(
            HeapConfig::new().with_bucket_count(0).validate(),
            Err(ConfigError::BucketCount(0))
        );
        assert_eq!(
            HeapConfig::new().with_class_shift(40).validate(),
            Err(ConfigError::ClassShift(40))
        );
    }

    #[test]
    fn rejects_arena_limit_beyond_tag_range() {
        let config = HeapConfig::new().with_max_arena_bytes(usize::MAX);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MaxArenaBytes { .. })
        ));
    }
}
