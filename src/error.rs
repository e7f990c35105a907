//! Error types for the heap.

use thiserror::Error;

/// Errors returned by the fallible heap operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The arena source refused to grow.
    #[error("out of memory: could not satisfy {requested} bytes (arena is {arena_size} bytes)")]
    OutOfMemory {
        /// Block size that was being searched for.
        requested: usize,
        /// Arena size at the time of the failure.
        arena_size: usize,
    },

    /// Size arithmetic overflowed the range a block tag can encode.
    #[error("requested size overflows the block size range")]
    Overflow,

    /// The pointer does not refer to a live allocation of this heap.
    #[error("{offset:#x} is not a live allocation")]
    InvalidPointer {
        /// Payload offset that was passed in.
        offset: usize,
    },

    /// The heap configuration was rejected.
    #[error("invalid heap configuration: {0}")]
    Config(#[from] ConfigError),
}

/// A [`crate::HeapConfig`] rule that does not hold.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("minimum block size {0} must be a multiple of 8 and at least 16")]
    MinBlockSize(usize),

    #[error("growth quantum {quantum} must be a multiple of 8 and at least {min_block_size} + 8")]
    GrowthQuantum { quantum: usize, min_block_size: usize },

    #[error("bucket count {0} must be between 1 and 32")]
    BucketCount(usize),

    #[error("class shift {0} must be below 31")]
    ClassShift(u32),

    #[error("arena limit {bytes} must be at least the growth quantum and at most {limit}")]
    MaxArenaBytes { bytes: usize, limit: usize },
}

/// Corruption found by the heap consistency checker.
///
/// Offsets are payload offsets from the arena base.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Inconsistency {
    #[error("block {block}: header {header:#x} and footer {footer:#x} disagree")]
    TagMismatch { block: u32, header: u32, footer: u32 },

    #[error("block {block}: size {size} is not an 8-byte multiple of at least the minimum block size")]
    Misaligned { block: u32, size: u32 },

    #[error("{which} sentinel at offset {offset} holds {tag:#x}")]
    BadSentinel { which: &'static str, offset: usize, tag: u32 },

    #[error("block {block} runs past the arena end {arena_size}")]
    OutOfBounds { block: u32, arena_size: usize },

    #[error("adjacent blocks {first} and {second} are both free")]
    UncoalescedNeighbours { first: u32, second: u32 },

    #[error("block {block} of size {size} is in bucket {found}, expected bucket {expected}")]
    WrongBucket { block: u32, size: u32, found: usize, expected: usize },

    #[error("block {block} in bucket {bucket} is not marked free")]
    NotFree { block: u32, bucket: usize },

    #[error("block {block} in bucket {bucket} has a prev link that does not point back to its predecessor")]
    BrokenBackLink { block: u32, bucket: usize },

    #[error("bucket {bucket} holds block {block} of size {size} above its recorded maximum {max_seen}")]
    StaleMaximum { bucket: usize, block: u32, size: u32, max_seen: u32 },

    #[error("bucket {bucket} lists more free blocks than the heap holds ({physical}); the list is cyclic")]
    CyclicList { bucket: usize, physical: usize },

    #[error("heap walk found {physical} free blocks but the free lists hold {listed}")]
    CountMismatch { physical: usize, listed: usize },
}
