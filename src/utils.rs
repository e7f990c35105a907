//! This file contains all the helper functions for the allocator.
//! These are functions that don't particularly belong to any concrete module of the program.

/// Alignment quantum of every block size and payload offset.
pub const ALIGNMENT: usize = 8;

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// This is used to round block sizes up to [`ALIGNMENT`] and reserved
/// arena sizes up to the computer's page size.
pub fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Like [`align`] but returns `None` instead of wrapping around.
pub fn checked_align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    to_be_aligned
        .checked_add(aligment - 1)
        .map(|value| value & !(aligment - 1))
}
