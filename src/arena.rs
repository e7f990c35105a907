use tracing::debug;

use crate::{
    block::{Block, TAG_SIZE, Tag},
    kernel::ArenaSource,
    utils::{ALIGNMENT, align},
};

/// Offset of the prologue tag.
pub(crate) const PROLOGUE: usize = 0;

/// Payload offset of the first real block. Its header sits right after
/// the prologue word.
pub(crate) const FIRST_PAYLOAD: u32 = 8;

/// An in-memory arena source backed by a `Vec<u8>` with a hard size limit.
///
/// The vector may reallocate as it grows. That is fine since the heap only
/// stores offsets, but it means [`ArenaSource::bounds`] can change between
/// extensions. Use [`crate::MmapSource`] when the arena must stay put.
#[derive(Clone, Debug, Default)]
pub struct VecSource {
    bytes: Vec<u8>,
    limit: usize,
}

impl VecSource {
    /// An empty source that refuses to grow beyond `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
        }
    }

    /// The maximum size this source will grow to.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl ArenaSource for VecSource {
    fn reset(&mut self) {
        self.bytes.clear();
    }

    fn extend(&mut self, bytes: usize) -> Option<usize> {
        let old_len = self.bytes.len();
        let new_len = old_len.checked_add(bytes)?;
        if new_len > self.limit {
            return None;
        }

        self.bytes.resize(new_len, 0);
        Some(old_len)
    }

    fn bounds(&self) -> (usize, usize) {
        let low = self.bytes.as_ptr() as usize;
        (low, low + self.bytes.len())
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// The arena manager: one contiguous byte region that only grows.
///
/// ```text
///  0        4        8                                          len - 4    len
///  +--------+--------+--------------- ... ----------------------+---------+
///  |prologue| header |  blocks ...                              |epilogue |
///  |  0|1   |        |                                          |   0|1   |
///  +--------+--------+--------------- ... ----------------------+---------+
/// ```
///
/// The prologue and epilogue are zero-size allocated tags that stop
/// physical traversal at both ends. Extending the arena turns the old
/// epilogue into the header of a new free block and writes a new epilogue
/// at the new end.
pub(crate) struct Arena<S> {
    source: S,
    /// Minimum extension in bytes.
    growth_quantum: usize,
    /// The arena never grows beyond this many bytes.
    limit: usize,
    /// Successful extensions since the last `init`.
    extensions: usize,
}

impl<S: ArenaSource> Arena<S> {
    pub fn new(source: S, growth_quantum: usize, limit: usize) -> Self {
        Self {
            source,
            growth_quantum,
            limit,
            extensions: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.source.len()
    }

    #[inline]
    pub fn extensions(&self) -> usize {
        self.extensions
    }

    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.source.as_bytes()
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.source.as_bytes_mut()
    }

    /// Reads the 4-byte word at `offset`.
    #[inline]
    pub fn word(&self, offset: usize) -> u32 {
        let mut word = [0; TAG_SIZE];
        word.copy_from_slice(&self.bytes()[offset..offset + TAG_SIZE]);
        u32::from_ne_bytes(word)
    }

    #[inline]
    pub fn set_word(&mut self, offset: usize, value: u32) {
        self.bytes_mut()[offset..offset + TAG_SIZE].copy_from_slice(&value.to_ne_bytes());
    }

    /// Offset of the epilogue tag.
    #[inline]
    pub fn epilogue(&self) -> usize {
        self.len() - TAG_SIZE
    }

    /// Resets the source and lays out a fresh arena: prologue, one free
    /// block spanning the first extension, epilogue.
    ///
    /// Returns the free block, which is not yet on any free list.
    pub fn init(&mut self) -> Option<Block> {
        self.source.reset();
        self.extensions = 0;

        let quantum = align(self.growth_quantum, ALIGNMENT);
        if quantum > self.limit {
            return None;
        }
        self.source.extend(quantum)?;
        self.bytes_mut().fill(0);

        self.set_word(PROLOGUE, Tag::SENTINEL.raw());
        let block = Block(FIRST_PAYLOAD);
        block.write(self, (quantum - ALIGNMENT) as u32, false);
        let epilogue = self.epilogue();
        self.set_word(epilogue, Tag::SENTINEL.raw());

        debug!(arena_size = quantum, first_block = block.0, "arena initialised");

        Some(block)
    }

    /// Grows the arena by at least `min_bytes` (and at least the growth
    /// quantum) and turns the new space into one free block.
    ///
    /// Returns the new block, which is not on any free list, or `None` if
    /// the growth was refused. A refused growth leaves the arena untouched
    /// and is never retried.
    pub fn extend(&mut self, min_bytes: usize) -> Option<Block> {
        let bytes = align(min_bytes.max(self.growth_quantum), ALIGNMENT);
        if self.len().checked_add(bytes)? > self.limit {
            debug!(bytes, arena_size = self.len(), limit = self.limit, "arena limit reached");
            return None;
        }

        let Some(old_end) = self.source.extend(bytes) else {
            debug!(bytes, arena_size = self.len(), "arena source refused to grow");
            return None;
        };
        self.bytes_mut()[old_end..].fill(0);
        self.extensions += 1;

        // The old epilogue word becomes the header of the new block.
        let block = Block(old_end as u32);
        block.write(self, bytes as u32, false);
        let epilogue = self.epilogue();
        self.set_word(epilogue, Tag::SENTINEL.raw());

        debug!(bytes, block = block.0, arena_size = self.len(), "arena extended");

        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_lays_out_sentinels_and_one_free_block() {
        let mut arena = Arena::new(VecSource::with_limit(4096), 512, 4096);
        let block = arena.init().unwrap();

        assert_eq!(arena.len(), 512);
        assert_eq!(block, Block(FIRST_PAYLOAD));
        assert_eq!(block.size(&arena), 504);
        assert!(!block.is_allocated(&arena));
        assert_eq!(arena.word(PROLOGUE), Tag::SENTINEL.raw());
        assert_eq!(arena.word(arena.epilogue()), Tag::SENTINEL.raw());
        assert_eq!(block.next(&arena).header_offset(), arena.epilogue());
    }

    #[test]
    fn extend_reuses_the_old_epilogue() {
        let mut arena = Arena::new(VecSource::with_limit(8192), 512, 8192);
        arena.init().unwrap();
        let old_epilogue = arena.epilogue();

        let block = arena.extend(1000).unwrap();
        assert_eq!(block.header_offset(), old_epilogue);
        assert_eq!(block.size(&arena), 1000);
        assert_eq!(arena.len(), 1512);
        assert_eq!(arena.word(arena.epilogue()), Tag::SENTINEL.raw());
        assert_eq!(arena.extensions(), 1);
    }

    #[test]
    fn extend_rounds_up_to_the_quantum() {
        let mut arena = Arena::new(VecSource::with_limit(8192), 512, 8192);
        arena.init().unwrap();

        let block = arena.extend(24).unwrap();
        assert_eq!(block.size(&arena), 512);

        let block = arena.extend(1001).unwrap();
        assert_eq!(block.size(&arena), 1008);
    }

    #[test]
    fn refused_extension_leaves_arena_unchanged() {
        let mut arena = Arena::new(VecSource::with_limit(1024), 512, 1024);
        arena.init().unwrap();
        let before = arena.bytes().to_vec();

        assert!(arena.extend(4096).is_none());
        assert_eq!(arena.bytes(), &before[..]);
        assert_eq!(arena.extensions(), 0);
    }

    #[test]
    fn init_fails_when_the_source_is_too_small() {
        let mut arena = Arena::new(VecSource::with_limit(256), 512, 4096);
        assert!(arena.init().is_none());
    }
}
