use std::{fmt, num::NonZeroU32};

use crate::{arena::Arena, kernel::ArenaSource};

/// Size of a header or footer word in bytes.
pub(crate) const TAG_SIZE: usize = 4;

/// Bytes of every block taken by its header and footer.
pub(crate) const TAGS_OVERHEAD: usize = 2 * TAG_SIZE;

/// A boundary tag: block size and allocation bit packed in one word.
///
/// Sizes are multiples of 8, which leaves the low three bits free. Bit 0
/// is the allocation flag.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(u32);

impl Tag {
    /// Zero-size allocated tag of the prologue and epilogue.
    pub const SENTINEL: Tag = Tag::new(0, true);

    const ALLOCATED: u32 = 0x1;
    const SIZE_MASK: u32 = !0x7;

    #[inline]
    pub const fn new(size: u32, allocated: bool) -> Self {
        Self(size | allocated as u32)
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn size(self) -> u32 {
        self.0 & Self::SIZE_MASK
    }

    #[inline]
    pub const fn is_allocated(self) -> bool {
        self.0 & Self::ALLOCATED != 0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

/// A block, identified by the offset of its payload from the arena base.
///
/// Every block, free or allocated, is wrapped by two identical tags so
/// that both physical neighbours can be found in O(1):
///
/// ```text
///            offset - 4   offset                      offset + size - 8
///                 |         |                                 |
///  ... +----------+---------+------------ ... ----------------+----------+ ...
///      | footer of| header  |  payload (size - 8 bytes)       |  footer  | header of
///      | previous | size|a  |                                 |  size|a  | next block
///  ... +----------+---------+------------ ... ----------------+----------+ ...
///                 <-------------------------- size ---------------------->
/// ```
///
/// Payload offsets are always multiples of 8. A free block reuses the first
/// 8 bytes of its payload for its free-list links, see [`crate::list`].
///
/// All the accessors go through the arena; nothing here caches tag values,
/// so a `Block` is just a typed offset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Block(pub u32);

impl Block {
    #[inline]
    pub fn offset(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn header_offset(self) -> usize {
        self.offset() - TAG_SIZE
    }

    #[inline]
    pub fn header<S: ArenaSource>(self, arena: &Arena<S>) -> Tag {
        Tag::from_raw(arena.word(self.header_offset()))
    }

    /// Footer of the block, located through the size in its header.
    #[inline]
    pub fn footer<S: ArenaSource>(self, arena: &Arena<S>) -> Tag {
        let size = self.header(arena).size() as usize;
        Tag::from_raw(arena.word(self.offset() + size - TAGS_OVERHEAD))
    }

    #[inline]
    pub fn size<S: ArenaSource>(self, arena: &Arena<S>) -> u32 {
        self.header(arena).size()
    }

    #[inline]
    pub fn is_allocated<S: ArenaSource>(self, arena: &Arena<S>) -> bool {
        self.header(arena).is_allocated()
    }

    /// Writes matching header and footer. This is the only place tags of a
    /// real block are written, which keeps both ends in agreement.
    #[inline]
    pub fn write<S: ArenaSource>(self, arena: &mut Arena<S>, size: u32, allocated: bool) {
        debug_assert!(size % 8 == 0 && size >= 16, "bad block size {size}");
        let tag = Tag::new(size, allocated).raw();
        arena.set_word(self.header_offset(), tag);
        arena.set_word(self.offset() + size as usize - TAGS_OVERHEAD, tag);
    }

    /// The block starting `bytes` after this one.
    #[inline]
    pub fn offset_by(self, bytes: u32) -> Block {
        Block(self.0 + bytes)
    }

    /// Next block in address order. This is the epilogue (a zero-size
    /// allocated tag) when `self` is the last block.
    #[inline]
    pub fn next<S: ArenaSource>(self, arena: &Arena<S>) -> Block {
        self.offset_by(self.size(arena))
    }

    /// Previous block in address order, read through its footer. `None`
    /// when the word before our header is the prologue.
    #[inline]
    pub fn prev<S: ArenaSource>(self, arena: &Arena<S>) -> Option<Block> {
        let footer = Tag::from_raw(arena.word(self.header_offset() - TAG_SIZE));
        match footer.size() {
            0 => None,
            size => Some(Block(self.0 - size)),
        }
    }

    /// Previous block, but only if it is free.
    #[inline]
    pub fn prev_free<S: ArenaSource>(self, arena: &Arena<S>) -> Option<Block> {
        self.prev(arena).filter(|prev| !prev.is_allocated(arena))
    }

    /// Next block, but only if it is free. The epilogue is allocated so it
    /// never qualifies.
    #[inline]
    pub fn next_free<S: ArenaSource>(self, arena: &Arena<S>) -> Option<Block> {
        Some(self.next(arena)).filter(|next| !next.is_allocated(arena))
    }
}

/// Handle to an allocation: the payload offset from the arena base.
///
/// Payload offsets are never zero, so `Option<Ptr>` is as small as a `u32`
/// and `None` plays the role of a null pointer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ptr(NonZeroU32);

impl Ptr {
    /// Build a handle from a raw payload offset. Returns `None` for `0` or
    /// offsets that don't fit a tag.
    pub fn from_offset(offset: usize) -> Option<Ptr> {
        u32::try_from(offset).ok().and_then(NonZeroU32::new).map(Ptr)
    }

    /// Offset of the payload from the arena base.
    #[inline]
    pub fn offset(self) -> usize {
        self.0.get() as usize
    }

    #[inline]
    pub(crate) fn block(self) -> Block {
        Block(self.0.get())
    }

    #[inline]
    pub(crate) fn from_block(block: Block) -> Ptr {
        Ptr(NonZeroU32::new(block.0).expect("block payloads never sit at offset 0"))
    }
}

impl fmt::Debug for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ptr(+{:#x})", self.0)
    }
}

impl fmt::Display for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}
