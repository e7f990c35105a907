use crate::{arena::Arena, block::Block, kernel::ArenaSource};

/// Link to another free block, or the end of the list.
pub(crate) type Link = Option<Block>;

/// Offset of the `next` link inside a free block's payload.
const NEXT: usize = 0;
/// Offset of the `prev` link inside a free block's payload.
const PREV: usize = 4;

/// Free list links live in the payload of the free block itself, since that
/// part of a free block is not used by anyone:
///
/// ```text
/// +------------------------+ <-- offset - 4
/// |        header          |
/// +------------------------+ <-- offset
/// |   next (u32 offset)    |
/// +------------------------+
/// |   prev (u32 offset)    |
/// +------------------------+
/// |     unused payload     |
/// |          ...           |
/// +------------------------+
/// |        footer          |
/// +------------------------+
/// ```
///
/// Links are stored as payload offsets from the arena base rather than
/// addresses: two of them fit in the 8 bytes a minimum block has room for,
/// and they stay valid if the arena's backing memory moves. `0` never is a
/// payload offset, so it encodes "no block".
pub(crate) struct FreeNode;

impl FreeNode {
    #[inline]
    fn read<S: ArenaSource>(arena: &Arena<S>, at: usize) -> Link {
        match arena.word(at) {
            0 => None,
            offset => Some(Block(offset)),
        }
    }

    #[inline]
    fn write<S: ArenaSource>(arena: &mut Arena<S>, at: usize, link: Link) {
        arena.set_word(at, link.map_or(0, |block| block.0));
    }

    #[inline]
    pub fn next<S: ArenaSource>(arena: &Arena<S>, block: Block) -> Link {
        Self::read(arena, block.offset() + NEXT)
    }

    #[inline]
    pub fn prev<S: ArenaSource>(arena: &Arena<S>, block: Block) -> Link {
        Self::read(arena, block.offset() + PREV)
    }

    #[inline]
    pub fn set_next<S: ArenaSource>(arena: &mut Arena<S>, block: Block, next: Link) {
        Self::write(arena, block.offset() + NEXT, next);
    }

    #[inline]
    pub fn set_prev<S: ArenaSource>(arena: &mut Arena<S>, block: Block, prev: Link) {
        Self::write(arena, block.offset() + PREV, prev);
    }
}

/// Walks a free list from `current` following `next` links.
pub(crate) struct Iter<'a, S> {
    arena: &'a Arena<S>,
    current: Link,
}

impl<'a, S: ArenaSource> Iter<'a, S> {
    pub fn new(arena: &'a Arena<S>, first: Link) -> Self {
        Self {
            arena,
            current: first,
        }
    }
}

impl<S: ArenaSource> Iterator for Iter<'_, S> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;
        self.current = FreeNode::next(self.arena, block);

        Some(block)
    }
}
