use std::ops::Range;

use tracing::{debug, trace};

use crate::{
    arena::{Arena, FIRST_PAYLOAD, VecSource},
    block::{Block, Ptr, TAG_SIZE, TAGS_OVERHEAD},
    config::HeapConfig,
    error::HeapError,
    freelist::FreeLists,
    kernel::ArenaSource,
    mmap::MmapSource,
    utils::{ALIGNMENT, checked_align},
};

/// A segregated-fit heap over one growable arena.
///
/// The heap owns its arena and all of its metadata; nothing is global, so
/// any number of independent heaps can coexist. Every operation takes
/// `&mut self`: the heap does no locking and callers that need to share it
/// across threads must serialise access themselves.
///
/// Allocations are identified by [`Ptr`] handles (payload offsets) and
/// their bytes are reached through [`SegHeap::payload`] and
/// [`SegHeap::payload_mut`].
pub struct SegHeap<S = VecSource> {
    pub(crate) arena: Arena<S>,
    pub(crate) lists: FreeLists,
    pub(crate) config: HeapConfig,
}

/// One block as seen by a physical walk of the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload handle of the block.
    pub ptr: Ptr,
    /// Block size, header and footer included.
    pub size: usize,
    pub allocated: bool,
}

/// Occupancy summary produced by [`SegHeap::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub arena_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    /// Successful arena extensions since the heap was (re)initialised.
    pub extensions: usize,
}

impl SegHeap<VecSource> {
    /// A heap over an in-memory arena limited to `config.max_arena_bytes`.
    pub fn in_memory(config: HeapConfig) -> Result<Self, HeapError> {
        let source = VecSource::with_limit(config.max_arena_bytes);
        Self::new(source, config)
    }
}

impl SegHeap<MmapSource> {
    /// A heap over a reserved range of virtual memory of
    /// `config.max_arena_bytes` bytes. The arena never moves.
    pub fn mapped(config: HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        let source = MmapSource::reserve(config.max_arena_bytes).ok_or(HeapError::OutOfMemory {
            requested: config.max_arena_bytes,
            arena_size: 0,
        })?;
        Self::new(source, config)
    }
}

impl<S: ArenaSource> SegHeap<S> {
    /// Validates `config` and initialises a heap over `source`.
    ///
    /// Fails if the configuration is invalid or the source refuses the
    /// initial extension.
    pub fn new(source: S, config: HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;

        let arena = Arena::new(source, config.growth_quantum, config.max_arena_bytes);
        let lists = FreeLists::new(config.bucket_count, config.class_shift);
        let mut heap = Self { arena, lists, config };
        heap.reset()?;

        Ok(heap)
    }

    /// Throws away every allocation and lays out a fresh arena.
    ///
    /// All outstanding [`Ptr`]s are invalidated. If the source refuses the
    /// initial extension the heap is left empty and every allocation fails.
    pub fn reset(&mut self) -> Result<(), HeapError> {
        self.lists.clear();

        let block = self.arena.init().ok_or(HeapError::OutOfMemory {
            requested: self.config.growth_quantum,
            arena_size: 0,
        })?;
        self.lists.add(&mut self.arena, block);
        self.debug_check("reset");

        Ok(())
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The arena source backing this heap.
    pub fn source(&self) -> &S {
        self.arena.source()
    }

    /// Current arena size in bytes.
    pub fn arena_size(&self) -> usize {
        self.arena.len()
    }

    /// Allocates at least `size` bytes, returning `None` when the arena
    /// cannot grow any further.
    ///
    /// The payload is 8-byte aligned relative to the arena base. A request
    /// for 0 bytes still gets a minimum block.
    pub fn allocate(&mut self, size: usize) -> Option<Ptr> {
        self.try_allocate(size).ok()
    }

    /// Like [`SegHeap::allocate`] but reports why the allocation failed.
    /// A failed allocation changes nothing.
    pub fn try_allocate(&mut self, size: usize) -> Result<Ptr, HeapError> {
        let needed = self.block_size_for(size)?;

        let block = match self.lists.find_fit(&self.arena, needed) {
            Some(block) => {
                self.place(block, needed, true);
                block
            }
            None => {
                let block = self.extend(needed)?;
                self.place(block, needed, false);
                block
            }
        };

        trace!(requested = size, block_size = needed, ptr = block.0, "allocate");
        self.debug_check("allocate");

        Ok(Ptr::from_block(block))
    }

    /// Allocates `count * size` bytes and zeroes them. Returns `None` if the
    /// product overflows or the allocation fails.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<Ptr> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.allocate(bytes)?;
        self.payload_mut(ptr).fill(0);

        Some(ptr)
    }

    /// Returns an allocation to the heap, merging it with free neighbours.
    ///
    /// `None`, pointers outside the arena and pointers that do not refer
    /// to a live allocation are ignored.
    pub fn free(&mut self, ptr: impl Into<Option<Ptr>>) {
        let Some(ptr) = ptr.into() else {
            return;
        };
        let Some(block) = self.allocated_block(ptr) else {
            debug!(ptr = ptr.offset(), "ignoring free of a pointer that is not a live allocation");
            return;
        };

        trace!(ptr = block.0, block_size = block.size(&self.arena), "free");
        self.release(block);
        self.debug_check("free");
    }

    /// Changes the size of an allocation, keeping its contents.
    ///
    /// - `size == 0` frees `ptr` and returns `None`.
    /// - `ptr == None` is [`SegHeap::allocate`].
    /// - Shrinking and growing into a free successor keep the same pointer.
    /// - Otherwise the contents move to a new allocation and the old one is
    ///   freed.
    ///
    /// If the move fails `None` is returned and the allocation,
    /// contents included, is left exactly as it was.
    pub fn resize(&mut self, ptr: Option<Ptr>, size: usize) -> Option<Ptr> {
        self.try_resize(ptr, size).ok().flatten()
    }

    /// Like [`SegHeap::resize`] but reports why the resize failed.
    pub fn try_resize(&mut self, ptr: Option<Ptr>, size: usize) -> Result<Option<Ptr>, HeapError> {
        if size == 0 {
            self.free(ptr);
            return Ok(None);
        }
        let Some(ptr) = ptr else {
            return self.try_allocate(size).map(Some);
        };

        let block = self
            .allocated_block(ptr)
            .ok_or(HeapError::InvalidPointer { offset: ptr.offset() })?;
        let needed = self.block_size_for(size)?;
        let current = block.size(&self.arena);

        if needed <= current {
            self.shrink(block, current, needed);
        } else if !self.grow_in_place(block, current, needed) {
            return self.relocate(block, current, size).map(Some);
        }

        trace!(ptr = block.0, from = current, to = needed, "resize in place");
        self.debug_check("resize");

        Ok(Some(ptr))
    }

    /// Usable bytes of an allocation, or `None` if `ptr` is not live.
    pub fn usable_size(&self, ptr: Ptr) -> Option<usize> {
        self.allocated_block(ptr)
            .map(|block| block.size(&self.arena) as usize - TAGS_OVERHEAD)
    }

    /// The payload of an allocation.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not a live allocation of this heap.
    pub fn payload(&self, ptr: Ptr) -> &[u8] {
        let range = self.payload_range(ptr);
        &self.arena.bytes()[range]
    }

    /// The payload of an allocation, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not a live allocation of this heap.
    pub fn payload_mut(&mut self, ptr: Ptr) -> &mut [u8] {
        let range = self.payload_range(ptr);
        &mut self.arena.bytes_mut()[range]
    }

    /// Every block in address order, prologue and epilogue excluded.
    pub fn blocks(&self) -> Blocks<'_, S> {
        Blocks {
            arena: &self.arena,
            current: Block(FIRST_PAYLOAD),
        }
    }

    /// Walks the heap and sums up what it finds. O(number of blocks).
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            arena_bytes: self.arena.len(),
            extensions: self.arena.extensions(),
            ..HeapStats::default()
        };

        for block in self.blocks() {
            if block.allocated {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += block.size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
            }
        }

        stats
    }

    /// Block size needed to serve `size` payload bytes.
    fn block_size_for(&self, size: usize) -> Result<u32, HeapError> {
        let needed = size
            .checked_add(TAGS_OVERHEAD)
            .and_then(|needed| checked_align(needed, ALIGNMENT))
            .ok_or(HeapError::Overflow)?
            .max(self.config.min_block_size);

        if needed > HeapConfig::ARENA_LIMIT {
            return Err(HeapError::Overflow);
        }

        Ok(needed as u32)
    }

    fn extend(&mut self, needed: u32) -> Result<Block, HeapError> {
        let out_of_memory = HeapError::OutOfMemory {
            requested: needed as usize,
            arena_size: self.arena.len(),
        };
        // A failed reset leaves no arena to extend.
        if self.arena.len() == 0 {
            return Err(out_of_memory);
        }

        self.arena.extend(needed as usize).ok_or(out_of_memory)
    }

    /// Allocates the first `needed` bytes of the free `block`, returning the
    /// rest to the free lists when it is big enough to be a block.
    ///
    /// `listed` tells whether `block` is on a free list (found by a search)
    /// or fresh from an arena extension.
    fn place(&mut self, block: Block, needed: u32, listed: bool) {
        let arena = &mut self.arena;
        let available = block.size(arena);
        let remainder = available - needed;

        if remainder as usize >= self.config.min_block_size {
            let rest = block.offset_by(needed);
            let relinked = listed && self.lists.same_class(available, remainder);

            if relinked {
                self.lists.move_link(arena, block, rest, remainder);
            } else if listed {
                self.lists.remove(arena, block);
            }
            block.write(arena, needed, true);
            rest.write(arena, remainder, false);
            if !relinked {
                self.lists.add(arena, rest);
            }
        } else {
            if listed {
                self.lists.remove(arena, block);
            }
            block.write(arena, available, true);
        }
    }

    /// Marks `block` free and merges it with whichever physical neighbours
    /// are free, so that no two free blocks are ever adjacent.
    ///
    /// A merged block that stays in the class of the neighbour it grew out of
    /// keeps that neighbour's list slot; otherwise it is reinserted.
    ///
    /// The block is tagged free before merging: its old header survives
    /// inside the merged block and must never read as allocated.
    fn release(&mut self, block: Block) {
        let arena = &mut self.arena;
        let size = block.size(arena);
        let prev = block.prev_free(arena);
        let next = block.next_free(arena);
        block.write(arena, size, false);

        match (prev, next) {
            (None, None) => {
                self.lists.add(arena, block);
            }
            (Some(prev), Some(next)) => {
                let prev_size = prev.size(arena);
                let next_size = next.size(arena);
                let merged = prev_size + size + next_size;

                if self.lists.same_class(prev_size, merged) {
                    self.lists.remove(arena, next);
                    prev.write(arena, merged, false);
                    self.lists.note_size(merged);
                } else if self.lists.same_class(next_size, merged) {
                    self.lists.remove(arena, prev);
                    self.lists.move_link(arena, next, prev, merged);
                    prev.write(arena, merged, false);
                } else {
                    self.lists.remove(arena, prev);
                    self.lists.remove(arena, next);
                    prev.write(arena, merged, false);
                    self.lists.add(arena, prev);
                }
            }
            (Some(prev), None) => {
                let prev_size = prev.size(arena);
                let merged = prev_size + size;

                if self.lists.same_class(prev_size, merged) {
                    prev.write(arena, merged, false);
                    self.lists.note_size(merged);
                } else {
                    self.lists.remove(arena, prev);
                    prev.write(arena, merged, false);
                    self.lists.add(arena, prev);
                }
            }
            (None, Some(next)) => {
                let next_size = next.size(arena);
                let merged = size + next_size;
                let relinked = self.lists.same_class(next_size, merged);

                if relinked {
                    self.lists.move_link(arena, next, block, merged);
                } else {
                    self.lists.remove(arena, next);
                }
                block.write(arena, merged, false);
                if !relinked {
                    self.lists.add(arena, block);
                }
            }
        }
    }

    /// Cuts an allocation down to `needed` bytes. The tail is released only
    /// if it can stand as a block of its own.
    fn shrink(&mut self, block: Block, current: u32, needed: u32) {
        let tail = current - needed;
        if (tail as usize) < self.config.min_block_size {
            return;
        }

        let rest = block.offset_by(needed);
        block.write(&mut self.arena, needed, true);
        rest.write(&mut self.arena, tail, true);
        self.release(rest);
    }

    /// Grows an allocation by absorbing its free successor, if that is
    /// enough. Returns whether it worked.
    fn grow_in_place(&mut self, block: Block, current: u32, needed: u32) -> bool {
        let arena = &mut self.arena;
        let Some(next) = block.next_free(arena) else {
            return false;
        };
        let next_size = next.size(arena);
        let combined = current + next_size;
        if combined < needed {
            return false;
        }

        let remainder = combined - needed;
        if remainder as usize >= self.config.min_block_size {
            let rest = block.offset_by(needed);
            let relinked = self.lists.same_class(next_size, remainder);

            if relinked {
                self.lists.move_link(arena, next, rest, remainder);
            } else {
                self.lists.remove(arena, next);
            }
            block.write(arena, needed, true);
            rest.write(arena, remainder, false);
            if !relinked {
                self.lists.add(arena, rest);
            }
        } else {
            self.lists.remove(arena, next);
            block.write(arena, combined, true);
        }

        true
    }

    /// Moves an allocation to a new block of `size` bytes. The old block is
    /// only touched once the new one exists.
    fn relocate(&mut self, block: Block, current: u32, size: usize) -> Result<Ptr, HeapError> {
        let new = self.try_allocate(size)?;

        let len = (current as usize - TAGS_OVERHEAD).min(size);
        let from = block.offset();
        self.arena.bytes_mut().copy_within(from..from + len, new.offset());
        self.release(block);

        trace!(from = block.0, to = new.offset(), copied = len, "resize by relocation");
        self.debug_check("resize");

        Ok(new)
    }

    /// The block behind `ptr` if it is a live allocation: inside the arena,
    /// aligned, tagged allocated, with a sane size and matching footer.
    pub(crate) fn allocated_block(&self, ptr: Ptr) -> Option<Block> {
        let offset = ptr.offset();
        let len = self.arena.len();
        if len == 0
            || offset < FIRST_PAYLOAD as usize
            || offset % ALIGNMENT != 0
            || offset + TAGS_OVERHEAD > self.arena.epilogue()
        {
            return None;
        }

        let block = ptr.block();
        let header = block.header(&self.arena);
        let size = header.size() as usize;
        let fits = size >= self.config.min_block_size
            && block.header_offset() + size <= self.arena.epilogue();

        (header.is_allocated() && fits && block.footer(&self.arena) == header).then_some(block)
    }

    fn payload_range(&self, ptr: Ptr) -> Range<usize> {
        match self.allocated_block(ptr) {
            Some(block) => {
                let start = block.offset();
                start..start + block.size(&self.arena) as usize - TAGS_OVERHEAD
            }
            None => panic!("{ptr:?} is not a live allocation"),
        }
    }

    #[inline]
    fn debug_check(&self, context: &str) {
        if cfg!(feature = "debug-checks") {
            self.check_heap(context);
        }
    }
}

/// Iterator over the blocks of a heap in address order. See [`SegHeap::blocks`].
pub struct Blocks<'a, S> {
    arena: &'a Arena<S>,
    current: Block,
}

impl<S: ArenaSource> Iterator for Blocks<'_, S> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.arena.len();
        if len < TAG_SIZE || self.current.header_offset() >= self.arena.epilogue() {
            return None;
        }

        let header = self.current.header(self.arena);
        let size = header.size() as usize;
        // Stop on anything that does not look like a block rather than run off the arena.
        if size == 0 || self.current.header_offset() + size > self.arena.epilogue() {
            return None;
        }

        let info = BlockInfo {
            ptr: Ptr::from_block(self.current),
            size,
            allocated: header.is_allocated(),
        };
        self.current = self.current.offset_by(header.size());

        Some(info)
    }
}
