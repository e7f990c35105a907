use crate::{
    arena::Arena,
    block::Block,
    kernel::ArenaSource,
    list::{FreeNode, Iter, Link},
    utils::ALIGNMENT,
};

/// How far a new block may exceed a listed one and still be placed before it.
const ORDER_TOLERANCE: u32 = ALIGNMENT as u32;

/// Head of one size class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BucketHead {
    /// Upper bound on the size of any block in the bucket.
    ///
    /// Raised whenever a larger block joins the bucket and never lowered on
    /// removal, so it may be stale. A stale value only costs a wasted scan;
    /// it never hides a block that fits.
    pub max_seen: u32,
    /// First block of the list.
    pub first: Link,
}

/// Segregated free lists: one doubly linked list of free blocks per size class.
///
/// ```text
///   bucket   class              list (roughly ascending by size)
///   +-----+
///   |  0  |  [16, 32)      -> 16 -> 24
///   |  1  |  [32, 64)      -> 32 -> 40 -> 56
///   |  2  |  [64, 128)     ->
///   | ... |
///   | 11  |  [32768, inf)  -> 40960
///   +-----+
/// ```
///
/// The list nodes themselves are stored inside the free blocks (see
/// [`FreeNode`]), so the directory only holds one [`BucketHead`] per class.
///
/// Lists are kept approximately ascending: a new block goes before the first
/// entry it does not exceed by more than 8 bytes. Combined with scanning the
/// buckets from the smallest fitting class upwards this gives a soft best
/// fit without paying for an exact sort.
///
/// The insertion rule is skip-while-larger: entries the new block exceeds
/// by more than 8 bytes are passed over, and it lands before the first one
/// within that tolerance. Inserting before the first entry it exceeds would
/// sort the lists descending.
pub(crate) struct FreeLists {
    heads: Vec<BucketHead>,
    class_shift: u32,
}

impl FreeLists {
    pub fn new(bucket_count: usize, class_shift: u32) -> Self {
        Self {
            heads: vec![BucketHead::default(); bucket_count],
            class_shift,
        }
    }

    /// Empties every bucket.
    pub fn clear(&mut self) {
        self.heads.fill(BucketHead::default());
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    #[inline]
    pub fn head(&self, bucket: usize) -> BucketHead {
        self.heads[bucket]
    }

    /// Size class of a block of `size` bytes.
    ///
    /// Halves `size >> class_shift` until it reaches zero or the last bucket
    /// is hit, so the class boundaries are 32, 64, 128, ... by default.
    pub fn bucket_for(&self, size: u32) -> usize {
        let last = self.heads.len() - 1;
        let mut size = size >> self.class_shift;
        let mut bucket = 0;

        while bucket < last && size > 0 {
            bucket += 1;
            size >>= 1;
        }

        bucket
    }

    /// Whether blocks of these two sizes share a list.
    #[inline]
    pub fn same_class(&self, a: u32, b: u32) -> bool {
        self.bucket_for(a) == self.bucket_for(b)
    }

    /// Blocks of bucket `bucket`, head first.
    pub fn iter<'a, S: ArenaSource>(&self, arena: &'a Arena<S>, bucket: usize) -> Iter<'a, S> {
        Iter::new(arena, self.heads[bucket].first)
    }

    /// Raises the size bound of the class of `size` to cover `size`.
    #[inline]
    pub fn note_size(&mut self, size: u32) {
        let bucket = self.bucket_for(size);
        let head = &mut self.heads[bucket];
        head.max_seen = head.max_seen.max(size);
    }

    /// Inserts a free block into the list of its current size class.
    pub fn add<S: ArenaSource>(&mut self, arena: &mut Arena<S>, block: Block) {
        let size = block.size(arena);
        let bucket = self.bucket_for(size);
        self.note_size(size);

        // Skip entries the new block exceeds by more than the tolerance.
        let mut prev: Link = None;
        let mut current = self.heads[bucket].first;
        while let Some(node) = current {
            if size <= node.size(arena).saturating_add(ORDER_TOLERANCE) {
                break;
            }
            prev = Some(node);
            current = FreeNode::next(arena, node);
        }

        FreeNode::set_next(arena, block, current);
        FreeNode::set_prev(arena, block, prev);
        match prev {
            Some(prev) => FreeNode::set_next(arena, prev, Some(block)),
            None => self.heads[bucket].first = Some(block),
        }
        if let Some(next) = current {
            FreeNode::set_prev(arena, next, Some(block));
        }
    }

    /// Unlinks a block from its list.
    ///
    /// The class is derived from the block's current size, so this must run
    /// before the block is retagged.
    pub fn remove<S: ArenaSource>(&mut self, arena: &mut Arena<S>, block: Block) {
        let bucket = self.bucket_for(block.size(arena));
        let next = FreeNode::next(arena, block);
        let prev = FreeNode::prev(arena, block);

        match prev {
            Some(prev) => FreeNode::set_next(arena, prev, next),
            // `max_seen` is left alone.
            None => self.heads[bucket].first = next,
        }
        if let Some(next) = next {
            FreeNode::set_prev(arena, next, prev);
        }
    }

    /// Puts `to` in the list slot of `from`, which drops out of the list.
    ///
    /// Used when a free block moves (a split carves its front, a merge grows
    /// it backwards) but stays in the same class, saving a remove and an
    /// ordered insert. `size` is the size `to` is about to be tagged with;
    /// it must map to the same class as `from`.
    ///
    /// Both links of `from` are read before anything is written, so `to`'s
    /// tags may overlap them. Call this before retagging either block.
    pub fn move_link<S: ArenaSource>(&mut self, arena: &mut Arena<S>, from: Block, to: Block, size: u32) {
        let bucket = self.bucket_for(size);
        let next = FreeNode::next(arena, from);
        let prev = FreeNode::prev(arena, from);

        FreeNode::set_next(arena, to, next);
        FreeNode::set_prev(arena, to, prev);
        match prev {
            Some(prev) => FreeNode::set_next(arena, prev, Some(to)),
            None => self.heads[bucket].first = Some(to),
        }
        if let Some(next) = next {
            FreeNode::set_prev(arena, next, Some(to));
        }
        self.note_size(size);
    }

    /// Finds a free block of at least `size` bytes.
    ///
    /// Buckets are scanned from the class of `size` upwards. A bucket whose
    /// `max_seen` is below `size` is skipped without walking it; inside a
    /// bucket the first block that fits wins.
    pub fn find_fit<S: ArenaSource>(&self, arena: &Arena<S>, size: u32) -> Option<Block> {
        (self.bucket_for(size)..self.heads.len())
            .filter(|&bucket| self.heads[bucket].max_seen >= size)
            .find_map(|bucket| self.iter(arena, bucket).find(|block| block.size(arena) >= size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{FIRST_PAYLOAD, VecSource};

    /// Arena carved into free blocks of the given sizes, separated by
    /// 16-byte allocated spacers so none of them touch.
    fn carve(sizes: &[u32]) -> (Arena<VecSource>, Vec<Block>) {
        let mut arena = Arena::new(VecSource::with_limit(1 << 20), 1 << 16, 1 << 20);
        let first = arena.init().unwrap();
        let total = first.size(&arena);

        let mut blocks = Vec::new();
        let mut cursor = Block(FIRST_PAYLOAD);
        let mut used = 0;
        for &size in sizes {
            cursor.write(&mut arena, size, false);
            blocks.push(cursor);
            cursor = cursor.offset_by(size);
            cursor.write(&mut arena, 16, true);
            cursor = cursor.offset_by(16);
            used += size + 16;
        }
        cursor.write(&mut arena, total - used, true);

        (arena, blocks)
    }

    fn sizes_in<S: ArenaSource>(lists: &FreeLists, arena: &Arena<S>, bucket: usize) -> Vec<u32> {
        lists.iter(arena, bucket).map(|block| block.size(arena)).collect()
    }

    #[test]
    fn bucket_boundaries_double_from_32() {
        let lists = FreeLists::new(12, 5);

        assert_eq!(lists.bucket_for(16), 0);
        assert_eq!(lists.bucket_for(24), 0);
        assert_eq!(lists.bucket_for(32), 1);
        assert_eq!(lists.bucket_for(63), 1);
        assert_eq!(lists.bucket_for(64), 2);
        assert_eq!(lists.bucket_for(112), 2);
        assert_eq!(lists.bucket_for(128), 3);
        assert_eq!(lists.bucket_for(32 << 10), 11);
        assert_eq!(lists.bucket_for(u32::MAX & !7), 11);
    }

    #[test]
    fn same_class_follows_buckets() {
        let lists = FreeLists::new(12, 5);
        assert!(lists.same_class(64, 120));
        assert!(!lists.same_class(120, 128));
        assert!(lists.same_class(1 << 20, 1 << 25));
    }

    #[test]
    fn add_keeps_lists_roughly_ascending() {
        let (mut arena, blocks) = carve(&[104, 72, 88, 80]);
        let mut lists = FreeLists::new(12, 5);

        for &block in &blocks {
            lists.add(&mut arena, block);
        }

        // 88 passes 72, 80 stops at 72 since it exceeds it by no more than 8.
        assert_eq!(sizes_in(&lists, &arena, 2), vec![80, 72, 88, 104]);
        assert_eq!(lists.head(2).max_seen, 104);
    }

    #[test]
    fn near_equal_sizes_insert_ahead() {
        let (mut arena, blocks) = carve(&[72, 80]);
        let mut lists = FreeLists::new(12, 5);

        lists.add(&mut arena, blocks[0]);
        // 80 exceeds 72 by exactly the tolerance, so it goes first.
        lists.add(&mut arena, blocks[1]);
        assert_eq!(sizes_in(&lists, &arena, 2), vec![80, 72]);
    }

    #[test]
    fn remove_relinks_neighbours_and_keeps_max_seen() {
        let (mut arena, blocks) = carve(&[72, 88, 104]);
        let mut lists = FreeLists::new(12, 5);
        for &block in &blocks {
            lists.add(&mut arena, block);
        }

        lists.remove(&mut arena, blocks[1]);
        assert_eq!(sizes_in(&lists, &arena, 2), vec![72, 104]);
        assert_eq!(FreeNode::prev(&arena, blocks[2]), Some(blocks[0]));

        lists.remove(&mut arena, blocks[0]);
        assert_eq!(lists.head(2).first, Some(blocks[2]));
        assert_eq!(FreeNode::prev(&arena, blocks[2]), None);

        lists.remove(&mut arena, blocks[2]);
        assert_eq!(lists.head(2).first, None);
        // Stale by design.
        assert_eq!(lists.head(2).max_seen, 104);
    }

    #[test]
    fn move_link_takes_over_the_slot() {
        let (mut arena, blocks) = carve(&[72, 104, 120]);
        let mut lists = FreeLists::new(12, 5);
        for &block in &blocks {
            lists.add(&mut arena, block);
        }

        // Carve 32 bytes off the front of the middle block.
        let moved = blocks[1].offset_by(32);
        lists.move_link(&mut arena, blocks[1], moved, 72);
        moved.write(&mut arena, 72, false);

        let walked: Vec<_> = lists.iter(&arena, 2).collect();
        assert_eq!(walked, vec![blocks[0], moved, blocks[2]]);
        assert_eq!(FreeNode::prev(&arena, blocks[2]), Some(moved));

        // Moving the head rewrites the bucket head.
        let moved_head = blocks[0].offset_by(8);
        lists.move_link(&mut arena, blocks[0], moved_head, 64);
        moved_head.write(&mut arena, 64, false);
        assert_eq!(lists.head(2).first, Some(moved_head));
    }

    #[test]
    fn find_fit_skips_buckets_that_cannot_fit() {
        let (mut arena, blocks) = carve(&[48, 72, 200]);
        let mut lists = FreeLists::new(12, 5);
        for &block in &blocks {
            lists.add(&mut arena, block);
        }

        assert_eq!(lists.find_fit(&arena, 40), Some(blocks[0]));
        assert_eq!(lists.find_fit(&arena, 56), Some(blocks[1]));
        assert_eq!(lists.find_fit(&arena, 64), Some(blocks[1]));
        assert_eq!(lists.find_fit(&arena, 80), Some(blocks[2]));
        assert_eq!(lists.find_fit(&arena, 208), None);
    }
}
