//! Heap consistency checker.
//!
//! Debugging aid only: it walks the whole heap twice, once in address order
//! and once through every free list, and cross-checks the two views. The
//! allocator never calls it on its own unless the `debug-checks` feature is
//! enabled.

use tracing::error;

use crate::{
    arena::{FIRST_PAYLOAD, PROLOGUE},
    block::{Block, TAG_SIZE, TAGS_OVERHEAD, Tag},
    error::Inconsistency,
    heap::SegHeap,
    kernel::ArenaSource,
    list::FreeNode,
    utils::ALIGNMENT,
};

/// What a successful [`SegHeap::verify`] saw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapReport {
    /// Blocks found walking the heap, sentinels excluded.
    pub blocks: usize,
    /// Free blocks, counted by both walks.
    pub free_blocks: usize,
}

impl<S: ArenaSource> SegHeap<S> {
    /// Checks every heap invariant and reports the first violation.
    ///
    /// In address order: sentinels in place, every block 8-byte aligned, at
    /// least the minimum size, inside the arena, with agreeing header and
    /// footer, and never two free blocks in a row. Through the free lists:
    /// every listed block is free, lies in the bucket of its size, below the
    /// bucket's `max_seen`, with a `prev` link pointing at its predecessor,
    /// and the lists hold exactly as many blocks as the walk found free.
    pub fn verify(&self) -> Result<HeapReport, Inconsistency> {
        let physical = self.walk_blocks()?;
        let listed = self.walk_lists(physical.free_blocks)?;

        if listed != physical.free_blocks {
            return Err(Inconsistency::CountMismatch {
                physical: physical.free_blocks,
                listed,
            });
        }

        Ok(physical)
    }

    /// Runs [`SegHeap::verify`] and aborts on the first inconsistency.
    ///
    /// `context` names the call site in the diagnostic. A broken heap means
    /// either an allocator bug or a caller writing outside its allocation;
    /// neither can be recovered from.
    pub fn check_heap(&self, context: &str) {
        if let Err(inconsistency) = self.verify() {
            let (low, high) = self.source().bounds();
            error!(context, %inconsistency, low, high, "heap consistency check failed");
            panic!("heap check failed ({context}): {inconsistency}");
        }
    }

    fn walk_blocks(&self) -> Result<HeapReport, Inconsistency> {
        let arena = &self.arena;
        let len = arena.len();
        let min_block_size = self.config.min_block_size;

        if len < FIRST_PAYLOAD as usize + TAG_SIZE {
            return Err(Inconsistency::BadSentinel {
                which: "prologue",
                offset: PROLOGUE,
                tag: 0,
            });
        }
        let prologue = arena.word(PROLOGUE);
        if prologue != Tag::SENTINEL.raw() {
            return Err(Inconsistency::BadSentinel {
                which: "prologue",
                offset: PROLOGUE,
                tag: prologue,
            });
        }

        let epilogue = arena.epilogue();
        let mut report = HeapReport::default();
        let mut previous_free: Option<Block> = None;
        let mut block = Block(FIRST_PAYLOAD);

        loop {
            let header = block.header(arena);
            let size = header.size() as usize;

            if size == 0 {
                if header != Tag::SENTINEL || block.header_offset() != epilogue {
                    return Err(Inconsistency::BadSentinel {
                        which: "epilogue",
                        offset: block.header_offset(),
                        tag: header.raw(),
                    });
                }
                break;
            }
            if size % ALIGNMENT != 0 || size < min_block_size {
                return Err(Inconsistency::Misaligned {
                    block: block.0,
                    size: header.size(),
                });
            }
            if block.header_offset() + size > epilogue {
                return Err(Inconsistency::OutOfBounds {
                    block: block.0,
                    arena_size: len,
                });
            }
            let footer = block.footer(arena);
            if footer != header {
                return Err(Inconsistency::TagMismatch {
                    block: block.0,
                    header: header.raw(),
                    footer: footer.raw(),
                });
            }

            report.blocks += 1;
            if header.is_allocated() {
                previous_free = None;
            } else {
                if let Some(previous) = previous_free {
                    return Err(Inconsistency::UncoalescedNeighbours {
                        first: previous.0,
                        second: block.0,
                    });
                }
                previous_free = Some(block);
                report.free_blocks += 1;
            }

            block = block.offset_by(header.size());
        }

        Ok(report)
    }

    /// Walks every bucket and returns the number of listed blocks. Gives up
    /// as soon as the lists hold more blocks than `physical`, which can only
    /// happen with a cycle.
    fn walk_lists(&self, physical: usize) -> Result<usize, Inconsistency> {
        let arena = &self.arena;
        let epilogue = arena.epilogue();
        let mut listed = 0;

        for bucket in 0..self.lists.bucket_count() {
            let head = self.lists.head(bucket);
            let mut predecessor = None;
            let mut current = head.first;
            // Reported once the walk is known to terminate; a cycle always
            // breaks a back link too and should be reported as a cycle.
            let mut broken_back_link = None;

            while let Some(block) = current {
                // Links and tags of a listed block must be readable.
                if block.offset() < FIRST_PAYLOAD as usize
                    || block.offset() % ALIGNMENT != 0
                    || block.offset() + TAGS_OVERHEAD > epilogue
                {
                    return Err(Inconsistency::OutOfBounds {
                        block: block.0,
                        arena_size: arena.len(),
                    });
                }

                let header = block.header(arena);
                if header.is_allocated() {
                    return Err(Inconsistency::NotFree { block: block.0, bucket });
                }
                let expected = self.lists.bucket_for(header.size());
                if expected != bucket {
                    return Err(Inconsistency::WrongBucket {
                        block: block.0,
                        size: header.size(),
                        found: bucket,
                        expected,
                    });
                }
                if header.size() > head.max_seen {
                    return Err(Inconsistency::StaleMaximum {
                        bucket,
                        block: block.0,
                        size: header.size(),
                        max_seen: head.max_seen,
                    });
                }
                if broken_back_link.is_none() && FreeNode::prev(arena, block) != predecessor {
                    broken_back_link = Some(Inconsistency::BrokenBackLink { block: block.0, bucket });
                }

                listed += 1;
                if listed > physical {
                    return Err(Inconsistency::CyclicList { bucket, physical });
                }

                predecessor = Some(block);
                current = FreeNode::next(arena, block);
            }

            if let Some(inconsistency) = broken_back_link {
                return Err(inconsistency);
            }
        }

        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeapConfig, Ptr};

    fn heap() -> SegHeap {
        SegHeap::in_memory(HeapConfig::default()).unwrap()
    }

    /// Three allocations of 32 bytes, the middle one freed.
    fn heap_with_hole() -> (SegHeap, [Ptr; 3]) {
        let mut heap = heap();
        let ptrs = [
            heap.allocate(24).unwrap(),
            heap.allocate(24).unwrap(),
            heap.allocate(24).unwrap(),
        ];
        heap.free(ptrs[1]);
        (heap, ptrs)
    }

    #[test]
    fn healthy_heap_passes() {
        let (heap, _) = heap_with_hole();

        let report = heap.verify().unwrap();
        assert_eq!(report.blocks, 4);
        assert_eq!(report.free_blocks, 2);
        heap.check_heap("healthy_heap_passes");
    }

    #[test]
    fn detects_footer_overwrite() {
        let (mut heap, ptrs) = heap_with_hole();
        // Write one word past the usable payload, onto the footer.
        let footer = ptrs[0].offset() + 24;
        heap.arena.set_word(footer, 0xDEAD_BEE8);

        assert!(matches!(
            heap.verify(),
            Err(Inconsistency::TagMismatch { block: 8, .. })
        ));
    }

    #[test]
    fn detects_a_clobbered_epilogue() {
        let mut heap = heap();
        let epilogue = heap.arena.epilogue();
        heap.arena.set_word(epilogue, 0);

        assert!(matches!(
            heap.verify(),
            Err(Inconsistency::BadSentinel { which: "epilogue", .. })
        ));
    }

    #[test]
    fn detects_adjacent_free_blocks() {
        let (mut heap, ptrs) = heap_with_hole();
        // Mark the first block free behind the allocator's back.
        ptrs[0].block().write(&mut heap.arena, 32, false);

        assert_eq!(
            heap.verify(),
            Err(Inconsistency::UncoalescedNeighbours { first: 8, second: 40 })
        );
    }

    #[test]
    fn detects_allocated_block_on_a_list() {
        let (mut heap, ptrs) = heap_with_hole();
        ptrs[1].block().write(&mut heap.arena, 32, true);

        assert_eq!(
            heap.verify(),
            Err(Inconsistency::NotFree { block: 40, bucket: 1 })
        );
    }

    #[test]
    fn detects_free_block_missing_from_lists() {
        let (mut heap, ptrs) = heap_with_hole();
        let hole = ptrs[1].block();
        heap.lists.remove(&mut heap.arena, hole);

        assert_eq!(
            heap.verify(),
            Err(Inconsistency::CountMismatch { physical: 2, listed: 1 })
        );
    }

    #[test]
    fn detects_block_in_the_wrong_bucket() {
        let (mut heap, ptrs) = heap_with_hole();
        let hole = ptrs[1].block();
        heap.lists.remove(&mut heap.arena, hole);
        // Grow the hole into the next block's space without relisting it.
        hole.write(&mut heap.arena, 64, false);
        heap.lists.add(&mut heap.arena, hole);
        hole.write(&mut heap.arena, 32, false);
        ptrs[2].block().write(&mut heap.arena, 32, true);

        assert_eq!(
            heap.verify(),
            Err(Inconsistency::WrongBucket {
                block: 40,
                size: 32,
                found: 2,
                expected: 1
            })
        );
    }

    #[test]
    fn detects_cycles() {
        let (mut heap, ptrs) = heap_with_hole();
        let hole = ptrs[1].block();
        FreeNode::set_next(&mut heap.arena, hole, Some(hole));

        assert_eq!(
            heap.verify(),
            Err(Inconsistency::CyclicList { bucket: 1, physical: 2 })
        );
    }

    #[test]
    fn detects_broken_back_links() {
        let mut heap = heap();
        let ptrs: Vec<_> = (0..5).map(|_| heap.allocate(24).unwrap()).collect();
        heap.free(ptrs[1]);
        heap.free(ptrs[3]);
        // Bucket 1 now holds ptrs[3] then ptrs[1]; point the second one's
        // prev link somewhere else.
        let second = heap.lists.iter(&heap.arena, 1).nth(1).unwrap();
        FreeNode::set_prev(&mut heap.arena, second, None);

        assert_eq!(
            heap.verify(),
            Err(Inconsistency::BrokenBackLink { block: second.0, bucket: 1 })
        );
    }

    #[test]
    #[should_panic(expected = "heap check failed (corrupted)")]
    fn check_heap_aborts_on_corruption() {
        let mut heap = heap();
        heap.arena.set_word(PROLOGUE, 0);
        heap.check_heap("corrupted");
    }
}
