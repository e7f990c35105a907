use segheap::{ArenaSource, HeapConfig, SegHeap};

fn main() {
    let config = HeapConfig::default().with_max_arena_bytes(16 * 1024 * 1024);
    let mut heap = SegHeap::mapped(config).expect("could not reserve the arena");

    let (low, _) = heap.source().bounds();
    println!("Arena reserved at {low:#x} ({} bytes of address space)", heap.source().capacity());

    let mut live = Vec::new();
    for round in 0..64 {
        let size = 16 << (round % 10);
        if let Some(ptr) = heap.allocate(size) {
            heap.payload_mut(ptr).fill(round as u8);
            live.push(ptr);
        }
        // Free every other allocation to exercise coalescing.
        if round % 2 == 1 && !live.is_empty() {
            let ptr = live.swap_remove(live.len() / 2);
            heap.free(ptr);
        }
    }

    let (low_after, high) = heap.source().bounds();
    assert_eq!(low, low_after, "a mapped arena never moves");
    println!("Arena spans {low_after:#x}..{high:#x}");
    println!("{:?}", heap.stats());

    heap.check_heap("mmap_arena demo");
}
