use segheap::{HeapConfig, Ptr, SegHeap};

fn log_alloc(heap: &SegHeap, ptr: Ptr, requested: usize) {
    println!("Requested {requested} bytes of memory");
    println!(
        "Received {ptr} with {} usable bytes, arena is {} bytes",
        heap.usable_size(ptr).unwrap_or(0),
        heap.arena_size()
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut heap = SegHeap::in_memory(HeapConfig::default()).expect("heap initialisation failed");

    let addr1 = heap.allocate(8).expect("out of memory");
    log_alloc(&heap, addr1, 8);

    let addr2 = heap.allocate(100).expect("out of memory");
    log_alloc(&heap, addr2, 100);

    let addr3 = heap.allocate(2000).expect("out of memory");
    log_alloc(&heap, addr3, 2000);

    heap.payload_mut(addr2)[..12].copy_from_slice(b"Heap Testing");
    let addr2 = heap.resize(Some(addr2), 300).expect("out of memory");
    println!(
        "Resized to {addr2}: {:?}",
        String::from_utf8_lossy(&heap.payload(addr2)[..12])
    );

    heap.free(addr1);
    heap.free(addr2);

    // Freed neighbours merge, so this fits where the first two were.
    let addr4 = heap.allocate(64).expect("out of memory");
    if addr4 == addr1 {
        println!("Correctly reused {addr4}");
    } else {
        println!("Not reused. First was at {addr1} and this one is at {addr4}");
    }

    heap.free(addr3);
    heap.free(addr4);

    let report = heap.verify().expect("heap is inconsistent");
    println!("{:?}", heap.stats());
    println!("{report:?}");
}
