use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use segheap::{HeapConfig, SegHeap};
use std::hint::black_box;

const OPS: u64 = 10_000;

/// Allocate and immediately free the same size.
fn allocate_free(heap: &mut SegHeap, size: usize) {
    for _ in 0..OPS {
        let ptr = heap.allocate(size);
        black_box(ptr);
        heap.free(ptr);
    }
}

/// Keep a window of live allocations of mixed sizes, freeing the oldest.
fn mixed_window(heap: &mut SegHeap, window: usize) {
    let mut live = std::collections::VecDeque::with_capacity(window);
    for i in 0..OPS as usize {
        let size = 16 + (i * 37) % 1000;
        if let Some(ptr) = heap.allocate(size) {
            live.push_back(ptr);
        }
        if live.len() > window {
            heap.free(live.pop_front());
        }
    }
    while let Some(ptr) = live.pop_front() {
        heap.free(ptr);
    }
}

fn benchmark_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_free");

    for size in [16, 64, 256, 1024, 4096] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("segheap", size), &size, |b, &size| {
            let mut heap = SegHeap::in_memory(HeapConfig::default()).unwrap();
            b.iter(|| allocate_free(&mut heap, size))
        });
    }

    group.finish();

    let mut group = c.benchmark_group("mixed_window");

    for window in [16, 256, 2048] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("segheap", window), &window, |b, &window| {
            let mut heap = SegHeap::in_memory(HeapConfig::default()).unwrap();
            b.iter(|| mixed_window(&mut heap, window))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_throughput);
criterion_main!(benches);
