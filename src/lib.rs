//! # segheap
//!
//! A dynamic memory allocator over a single growable arena, using
//! boundary-tagged blocks and segregated free lists.
//!
//! ```text
//!  arena
//!  +----+--------+--------+------+----------------+--------+-----+----+
//!  | P  | alloc  |  free  | alloc|      free      | alloc  | ... | E  |
//!  +----+--------+---|----+------+--------|-------+--------+-----+----+
//!                    |                    |
//!  free lists        |                    |
//!  [0] 16..31        |                    |
//!  [1] 32..63   <----+                    |
//!  ...                                    |
//!  [4] 256..511 <-------------------------+
//!  ...
//! ```
//!
//! Every block carries a header and a footer holding its size and an
//! allocation bit, so both physical neighbours of a block are reachable in
//! O(1). Free blocks are kept in one doubly linked list per size class; the
//! links live inside the free blocks themselves. Freeing a block merges it
//! with free neighbours right away, so no two free blocks are ever adjacent.
//!
//! The heap hands out [`Ptr`] handles (payload offsets from the arena base)
//! instead of raw pointers. Bytes are reached through the heap, which keeps
//! all of the allocator logic in safe code; only the [`MmapSource`] backend
//! talks to the kernel.
//!
//! ## Quick start
//!
//! ```rust
//! use segheap::{HeapConfig, SegHeap};
//!
//! let mut heap = SegHeap::in_memory(HeapConfig::default()).unwrap();
//!
//! let ptr = heap.allocate(100).unwrap();
//! heap.payload_mut(ptr)[..5].copy_from_slice(b"hello");
//!
//! let ptr = heap.resize(Some(ptr), 4000).unwrap();
//! assert_eq!(&heap.payload(ptr)[..5], b"hello");
//!
//! heap.free(ptr);
//! heap.check_heap("quick start");
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded**: a heap does no locking; use one per thread or wrap it.
//! - **Grow only**: the arena is never compacted or shrunk.
//! - **32-bit tags**: an arena is at most 4 GiB.

mod arena;
mod block;
mod checker;
pub mod config;
pub mod error;
mod freelist;
mod heap;
mod kernel;
mod list;
mod mmap;
pub mod utils;

pub use arena::VecSource;
pub use block::Ptr;
pub use checker::HeapReport;
pub use config::HeapConfig;
pub use error::{ConfigError, HeapError, Inconsistency};
pub use heap::{BlockInfo, Blocks, HeapStats, SegHeap};
pub use kernel::{ArenaSource, page_size};
pub use mmap::MmapSource;
