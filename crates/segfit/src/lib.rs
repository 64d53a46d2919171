//! Segregated best-fit heap allocator.
//!
//! This crate implements the classical four-operation allocator contract —
//! allocate, free, reallocate, zero-initialized allocate — over a single
//! contiguous, grow-only heap obtained from a
//! [`HeapSource`](heap_source::HeapSource). It is `no_std` and designed for
//! a single mutator.
//!
//! # Block format
//!
//! The heap is measured in 4-byte words. Every block is a one-word header,
//! a payload, and — on free blocks only — a one-word footer mirroring the
//! header:
//!
//! ```text
//! ┌────────┬──────────────────────────────┬────────┐
//! │ header │ payload (size words)         │ footer │  free block
//! ├────────┼──────────────────────────────┴────────┘
//! │ header │ payload (size words)         │           allocated block
//! └────────┴──────────────────────────────┘
//!
//! header: [ prev-free : 1 ][ alloc : 1 ][ size in words : 30 ]
//! ```
//!
//! Allocated blocks drop the footer; their successor's *prev-free* header
//! bit records whether a boundary tag exists to walk back through. The
//! saved word goes to the payload, which is why allocated payload sizes are
//! odd and free ones even — the parity keeps every payload 8-byte aligned.
//!
//! # Free index
//!
//! Free blocks are indexed in two tiers by payload size:
//!
//! - sizes 2 and 4 live in two LIFO buckets,
//! - sizes 6 and up live in a binary search tree keyed by size, where each
//!   node heads the address-ordered list of all free blocks of that size.
//!
//! A fit query returns the lowest-address block of the smallest qualifying
//! size. Freed blocks are coalesced with free physical neighbors through
//! boundary tags before they are indexed, so no two adjacent free blocks
//! ever exist.
//!
//! # Example
//!
//! ```
//! use heap_source::ArenaSource;
//! use segfit::SegFitAllocator;
//!
//! let mut backing = vec![0_u64; 1024];
//! let arena = unsafe { ArenaSource::new(backing.as_mut_ptr().cast(), 8192) };
//! let mut heap = SegFitAllocator::init(arena).unwrap();
//!
//! let p = heap.allocate(100).expect("arena has room");
//! assert_eq!(p.addr() % 8, 0);
//!
//! unsafe {
//!     p.write_bytes(0x42, 100);
//!     let p = heap.reallocate(p, 200).expect("arena has room");
//!     assert_eq!(p.read(), 0x42);
//!     heap.free(p);
//! }
//!
//! heap.check_heap(true).unwrap();
//! ```
//!
//! # Thread safety
//!
//! The allocator is `Send` but not `Sync`: every operation takes
//! `&mut self`, and the heap has no internal synchronization. Reentering
//! an operation from a signal handler is unsupported.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod block;
mod check;
mod heap;
mod index;

pub use check::CheckError;
pub use heap::{InitError, SegFitAllocator};
