//! # rbmalloc - A Best-Fit Heap Allocator with a Red-Black Free Index
//!
//! This crate provides a general-purpose **best-fit allocator** that serves
//! variable-size requests from one contiguous, growable region and finds the
//! tightest free block in O(log n) through a red-black tree embedded in the
//! free blocks themselves.
//!
//! ## Overview
//!
//! ```text
//!   Heap layout:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                           MANAGED REGION                             │
//!   │                                                                      │
//!   │  ┌────┬─────────┬────────┬──────┬────────┬──────┬─────────┬───────┐  │
//!   │  │pad │ prologue│ alloc  │ FREE │ alloc  │ FREE │  alloc  │epilog │  │
//!   │  │    │  (8|1)  │ block  │ block│ block  │ block│  block  │ (0|1) │  │
//!   │  └────┴─────────┴────────┴──────┴────────┴──────┴─────────┴───────┘  │
//!   │                             │               │                        │
//!   │                             └───────┬───────┘                        │
//!   │                                     ▼                                │
//!   │                        free blocks carry tree nodes                  │
//!   │                        inside their own payload bytes                │
//!   │                                                                      │
//!   │                              ┌──────────┐                            │
//!   │                              │ size 256 │ B                          │
//!   │                              └──────────┘                            │
//!   │                              ╱          ╲                            │
//!   │                    ┌──────────┐      ┌──────────┐                    │
//!   │                    │ size  64 │ R    │ size 512 │ R                  │
//!   │                    └──────────┘      └──────────┘                    │
//!   └──────────────────────────────────────────────────────────────────────┘
//!
//!   Allocation walks the tree for the smallest block that fits.
//!   Frees merge with physical neighbors through boundary tags.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   rbmalloc
//!   ├── align     - Alignment macros (align!, align_to!)
//!   ├── block     - Boundary-tag layout and block navigation (internal)
//!   ├── tree      - Red-black free-block index (internal)
//!   ├── provider  - Memory providers (sbrk, fixed arena)
//!   ├── heap      - The allocator: malloc / free / realloc
//!   ├── check     - Whole-heap consistency checker
//!   └── global    - GlobalAlloc adapter
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rbmalloc::{ArenaProvider, Heap};
//!
//! fn main() {
//!     // A private 1 MiB heap, independent of the program break.
//!     let arena = ArenaProvider::new(1024 * 1024).unwrap();
//!     let mut heap = Heap::new(arena).unwrap();
//!
//!     unsafe {
//!         let p = heap.malloc(100) as *mut u64;
//!         *p = 42;
//!         println!("value = {}", *p);
//!
//!         let p = heap.realloc(p as *mut u8, 400);
//!         heap.free(p);
//!     }
//! }
//! ```
//!
//! Or as the program's global allocator:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOCATOR: rbmalloc::GlobalHeap<{ 16 * 1024 * 1024 }> =
//!     rbmalloc::GlobalHeap::new();
//! ```
//!
//! ## How It Works
//!
//! Every block carries a header and a footer with its size and an allocated
//! bit, so both physical neighbors of any block can be inspected in O(1):
//!
//! ```text
//!   ┌─────────┬──────────────────────────────┬─────────┐
//!   │ header  │           payload            │ footer  │
//!   │ size|a  │  user data, or the tree node │ size|a  │
//!   │  (4 B)  │  while the block is free     │  (4 B)  │
//!   └─────────┴──────────────────────────────┴─────────┘
//!             ▲
//!             └── pointer returned to the user (8-byte aligned)
//! ```
//!
//! The free-block index costs nothing for allocated memory: when a block is
//! freed, its first 32 payload bytes become a tree node (parent, left,
//! right, color); when it is handed out again, the user simply overwrites
//! them. Freed blocks are merged with free neighbors before they re-enter
//! the index, so the index always holds maximal free runs.
//!
//! Growth is delegated to a [`Provider`]: `sbrk`-style program-break growth
//! ([`SbrkProvider`]) or a fixed-capacity private mapping
//! ([`ArenaProvider`]). The provider is injected, so any number of
//! independent heaps can coexist.
//!
//! ## Features
//!
//! - **Best-fit placement**: smallest fitting block, found in O(log n)
//! - **Immediate coalescing**: no two adjacent free blocks, ever
//! - **In-place realloc**: grows into a free neighbor when possible
//! - **Self-checking**: [`Heap::check`] verifies every structural invariant
//!
//! ## Limitations
//!
//! - **Single-threaded core**: wrap it (or use [`GlobalHeap`]) to share
//! - **No shrinking**: memory is never returned to the OS
//! - **Unix-only providers**: both are built on `libc`
//!
//! ## Safety
//!
//! The crate hands out raw pointers and trusts its callers the way
//! `malloc(3)` does: freeing a foreign pointer, double-freeing, or using a
//! block after free is undefined behavior the allocator does not detect.

pub mod align;
pub mod block;
mod check;
mod global;
mod heap;
mod provider;
mod tree;

pub use global::GlobalHeap;
pub use heap::{Heap, print_heap};
pub use provider::{ArenaProvider, Provider, SbrkProvider};
