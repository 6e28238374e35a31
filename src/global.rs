//! # Global Allocator Adapter
//!
//! Lets the heap serve as a Rust `#[global_allocator]`. The core
//! [`Heap`] wants a single mutator, so the adapter guards it with a spin
//! mutex and initializes it lazily on first use; the backing arena is
//! reserved in one anonymous mapping of `N` bytes, so the heap's footprint
//! is bounded up front and stays clear of the program break.
//!
//! Payload pointers are naturally 8-byte aligned. For stricter alignments
//! the adapter over-allocates, aligns the returned pointer upward, and
//! stashes the raw payload pointer in the word just below it:
//!
//! ```text
//!   ┌────────┬────────────────┬───────────┬──────────────────────┐
//!   │ header │     slack      │ raw ptr   │  user data (aligned) │
//!   └────────┴────────────────┴───────────┴──────────────────────┘
//!   ▲                                     ▲
//!   └── raw payload (stored)              └── pointer handed out
//! ```
//!
//! `dealloc` reads the stashed pointer back whenever the layout's alignment
//! says it must be there.

use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::ptr;

use spin::Mutex;

use crate::align_to;
use crate::block::DSIZE;
use crate::heap::Heap;
use crate::provider::ArenaProvider;

/// A mutex-guarded, lazily initialized heap of at most `N` bytes.
///
/// # Usage
///
/// ```rust,ignore
/// #[global_allocator]
/// static ALLOCATOR: rbmalloc::GlobalHeap<{ 16 * 1024 * 1024 }> =
///   rbmalloc::GlobalHeap::new();
/// ```
///
/// `N` bounds the heap for the whole program run; the allocator never
/// returns memory to the OS, so size it for the peak working set.
pub struct GlobalHeap<const N: usize> {
  inner: Mutex<Option<Heap<ArenaProvider>>>,
}

impl<const N: usize> GlobalHeap<N> {
  #[must_use = "assign the allocator to a static and mark it #[global_allocator]"]
  pub const fn new() -> Self {
    Self {
      inner: Mutex::new(None),
    }
  }

  /// Runs `f` against the heap, mapping the arena on first use.
  ///
  /// Returns `None` when the arena cannot be mapped or the heap cannot be
  /// initialized, which the callers translate into a null pointer.
  fn with_heap<R>(
    &self,
    f: impl FnOnce(&mut Heap<ArenaProvider>) -> R,
  ) -> Option<R> {
    let mut guard = self.inner.lock();

    if guard.is_none() {
      *guard = ArenaProvider::new(N).and_then(Heap::new);
    }

    guard.as_mut().map(f)
  }
}

// SAFETY: null on failure, never panics, and payloads meet the layout's
// alignment either natively (up to 8) or through the stashed-pointer
// scheme above.
unsafe impl<const N: usize> GlobalAlloc for GlobalHeap<N> {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    let align = layout.align();

    if align <= DSIZE {
      return self
        .with_heap(|heap| unsafe { heap.malloc(layout.size()) })
        .unwrap_or(ptr::null_mut());
    }

    // Worst case the aligned pointer sits almost `align` bytes into the
    // block, plus one word for the stash.
    let Some(total) = layout.size().checked_add(align + DSIZE) else {
      return ptr::null_mut();
    };
    let raw = self
      .with_heap(|heap| unsafe { heap.malloc(total) })
      .unwrap_or(ptr::null_mut());
    if raw.is_null() {
      return ptr::null_mut();
    }

    let aligned = align_to!(raw as usize + DSIZE, align) as *mut u8;
    unsafe {
      (aligned as *mut *mut u8).sub(1).write(raw);
    }
    aligned
  }

  unsafe fn dealloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
  ) {
    if ptr.is_null() {
      return;
    }

    let raw = if layout.align() <= DSIZE {
      ptr
    } else {
      unsafe { (ptr as *mut *mut u8).sub(1).read() }
    };

    self.with_heap(|heap| unsafe { heap.free(raw) });
  }

  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    if layout.align() <= DSIZE {
      return self
        .with_heap(|heap| unsafe { heap.realloc(ptr, new_size) })
        .unwrap_or(ptr::null_mut());
    }

    // Stricter alignments go through allocate-copy-free so the stashed
    // pointer stays consistent.
    let new_layout =
      unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    let new_ptr = unsafe { self.alloc(new_layout) };
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, cmp::min(layout.size(), new_size));
        self.dealloc(ptr, layout);
      }
    }
    new_ptr
  }
}
