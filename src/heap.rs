//! # Best-Fit Heap
//!
//! The allocator proper: a boundary-tagged heap whose free blocks are
//! indexed by the embedded red-black tree.
//!
//! ## Heap layout
//!
//! The managed region is bracketed by two sentinels so that block walks and
//! neighbor inspections never need edge checks:
//!
//! ```text
//!          ┌─────┬────────┬────────┬─────────────────────────┬────────┐
//!          │ pad │ prolog │ prolog │     ordinary blocks     │ epilog │
//!          │ 4 B │ header │ footer │          ...            │ header │
//!          │     │ (8|a)  │ (8|a)  │                         │ (0|a)  │
//!          └─────┴────────┴────────┴─────────────────────────┴────────┘
//!          ▲                                                          ▲
//!       heap_low()                                              heap_high()
//! ```
//!
//! - The *prologue* is a permanently allocated 8-byte block, so every real
//!   block has a previous footer to look at.
//! - The *epilogue* is a zero-size allocated header at the very top. Every
//!   extension overwrites it with the new block's header and writes a fresh
//!   epilogue one word past the new end.
//!
//! ## Allocation flow
//!
//! ```text
//!   malloc(n)
//!      │  round n+8 up to a multiple of 8, at least 48
//!      ▼
//!   best_fit(asize) ──── hit ────► place: split when the remainder
//!      │                           can stand alone, else absorb it
//!    miss
//!      ▼
//!   extend_heap(max(asize, CHUNKSIZE)) ──► coalesce with a free tail,
//!                                          then place as above
//! ```
//!
//! Frees mark the tags and coalesce with both physical neighbors, removing
//! merged neighbors from the index first so the index never holds a block
//! whose key went stale. Reallocation grows in place when the next block is
//! free and large enough, shrinks in place when the new size leaves a
//! viable remainder, and only as a last resort allocates-copies-frees.
//!
//! ## Safety
//!
//! The same caller contract as `malloc(3)`: pointers passed to
//! [`free`](Heap::free) and [`realloc`](Heap::realloc) must have come from
//! this heap and must not be used after they are released. The heap assumes
//! a single mutator; wrap it externally for shared use.

use core::cmp;
use core::ptr;

use crate::align;
use crate::block::{self, CHUNKSIZE, DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, WSIZE};
use crate::provider::Provider;
use crate::tree::RbTree;

/// Debug helper that prints the managed region and the free-byte total.
///
/// # Example Output
///
/// ```text
/// heap = [0x7f12aa000000, 0x7f12aa001010), free = 4096 bytes
/// ```
pub fn print_heap<P: Provider>(heap: &Heap<P>) {
  println!(
    "heap = [{:?}, {:?}), free = {} bytes",
    heap.heap_low(),
    heap.heap_high(),
    heap.total_free_bytes(),
  );
}

/// Rounds a request up to a legal block size: payload plus both boundary
/// tags, aligned to `DSIZE`, never below `MIN_BLOCK_SIZE` and never above
/// what a 32-bit tag can represent. `None` means the request cannot be
/// served at all, zero-size requests included.
fn adjust_request(size: usize) -> Option<usize> {
  if size == 0 {
    return None;
  }

  let padded = size.checked_add(DSIZE + DSIZE - 1)?;
  let asize = cmp::max(padded & !(DSIZE - 1), MIN_BLOCK_SIZE);

  if asize > MAX_BLOCK_SIZE { None } else { Some(asize) }
}

/// A best-fit heap over an injected [`Provider`].
///
/// Instances are independent; every piece of allocator state, the tree root
/// and its sentinel included, lives in the instance, so tests can run as
/// many heaps side by side as they like.
///
/// # Thread Safety
///
/// The heap serves one logical mutator and is **not** internally
/// synchronized. [`crate::GlobalHeap`] wraps one in a mutex for use as a
/// global allocator.
pub struct Heap<P: Provider> {
  provider: P,

  /// Payload pointer of the prologue block.
  pub(crate) prologue: *mut u8,

  /// Free-block index.
  pub(crate) tree: RbTree,
}

// SAFETY: every embedded pointer targets the provider's region or the
// tree's owned sentinel, both of which move with the heap as a unit.
unsafe impl<P: Provider + Send> Send for Heap<P> {}

impl<P: Provider> Heap<P> {
  /// Builds a heap on `provider`: writes the pad word and both sentinels,
  /// then maps the first `CHUNKSIZE`-byte free block.
  ///
  /// Returns `None` when the provider cannot supply the initial
  /// 16 + `CHUNKSIZE` bytes.
  pub fn new(provider: P) -> Option<Self> {
    let mut heap = Self {
      provider,
      prologue: ptr::null_mut(),
      tree: RbTree::new()?,
    };

    let p = heap.provider.extend(4 * WSIZE)?;
    unsafe {
      block::put(p, 0);
      block::put(p.add(WSIZE), block::pack(DSIZE, true));
      block::put(p.add(2 * WSIZE), block::pack(DSIZE, true));
      block::put(p.add(3 * WSIZE), block::pack(0, true));
      heap.prologue = p.add(2 * WSIZE);

      if heap.extend_heap(CHUNKSIZE / WSIZE).is_null() {
        return None;
      }
    }

    Some(heap)
  }

  /// Allocates `size` payload bytes and returns an 8-byte-aligned pointer,
  /// or null when `size` is zero or the heap cannot grow far enough.
  ///
  /// The block chosen is the smallest free block that fits; only when no
  /// block fits is the heap extended.
  ///
  /// # Safety
  ///
  /// The returned pointer is valid for `size` bytes until passed to
  /// [`free`](Heap::free) or grown out of by [`realloc`](Heap::realloc).
  /// The heap must not be mutated concurrently.
  pub unsafe fn malloc(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    let Some(asize) = adjust_request(size) else {
      return ptr::null_mut();
    };

    unsafe {
      let bp = self.tree.best_fit(asize);
      if !bp.is_null() {
        self.place(bp, asize);
        return bp;
      }

      let bp = self.extend_heap(cmp::max(asize, CHUNKSIZE) / WSIZE);
      if bp.is_null() {
        return ptr::null_mut();
      }
      self.place(bp, asize);
      bp
    }
  }

  /// Releases the block at `bp`. Null is a no-op.
  ///
  /// The block is merged with free physical neighbors before going back
  /// into the index, so no two adjacent free blocks ever exist.
  ///
  /// # Safety
  ///
  /// `bp` must be null or a pointer previously returned by this heap and
  /// not yet released. The heap must not be mutated concurrently.
  pub unsafe fn free(
    &mut self,
    bp: *mut u8,
  ) {
    if bp.is_null() {
      return;
    }

    unsafe {
      let size = block::block_size(bp);
      block::write_tags(bp, size, false);
      self.coalesce(bp);
    }
  }

  /// Resizes the block at `bp` to `size` payload bytes.
  ///
  /// In order of preference: shrink in place, grow into a free next block,
  /// or allocate-copy-free. A null `bp` behaves as `malloc(size)`; a zero
  /// `size` frees `bp` and returns null. When a fresh allocation is needed
  /// and fails, the old block is left untouched and null is returned.
  ///
  /// # Safety
  ///
  /// Same contract as [`free`](Heap::free) for `bp`; on success the old
  /// pointer must no longer be used if a different one was returned.
  pub unsafe fn realloc(
    &mut self,
    bp: *mut u8,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      if size == 0 {
        self.free(bp);
        return ptr::null_mut();
      }
      if bp.is_null() {
        return self.malloc(size);
      }

      let Some(asize) = adjust_request(size) else {
        return ptr::null_mut();
      };
      let csize = block::block_size(bp);

      if asize <= csize {
        // Already big enough. Carve off the tail when it can stand alone
        // as a block; the coalescer reunites it with a free neighbor.
        if csize - asize >= MIN_BLOCK_SIZE {
          block::write_tags(bp, asize, true);
          let rest = block::next_block(bp);
          block::write_tags(rest, csize - asize, false);
          self.coalesce(rest);
        }
        return bp;
      }

      let next = block::next_block(bp);
      if !block::is_allocated(next) && csize + block::block_size(next) >= asize {
        // Absorb the free neighbor instead of moving.
        let combined = csize + block::block_size(next);
        self.tree.remove(next);

        if combined - asize >= MIN_BLOCK_SIZE {
          block::write_tags(bp, asize, true);
          let rest = block::next_block(bp);
          block::write_tags(rest, combined - asize, false);
          self.tree.insert(rest);
        } else {
          block::write_tags(bp, combined, true);
        }
        return bp;
      }

      let new_bp = self.malloc(size);
      if new_bp.is_null() {
        return ptr::null_mut();
      }
      ptr::copy_nonoverlapping(bp, new_bp, cmp::min(size, csize - DSIZE));
      self.free(bp);
      new_bp
    }
  }

  /// Lowest address of the managed region.
  pub fn heap_low(&self) -> *mut u8 {
    self.provider.heap_low()
  }

  /// One past the highest mapped byte of the managed region.
  pub fn heap_high(&self) -> *mut u8 {
    self.provider.heap_high()
  }

  /// Grows the heap by `words` 4-byte words (rounded up to keep 8-byte
  /// alignment) and returns the resulting free block, already merged with
  /// a free tail. Null when the provider refuses.
  unsafe fn extend_heap(
    &mut self,
    words: usize,
  ) -> *mut u8 {
    let size = align!(words * WSIZE);

    let Some(bp) = self.provider.extend(size) else {
      return ptr::null_mut();
    };

    unsafe {
      // The word just below the returned range is the old epilogue; it
      // becomes the new block's header.
      block::write_tags(bp, size, false);
      block::put(block::header(block::next_block(bp)), block::pack(0, true));

      self.coalesce(bp)
    }
  }

  /// Merges the free block at `bp` with whichever physical neighbors are
  /// free and inserts the result into the index.
  ///
  /// Neighbors are pulled out of the index before any tag is rewritten, so
  /// the index never holds a block under a stale key.
  unsafe fn coalesce(
    &mut self,
    bp: *mut u8,
  ) -> *mut u8 {
    unsafe {
      let prev_allocated = block::get(bp.sub(DSIZE)) & 1 != 0;
      let next = block::next_block(bp);
      let next_allocated = block::get(block::header(next)) & 1 != 0;

      let mut bp = bp;
      let mut size = block::block_size(bp);

      if prev_allocated && next_allocated {
        // both neighbors busy, nothing to merge
      } else if prev_allocated && !next_allocated {
        self.tree.remove(next);
        size += block::block_size(next);
        block::write_tags(bp, size, false);
      } else if !prev_allocated && next_allocated {
        let prev = block::prev_block(bp);
        self.tree.remove(prev);
        size += block::block_size(prev);
        block::write_tags(prev, size, false);
        bp = prev;
      } else {
        let prev = block::prev_block(bp);
        self.tree.remove(prev);
        self.tree.remove(next);
        size += block::block_size(prev) + block::block_size(next);
        block::write_tags(prev, size, false);
        bp = prev;
      }

      self.tree.insert(bp);
      bp
    }
  }

  /// Converts the free block at `bp` into an allocated block of `asize`
  /// bytes, splitting off the remainder when it can stand alone.
  unsafe fn place(
    &mut self,
    bp: *mut u8,
    asize: usize,
  ) {
    unsafe {
      let csize = block::block_size(bp);
      self.tree.remove(bp);

      if csize - asize >= MIN_BLOCK_SIZE {
        block::write_tags(bp, asize, true);
        let rest = block::next_block(bp);
        block::write_tags(rest, csize - asize, false);
        self.tree.insert(rest);
      } else {
        block::write_tags(bp, csize, true);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::provider::ArenaProvider;

  fn new_heap() -> Heap<ArenaProvider> {
    let arena = ArenaProvider::new(1 << 20).expect("arena mapping failed");
    Heap::new(arena).expect("heap initialization failed")
  }

  fn fill(
    bp: *mut u8,
    len: usize,
    seed: u8,
  ) {
    for i in 0..len {
      unsafe { bp.add(i).write(seed.wrapping_add(i as u8)) };
    }
  }

  fn assert_filled(
    bp: *mut u8,
    len: usize,
    seed: u8,
  ) {
    for i in 0..len {
      assert_eq!(unsafe { bp.add(i).read() }, seed.wrapping_add(i as u8));
    }
  }

  #[test]
  fn fresh_heap_holds_one_chunk() {
    let heap = new_heap();

    heap.check().unwrap();
    assert_eq!(heap.free_block_sizes(), vec![CHUNKSIZE]);
  }

  #[test]
  fn adjust_request_rounds_and_rejects() {
    assert_eq!(adjust_request(0), None);
    assert_eq!(adjust_request(1), Some(MIN_BLOCK_SIZE));
    assert_eq!(adjust_request(40), Some(48));
    assert_eq!(adjust_request(41), Some(56));
    assert_eq!(adjust_request(100), Some(112));
    assert_eq!(adjust_request(usize::MAX), None);
    assert_eq!(adjust_request(MAX_BLOCK_SIZE), None);
    assert_eq!(adjust_request(MAX_BLOCK_SIZE - DSIZE), Some(MAX_BLOCK_SIZE));
  }

  #[test]
  fn malloc_zero_returns_null_without_growth() {
    let mut heap = new_heap();
    let high = heap.heap_high();

    let p = unsafe { heap.malloc(0) };

    assert!(p.is_null());
    assert_eq!(heap.heap_high(), high);
    heap.check().unwrap();
  }

  #[test]
  fn malloc_huge_returns_null_without_growth() {
    let mut heap = new_heap();
    let high = heap.heap_high();

    let p = unsafe { heap.malloc(usize::MAX) };

    assert!(p.is_null());
    assert_eq!(heap.heap_high(), high);
    heap.check().unwrap();
  }

  #[test]
  fn free_null_is_a_noop() {
    let mut heap = new_heap();

    unsafe { heap.free(ptr::null_mut()) };
    heap.check().unwrap();
  }

  #[test]
  fn payloads_are_eight_byte_aligned() {
    let mut heap = new_heap();

    unsafe {
      for size in [1, 7, 8, 9, 24, 40, 100, 1000] {
        let p = heap.malloc(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % DSIZE, 0, "payload for {} misaligned", size);
        heap.check().unwrap();
      }
    }
  }

  #[test]
  fn simple_cycle_restores_the_chunk() {
    let mut heap = new_heap();

    unsafe {
      let p = heap.malloc(40);
      assert!(!p.is_null());
      heap.check().unwrap();
      // 40 rounds up to the 48-byte minimum, leaving a split remainder.
      assert_eq!(heap.free_block_sizes(), vec![CHUNKSIZE - 48]);

      heap.free(p);
    }

    heap.check().unwrap();
    assert_eq!(heap.free_block_sizes(), vec![CHUNKSIZE]);
  }

  #[test]
  fn round_trip_preserves_total_free_bytes() {
    let mut heap = new_heap();
    let before = heap.total_free_bytes();

    unsafe {
      let p = heap.malloc(500);
      assert!(!p.is_null());
      heap.free(p);
    }

    heap.check().unwrap();
    assert_eq!(heap.total_free_bytes(), before);
  }

  #[test]
  fn split_then_coalesce_back_to_one_region() {
    let mut heap = new_heap();

    unsafe {
      let a = heap.malloc(100);
      let b = heap.malloc(100);
      let c = heap.malloc(100);
      assert!(!a.is_null() && !b.is_null() && !c.is_null());
      heap.check().unwrap();

      // Freeing the outer two leaves two free islands around b.
      heap.free(a);
      heap.check().unwrap();
      heap.free(c);
      heap.check().unwrap();
      assert_eq!(heap.free_block_sizes().len(), 2);

      // Freeing b bridges everything into one region again.
      heap.free(b);
    }

    heap.check().unwrap();
    assert_eq!(heap.free_block_sizes(), vec![CHUNKSIZE]);
  }

  #[test]
  fn best_fit_picks_the_tightest_hole() {
    let mut heap = new_heap();

    unsafe {
      // Guard allocations keep the three holes from coalescing once their
      // owners are freed.
      let a = heap.malloc(200);
      let _g1 = heap.malloc(16);
      let b = heap.malloc(100);
      let _g2 = heap.malloc(16);
      let c = heap.malloc(300);
      let _g3 = heap.malloc(16);

      heap.free(a); // hole of 208
      heap.free(c); // hole of 312
      heap.free(b); // hole of 112
      heap.check().unwrap();

      // 90 needs a 104-byte block; the 112-byte hole is the tightest fit.
      let p = heap.malloc(90);
      assert_eq!(p, b);
    }

    heap.check().unwrap();
  }

  #[test]
  fn realloc_within_capacity_does_not_move() {
    let mut heap = new_heap();

    unsafe {
      let p = heap.malloc(100);
      fill(p, 100, 7);

      // 100 rounds to a 112-byte block with 104 payload bytes.
      let q = heap.realloc(p, 104);
      assert_eq!(q, p);

      let r = heap.realloc(p, 10);
      assert_eq!(r, p);
      assert_filled(r, 10, 7);
    }

    heap.check().unwrap();
  }

  #[test]
  fn realloc_shrink_releases_the_tail() {
    let mut heap = new_heap();

    unsafe {
      let p = heap.malloc(200);
      fill(p, 200, 3);

      let q = heap.realloc(p, 40);
      assert_eq!(q, p);
      assert_filled(q, 40, 3);
    }

    heap.check().unwrap();
    // The released tail merged with the remaining chunk.
    assert_eq!(heap.free_block_sizes(), vec![CHUNKSIZE - 48]);
  }

  #[test]
  fn realloc_grows_into_a_free_neighbor() {
    let mut heap = new_heap();

    unsafe {
      let p = heap.malloc(64);
      let q = heap.malloc(128);
      let _guard = heap.malloc(16);
      fill(p, 64, 11);

      heap.free(q);
      heap.check().unwrap();

      let r = heap.realloc(p, 128);
      assert_eq!(r, p);
      assert_filled(r, 64, 11);
    }

    heap.check().unwrap();
  }

  #[test]
  fn realloc_moves_when_the_neighbor_is_busy() {
    let mut heap = new_heap();

    unsafe {
      let p = heap.malloc(64);
      let _guard = heap.malloc(16);
      fill(p, 64, 42);

      let q = heap.realloc(p, 128);
      assert!(!q.is_null());
      assert_ne!(q, p);
      assert_filled(q, 64, 42);
    }

    heap.check().unwrap();
  }

  #[test]
  fn realloc_null_allocates_and_zero_frees() {
    let mut heap = new_heap();
    let before = heap.total_free_bytes();

    unsafe {
      let p = heap.realloc(ptr::null_mut(), 100);
      assert!(!p.is_null());
      heap.check().unwrap();

      let q = heap.realloc(p, 0);
      assert!(q.is_null());
    }

    heap.check().unwrap();
    assert_eq!(heap.total_free_bytes(), before);
  }

  #[test]
  fn exhaustion_fails_cleanly_and_recovers() {
    let arena = ArenaProvider::new(16 * 1024).expect("arena mapping failed");
    let mut heap = Heap::new(arena).expect("heap initialization failed");

    unsafe {
      let mut live = Vec::new();
      loop {
        let p = heap.malloc(1024);
        if p.is_null() {
          break;
        }
        live.push(p);
      }

      // The arena is spent; the refusal must not have corrupted anything.
      assert!(!live.is_empty());
      heap.check().unwrap();
      assert!(heap.malloc(16 * 1024).is_null());

      for p in live {
        heap.free(p);
      }
      heap.check().unwrap();

      // Everything is free again, so a large request succeeds.
      assert!(!heap.malloc(8 * 1024).is_null());
    }

    heap.check().unwrap();
  }

  #[test]
  fn growth_past_the_first_chunk_extends_the_heap() {
    let mut heap = new_heap();
    let high = heap.heap_high();

    unsafe {
      let p = heap.malloc(CHUNKSIZE * 2);
      assert!(!p.is_null());
      assert!(heap.heap_high() > high);
      heap.check().unwrap();

      heap.free(p);
    }

    heap.check().unwrap();
  }

  #[test]
  fn many_mixed_operations_keep_invariants() {
    let mut heap = new_heap();

    unsafe {
      let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();
      let mut seed = 0x9E3779B9u32;

      for round in 0..400u32 {
        seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
        let size = 1 + (seed >> 20) as usize % 700;

        if live.len() > 24 || (round % 3 == 0 && !live.is_empty()) {
          let idx = seed as usize % live.len();
          let (bp, len, tag) = live.swap_remove(idx);
          assert_filled(bp, len, tag);
          heap.free(bp);
        } else {
          let bp = heap.malloc(size);
          assert!(!bp.is_null());
          let tag = (seed >> 8) as u8;
          fill(bp, size, tag);
          live.push((bp, size, tag));
        }

        if round % 16 == 0 {
          heap.check().unwrap();
        }
      }

      for (bp, len, tag) in live {
        assert_filled(bp, len, tag);
        heap.free(bp);
      }
    }

    heap.check().unwrap();
    assert_eq!(heap.free_block_sizes().len(), 1);
  }
}
