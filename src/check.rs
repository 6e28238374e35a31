//! # Heap Consistency Checker
//!
//! A read-only diagnostics pass over the whole heap. Drivers call it to
//! catch corruption early; the test suite calls it after every operation.
//!
//! The pass walks the physical block list from prologue to epilogue and
//! cross-checks it against the free-block index:
//!
//! - header and footer of every block are identical;
//! - every size is a multiple of 8 and at least the block minimum;
//! - no two adjacent blocks are both free;
//! - both sentinels are intact and the epilogue sits at the heap's top;
//! - the tree satisfies the red-black and ordering invariants;
//! - the set of free blocks and the set of tree nodes are identical.

use crate::block::{self, DSIZE, MIN_BLOCK_SIZE, WSIZE};
use crate::heap::Heap;
use crate::provider::Provider;

impl<P: Provider> Heap<P> {
  /// Verifies every structural invariant of the heap and its index.
  ///
  /// Returns a description of the first violation found. A corrupted heap
  /// may also make the walk itself read garbage, so this is a debugging
  /// aid, not a hardening layer.
  pub fn check(&self) -> Result<(), String> {
    unsafe {
      let high = self.heap_high();

      // Prologue: allocated, 8 bytes, matching tags.
      if block::block_size(self.prologue) != DSIZE
        || !block::is_allocated(self.prologue)
        || block::get(block::header(self.prologue)) != block::get(block::footer(self.prologue))
      {
        return Err("prologue is damaged".to_string());
      }

      let mut free_blocks = Vec::new();
      let mut prev_was_free = false;
      let mut bp = block::next_block(self.prologue);

      loop {
        // The epilogue's payload pointer is exactly the heap top; anything
        // beyond means a header lied about its size.
        if bp > high {
          return Err(format!("block walk ran past the heap end at {:p}", bp));
        }

        let size = block::block_size(bp);
        let allocated = block::is_allocated(bp);

        if size == 0 {
          // Epilogue: allocated, zero size, topmost word of the heap.
          if !allocated {
            return Err("epilogue is not marked allocated".to_string());
          }
          if block::header(bp) != high.wrapping_sub(WSIZE) {
            return Err(format!(
              "epilogue at {:p} is not at the heap top {:p}",
              block::header(bp),
              high,
            ));
          }
          break;
        }

        if size % DSIZE != 0 || size < MIN_BLOCK_SIZE {
          return Err(format!("block {:p} has illegal size {}", bp, size));
        }
        if block::get(block::header(bp)) != block::get(block::footer(bp)) {
          return Err(format!("block {:p} has mismatched tags", bp));
        }
        if !allocated {
          if prev_was_free {
            return Err(format!("adjacent free blocks at {:p}", bp));
          }
          free_blocks.push(bp);
        }

        prev_was_free = !allocated;
        bp = block::next_block(bp);
      }

      self.tree.validate()?;

      let mut indexed = Vec::new();
      self.tree.collect(&mut indexed);

      free_blocks.sort();
      indexed.sort();
      if free_blocks != indexed {
        return Err(format!(
          "index holds {} blocks but the heap has {} free blocks",
          indexed.len(),
          free_blocks.len(),
        ));
      }

      Ok(())
    }
  }

  /// Sum of the sizes of all free blocks.
  pub fn total_free_bytes(&self) -> usize {
    self.free_block_sizes().iter().sum()
  }

  /// Sizes of all free blocks, in physical order.
  pub(crate) fn free_block_sizes(&self) -> Vec<usize> {
    let mut sizes = Vec::new();

    unsafe {
      let mut bp = block::next_block(self.prologue);
      while block::block_size(bp) != 0 {
        if !block::is_allocated(bp) {
          sizes.push(block::block_size(bp));
        }
        bp = block::next_block(bp);
      }
    }

    sizes
  }
}

#[cfg(test)]
mod tests {
  use crate::block::{self, CHUNKSIZE};
  use crate::heap::Heap;
  use crate::provider::ArenaProvider;

  fn new_heap() -> Heap<ArenaProvider> {
    let arena = ArenaProvider::new(1 << 20).expect("arena mapping failed");
    Heap::new(arena).expect("heap initialization failed")
  }

  #[test]
  fn fresh_heap_passes_and_reports_the_chunk() {
    let heap = new_heap();

    heap.check().unwrap();
    assert_eq!(heap.total_free_bytes(), CHUNKSIZE);
  }

  #[test]
  fn clobbered_footer_is_reported() {
    let mut heap = new_heap();

    unsafe {
      let p = heap.malloc(64);
      assert!(!p.is_null());
      heap.check().unwrap();

      // Simulated overrun: stomp the footer without touching the header.
      block::put(block::footer(p), 0xDEAD_BEEF);

      let report = heap.check().unwrap_err();
      assert!(report.contains("mismatched tags"), "got: {}", report);
    }
  }

  #[test]
  fn clobbered_epilogue_is_reported() {
    let mut heap = new_heap();

    unsafe {
      let high = heap.heap_high();
      // Strip the allocated bit from the epilogue header.
      block::put(high.sub(4), 0);
    }

    assert!(heap.check().is_err());
  }
}
