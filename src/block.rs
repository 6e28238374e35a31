//! # Block Layout and Boundary Tags
//!
//! Every block in the heap, allocated or free, carries a 4-byte header and a
//! 4-byte footer storing the same packed word: the block's total size with
//! the allocated flag in the low bit. Sizes are multiples of 8, so the low
//! three bits of the size are always zero and bit 0 is free for the flag.
//!
//! ```text
//!            ┌─────────────┬──────────────────────────────┬─────────────┐
//!            │   header    │           payload            │   footer    │
//!            │ size | a    │  user data (allocated) or    │ size | a    │
//!            │   4 bytes   │  tree node (free)            │   4 bytes   │
//!            └─────────────┴──────────────────────────────┴─────────────┘
//!            ▲             ▲                                            ▲
//!            │             │                                            │
//!          bp - 4          bp (payload pointer,                  bp + size - 8
//!                              8-byte aligned)
//! ```
//!
//! The duplicated footer is what makes coalescing O(1): the word just below
//! a block's header is the *previous* block's footer, so both physical
//! neighbors can be inspected without any global scan.
//!
//! ```text
//!   ...──┬────────┬─────────────────┬────────┬────────┬──────────────...
//!        │ footer │ <- prev block   │ header │payload │  <- this block
//!        └────────┴─────────────────┴────────┴────────┴──────────────...
//!                                   ▲
//!             prev footer = bp - 8  │  header = bp - 4
//! ```
//!
//! All helpers in this module take `bp`, the payload pointer, which is the
//! only pointer ever handed to callers of the allocator.

/// Header and footer width in bytes.
pub const WSIZE: usize = 4;

/// Payload alignment and size granule in bytes.
pub const DSIZE: usize = 8;

/// Default heap extension step. Growing in 4 KiB chunks amortizes the cost
/// of provider calls over many small allocations.
pub const CHUNKSIZE: usize = 4096;

/// Smallest legal block: header and footer plus enough payload to host an
/// embedded tree node once the block is freed.
pub const MIN_BLOCK_SIZE: usize = 48;

/// Largest representable block. Tags are 32-bit words, so a block size must
/// fit in one with the low bits clear.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX & !7u32) as usize;

/// Packs a block size and an allocated flag into a tag word.
pub(crate) fn pack(
  size: usize,
  allocated: bool,
) -> u32 {
  size as u32 | allocated as u32
}

/// Reads the tag word at `p`.
///
/// # Safety
///
/// `p` must point at a readable, 4-byte-aligned tag word inside the heap.
pub(crate) unsafe fn get(p: *const u8) -> u32 {
  unsafe { (p as *const u32).read() }
}

/// Writes the tag word at `p`.
///
/// # Safety
///
/// `p` must point at a writable, 4-byte-aligned tag word inside the heap.
pub(crate) unsafe fn put(
  p: *mut u8,
  word: u32,
) {
  unsafe { (p as *mut u32).write(word) }
}

/// Address of the header belonging to payload pointer `bp`.
///
/// # Safety
///
/// `bp` must be a payload pointer of a block in the heap.
pub(crate) unsafe fn header(bp: *mut u8) -> *mut u8 {
  unsafe { bp.sub(WSIZE) }
}

/// Total size of the block at `bp`, read from its header.
///
/// # Safety
///
/// `bp` must be a payload pointer of a block with an intact header.
pub(crate) unsafe fn block_size(bp: *mut u8) -> usize {
  unsafe { (get(header(bp)) & !7) as usize }
}

/// Whether the block at `bp` is allocated, read from its header.
///
/// # Safety
///
/// `bp` must be a payload pointer of a block with an intact header.
pub(crate) unsafe fn is_allocated(bp: *mut u8) -> bool {
  unsafe { get(header(bp)) & 1 != 0 }
}

/// Address of the footer belonging to payload pointer `bp`.
///
/// # Safety
///
/// `bp` must be a payload pointer of a block with an intact header.
pub(crate) unsafe fn footer(bp: *mut u8) -> *mut u8 {
  unsafe { bp.add(block_size(bp) - DSIZE) }
}

/// Payload pointer of the physically next block.
///
/// # Safety
///
/// `bp` must be a payload pointer of a block with an intact header, and the
/// next block must exist (the epilogue bounds every walk).
pub(crate) unsafe fn next_block(bp: *mut u8) -> *mut u8 {
  unsafe { bp.add(block_size(bp)) }
}

/// Payload pointer of the physically previous block, found through the
/// previous block's footer.
///
/// # Safety
///
/// `bp` must be a payload pointer of a block preceded by another block with
/// an intact footer (the prologue bounds every walk).
pub(crate) unsafe fn prev_block(bp: *mut u8) -> *mut u8 {
  unsafe { bp.sub((get(bp.sub(DSIZE)) & !7) as usize) }
}

/// Writes matching header and footer tags for the block at `bp`.
///
/// The footer position is derived from the `size` argument, not from the
/// current header, so this also resizes a block.
///
/// # Safety
///
/// `bp` must be a payload pointer with `size` writable bytes of block
/// storage behind it (header included).
pub(crate) unsafe fn write_tags(
  bp: *mut u8,
  size: usize,
  allocated: bool,
) {
  unsafe {
    put(header(bp), pack(size, allocated));
    put(bp.add(size - DSIZE), pack(size, allocated));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // Backing storage of u64 so payload pointers land on 8-byte boundaries
  // exactly as they do in a real heap.
  fn buffer() -> Vec<u64> {
    vec![0u64; 128]
  }

  #[test]
  fn pack_splits_into_size_and_flag() {
    assert_eq!(pack(48, false), 48);
    assert_eq!(pack(48, true), 49);
    assert_eq!(pack(4096, true) & !7, 4096);
    assert_eq!(pack(4096, true) & 1, 1);
  }

  #[test]
  fn tags_round_trip_through_header_and_footer() {
    let mut buf = buffer();
    let base = buf.as_mut_ptr() as *mut u8;

    unsafe {
      // First block starts right after a pad word, like the real layout.
      let bp = base.add(DSIZE);
      write_tags(bp, 64, true);

      assert_eq!(block_size(bp), 64);
      assert!(is_allocated(bp));
      assert_eq!(get(header(bp)), get(footer(bp)));

      write_tags(bp, 64, false);
      assert!(!is_allocated(bp));
      assert_eq!(get(header(bp)), get(footer(bp)));
    }
  }

  #[test]
  fn navigation_walks_physical_neighbors() {
    let mut buf = buffer();
    let base = buf.as_mut_ptr() as *mut u8;

    unsafe {
      let first = base.add(DSIZE);
      let second = first.add(48);
      let third = second.add(120);

      write_tags(first, 48, true);
      write_tags(second, 120, false);
      write_tags(third, 56, true);

      assert_eq!(next_block(first), second);
      assert_eq!(next_block(second), third);
      assert_eq!(prev_block(second), first);
      assert_eq!(prev_block(third), second);
    }
  }

  #[test]
  fn max_block_size_fits_a_tag_word() {
    assert_eq!(MAX_BLOCK_SIZE % DSIZE, 0);
    assert!(MAX_BLOCK_SIZE <= u32::MAX as usize);
    assert_eq!(pack(MAX_BLOCK_SIZE, true) & !7, MAX_BLOCK_SIZE as u32);
  }
}
