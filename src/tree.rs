//! # Free-Block Index
//!
//! A red-black tree ordered by block size, used to answer best-fit queries
//! in O(log n). The tree spends no memory of its own: each node lives inside
//! the payload of the free block it represents, so the same bytes that hold
//! user data while a block is allocated hold the node while it is free.
//!
//! ```text
//!   Free block:
//!   ┌────────┬──────────┬──────────┬──────────┬───────┬─────────┬────────┐
//!   │ header │  parent  │   left   │  right   │ color │ (slack) │ footer │
//!   │  4 B   │   8 B    │   8 B    │   8 B    │  8 B  │         │  4 B   │
//!   └────────┴──────────┴──────────┴──────────┴───────┴─────────┴────────┘
//!            ▲
//!            └── payload pointer == node pointer
//! ```
//!
//! The node needs 32 bytes, which together with the boundary tags and 8-byte
//! alignment is why no block is ever smaller than 48 bytes.
//!
//! A single sentinel node stands in for every leaf and for the parent of the
//! root:
//!
//! ```text
//!                      ┌──────────┐
//!                      │ size 112 │ B
//!                      └──────────┘
//!                      ╱          ╲
//!             ┌──────────┐      ┌──────────┐
//!             │ size  56 │ R    │ size 136 │ R
//!             └──────────┘      └──────────┘
//!              ╱        ╲        ╱        ╲
//!            NIL        NIL    NIL        NIL
//! ```
//!
//! The sentinel comes from the host C allocator, never from this heap and
//! never from the Rust global allocator, so it cannot alias a block and the
//! tree keeps working while this crate *is* the program's global allocator.
//! Its color is BLACK and stays BLACK; its parent field is transiently
//! written during remove-fixup, which is fine because at most one removal
//! is ever in flight.
//!
//! Keys are block sizes read straight from block headers. Duplicate sizes
//! are common (every free chunk of a popular size), so equal keys are
//! allowed and an equal newcomer always descends to the right. Best-fit
//! breaks ties in favor of whichever equal candidate the descent meets
//! first, which keeps the policy deterministic.

use core::mem;
use core::ptr;

use libc::c_void;

use crate::block;

/// Node color.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Color {
  Red,
  Black,
}

/// Tree-node view of a free block's payload.
#[repr(C)]
pub(crate) struct Node {
  parent: *mut Node,
  left: *mut Node,
  right: *mut Node,
  color: Color,
}

// The node must fit between the boundary tags of a minimum-size block.
const _: () =
  assert!(core::mem::size_of::<Node>() + 2 * block::WSIZE <= block::MIN_BLOCK_SIZE);

/// The ordering key: the block's total size, read from its header.
///
/// # Safety
///
/// `x` must be the payload pointer of a block with an intact header.
unsafe fn key(x: *mut Node) -> usize {
  unsafe { block::block_size(x as *mut u8) }
}

/// The free-block index.
///
/// Owns only the sentinel; every other node is a view into a free block and
/// is handed over (or taken back) by the allocator as blocks change state.
pub(crate) struct RbTree {
  root: *mut Node,
  nil: *mut Node,
}

impl RbTree {
  /// Creates an empty tree with a freshly allocated sentinel, or `None`
  /// when the host allocator refuses the 32 bytes.
  pub(crate) fn new() -> Option<Self> {
    let nil = unsafe { libc::malloc(mem::size_of::<Node>()) } as *mut Node;
    if nil.is_null() {
      return None;
    }

    // The sentinel is black and is its own parent and child.
    unsafe {
      (*nil).parent = nil;
      (*nil).left = nil;
      (*nil).right = nil;
      (*nil).color = Color::Black;
    }

    Some(Self { root: nil, nil })
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.root == self.nil
  }

  /// Inserts the free block at `bp` into the index.
  ///
  /// The first 32 payload bytes of the block are overwritten with the node.
  /// Equal keys descend to the right.
  ///
  /// # Safety
  ///
  /// `bp` must be the payload pointer of a free block with an intact header
  /// that is not currently in the tree.
  pub(crate) unsafe fn insert(
    &mut self,
    bp: *mut u8,
  ) {
    let z = bp as *mut Node;

    unsafe {
      let mut y = self.nil;
      let mut x = self.root;

      while x != self.nil {
        y = x;
        x = if key(z) < key(x) { (*x).left } else { (*x).right };
      }

      (*z).parent = y;
      if y == self.nil {
        self.root = z;
      } else if key(z) < key(y) {
        (*y).left = z;
      } else {
        (*y).right = z;
      }

      (*z).left = self.nil;
      (*z).right = self.nil;
      (*z).color = Color::Red;

      self.insert_fixup(z);
    }
  }

  /// Removes the free block at `bp` from the index.
  ///
  /// # Safety
  ///
  /// `bp` must be the payload pointer of a block currently in the tree, and
  /// its header must still carry the size it was inserted under.
  pub(crate) unsafe fn remove(
    &mut self,
    bp: *mut u8,
  ) {
    let z = bp as *mut Node;

    unsafe {
      let mut y = z;
      let mut removed_color = (*y).color;
      let x;

      if (*z).left == self.nil {
        x = (*z).right;
        self.transplant(z, (*z).right);
      } else if (*z).right == self.nil {
        x = (*z).left;
        self.transplant(z, (*z).left);
      } else {
        y = self.minimum((*z).right);
        removed_color = (*y).color;
        x = (*y).right;
        if (*y).parent == z {
          // x may be the sentinel here; its parent is patched so that
          // remove_fixup can climb from it.
          (*x).parent = y;
        } else {
          self.transplant(y, (*y).right);
          (*y).right = (*z).right;
          (*(*y).right).parent = y;
        }
        self.transplant(z, y);
        (*y).left = (*z).left;
        (*(*y).left).parent = y;
        (*y).color = (*z).color;
      }

      if removed_color == Color::Black {
        self.remove_fixup(x);
      }
    }
  }

  /// Returns the payload pointer of the smallest free block whose size is at
  /// least `asize`, or null when no block fits.
  ///
  /// # Safety
  ///
  /// Every node in the tree must still carry an intact header.
  pub(crate) unsafe fn best_fit(
    &self,
    asize: usize,
  ) -> *mut u8 {
    let best = unsafe { self.best_fit_from(self.root, asize, self.nil) };

    if best == self.nil {
      ptr::null_mut()
    } else {
      best as *mut u8
    }
  }

  /// Recursive best-fit descent: a fitting node narrows the search to its
  /// left subtree, a too-small node sends it right.
  unsafe fn best_fit_from(
    &self,
    x: *mut Node,
    asize: usize,
    best: *mut Node,
  ) -> *mut Node {
    if x == self.nil {
      return best;
    }

    unsafe {
      if key(x) >= asize {
        let best = if best == self.nil || key(x) < key(best) { x } else { best };
        self.best_fit_from((*x).left, asize, best)
      } else {
        self.best_fit_from((*x).right, asize, best)
      }
    }
  }

  unsafe fn minimum(
    &self,
    mut x: *mut Node,
  ) -> *mut Node {
    unsafe {
      while (*x).left != self.nil {
        x = (*x).left;
      }
    }
    x
  }

  /// Replaces the subtree rooted at `u` with the subtree rooted at `v`.
  unsafe fn transplant(
    &mut self,
    u: *mut Node,
    v: *mut Node,
  ) {
    unsafe {
      if (*u).parent == self.nil {
        self.root = v;
      } else if u == (*(*u).parent).left {
        (*(*u).parent).left = v;
      } else {
        (*(*u).parent).right = v;
      }
      // Unconditional on purpose: when v is the sentinel this records the
      // parent remove_fixup starts climbing from.
      (*v).parent = (*u).parent;
    }
  }

  unsafe fn rotate_left(
    &mut self,
    x: *mut Node,
  ) {
    unsafe {
      let y = (*x).right;

      (*x).right = (*y).left;
      if (*y).left != self.nil {
        (*(*y).left).parent = x;
      }

      (*y).parent = (*x).parent;
      if (*x).parent == self.nil {
        self.root = y;
      } else if x == (*(*x).parent).left {
        (*(*x).parent).left = y;
      } else {
        (*(*x).parent).right = y;
      }

      (*y).left = x;
      (*x).parent = y;
    }
  }

  unsafe fn rotate_right(
    &mut self,
    x: *mut Node,
  ) {
    unsafe {
      let y = (*x).left;

      (*x).left = (*y).right;
      if (*y).right != self.nil {
        (*(*y).right).parent = x;
      }

      (*y).parent = (*x).parent;
      if (*x).parent == self.nil {
        self.root = y;
      } else if x == (*(*x).parent).right {
        (*(*x).parent).right = y;
      } else {
        (*(*x).parent).left = y;
      }

      (*y).right = x;
      (*x).parent = y;
    }
  }

  unsafe fn insert_fixup(
    &mut self,
    mut z: *mut Node,
  ) {
    unsafe {
      while (*(*z).parent).color == Color::Red {
        let p = (*z).parent;
        let g = (*p).parent;

        if p == (*g).left {
          let uncle = (*g).right;
          if (*uncle).color == Color::Red {
            (*p).color = Color::Black;
            (*uncle).color = Color::Black;
            (*g).color = Color::Red;
            z = g;
          } else {
            if z == (*p).right {
              z = p;
              self.rotate_left(z);
            }
            let p = (*z).parent;
            let g = (*p).parent;
            (*p).color = Color::Black;
            (*g).color = Color::Red;
            self.rotate_right(g);
          }
        } else {
          let uncle = (*g).left;
          if (*uncle).color == Color::Red {
            (*p).color = Color::Black;
            (*uncle).color = Color::Black;
            (*g).color = Color::Red;
            z = g;
          } else {
            if z == (*p).left {
              z = p;
              self.rotate_right(z);
            }
            let p = (*z).parent;
            let g = (*p).parent;
            (*p).color = Color::Black;
            (*g).color = Color::Red;
            self.rotate_left(g);
          }
        }
      }

      (*self.root).color = Color::Black;
    }
  }

  unsafe fn remove_fixup(
    &mut self,
    mut x: *mut Node,
  ) {
    unsafe {
      while x != self.root && (*x).color == Color::Black {
        if x == (*(*x).parent).left {
          let mut w = (*(*x).parent).right;

          if (*w).color == Color::Red {
            (*w).color = Color::Black;
            (*(*x).parent).color = Color::Red;
            self.rotate_left((*x).parent);
            w = (*(*x).parent).right;
          }

          if (*(*w).left).color == Color::Black && (*(*w).right).color == Color::Black {
            (*w).color = Color::Red;
            x = (*x).parent;
          } else {
            if (*(*w).right).color == Color::Black {
              (*(*w).left).color = Color::Black;
              (*w).color = Color::Red;
              self.rotate_right(w);
              w = (*(*x).parent).right;
            }
            (*w).color = (*(*x).parent).color;
            (*(*x).parent).color = Color::Black;
            (*(*w).right).color = Color::Black;
            self.rotate_left((*x).parent);
            x = self.root;
          }
        } else {
          let mut w = (*(*x).parent).left;

          if (*w).color == Color::Red {
            (*w).color = Color::Black;
            (*(*x).parent).color = Color::Red;
            self.rotate_right((*x).parent);
            w = (*(*x).parent).left;
          }

          if (*(*w).right).color == Color::Black && (*(*w).left).color == Color::Black {
            (*w).color = Color::Red;
            x = (*x).parent;
          } else {
            if (*(*w).left).color == Color::Black {
              (*(*w).right).color = Color::Black;
              (*w).color = Color::Red;
              self.rotate_left(w);
              w = (*(*x).parent).left;
            }
            (*w).color = (*(*x).parent).color;
            (*(*x).parent).color = Color::Black;
            (*(*w).left).color = Color::Black;
            self.rotate_right((*x).parent);
            x = self.root;
          }
        }
      }

      (*x).color = Color::Black;
    }
  }

  /// Checks the red-black and ordering invariants.
  ///
  /// Reports the first violation found: a non-black sentinel or root, a red
  /// node with a red child, a parent/child link mismatch, keys out of
  /// order, or subtrees of unequal black-height.
  ///
  /// # Safety
  ///
  /// Every node in the tree must still carry an intact header.
  pub(crate) unsafe fn validate(&self) -> Result<(), String> {
    unsafe {
      if (*self.nil).color != Color::Black {
        return Err("sentinel is not black".to_string());
      }
      if (*self.root).color != Color::Black {
        return Err("root is not black".to_string());
      }
      self.validate_from(self.root).map(|_| ())
    }
  }

  /// Returns the black-height of the subtree rooted at `x`.
  unsafe fn validate_from(
    &self,
    x: *mut Node,
  ) -> Result<usize, String> {
    if x == self.nil {
      return Ok(1);
    }

    unsafe {
      let left = (*x).left;
      let right = (*x).right;

      if (*x).color == Color::Red
        && ((*left).color == Color::Red || (*right).color == Color::Red)
      {
        return Err(format!("red node {:p} has a red child", x));
      }
      if left != self.nil && (*left).parent != x {
        return Err(format!("left child of {:p} has a wrong parent link", x));
      }
      if right != self.nil && (*right).parent != x {
        return Err(format!("right child of {:p} has a wrong parent link", x));
      }
      if left != self.nil && key(left) > key(x) {
        return Err(format!("left child of {:p} has a larger key", x));
      }
      if right != self.nil && key(right) < key(x) {
        return Err(format!("right child of {:p} has a smaller key", x));
      }

      let lh = self.validate_from(left)?;
      let rh = self.validate_from(right)?;
      if lh != rh {
        return Err(format!("black-height mismatch at {:p}: {} vs {}", x, lh, rh));
      }

      Ok(lh + ((*x).color == Color::Black) as usize)
    }
  }

  /// Collects the payload pointers of every node, in key order.
  ///
  /// # Safety
  ///
  /// The tree structure must be intact.
  pub(crate) unsafe fn collect(
    &self,
    out: &mut Vec<*mut u8>,
  ) {
    unsafe { self.collect_from(self.root, out) }
  }

  unsafe fn collect_from(
    &self,
    x: *mut Node,
    out: &mut Vec<*mut u8>,
  ) {
    if x == self.nil {
      return;
    }
    unsafe {
      self.collect_from((*x).left, out);
      out.push(x as *mut u8);
      self.collect_from((*x).right, out);
    }
  }
}

impl Drop for RbTree {
  fn drop(&mut self) {
    // Block nodes live inside the managed region; only the sentinel is
    // owned by the tree itself.
    unsafe { libc::free(self.nil as *mut c_void) };
  }
}
