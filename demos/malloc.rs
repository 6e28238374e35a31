use std::io::Read;
use std::ptr;

use rbmalloc::{ArenaProvider, Heap, SbrkProvider, print_heap};

/// Waits until the user presses ENTER.
/// Useful when you want to inspect memory state with tools like `pmap`,
/// `htop`, `gdb`, or just visually track how the heap evolves.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

fn main() {
  // A heap growing the program break, exactly like a classic malloc.
  // All the steps below fit inside the initial 4 KiB chunk, so the break
  // moves once at startup and never again.
  let mut heap =
    Heap::new(SbrkProvider::new()).expect("the provider refused the initial chunk");

  unsafe {
    println!("[0] Fresh heap (PID = {})", std::process::id());
    print_heap(&heap);
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 1) Allocate 100 bytes and use them.
    // --------------------------------------------------------------------
    let a = heap.malloc(100);
    println!("\n[1] malloc(100) = {:?}", a);
    ptr::write_bytes(a, 0xAB, 100);
    println!("[1] Initialized the block with 0xAB");
    print_heap(&heap);
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 2) Two more allocations, so the first chunk splits repeatedly.
    // --------------------------------------------------------------------
    let b = heap.malloc(100);
    let c = heap.malloc(100);
    println!("\n[2] malloc(100) = {:?}, malloc(100) = {:?}", b, c);
    print_heap(&heap);
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 3) Free the middle block, punching a hole between a and c.
    // --------------------------------------------------------------------
    heap.free(b);
    println!("\n[3] free(middle block)");
    print_heap(&heap);
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 4) Allocate 80 bytes. Best fit prefers the 112-byte hole over the
    //    large tail of the chunk.
    // --------------------------------------------------------------------
    let d = heap.malloc(80);
    println!("\n[4] malloc(80) = {:?}", d);
    println!(
      "[4] d == old middle block? {}",
      if d == b {
        "Yes, the tightest hole was reused"
      } else {
        "No, it was placed somewhere else"
      }
    );
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 5) Grow the last allocation in place: the block after c is the free
    //    tail of the chunk, so no copy is needed.
    // --------------------------------------------------------------------
    let grown = heap.realloc(c, 300);
    println!("\n[5] realloc(last block, 300) = {:?}", grown);
    println!(
      "[5] grown == c? {}",
      if grown == c {
        "Yes, it grew into the free neighbor"
      } else {
        "No, it had to move"
      }
    );
    print_heap(&heap);
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 6) Free everything. Coalescing folds the heap back into one block.
    // --------------------------------------------------------------------
    heap.free(a);
    heap.free(d);
    heap.free(grown);
    println!("\n[6] Freed everything");
    print_heap(&heap);
    println!("[6] Consistency check: {:?}", heap.check());
    block_until_enter_pressed();
  }

  // ------------------------------------------------------------------------
  // 7) Exhaustion, demonstrated against a tiny private arena so the main
  //    heap is untouched: allocations fail cleanly once the 16 KiB are
  //    spent, and the heap stays intact.
  // ------------------------------------------------------------------------
  let arena = ArenaProvider::new(16 * 1024).expect("arena mapping failed");
  let mut small = Heap::new(arena).expect("heap initialization failed");

  unsafe {
    let mut count = 0;
    while !small.malloc(1024).is_null() {
      count += 1;
    }
    println!("\n[7] A 16 KiB arena served {} KiB allocations, then:", count);
    println!("[7] malloc(1024) = {:?}", small.malloc(1024));
    println!("[7] Consistency check: {:?}", small.check());
  }

  println!("\n[8] End of example. The OS reclaims everything on exit.");
}
