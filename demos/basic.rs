//! Walks through a small allocate/release session. Run with
//! `RUST_LOG=debug` to see the heap dumps.

use brkalloc::Heap;

fn main() {
    env_logger::init();

    let mut heap = Heap::new();

    let a = heap.allocate(24);
    println!("Requested 24 bytes, received {a:?}");

    let b = heap.allocate(100);
    println!("Requested 100 bytes, received {b:?}");

    heap.examine();

    unsafe {
        heap.release(a);
        heap.release(b);
    }
    println!("Released both, free blocks: {}", heap.free_blocks());

    heap.examine();
    assert_eq!(heap.check(), 0);

    // The freed span is reused for the next request that fits.
    let c = heap.allocate(32);
    println!("Requested 32 bytes, received {c:?}");
    assert_eq!(c, a);
}
