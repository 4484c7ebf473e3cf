use std::ptr::{self, NonNull};

use log::{debug, error};

use crate::{
    arena::{exhausted, Arena, DEFAULT_RESERVE},
    block::{Block, FreeLinks, Link, ALIGNMENT, BLOCK_HEADER_SIZE},
    freelist::FreeList,
};

/// First-fit heap with splitting and coalescing over a single growable
/// arena.
///
/// The heap tracks its blocks through two views at once. The implicit
/// view walks the arena in address order, advancing by header plus
/// capacity from one block to the next, and is the ground truth for
/// merging decisions. The explicit [`FreeList`] threads only the free
/// blocks and is what allocation searches.
///
/// ```text
///              free list: head -> C -> A
///
/// +--------+--------+--------+--------+--------+
/// | A free | B used | C free | D used | E used |   address order
/// +--------+--------+--------+--------+--------+
/// lo                                          hi
/// ```
///
/// Two invariants tie the views together: a block is in the free list
/// exactly when its size is negative, and no two address-adjacent blocks
/// are ever both free, because releasing merges eagerly.
///
/// A `Heap` is an ordinary value. Several independent heaps can coexist,
/// each owns its arena and returns it to the OS when dropped. All
/// operations take `&mut self`, concurrent use needs an external lock
/// around the whole heap.
pub struct Heap {
    arena: Arena,
    free_list: FreeList,
    /// Last block in address order, `None` while the arena is empty.
    /// Growth appends behind it, merges may move it backwards.
    tail: Link<Block>,
}

// The heap owns every address it hands out, moving it to another thread
// moves the whole arena with it.
unsafe impl Send for Heap {}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Creates an empty heap with the default address space reservation.
    pub fn new() -> Self {
        Self::with_reserve(DEFAULT_RESERVE)
    }

    /// Creates an empty heap whose arena may grow up to `reserve` bytes.
    ///
    /// The reservation is address space, not memory. Pages are only
    /// backed once the arena grows over them, so a generous reservation
    /// costs nothing up front.
    pub fn with_reserve(reserve: usize) -> Self {
        Self {
            arena: Arena::new(reserve),
            free_list: FreeList::new(),
            tail: None,
        }
    }

    /// Hands out `size` bytes of memory and returns the payload address.
    ///
    /// A zero `size` returns null, which is a defined result and not an
    /// error. The payload capacity is `size` rounded up to [`ALIGNMENT`],
    /// and can be larger still when a free block fits but is too small to
    /// split.
    ///
    /// Terminates the process if the arena cannot grow to serve the
    /// request, see [`Arena::grow`].
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        // Round up so every payload can host the free links later on.
        let request = match size.checked_next_multiple_of(ALIGNMENT) {
            Some(request) if request <= isize::MAX as usize - BLOCK_HEADER_SIZE => request,
            _ => exhausted(size),
        };

        if let Some(mut block) = self.free_list.search(request) {
            unsafe {
                if block.as_ref().capacity() > request + BLOCK_HEADER_SIZE {
                    self.split(block, request);
                } else {
                    // The leftover would be too small to ever become a
                    // block of its own, hand the whole capacity over.
                    self.free_list.remove(block);
                    let freed = block.as_ref().size;
                    block.as_mut().size = -freed;
                }

                return Block::payload(block).as_ptr();
            }
        }

        // No free block fits. One growth request serves exactly this
        // allocation, the new block becomes the address-order tail.
        let block = self.arena.grow(request + BLOCK_HEADER_SIZE).cast::<Block>();
        unsafe {
            block.as_ptr().write(Block {
                size: request as isize,
                prev: self.tail,
            });
            self.tail = Some(block);

            Block::payload(block).as_ptr()
        }
    }

    /// Releases an allocation so its block can be reused.
    ///
    /// Passing null is a no-op. The freed block joins the free list and
    /// is immediately merged with a free neighbour on either side.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or an address returned by [`Heap::allocate`] on
    /// this same heap that has not been released since. Releasing a
    /// foreign pointer or releasing twice corrupts the heap.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };

        unsafe {
            let mut block = Block::from_payload(payload);

            if !block.as_ref().is_free() {
                let owned = block.as_ref().size;
                block.as_mut().size = -owned;
            }

            // The payload is ours again. Reset the link slots before the
            // list starts writing through them.
            *Block::free_links(block) = FreeLinks {
                next_free: None,
                prev_free: None,
            };

            self.free_list.insert(block);
            self.coalesce(block);
        }
    }

    /// Shrinks the free `block` to `keep` payload bytes for the caller
    /// and carves the leftover capacity into a new free block behind it.
    ///
    /// **SAFETY**: `block` must be in the free list, and its capacity
    /// must exceed `keep + BLOCK_HEADER_SIZE` so the remainder can hold a
    /// header and a minimum payload.
    unsafe fn split(&mut self, block: NonNull<Block>, keep: usize) {
        unsafe {
            let capacity = block.as_ref().capacity();
            debug_assert!(capacity > keep + BLOCK_HEADER_SIZE);

            self.free_list.remove(block);
            (*block.as_ptr()).size = keep as isize;

            let remainder = NonNull::new_unchecked(
                block
                    .as_ptr()
                    .cast::<u8>()
                    .add(BLOCK_HEADER_SIZE + keep)
                    .cast::<Block>(),
            );
            remainder.as_ptr().write(Block {
                size: -((capacity - BLOCK_HEADER_SIZE - keep) as isize),
                prev: Some(block),
            });
            self.free_list.insert(remainder);

            // The block that used to follow `block` now follows the
            // remainder, or the remainder is the new tail.
            match self.next_block(remainder) {
                Some(mut follower) => follower.as_mut().prev = Some(remainder),
                None => self.tail = Some(remainder),
            }
        }
    }

    /// Merges the just-freed `block` with a free structural successor
    /// and/or predecessor, at most one on each side.
    ///
    /// A successful merge on both sides folds a run of three blocks into
    /// one. The merged block keeps the lowest address of the run, so a
    /// backward merge continues under the predecessor's identity.
    ///
    /// **SAFETY**: `block` must be free and already inserted in the free
    /// list.
    unsafe fn coalesce(&mut self, block: NonNull<Block>) {
        unsafe {
            let mut block = block;

            if let Some(next) = self.next_block(block) {
                if next.as_ref().is_free() {
                    self.free_list.remove(next);
                    self.free_list.remove(block);

                    let merged =
                        block.as_ref().capacity() + BLOCK_HEADER_SIZE + next.as_ref().capacity();
                    (*block.as_ptr()).size = -(merged as isize);

                    match self.next_block(block) {
                        Some(mut follower) => follower.as_mut().prev = Some(block),
                        None => self.tail = Some(block),
                    }

                    self.free_list.insert(block);
                }
            }

            if let Some(prev) = block.as_ref().prev {
                if prev.as_ref().is_free() {
                    self.free_list.remove(block);
                    self.free_list.remove(prev);

                    let merged =
                        prev.as_ref().capacity() + BLOCK_HEADER_SIZE + block.as_ref().capacity();
                    block = prev;
                    (*block.as_ptr()).size = -(merged as isize);

                    match self.next_block(block) {
                        Some(mut follower) => follower.as_mut().prev = Some(block),
                        None => self.tail = Some(block),
                    }

                    self.free_list.insert(block);
                }
            }
        }
    }

    /// First block in address order, `None` while the arena is empty.
    fn first_block(&self) -> Link<Block> {
        if self.arena.size() == 0 {
            None
        } else {
            Some(self.arena.lo().cast::<Block>())
        }
    }

    /// Structural successor of `block`, `None` when `block` is the last
    /// block of the arena.
    ///
    /// This is the only way neighbours are discovered, and it never reads
    /// past the arena end: the candidate address is compared against the
    /// high bound before it is dereferenced.
    fn next_block(&self, block: NonNull<Block>) -> Link<Block> {
        let step = BLOCK_HEADER_SIZE + unsafe { block.as_ref().capacity() };
        let next = block.as_ptr().cast::<u8>().wrapping_add(step);

        if next >= self.arena.hi() {
            None
        } else {
            Some(unsafe { NonNull::new_unchecked(next.cast::<Block>()) })
        }
    }

    /// Current arena size in bytes.
    pub fn arena_size(&self) -> usize {
        self.arena.size()
    }

    /// Number of blocks sitting in the free list.
    pub fn free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Dumps the whole heap through `log::debug!`, one line per block,
    /// followed by the free-list chain.
    pub fn examine(&self) {
        debug!("====================================================");
        debug!(
            "arena: {:p}..{:p} ({:#x} bytes)",
            self.arena.lo(),
            self.arena.hi(),
            self.arena.size()
        );
        debug!("free list head: {:?}", self.free_list.head());
        debug!("tail: {:?}", self.tail);

        let mut current = self.first_block();
        while let Some(block) = current {
            unsafe {
                let header = block.as_ref();
                if header.is_free() {
                    let links = Block::free_links(block);
                    debug!(
                        "{:p}: {}\tFREE\tprev: {:?} next_free: {:?} prev_free: {:?}",
                        block, header.size, header.prev, links.next_free, links.prev_free
                    );
                } else {
                    debug!(
                        "{:p}: {}\tALLOCATED\tprev: {:?}",
                        block, header.size, header.prev
                    );
                }
            }
            current = self.next_block(block);
        }
        debug!("end of arena");

        let mut chain = String::from("free chain: head");
        let mut current = self.free_list.head();
        while let Some(block) = current {
            chain.push_str(&format!(" -> {block:p}"));
            current = unsafe { Block::free_links(block).next_free };
        }
        debug!("{chain}");
    }

    /// Validates the heap structure and returns the number of violations
    /// found, zero meaning the heap is consistent.
    ///
    /// The implicit walk checks every back link, that no two adjacent
    /// blocks are both free, that the traversal lands exactly on the
    /// arena end and that the cached tail is the real last block. The
    /// free-list walk then checks that every member is actually free,
    /// that the links are doubly consistent and non-circular, and that
    /// the list length matches the number of free blocks seen in address
    /// order.
    ///
    /// Violations are reported through `log::error!` and counted, never
    /// repaired. A nonzero result reflects an earlier bug, there is no
    /// rollback.
    pub fn check(&self) -> usize {
        let mut errors = 0;
        let mut free_count = 0;

        let mut last: Link<Block> = None;
        let mut last_was_free = false;
        let mut end = self.arena.lo().as_ptr();
        let mut current = self.first_block();
        while let Some(block) = current {
            unsafe {
                let header = block.as_ref();

                if header.prev != last {
                    error!(
                        "check: back link of {:p} is {:?}, expected {:?}",
                        block, header.prev, last
                    );
                    errors += 1;
                }

                if header.is_free() {
                    if last_was_free {
                        error!("check: adjacent free blocks, second one at {block:p}");
                        errors += 1;
                    }
                    free_count += 1;
                }
                last_was_free = header.is_free();

                end = block
                    .as_ptr()
                    .cast::<u8>()
                    .wrapping_add(BLOCK_HEADER_SIZE + header.capacity());
            }
            last = Some(block);
            current = self.next_block(block);
        }

        if end != self.arena.hi() {
            error!(
                "check: traversal ends at {:p}, arena ends at {:p}",
                end,
                self.arena.hi()
            );
            errors += 1;
        }
        if self.tail != last {
            error!(
                "check: cached tail is {:?}, last block in address order is {:?}",
                self.tail, last
            );
            errors += 1;
        }

        let mut seen = 0;
        let mut prev: Link<Block> = None;
        let mut current = self.free_list.head();
        while let Some(block) = current {
            unsafe {
                if !block.as_ref().is_free() {
                    error!("check: allocated block {block:p} linked in the free list");
                    errors += 1;
                    // Its payload belongs to a caller, the links are not
                    // readable. Stop the walk here.
                    break;
                }

                let links = Block::free_links(block);
                if links.prev_free != prev {
                    error!(
                        "check: free list of {:p} is not doubly consistent, prev_free is {:?}, expected {:?}",
                        block, links.prev_free, prev
                    );
                    errors += 1;
                }

                seen += 1;
                if seen > free_count {
                    error!("check: free list is longer than the free block count, likely circular");
                    errors += 1;
                    break;
                }

                prev = current;
                current = links.next_free;
            }
        }

        if seen != free_count {
            error!("check: free list has {seen} entries but {free_count} blocks are free");
            errors += 1;
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESERVE: usize = 1024 * 1024;

    fn heap() -> Heap {
        Heap::with_reserve(RESERVE)
    }

    #[test]
    fn zero_size_returns_null() {
        let mut heap = heap();

        assert!(heap.allocate(0).is_null());
        assert_eq!(heap.arena_size(), 0);
        assert_eq!(heap.check(), 0);
    }

    #[test]
    fn release_null_is_a_noop() {
        let mut heap = heap();

        unsafe { heap.release(ptr::null_mut()) };
        assert_eq!(heap.check(), 0);
    }

    #[test]
    fn allocation_grows_the_arena_by_one_block() {
        let mut heap = heap();

        let first = heap.allocate(8);
        assert!(!first.is_null());
        assert_eq!(heap.arena_size(), BLOCK_HEADER_SIZE + ALIGNMENT);
        assert_eq!(first as usize % ALIGNMENT, 0);

        let second = heap.allocate(8);
        assert_eq!(heap.arena_size(), 2 * (BLOCK_HEADER_SIZE + ALIGNMENT));
        assert_ne!(first, second);
        assert_eq!(heap.check(), 0);
    }

    #[test]
    fn payloads_do_not_overlap() {
        let mut heap = heap();

        let sizes = [1, 16, 17, 100, 256, 3];
        let ptrs: Vec<(*mut u8, usize)> = sizes
            .iter()
            .map(|&size| {
                let ptr = heap.allocate(size);
                assert!(!ptr.is_null());
                (ptr, size)
            })
            .collect();

        // Fill every payload, then verify none of the writes clobbered
        // another payload.
        for (index, &(ptr, size)) in ptrs.iter().enumerate() {
            unsafe { ptr.write_bytes(index as u8 + 1, size) };
        }
        for (index, &(ptr, size)) in ptrs.iter().enumerate() {
            for offset in 0..size {
                assert_eq!(unsafe { *ptr.add(offset) }, index as u8 + 1);
            }
        }

        assert_eq!(heap.check(), 0);
    }

    #[test]
    fn released_block_is_reused() {
        let mut heap = heap();

        let first = heap.allocate(64);
        unsafe { heap.release(first) };
        assert_eq!(heap.free_blocks(), 1);

        let second = heap.allocate(64);
        assert_eq!(first, second);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.check(), 0);
    }

    #[test]
    fn adjacent_releases_coalesce() {
        let mut heap = heap();

        let first = heap.allocate(8);
        let second = heap.allocate(8);

        unsafe { heap.release(first) };
        // Not merged yet, the neighbour is still allocated.
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.check(), 0);

        unsafe { heap.release(second) };
        // Both free and adjacent, one block spans both payloads plus the
        // reclaimed header.
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.check(), 0);

        let combined = 2 * ALIGNMENT + BLOCK_HEADER_SIZE;
        let reused = heap.allocate(combined);
        assert_eq!(reused, first);
        assert_eq!(heap.arena_size(), combined + BLOCK_HEADER_SIZE);
    }

    #[test]
    fn coalescing_collapses_runs_in_any_release_order() {
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in orders {
            let mut heap = heap();
            let ptrs = [heap.allocate(32), heap.allocate(32), heap.allocate(32)];

            for index in order {
                unsafe { heap.release(ptrs[index]) };
                assert_eq!(heap.check(), 0, "inconsistent after order {order:?}");
            }

            assert_eq!(heap.free_blocks(), 1, "run not collapsed for {order:?}");

            // The merged block spans all three payloads plus the two
            // reclaimed headers, and sits where the first block was.
            let combined = 3 * 32 + 2 * BLOCK_HEADER_SIZE;
            assert_eq!(heap.allocate(combined), ptrs[0]);
        }
    }

    #[test]
    fn splitting_reuses_a_larger_block() {
        let mut heap = heap();

        let big = heap.allocate(100);
        unsafe { heap.release(big) };

        // 100 rounds up to 112. The 8-byte request rounds to 16 and fits
        // with room for a remainder block, so the old address is reused
        // and the rest stays free.
        let small = heap.allocate(8);
        assert_eq!(small, big);
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.check(), 0);

        // The remainder holds what is left after the kept payload and
        // the new header, and serves an exact fit without growing.
        let grown = heap.arena_size();
        let remainder_capacity = 112 - ALIGNMENT - BLOCK_HEADER_SIZE;
        let rest = heap.allocate(remainder_capacity);
        assert_eq!(rest as usize, small as usize + ALIGNMENT + BLOCK_HEADER_SIZE);
        assert_eq!(heap.arena_size(), grown);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.check(), 0);
    }

    #[test]
    fn near_exact_fit_hands_out_the_whole_block() {
        let mut heap = heap();

        let big = heap.allocate(112);
        unsafe { heap.release(big) };

        // Splitting a 112-byte block for a 96-byte request would leave no
        // room for a remainder payload, the caller gets all 112 bytes.
        let reused = heap.allocate(96);
        assert_eq!(reused, big);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.check(), 0);

        // Releasing it again exposes the original capacity.
        unsafe { heap.release(reused) };
        assert_eq!(heap.allocate(112), big);
    }

    #[test]
    fn first_fit_prefers_the_most_recently_freed_block() {
        let mut heap = heap();

        // Alternate the candidates with guard allocations so the freed
        // blocks stay apart and cannot merge.
        let first = heap.allocate(48);
        let _guard1 = heap.allocate(16);
        let second = heap.allocate(48);
        let _guard2 = heap.allocate(16);

        unsafe {
            heap.release(first);
            heap.release(second);
        }
        assert_eq!(heap.free_blocks(), 2);

        // LIFO insertion means the last freed block is found first.
        assert_eq!(heap.allocate(48), second);
        assert_eq!(heap.allocate(48), first);
        assert_eq!(heap.check(), 0);
    }

    #[test]
    fn release_merges_into_a_single_span_across_the_heap() {
        let mut heap = heap();

        let ptrs: Vec<*mut u8> = (0..8).map(|_| heap.allocate(24)).collect();

        // Free every other block first, then the rest, so each release in
        // the second pass has at least one free neighbour to merge with.
        for chunk in ptrs.chunks(2) {
            unsafe { heap.release(chunk[1]) };
            assert_eq!(heap.check(), 0);
        }
        for chunk in ptrs.chunks(2) {
            unsafe { heap.release(chunk[0]) };
            assert_eq!(heap.check(), 0);
        }

        assert_eq!(heap.free_blocks(), 1);
    }

    #[test]
    fn growth_does_not_disturb_existing_payloads() {
        let mut heap = heap();

        let first = heap.allocate(64);
        unsafe { first.write_bytes(0xC4, 64) };

        for _ in 0..32 {
            heap.allocate(128);
        }

        for offset in 0..64 {
            assert_eq!(unsafe { *first.add(offset) }, 0xC4);
        }
        assert_eq!(heap.check(), 0);
    }
}
