use std::ptr::NonNull;

use crate::block::{Block, Link};

/// Doubly-linked list of the free [`Block`]s.
///
/// Every block is already reachable by walking the arena in address order,
/// but an allocation only cares about free blocks, so we thread a second
/// list through just those. Searching then costs the number of free blocks
/// instead of the number of all blocks.
///
/// The list stores nothing of its own. The links live in the payload of
/// each free block, which is empty by definition:
///
/// ```text
/// +------------------------+ <--------+
/// |       size, prev       |          | -> Block header
/// +------------------------+ <--------+
/// |  next_free, prev_free  |          | -> Payload, repurposed as links
/// +------------------------+          |    while the block is free
/// |          ...           |          |
/// +------------------------+ <--------+
/// ```
///
/// Insertion is LIFO at the head. The list has no address or size order,
/// which means a first-fit search returns the most recently freed block
/// that fits.
pub(crate) struct FreeList {
    head: Link<Block>,
}

impl FreeList {
    /// Creates a new empty list.
    pub const fn new() -> Self {
        Self { head: None }
    }

    pub fn head(&self) -> Link<Block> {
        self.head
    }

    /// Number of blocks currently linked. Walks the list, diagnostics and
    /// tests only.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut current = self.head;
        while let Some(block) = current {
            count += 1;
            current = unsafe { Block::free_links(block).next_free };
        }
        count
    }

    /// Inserts `block` at the head of the list.
    ///
    /// Allocated blocks are ignored, their payload is not ours to write.
    ///
    /// **SAFETY**: `block` must point at a live block header and must not
    /// already be a member of the list.
    pub unsafe fn insert(&mut self, block: NonNull<Block>) {
        unsafe {
            if !block.as_ref().is_free() {
                return;
            }

            let links = Block::free_links(block);
            links.next_free = self.head;
            links.prev_free = None;

            if let Some(old_head) = self.head {
                Block::free_links(old_head).prev_free = Some(block);
            }

            self.head = Some(block);
        }
    }

    /// Detaches `block` from wherever it sits in the list, re-linking its
    /// neighbours, and clears the block's own links.
    ///
    /// **SAFETY**: `block` must currently be a member of the list. Callers
    /// track membership through the sign of the block size.
    pub unsafe fn remove(&mut self, block: NonNull<Block>) {
        unsafe {
            let links = Block::free_links(block);
            let next = links.next_free;
            let prev = links.prev_free;
            links.next_free = None;
            links.prev_free = None;

            match prev {
                Some(prev) => Block::free_links(prev).next_free = next,
                None => self.head = next,
            }

            if let Some(next) = next {
                Block::free_links(next).prev_free = prev;
            }
        }
    }

    /// Returns the first block with a capacity of at least `min_size`.
    ///
    /// This is the first-fit strategy: the scan stops at the first block
    /// that is big enough, it never looks for a tighter match.
    pub fn search(&self, min_size: usize) -> Link<Block> {
        let mut current = self.head;

        while let Some(block) = current {
            unsafe {
                if block.as_ref().capacity() >= min_size {
                    return Some(block);
                }
                current = Block::free_links(block).next_free;
            }
        }

        None
    }
}
