use std::{mem, ptr::NonNull};

/// Nullable non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// Header size of a block. The header precedes the payload of every block,
/// so any address handed to a caller sits exactly this many bytes after the
/// start of its block.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

/// Alignment unit for payload sizes.
///
/// Chosen as the size of the free-list link pair so that every payload,
/// however small the request was, can host the links once its block is
/// freed.
pub(crate) const ALIGNMENT: usize = mem::size_of::<FreeLinks>();

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(BLOCK_HEADER_SIZE % ALIGNMENT == 0);

/// This is the structure of a block header. The payload is placed right
/// after it:
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        | -> Header
/// |        prev         |        |
/// +---------------------+ <------+
/// |       Payload       |        |
/// |         ...         |        | -> Caller bytes while allocated,
/// |         ...         |        |    free-list links while free
/// |                     |        |
/// +---------------------+ <------+
/// ```
///
/// The sign of `size` doubles as the allocation state: a negative size
/// marks a free block, a positive one a block owned by a caller. The
/// magnitude is the payload capacity in bytes either way. Blocks with a
/// zero capacity never exist, the smallest payload is [`ALIGNMENT`] bytes.
///
/// `prev` points at the block immediately before this one in address
/// order. Together with the size arithmetic of the forward walk it forms
/// the full address-ordered view of the arena, which is what merging
/// decisions are made from.
#[repr(C)]
pub(crate) struct Block {
    /// Signed payload capacity. Negative while free, positive once
    /// allocated.
    pub size: isize,
    /// Block immediately preceding this one in address order, `None` for
    /// the first block of the arena.
    pub prev: Link<Block>,
}

/// Free-list links of a free block.
///
/// These live in the first bytes of the payload, not in the header. An
/// allocated payload belongs to the caller, so the links are only valid
/// while the block is free and must be released before the block leaves
/// the free list.
#[repr(C)]
pub(crate) struct FreeLinks {
    /// Next free block, in insertion order.
    pub next_free: Link<Block>,
    /// Previous free block, `None` at the list head.
    pub prev_free: Link<Block>,
}

impl Block {
    /// Payload capacity in bytes, regardless of allocation state.
    pub(crate) fn capacity(&self) -> usize {
        self.size.unsigned_abs()
    }

    pub(crate) fn is_free(&self) -> bool {
        self.size < 0
    }

    /// Payload address of `block`, the address callers get to use.
    ///
    /// **SAFETY**: `block` must point at a live block header inside the
    /// arena.
    pub(crate) unsafe fn payload(block: NonNull<Block>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(BLOCK_HEADER_SIZE)) }
    }

    /// Recovers the owning block of a payload address previously produced
    /// by [`Block::payload`].
    ///
    /// **SAFETY**: `payload` must be an address handed out by this
    /// allocator, anything else lands on bytes that are not a header.
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Block> {
        unsafe { NonNull::new_unchecked(payload.as_ptr().sub(BLOCK_HEADER_SIZE).cast::<Block>()) }
    }

    /// Free-list links of `block`, living in its payload.
    ///
    /// **SAFETY**: `block` must be free. The payload of an allocated block
    /// belongs to the caller and must not be reinterpreted as links.
    pub(crate) unsafe fn free_links<'a>(block: NonNull<Block>) -> &'a mut FreeLinks {
        unsafe {
            debug_assert!(block.as_ref().is_free());
            &mut *Self::payload(block).as_ptr().cast::<FreeLinks>()
        }
    }
}
