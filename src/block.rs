use std::ptr::NonNull;

use crate::{aset::AllocSet, kernel, list::Node, utils::maxalign};

/// Header size of a block. We need to add the overhead introduced by our
/// [`Node`] structure since we always use our `Block` as a node of the
/// pool's block list.
pub const BLOCK_HEADER_SIZE: usize = maxalign(std::mem::size_of::<Node<Block>>());

/// A block is the unit of memory a pool obtains from the system allocator.
/// The fields of the block are its metadata, chunks are carved after this
/// header by bumping `free_ptr` towards `end_ptr`.
///
/// The following diagram represents this structure ignoring that the block
/// will be wrapped inside a [`Node`]:
///
/// ```text
/// +---------------------+ <------+
/// |         set         |        |
/// +---------------------+        |
/// |      free_ptr       |        | -> Header
/// +---------------------+        |
/// |       end_ptr       |        |
/// +---------------------+ <------+
/// | Chunk | Chunk | ... |        |
/// +---------------------+ <- free_ptr
/// |                     |        | -> Unused space
/// |                     |        |
/// +---------------------+ <------+ end_ptr
/// ```
///
/// Invariant: `free_ptr <= end_ptr`.
pub(crate) struct Block {
    /// Pool that owns the block.
    pub set: NonNull<AllocSet>,
    /// First unused byte.
    pub free_ptr: NonNull<u8>,
    /// One past the last byte of the block.
    pub end_ptr: NonNull<u8>,
}

pub(crate) type BlockNode = Node<Block>;

impl Block {
    /// Requests room for `payload` bytes plus the block header from the system
    /// allocator. Returns the address the [`BlockNode`] must be written at,
    /// together with an empty block describing it, or `None` if the system
    /// allocator fails.
    pub unsafe fn create(set: NonNull<AllocSet>, payload: usize) -> Option<(NonNull<u8>, Block)> {
        let size = payload + BLOCK_HEADER_SIZE;

        unsafe {
            let base = kernel::request_memory(size)?;

            Some((base, Block::spanning(set, base, size)))
        }
    }

    /// Describes an empty block of `size` bytes, header included, starting at `base`.
    pub unsafe fn spanning(set: NonNull<AllocSet>, base: NonNull<u8>, size: usize) -> Block {
        unsafe {
            Block {
                set,
                free_ptr: base.add(BLOCK_HEADER_SIZE),
                end_ptr: base.add(size),
            }
        }
    }

    /// Bytes left between the free pointer and the end of the block.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end_ptr.as_ptr() as usize - self.free_ptr.as_ptr() as usize
    }

    /// Advances the free pointer by `n` bytes and returns its previous value.
    ///
    /// **SAFETY**: `n <= self.remaining()`.
    #[inline]
    pub unsafe fn bump(&mut self, n: usize) -> NonNull<u8> {
        debug_assert!(n <= self.remaining());

        let start = self.free_ptr;
        self.free_ptr = unsafe { start.add(n) };
        start
    }
}

/// First byte after the header of `node`.
#[inline]
pub(crate) fn data_start(node: NonNull<BlockNode>) -> NonNull<u8> {
    unsafe { node.cast::<u8>().add(BLOCK_HEADER_SIZE) }
}

/// Total size of the block, header included.
#[inline]
pub(crate) unsafe fn block_size(node: NonNull<BlockNode>) -> usize {
    unsafe { (*node.as_ptr()).data.end_ptr.as_ptr() as usize - node.as_ptr() as usize }
}

/// Gives the whole block back to the system allocator. The block must
/// already be unlinked (or its list discarded).
pub(crate) unsafe fn release(node: NonNull<BlockNode>) {
    unsafe {
        let size = block_size(node);
        kernel::return_memory(node.cast(), size);
    }
}
