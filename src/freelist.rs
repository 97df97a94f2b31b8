use std::ptr::NonNull;

use crate::chunk::{CHUNK_HEADER_SIZE, Chunk};

/// The smallest chunk is `1 << MIN_BITS` bytes. It must be large enough to
/// store a [`FreeListLink`] and at least [`crate::utils::MAXIMUM_ALIGNOF`].
pub(crate) const MIN_BITS: u32 = 3;

/// Number of size classes, and therefore of freelists.
pub const NUM_FREELISTS: usize = 11;

/// Largest chunk served from a size class. Anything bigger gets a dedicated block.
pub const CHUNK_LIMIT: usize = 1 << (NUM_FREELISTS - 1 + MIN_BITS as usize);

const _: () = assert!(std::mem::size_of::<FreeListLink>() <= 1 << MIN_BITS);

/// Size in bytes of the chunks of size class `index`.
#[inline]
pub const fn class_size(index: usize) -> usize {
    (1 << MIN_BITS) << index
}

/// Size class that serves a request of `size` bytes: the smallest class whose
/// chunks are at least `size` bytes long. Requests up to 8 bytes, zero
/// included, land in class 0.
///
/// Caller must have checked that `size <= CHUNK_LIMIT`.
#[inline]
pub fn free_index(size: usize) -> usize {
    if size > 1 << MIN_BITS {
        // ceil(log2(size)) - MIN_BITS
        let index = (usize::BITS - (size - 1).leading_zeros() - MIN_BITS) as usize;
        debug_assert!(index < NUM_FREELISTS);
        index
    } else {
        0
    }
}

/// Stored in the payload of a free chunk, pointing to the next free chunk
/// of the same size class.
#[repr(C)]
struct FreeListLink {
    next: Option<NonNull<Chunk>>,
}

/// One singly linked list of free chunks per size class.
///
/// The lists don't own any storage. We use the payload of every free chunk
/// to keep the link to the next one, since the payload of a free chunk is
/// not used by anybody:
///
/// ```text
///      freelist[k]
///          |
///          v
/// +------------------+        +------------------+
/// |   ChunkHeader    |   +--> |   ChunkHeader    |
/// +------------------+   |    +------------------+
/// | next ------------|---+    | next = None      |
/// |  (unused bytes)  |        |  (unused bytes)  |
/// +------------------+        +------------------+
/// ```
///
/// Chunks are pushed and popped at the head, so reuse is LIFO.
pub(crate) struct FreeLists {
    heads: [Option<NonNull<Chunk>>; NUM_FREELISTS],
}

impl FreeLists {
    pub const fn new() -> Self {
        Self {
            heads: [None; NUM_FREELISTS],
        }
    }

    /// Forgets every free chunk.
    pub fn clear(&mut self) {
        self.heads = [None; NUM_FREELISTS];
    }

    #[inline]
    fn link(chunk: NonNull<Chunk>) -> NonNull<FreeListLink> {
        Chunk::pointer(chunk).cast()
    }

    /// Pushes `chunk` on top of the freelist of class `index`.
    ///
    /// **SAFETY**: `chunk` must be a chunk of class `index` no longer in use.
    #[inline]
    pub unsafe fn push(&mut self, index: usize, chunk: NonNull<Chunk>) {
        unsafe {
            Self::link(chunk).write(FreeListLink {
                next: self.heads[index],
            });
        }

        self.heads[index] = Some(chunk);
    }

    /// Takes the most recently freed chunk of class `index`, if any.
    #[inline]
    pub unsafe fn pop(&mut self, index: usize) -> Option<NonNull<Chunk>> {
        let chunk = self.heads[index]?;

        unsafe {
            self.heads[index] = Self::link(chunk).read().next;
        }

        Some(chunk)
    }

    /// Iterates over the free chunks of class `index`, most recent first.
    pub fn iter(&self, index: usize) -> impl Iterator<Item = NonNull<Chunk>> + '_ {
        let mut current = self.heads[index];

        std::iter::from_fn(move || {
            let chunk = current?;
            current = unsafe { Self::link(chunk).read().next };
            Some(chunk)
        })
    }

    /// Number of free chunks and the space they occupy, headers included.
    pub fn usage(&self) -> (usize, usize) {
        (0..NUM_FREELISTS).fold((0, 0), |(chunks, space), index| {
            let count = self.iter(index).count();
            (chunks + count, space + count * (class_size(index) + CHUNK_HEADER_SIZE))
        })
    }
}
