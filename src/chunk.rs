//! Chunk headers.
//!
//! Every pointer handed out by a pool is immediately preceded by one 64-bit
//! header word. The word is bit-packed so that, from a bare pointer, we can
//! recover which strategy serviced it and, for chunks carved out of a shared
//! block, the block and the size class:
//!
//! ```text
//!  63                         34 33                        5   4   3      0
//! +-----------------------------+---------------------------+-----+--------+
//! |   block offset (30 bits)    |      value (30 bits)      | ext | method |
//! +-----------------------------+---------------------------+-----+--------+
//! ```
//!
//! The block offset and the value share bit 34: offsets are always even, so
//! the offset's lowest bit is never stored. External (large) chunks keep a
//! magic pattern in every bit above the external flag instead.

use std::{fmt, mem, ptr::NonNull};

/// Number of header bits used to identify the strategy that owns a chunk.
pub(crate) const METHOD_ID_BITS: u32 = 4;
const METHOD_ID_MASK: u64 = (1 << METHOD_ID_BITS) - 1;

/// Largest value that can be stored in the value field of a chunk header.
pub const MAX_CHUNK_VALUE: usize = 0x3FFF_FFFF;

/// Largest distance in bytes between a chunk and the start of its block.
/// Pools cannot be configured with blocks larger than this.
pub const MAX_BLOCK_OFFSET: usize = 0x3FFF_FFFF;

const BLOCK_OFFSET_MASK: u64 = 0x3FFF_FFFE;

const EXTERNAL_BASEBIT: u32 = METHOD_ID_BITS;
const VALUE_BASEBIT: u32 = EXTERNAL_BASEBIT + 1;
const BLOCK_OFFSET_BASEBIT: u32 = VALUE_BASEBIT + 29;

/// Stored in the free bits of external chunks.
const CHUNK_MAGIC: u64 = 0xB1A8_DB85_8EB6_EFBA >> VALUE_BASEBIT << VALUE_BASEBIT;

/// Identifies the strategy (method table) that serviced a chunk.
///
/// Ids whose bit patterns are common in garbage are reserved: `0` shows up in
/// never-used memory, `1` and `2` in chunks from glibc's malloc and `15` in
/// wiped memory. Freeing a pointer carrying one of those ids dispatches to a
/// bogus method table that refuses to touch it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(u8);

impl MethodId {
    pub const RESERVED_UNUSED_MEMORY: MethodId = MethodId(0);
    pub const RESERVED_GLIBC: MethodId = MethodId(1);
    pub const RESERVED_GLIBC_LARGE: MethodId = MethodId(2);
    pub const ALLOC_SET: MethodId = MethodId(3);
    pub const RESERVED_WIPED_MEMORY: MethodId = MethodId(15);

    /// Number of distinct ids the header can encode.
    pub const COUNT: usize = 1 << METHOD_ID_BITS;

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    const fn from_bits(bits: u64) -> MethodId {
        MethodId((bits & METHOD_ID_MASK) as u8)
    }
}

impl fmt::Debug for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodId({})", self.0)
    }
}

/// A decoded view of a [`ChunkHeader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    /// The chunk owns a dedicated block.
    Large,
    /// The chunk was carved out of a shared block.
    Normal { value: usize, block_offset: usize },
}

/// The header word that precedes every chunk.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ChunkHeader(u64);

impl ChunkHeader {
    /// Encodes a chunk living `block_offset` bytes after the start of its block.
    ///
    /// `block_offset` must be even and `<= MAX_BLOCK_OFFSET`; `value` must be
    /// `<= MAX_CHUNK_VALUE`.
    #[inline]
    pub fn normal(block_offset: usize, value: usize, method: MethodId) -> Self {
        debug_assert!(block_offset & BLOCK_OFFSET_MASK as usize == block_offset);
        debug_assert!(value <= MAX_CHUNK_VALUE);

        Self(
            ((block_offset as u64) << BLOCK_OFFSET_BASEBIT)
                | ((value as u64) << VALUE_BASEBIT)
                | method.0 as u64,
        )
    }

    /// Encodes the chunk at address `chunk` of the block starting at `block`.
    #[inline]
    pub fn between(block: usize, chunk: usize, value: usize, method: MethodId) -> Self {
        debug_assert!(chunk >= block);

        Self::normal(chunk - block, value, method)
    }

    /// Encodes a chunk that occupies a dedicated block.
    #[inline]
    pub fn large(method: MethodId) -> Self {
        Self(CHUNK_MAGIC | (1 << EXTERNAL_BASEBIT) | method.0 as u64)
    }

    #[inline]
    pub fn method_id(self) -> MethodId {
        MethodId::from_bits(self.0)
    }

    #[inline]
    pub fn is_large(self) -> bool {
        self.0 & (1 << EXTERNAL_BASEBIT) != 0
    }

    /// Whether the bits above the external flag hold the large-chunk magic.
    #[inline]
    pub fn has_magic(self) -> bool {
        self.0 >> VALUE_BASEBIT << VALUE_BASEBIT == CHUNK_MAGIC
    }

    /// The value field (for the allocation set, the size class). Only valid
    /// for normal chunks.
    #[inline]
    pub fn value(self) -> usize {
        debug_assert!(!self.is_large());
        ((self.0 >> VALUE_BASEBIT) & MAX_CHUNK_VALUE as u64) as usize
    }

    /// Distance from the start of the block to the chunk. Only valid for
    /// normal chunks.
    #[inline]
    pub fn block_offset(self) -> usize {
        debug_assert!(!self.is_large());
        ((self.0 >> BLOCK_OFFSET_BASEBIT) & BLOCK_OFFSET_MASK) as usize
    }

    /// Address of the block holding the chunk at address `chunk`. Only valid
    /// for normal chunks.
    #[inline]
    pub fn block_address(self, chunk: usize) -> usize {
        chunk - self.block_offset()
    }

    pub fn kind(self) -> ChunkKind {
        if self.is_large() {
            ChunkKind::Large
        } else {
            ChunkKind::Normal {
                value: self.value(),
                block_offset: self.block_offset(),
            }
        }
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ChunkHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkHeader")
            .field("method", &self.method_id())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Metadata placed right before the memory handed to the caller. The header
/// word must stay the last field: dispatch reads the `u64` just before the
/// user pointer.
#[repr(C)]
pub(crate) struct Chunk {
    /// Size the caller asked for, or [`INVALID_ALLOC_SIZE`] while on a freelist.
    #[cfg(feature = "checking")]
    pub requested_size: usize,
    pub header: ChunkHeader,
}

/// Overhead in front of every chunk.
pub const CHUNK_HEADER_SIZE: usize = mem::size_of::<Chunk>();

/// Marks a chunk sitting on a freelist in the checking build.
#[cfg(feature = "checking")]
pub(crate) const INVALID_ALLOC_SIZE: usize = usize::MAX;

impl Chunk {
    /// Chunk metadata of a pointer previously returned by a pool.
    #[inline]
    pub unsafe fn from_pointer(ptr: NonNull<u8>) -> NonNull<Chunk> {
        unsafe { ptr.sub(CHUNK_HEADER_SIZE).cast() }
    }

    /// The user pointer of a chunk.
    #[inline]
    pub fn pointer(chunk: NonNull<Chunk>) -> NonNull<u8> {
        unsafe { chunk.cast::<u8>().add(CHUNK_HEADER_SIZE) }
    }
}

/// Reads the method id stored in the header word just before `ptr`.
///
/// **SAFETY**: the 8 bytes before `ptr` must be readable.
#[inline]
pub(crate) unsafe fn method_id_of(ptr: NonNull<u8>) -> MethodId {
    let header = unsafe { ptr.cast::<u64>().sub(1).read() };

    MethodId::from_bits(header)
}

/// Written right after the requested bytes of a chunk, in the checking build.
#[cfg(feature = "checking")]
const SENTINEL: u8 = 0x7E;

#[cfg(feature = "checking")]
pub(crate) unsafe fn set_sentinel(base: NonNull<u8>, offset: usize) {
    unsafe { base.add(offset).write(SENTINEL) }
}

#[cfg(feature = "checking")]
pub(crate) unsafe fn sentinel_ok(base: NonNull<u8>, offset: usize) -> bool {
    unsafe { base.add(offset).read() == SENTINEL }
}

/// Fills freed memory so stale reads stand out, in the checking build.
#[cfg(feature = "checking")]
pub(crate) unsafe fn wipe(base: NonNull<u8>, len: usize) {
    unsafe { base.write_bytes(0x7F, len) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn large_header_keeps_magic_and_method() {
        let header = ChunkHeader::large(MethodId::ALLOC_SET);

        assert!(header.is_large());
        assert!(header.has_magic());
        assert_eq!(header.method_id(), MethodId::ALLOC_SET);
        assert_eq!(header.kind(), ChunkKind::Large);
    }

    #[test]
    fn normal_header_is_not_large() {
        let header = ChunkHeader::normal(MAX_BLOCK_OFFSET & !1, MAX_CHUNK_VALUE, MethodId::ALLOC_SET);

        assert!(!header.is_large());
        assert!(!header.has_magic());
        assert_eq!(header.value(), MAX_CHUNK_VALUE);
        assert_eq!(header.block_offset(), MAX_BLOCK_OFFSET & !1);
        assert_eq!(header.method_id(), MethodId::ALLOC_SET);
    }

    #[test]
    fn header_word_is_last() {
        let mut chunk = Chunk {
            #[cfg(feature = "checking")]
            requested_size: 0,
            header: ChunkHeader::normal(64, 5, MethodId::ALLOC_SET),
        };

        let chunk = NonNull::from(&mut chunk);
        let ptr = Chunk::pointer(chunk);

        unsafe {
            assert_eq!(Chunk::from_pointer(ptr), chunk);
            assert_eq!(method_id_of(ptr), MethodId::ALLOC_SET);
        }
    }

    proptest! {
        #[test]
        fn normal_header_round_trip(
            block in (0usize..1 << 40).prop_map(|b| b * 8),
            offset in (0..=MAX_BLOCK_OFFSET / 8).prop_map(|o| o * 8),
            class in 0usize..11,
            method in 0u8..16,
        ) {
            let chunk = block + offset;
            let header = ChunkHeader::between(block, chunk, class, MethodId(method));

            prop_assert!(!header.is_large());
            prop_assert_eq!(header.block_address(chunk), block);
            prop_assert_eq!(header.value(), class);
            prop_assert_eq!(header.method_id(), MethodId(method));
        }
    }
}
