//! The allocation set: a pool strategy serving small requests from
//! power-of-two size classes carved out of ever larger blocks.
//!
//! A request goes through, in order:
//!
//! 1. a dedicated block, if it is larger than the pool's chunk limit;
//! 2. the freelist of its size class;
//! 3. the active block (the head of the block list), bumping its free pointer;
//! 4. a new block, after salvaging what is left of the active one into the
//!    freelists.
//!
//! Freed chunks go back to their freelist and are never returned to the
//! system individually. Only dedicated blocks are released on free; every
//! other block lives until the pool is reset or deleted.
//!
//! The pool's first allocation holds both the [`AllocSet`] header and the
//! keeper block:
//!
//! ```text
//! +------------------+----------------------+---------------------------+
//! | AllocSet         | BlockNode (keeper)   | Chunk | Chunk | ...       |
//! +------------------+----------------------+---------------------------+
//! ```
//!
//! The keeper is never released before the pool itself, so a pool that is
//! repeatedly reset and refilled with a little data never calls the system
//! allocator.

use std::{
    cmp,
    ptr::{self, NonNull},
};

#[cfg(feature = "checking")]
use crate::chunk::{self, INVALID_ALLOC_SIZE};
use crate::{
    block::{self, BLOCK_HEADER_SIZE, Block, BlockNode},
    check,
    chunk::{CHUNK_HEADER_SIZE, Chunk, ChunkHeader, MethodId},
    config::PoolConfig,
    context::{self, ContextMethods, MemoryContext},
    error::{PoolError, PoolResult},
    freelist::{CHUNK_LIMIT, FreeLists, MIN_BITS, NUM_FREELISTS, class_size, free_index},
    kernel,
    list::List,
    stats::MemoryContextCounters,
    utils::maxalign,
};

/// Largest request a pool accepts (1 GiB - 1).
pub const MAX_ALLOC_SIZE: usize = 0x3FFF_FFFF;

/// Chunks are at most 1/4 of a maximal block, less overhead.
const CHUNK_FRACTION: usize = 4;

/// A failed block request is retried at half the size down to this floor.
const MIN_RETRY_BLOCK_SIZE: usize = 1024 * 1024;

pub(crate) static ALLOC_SET_METHODS: ContextMethods = ContextMethods {
    alloc,
    free,
    realloc,
    reset,
    delete,
    get_chunk_context,
    get_chunk_space,
    is_empty,
    stats,
    check: check::check_alloc_set,
};

/// Allocation set header. The generic context header must be the first
/// field so a `MemoryContext` pointer can be cast to an `AllocSet` one.
#[repr(C)]
pub(crate) struct AllocSet {
    pub header: MemoryContext,
    /// Block list, active block first.
    pub blocks: List<Block>,
    pub freelists: FreeLists,
    pub init_block_size: usize,
    pub max_block_size: usize,
    pub next_block_size: usize,
    /// Requests above this get a dedicated block.
    pub alloc_chunk_limit: usize,
}

pub(crate) const ALLOC_SET_SIZE: usize = maxalign(std::mem::size_of::<AllocSet>());

/// The keeper block sits right after the set header.
#[inline]
pub(crate) fn keeper_block(set: NonNull<AllocSet>) -> NonNull<BlockNode> {
    unsafe { set.cast::<u8>().add(ALLOC_SET_SIZE).cast() }
}

/// Largest chunk served from the freelists of a pool whose blocks grow up to
/// `max_block_size`. Kept a power of two so that a stream of maximal chunks
/// wastes at most about 1/8 of a maximal block.
pub(crate) fn chunk_limit(max_block_size: usize) -> usize {
    let mut limit = CHUNK_LIMIT;

    while limit > 1 << MIN_BITS
        && limit + CHUNK_HEADER_SIZE > max_block_size.saturating_sub(BLOCK_HEADER_SIZE) / CHUNK_FRACTION
    {
        limit >>= 1;
    }

    limit
}

/// Creates an allocation set under `parent`. The header and the keeper block
/// are obtained with a single request to the system allocator.
pub(crate) fn create(
    parent: Option<NonNull<MemoryContext>>,
    name: &'static str,
    config: &PoolConfig,
) -> PoolResult<NonNull<MemoryContext>> {
    config.validate()?;

    let first_block_size = cmp::max(
        ALLOC_SET_SIZE + BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE,
        match config.min_context_size {
            0 => config.init_block_size,
            min => min,
        },
    );

    let base = unsafe { kernel::request_memory(first_block_size) }.ok_or_else(|| {
        log::warn!("out of memory: failed while creating memory pool \"{name}\"");
        PoolError::OutOfMemory {
            pool: name,
            size: first_block_size,
        }
    })?;

    let set = base.cast::<AllocSet>();
    let keeper = keeper_block(set);

    unsafe {
        let mut blocks = List::new();
        blocks.push_front(
            Block {
                set,
                free_ptr: block::data_start(keeper),
                end_ptr: base.add(first_block_size),
            },
            keeper.cast(),
        );

        let mut header = MemoryContext::new(MethodId::ALLOC_SET, name);
        header.mem_allocated = first_block_size;

        set.as_ptr().write(AllocSet {
            header,
            blocks,
            freelists: FreeLists::new(),
            init_block_size: config.init_block_size,
            max_block_size: config.max_block_size,
            next_block_size: config.init_block_size,
            alloc_chunk_limit: chunk_limit(config.max_block_size),
        });

        context::link_to_parent(set.cast(), parent);
    }

    log::debug!(
        "created memory pool \"{name}\" ({first_block_size} byte keeper, blocks {} to {} bytes)",
        config.init_block_size,
        config.max_block_size
    );

    Ok(set.cast())
}

/// Block holding a normal chunk, recovered from its header.
#[inline]
unsafe fn normal_chunk_block(chunk: NonNull<Chunk>, header: ChunkHeader) -> NonNull<BlockNode> {
    unsafe { chunk.cast::<u8>().sub(header.block_offset()).cast() }
}

/// A large chunk is always the first and only chunk of its block.
#[inline]
unsafe fn large_chunk_block(chunk: NonNull<Chunk>) -> NonNull<BlockNode> {
    unsafe { chunk.cast::<u8>().sub(BLOCK_HEADER_SIZE).cast() }
}

#[inline]
unsafe fn set_normal_header(node: NonNull<BlockNode>, chunk: NonNull<Chunk>, index: usize) {
    unsafe {
        (*chunk.as_ptr()).header = ChunkHeader::between(
            node.as_ptr() as usize,
            chunk.as_ptr() as usize,
            index,
            MethodId::ALLOC_SET,
        );
    }
}

#[cfg(feature = "checking")]
unsafe fn mark_allocated(chunk: NonNull<Chunk>, size: usize, chunk_size: usize) {
    unsafe {
        (*chunk.as_ptr()).requested_size = size;

        if size < chunk_size {
            chunk::set_sentinel(Chunk::pointer(chunk), size);
        }
    }
}

#[cfg(not(feature = "checking"))]
#[inline(always)]
unsafe fn mark_allocated(_: NonNull<Chunk>, _: usize, _: usize) {}

#[cfg(feature = "checking")]
unsafe fn mark_free(chunk: NonNull<Chunk>, chunk_size: usize) {
    unsafe {
        chunk::wipe(Chunk::pointer(chunk), chunk_size);
        (*chunk.as_ptr()).requested_size = INVALID_ALLOC_SIZE;
    }
}

#[cfg(not(feature = "checking"))]
#[inline(always)]
unsafe fn mark_free(_: NonNull<Chunk>, _: usize) {}

/// Warns if the caller scribbled past the requested size of `chunk`.
#[cfg(feature = "checking")]
unsafe fn verify_sentinel(set: NonNull<AllocSet>, chunk: NonNull<Chunk>, chunk_size: usize) {
    unsafe {
        let requested = (*chunk.as_ptr()).requested_size;

        if requested < chunk_size && !chunk::sentinel_ok(Chunk::pointer(chunk), requested) {
            log::warn!(
                "detected write past chunk end in {} {:p}",
                (*set.as_ptr()).header.name,
                chunk
            );
        }
    }
}

#[cfg(not(feature = "checking"))]
#[inline(always)]
unsafe fn verify_sentinel(_: NonNull<AllocSet>, _: NonNull<Chunk>, _: usize) {}

unsafe fn out_of_memory(set: NonNull<AllocSet>, size: usize) -> PoolError {
    let pool = unsafe { (*set.as_ptr()).header.name };
    log::warn!("out of memory: failed on request of size {size} in memory pool \"{pool}\"");

    PoolError::OutOfMemory { pool, size }
}

unsafe fn alloc(context: NonNull<MemoryContext>, size: usize) -> PoolResult<NonNull<u8>> {
    let set = context.cast::<AllocSet>();

    unsafe {
        let s = set.as_ptr();

        if size > (*s).alloc_chunk_limit {
            return alloc_large(set, size);
        }

        let index = free_index(size);
        let chunk_size = class_size(index);

        if let Some(chunk) = (*s).freelists.pop(index) {
            mark_allocated(chunk, size, chunk_size);
            return Ok(Chunk::pointer(chunk));
        }

        match (*s).blocks.first() {
            Some(active) if (*active.as_ptr()).data.remaining() >= chunk_size + CHUNK_HEADER_SIZE => {
                Ok(alloc_chunk_from_block(active, size, chunk_size, index))
            }
            _ => alloc_from_new_block(set, size, index),
        }
    }
}

/// Carves a chunk of class `index` out of `node`, which must have room for it.
#[inline]
unsafe fn alloc_chunk_from_block(
    node: NonNull<BlockNode>,
    size: usize,
    chunk_size: usize,
    index: usize,
) -> NonNull<u8> {
    unsafe {
        let chunk = (*node.as_ptr())
            .data
            .bump(chunk_size + CHUNK_HEADER_SIZE)
            .cast::<Chunk>();

        set_normal_header(node, chunk, index);
        mark_allocated(chunk, size, chunk_size);

        Chunk::pointer(chunk)
    }
}

/// Serves a request above the chunk limit with a block of its own.
#[cold]
unsafe fn alloc_large(set: NonNull<AllocSet>, size: usize) -> PoolResult<NonNull<u8>> {
    if size > MAX_ALLOC_SIZE {
        log::warn!("invalid memory allocation request size {size}");
        return Err(PoolError::InvalidAllocSize(size));
    }

    // Leave room for the sentinel byte in the checking build.
    #[cfg(feature = "checking")]
    let chunk_size = maxalign(size + 1);
    #[cfg(not(feature = "checking"))]
    let chunk_size = maxalign(size);

    unsafe {
        let s = set.as_ptr();

        let Some((base, mut block)) = Block::create(set, CHUNK_HEADER_SIZE + chunk_size) else {
            return Err(out_of_memory(set, size));
        };
        block.free_ptr = block.end_ptr;

        let block_size = BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE + chunk_size;
        (*s).header.mem_allocated += block_size;

        // Keep the active block at the front so its free space stays in use.
        let node = match (*s).blocks.first() {
            Some(active) => (*s).blocks.insert_after(active, block, base),
            None => (*s).blocks.push_front(block, base),
        };

        let chunk = block::data_start(node).cast::<Chunk>();
        (*chunk.as_ptr()).header = ChunkHeader::large(MethodId::ALLOC_SET);
        mark_allocated(chunk, size, chunk_size);

        log::trace!(
            "dedicated block of {block_size} bytes for a {size} byte request in memory pool \"{}\"",
            (*s).header.name
        );

        Ok(Chunk::pointer(chunk))
    }
}

/// Pushes whatever is left in `node` onto the freelists, largest classes
/// first. The active block is about to be pushed down the block list and
/// would never be allocated from again.
///
/// Only reached when less than one chunk of the requested class fits, so the
/// loop runs at most `NUM_FREELISTS - 1` times.
unsafe fn salvage_remaining(node: NonNull<BlockNode>) {
    unsafe {
        let block = &mut (*node.as_ptr()).data;
        let set = block.set.as_ptr();
        let mut available = block.remaining();

        while available >= (1 << MIN_BITS) + CHUNK_HEADER_SIZE {
            let mut chunk_size = available - CHUNK_HEADER_SIZE;
            let mut index = free_index(chunk_size);

            // free_index rounds up unless the space is an exact class size.
            if chunk_size != class_size(index) {
                index -= 1;
                chunk_size = class_size(index);
            }

            let chunk = block.bump(chunk_size + CHUNK_HEADER_SIZE).cast::<Chunk>();
            available -= chunk_size + CHUNK_HEADER_SIZE;

            set_normal_header(node, chunk, index);
            mark_free(chunk, chunk_size);
            (*set).freelists.push(index, chunk);
        }
    }
}

/// Salvages the active block, obtains the next block of the doubling schedule
/// and serves the request from it.
#[cold]
unsafe fn alloc_from_new_block(set: NonNull<AllocSet>, size: usize, index: usize) -> PoolResult<NonNull<u8>> {
    unsafe {
        let s = set.as_ptr();

        if let Some(active) = (*s).blocks.first() {
            salvage_remaining(active);
        }

        let mut block_size = (*s).next_block_size;
        (*s).next_block_size = cmp::min((*s).next_block_size << 1, (*s).max_block_size);

        let chunk_size = class_size(index);
        let required = chunk_size + BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE;
        while block_size < required {
            block_size <<= 1;
        }

        let mut base = kernel::request_memory(block_size);

        // Big blocks may fail under memory pressure: settle for smaller ones,
        // but not below 1 MiB or below what the request needs.
        while base.is_none() && block_size > MIN_RETRY_BLOCK_SIZE {
            block_size >>= 1;
            if block_size < required {
                break;
            }
            base = kernel::request_memory(block_size);
        }

        let Some(base) = base else {
            return Err(out_of_memory(set, size));
        };

        (*s).header.mem_allocated += block_size;

        let node = (*s).blocks.push_front(Block::spanning(set, base, block_size), base);

        log::trace!(
            "new block of {block_size} bytes in memory pool \"{}\"",
            (*s).header.name
        );

        Ok(alloc_chunk_from_block(node, size, chunk_size, index))
    }
}

unsafe fn free(ptr: NonNull<u8>) {
    unsafe {
        let chunk = Chunk::from_pointer(ptr);
        let header = (*chunk.as_ptr()).header;

        if header.is_large() {
            debug_assert!(header.has_magic());

            let node = large_chunk_block(chunk);
            let set = (*node.as_ptr()).data.set;
            let chunk_size = (*node.as_ptr()).data.end_ptr.as_ptr() as usize - ptr.as_ptr() as usize;
            verify_sentinel(set, chunk, chunk_size);

            let s = set.as_ptr();
            (*s).blocks.remove(node);
            (*s).header.mem_allocated -= block::block_size(node);
            block::release(node);
        } else {
            let node = normal_chunk_block(chunk, header);
            let set = (*node.as_ptr()).data.set;
            let index = header.value();
            debug_assert!(index < NUM_FREELISTS);

            verify_sentinel(set, chunk, class_size(index));
            mark_free(chunk, class_size(index));
            (*set.as_ptr()).freelists.push(index, chunk);
        }
    }
}

/// Chunks that already have room for `size` are returned as is (no shrink).
/// Other normal chunks move to a new chunk; large chunks are resized in
/// place with the system allocator.
unsafe fn realloc(ptr: NonNull<u8>, size: usize) -> PoolResult<NonNull<u8>> {
    unsafe {
        let chunk = Chunk::from_pointer(ptr);
        let header = (*chunk.as_ptr()).header;

        if header.is_large() {
            return realloc_large(chunk, size);
        }

        let node = normal_chunk_block(chunk, header);
        let set = (*node.as_ptr()).data.set;
        let old_chunk_size = class_size(header.value());
        verify_sentinel(set, chunk, old_chunk_size);

        if old_chunk_size >= size {
            mark_allocated(chunk, size, old_chunk_size);
            return Ok(ptr);
        }

        let new_ptr = alloc(set.cast(), size)?;

        #[cfg(feature = "checking")]
        let old_size = (*chunk.as_ptr()).requested_size;
        #[cfg(not(feature = "checking"))]
        let old_size = old_chunk_size;

        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size);
        free(ptr);

        Ok(new_ptr)
    }
}

unsafe fn realloc_large(chunk: NonNull<Chunk>, size: usize) -> PoolResult<NonNull<u8>> {
    if size > MAX_ALLOC_SIZE {
        log::warn!("invalid memory allocation request size {size}");
        return Err(PoolError::InvalidAllocSize(size));
    }

    #[cfg(feature = "checking")]
    let chunk_size = maxalign(size + 1);
    #[cfg(not(feature = "checking"))]
    let chunk_size = maxalign(size);

    unsafe {
        let node = large_chunk_block(chunk);
        let set = (*node.as_ptr()).data.set;
        let old_chunk_size =
            (*node.as_ptr()).data.end_ptr.as_ptr() as usize - Chunk::pointer(chunk).as_ptr() as usize;
        verify_sentinel(set, chunk, old_chunk_size);

        let block_size = BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE + chunk_size;
        let old_block_size = block::block_size(node);

        let Some(base) = kernel::resize_memory(node.cast(), old_block_size, block_size) else {
            return Err(out_of_memory(set, size));
        };

        let s = set.as_ptr();
        (*s).header.mem_allocated = (*s).header.mem_allocated - old_block_size + block_size;

        // The block has likely moved: fix its end and its neighbours' links.
        let node = base.cast::<BlockNode>();
        let end = base.add(block_size);
        (*node.as_ptr()).data.free_ptr = end;
        (*node.as_ptr()).data.end_ptr = end;
        (*s).blocks.relink_moved(node);

        let chunk = block::data_start(node).cast::<Chunk>();
        mark_allocated(chunk, size, chunk_size);

        Ok(Chunk::pointer(chunk))
    }
}

/// Gives every block but the keeper back to the system and empties the keeper.
unsafe fn reset(context: NonNull<MemoryContext>) {
    let set = context.cast::<AllocSet>();

    unsafe {
        #[cfg(feature = "checking")]
        check::check_alloc_set(context);

        let s = set.as_ptr();
        let keeper = keeper_block(set);

        (*s).freelists.clear();

        for node in (*s).blocks.nodes() {
            if node == keeper {
                (*node.as_ptr()).data.free_ptr = block::data_start(node);
            } else {
                (*s).header.mem_allocated -= block::block_size(node);
                block::release(node);
            }
        }

        (*s).blocks.reset_to(keeper);
        (*s).next_block_size = (*s).init_block_size;
    }
}

/// Gives every block back to the system, the keeper (and with it the set
/// header) last.
unsafe fn delete(context: NonNull<MemoryContext>) {
    let set = context.cast::<AllocSet>();

    unsafe {
        #[cfg(feature = "checking")]
        check::check_alloc_set(context);

        let s = set.as_ptr();
        let keeper = keeper_block(set);

        for node in (*s).blocks.nodes() {
            if node != keeper {
                (*s).header.mem_allocated -= block::block_size(node);
                block::release(node);
            }
        }

        let keeper_size = (*keeper.as_ptr()).data.end_ptr.as_ptr() as usize - s as usize;
        debug_assert_eq!((*s).header.mem_allocated, keeper_size);

        ptr::drop_in_place(s);
        kernel::return_memory(set.cast(), keeper_size);
    }
}

unsafe fn get_chunk_context(ptr: NonNull<u8>) -> Option<NonNull<MemoryContext>> {
    unsafe {
        let chunk = Chunk::from_pointer(ptr);
        let header = (*chunk.as_ptr()).header;

        let node = if header.is_large() {
            large_chunk_block(chunk)
        } else {
            normal_chunk_block(chunk, header)
        };

        Some((*node.as_ptr()).data.set.cast())
    }
}

/// Space taken by a chunk, header included.
unsafe fn get_chunk_space(ptr: NonNull<u8>) -> usize {
    unsafe {
        let chunk = Chunk::from_pointer(ptr);
        let header = (*chunk.as_ptr()).header;

        if header.is_large() {
            let node = large_chunk_block(chunk);
            (*node.as_ptr()).data.end_ptr.as_ptr() as usize - chunk.as_ptr() as usize
        } else {
            class_size(header.value()) + CHUNK_HEADER_SIZE
        }
    }
}

/// Only "new or just reset" counts as empty: freeing every chunk does not.
unsafe fn is_empty(context: NonNull<MemoryContext>) -> bool {
    unsafe { (*context.as_ptr()).is_reset }
}

unsafe fn stats(context: NonNull<MemoryContext>) -> MemoryContextCounters {
    let set = context.cast::<AllocSet>();

    unsafe {
        let s = set.as_ptr();

        let mut counters = MemoryContextCounters {
            totalspace: ALLOC_SET_SIZE,
            ..Default::default()
        };

        for node in (*s).blocks.nodes() {
            counters.nblocks += 1;
            counters.freespace += (*node.as_ptr()).data.remaining();
            counters.totalspace += if node == keeper_block(set) {
                (*node.as_ptr()).data.end_ptr.as_ptr() as usize - node.as_ptr() as usize
            } else {
                block::block_size(node)
            };
        }

        let (freechunks, freespace) = (*s).freelists.usage();
        counters.freechunks = freechunks;
        counters.freespace += freespace;

        counters
    }
}
