//! Hierarchical memory pools.
//!
//! A [`MemoryPool`] hands out small, 8-byte aligned chunks carved from large
//! blocks it obtains from the system allocator. Chunks can be freed one by
//! one, but the point of a pool is freeing everything at once: resetting or
//! dropping a pool releases all of its chunks, and those of its child pools,
//! in one go.
//!
//! Small requests are rounded up to a power of two (8 bytes to
//! [`CHUNK_LIMIT`]) and freed chunks are kept on one freelist per size class.
//! Requests above the pool's chunk limit get a block of their own that goes
//! straight back to the system allocator when freed.
//!
//! Every chunk is preceded by an 8-byte [`ChunkHeader`] that records which
//! strategy owns it and where its block starts. That is what lets [`free`],
//! [`realloc`] and [`chunk_space`] work on a bare pointer.
//!
//! ```
//! use mempool::{MemoryPool, PoolConfig};
//!
//! let mut pool = MemoryPool::new("parser", PoolConfig::SMALL).unwrap();
//! let child = pool.child("tokens", PoolConfig::SMALL).unwrap();
//!
//! let ptr = child.alloc(24).unwrap();
//! let ptr = unsafe { mempool::realloc(ptr, 200).unwrap() };
//! assert!(unsafe { mempool::chunk_space(ptr) } >= 200);
//!
//! drop(child);
//! pool.reset();
//! assert!(pool.is_empty());
//! ```
//!
//! Pools are single-threaded: handles are neither `Send` nor `Sync`.
//!
//! Building with the `checking` feature records the requested size of every
//! chunk, writes a sentinel byte after it, wipes freed memory and runs the
//! consistency walk of [`MemoryPool::check`] on every reset and delete.

mod aset;
mod block;
mod check;
mod chunk;
mod config;
mod context;
mod error;
mod freelist;
mod kernel;
mod list;
mod pool;
mod stats;
mod utils;

pub use aset::MAX_ALLOC_SIZE;
pub use block::BLOCK_HEADER_SIZE;
pub use chunk::{CHUNK_HEADER_SIZE, ChunkHeader, ChunkKind, MAX_BLOCK_OFFSET, MAX_CHUNK_VALUE, MethodId};
pub use config::{DEFAULT_INIT_BLOCK_SIZE, DEFAULT_MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, PoolConfig};
pub use context::ResetCallback;
pub use error::{CheckIssue, PoolError, PoolResult};
pub use freelist::{CHUNK_LIMIT, NUM_FREELISTS, class_size, free_index};
pub use kernel::system_bytes_in_use;
pub use pool::{
    MemoryPool, chunk_space, free, pool_alloc, pool_alloc_zeroed, pool_create, pool_destroy, pool_free, realloc,
};
pub use stats::MemoryContextCounters;
pub use utils::{MAXIMUM_ALIGNOF, maxalign};
