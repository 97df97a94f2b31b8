use std::{marker::PhantomData, ptr::NonNull};

use crate::{
    aset::{self, AllocSet},
    config::PoolConfig,
    context::{self, MemoryContext},
    error::{CheckIssue, PoolResult},
    stats::MemoryContextCounters,
};

/// Owning handle of a pool.
///
/// Dropping the handle deletes the pool, its descendants and every chunk
/// allocated in them. A child handle borrows its parent, so a parent cannot
/// be dropped or reset while one of its children is still around.
///
/// Chunks are handed out as raw pointers. They stay valid until they are
/// freed, or until their pool is reset or dropped, whichever comes first.
///
/// ```
/// use mempool::{MemoryPool, PoolConfig};
///
/// let pool = MemoryPool::new("request", PoolConfig::DEFAULT).unwrap();
/// let ptr = pool.alloc_zeroed(64).unwrap();
///
/// unsafe {
///     assert_eq!(*ptr.as_ptr(), 0);
///     mempool::free(ptr);
/// }
/// ```
pub struct MemoryPool<'parent> {
    context: NonNull<MemoryContext>,
    _parent: PhantomData<&'parent MemoryContext>,
}

impl MemoryPool<'static> {
    /// Creates a root pool.
    pub fn new(name: &'static str, config: PoolConfig) -> PoolResult<Self> {
        Ok(Self {
            context: aset::create(None, name, &config)?,
            _parent: PhantomData,
        })
    }

    /// Creates a root pool with [`PoolConfig::DEFAULT`].
    pub fn with_defaults(name: &'static str) -> PoolResult<Self> {
        Self::new(name, PoolConfig::DEFAULT)
    }
}

impl<'parent> MemoryPool<'parent> {
    /// Creates a pool owned by this one. It is deleted together with this
    /// pool, or when it is reset.
    pub fn child(&self, name: &'static str, config: PoolConfig) -> PoolResult<MemoryPool<'_>> {
        Ok(MemoryPool {
            context: aset::create(Some(self.context), name, &config)?,
            _parent: PhantomData,
        })
    }

    /// Allocates `size` bytes, aligned to 8 bytes. The contents are
    /// unspecified. A zero `size` is valid and yields a distinct pointer.
    #[inline]
    pub fn alloc(&self, size: usize) -> PoolResult<NonNull<u8>> {
        unsafe { context::alloc(self.context, size) }
    }

    /// Like [`alloc`](Self::alloc), with the first `size` bytes zeroed.
    pub fn alloc_zeroed(&self, size: usize) -> PoolResult<NonNull<u8>> {
        unsafe { context::alloc_zeroed(self.context, size) }
    }

    /// Frees every chunk of the pool at once and deletes its children. Only
    /// the first block is kept, empty, for the allocations to come.
    pub fn reset(&mut self) {
        unsafe { context::reset(self.context) }
    }

    /// Registers `callback` to run once, right before the next reset or the
    /// deletion of this pool. Callbacks run in registration order.
    pub fn register_reset_callback<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        unsafe { context::register_reset_callback(self.context, Box::new(callback)) }
    }

    pub fn name(&self) -> &'static str {
        unsafe { (*self.context.as_ptr()).name }
    }

    /// Bytes obtained from the system allocator for this pool's blocks.
    pub fn mem_allocated(&self) -> usize {
        unsafe { context::mem_allocated(self.context, false) }
    }

    /// [`mem_allocated`](Self::mem_allocated) of this pool and all its descendants.
    pub fn total_mem_allocated(&self) -> usize {
        unsafe { context::mem_allocated(self.context, true) }
    }

    pub fn stats(&self) -> MemoryContextCounters {
        unsafe { context::stats(self.context) }
    }

    /// Counters of this pool and all its descendants added up. Each pool's
    /// own counters are logged at debug level.
    pub fn total_stats(&self) -> MemoryContextCounters {
        unsafe { context::total_stats(self.context, 0) }
    }

    /// Whether nothing was allocated since the pool was created or last
    /// reset. Freeing every chunk does not make a pool empty again.
    pub fn is_empty(&self) -> bool {
        unsafe { context::is_empty(self.context) }
    }

    /// Walks the pool's blocks and chunks and reports any inconsistency.
    pub fn check(&self) -> Vec<CheckIssue> {
        unsafe { context::check(self.context) }
    }

    /// Whether `ptr` was allocated in this very pool (not in a descendant).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a pool and not freed since.
    pub unsafe fn owns(&self, ptr: NonNull<u8>) -> bool {
        unsafe { context::chunk_context(ptr) == Some(self.context) }
    }

    /// Requests above this many bytes get a dedicated block.
    pub fn chunk_limit(&self) -> usize {
        unsafe { (*self.context.cast::<AllocSet>().as_ptr()).alloc_chunk_limit }
    }

    pub fn allow_in_critical_section(&self) -> bool {
        unsafe { (*self.context.as_ptr()).allow_in_critical_section }
    }

    /// Sets the critical-section flag. Children created afterwards inherit it.
    pub fn set_allow_in_critical_section(&mut self, allow: bool) {
        unsafe { (*self.context.as_ptr()).allow_in_critical_section = allow }
    }
}

impl Drop for MemoryPool<'_> {
    fn drop(&mut self) {
        unsafe { context::delete(self.context) }
    }
}

/// Frees a chunk, whichever pool it came from.
///
/// # Safety
///
/// `ptr` must have been returned by a pool that is still alive and must not
/// have been freed since.
#[inline]
pub unsafe fn free(ptr: NonNull<u8>) {
    unsafe { context::free(ptr) }
}

/// Resizes a chunk to `size` bytes, preserving its contents up to the smaller
/// of the old and new sizes. The result may or may not be `ptr`; the old
/// pointer must not be used again unless they are equal. On error the
/// original chunk is left untouched.
///
/// # Safety
///
/// Same as [`free`].
pub unsafe fn realloc(ptr: NonNull<u8>, size: usize) -> PoolResult<NonNull<u8>> {
    unsafe { context::realloc(ptr, size) }
}

/// Bytes a chunk occupies in its pool, header included.
///
/// # Safety
///
/// Same as [`free`].
pub unsafe fn chunk_space(ptr: NonNull<u8>) -> usize {
    unsafe { context::chunk_space(ptr) }
}

/// Creates a root pool, or returns `None` (after logging why) if the
/// parameters are invalid or the system allocator fails. A zero
/// `init_block_size` or `max_block_size` selects the default.
pub fn pool_create(
    name: &'static str,
    min_context_size: usize,
    init_block_size: usize,
    max_block_size: usize,
) -> Option<MemoryPool<'static>> {
    MemoryPool::new(
        name,
        PoolConfig::new(min_context_size, init_block_size, max_block_size),
    )
    .inspect_err(|err| log::warn!("could not create memory pool \"{name}\": {err}"))
    .ok()
}

/// Deletes a pool along with everything allocated in it. `None` is a no-op.
pub fn pool_destroy(pool: Option<MemoryPool<'_>>) {
    drop(pool);
}

/// Allocates from `pool`; `None` if there is no pool or the request fails.
pub fn pool_alloc(pool: Option<&MemoryPool<'_>>, size: usize) -> Option<NonNull<u8>> {
    pool?.alloc(size).ok()
}

/// Like [`pool_alloc`], with the first `size` bytes zeroed.
pub fn pool_alloc_zeroed(pool: Option<&MemoryPool<'_>>, size: usize) -> Option<NonNull<u8>> {
    pool?.alloc_zeroed(size).ok()
}

/// Frees a chunk; `None` is a no-op.
///
/// # Safety
///
/// Same as [`free`].
pub unsafe fn pool_free(ptr: Option<NonNull<u8>>) {
    if let Some(ptr) = ptr {
        unsafe { free(ptr) }
    }
}
