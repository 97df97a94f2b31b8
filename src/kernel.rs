use std::{cell::Cell, ptr::NonNull};

/// The pool's view of the system allocator. Every block a pool owns, the
/// keeper block and its context header included, comes from here.
pub(crate) struct Kernel;

/// This trait provides an abstraction over the platform's general purpose
/// allocator. As the pool, our top level view of this, has nothing to do
/// with the concrete APIs offered by each platform.
///
/// Every method is fallible in the `Option` sense: a `None` means the system
/// could not satisfy the request and must be propagated, never unwrapped.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// given location or None if the underlying allocator fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Grow or shrink the region at `addr` to `len` bytes, possibly moving it.
    /// On failure the original region is left untouched.
    unsafe fn resize_memory(addr: NonNull<u8>, len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory starting from `addr` back to the system.
    unsafe fn return_memory(addr: NonNull<u8>);
}

thread_local! {
    /// Bytes currently obtained from the system allocator by pools on this thread.
    static BYTES_IN_USE: Cell<usize> = const { Cell::new(0) };
}

/// Number of bytes the pools of the calling thread currently hold from the
/// system allocator.
///
/// Pools are single threaded, so this is exact as long as a pool is created,
/// used and destroyed on the same thread.
pub fn system_bytes_in_use() -> usize {
    BYTES_IN_USE.with(Cell::get)
}

#[cfg(test)]
thread_local! {
    /// Number of upcoming requests (and resizes) to refuse.
    static FAIL_NEXT: Cell<usize> = const { Cell::new(0) };
    /// Requests (and resizes) above this many bytes are refused.
    static FAIL_ABOVE: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Makes the next `n` requests on this thread fail as if the system
/// allocator were out of memory.
#[cfg(test)]
pub(crate) fn fail_next_requests(n: usize) {
    FAIL_NEXT.with(|next| next.set(n));
}

/// Makes every request above `len` bytes on this thread fail until
/// [`clear_injected_failures`] is called.
#[cfg(test)]
pub(crate) fn fail_requests_above(len: usize) {
    FAIL_ABOVE.with(|above| above.set(len));
}

#[cfg(test)]
pub(crate) fn clear_injected_failures() {
    fail_next_requests(0);
    fail_requests_above(usize::MAX);
}

#[cfg(test)]
fn injected_failure(len: usize) -> bool {
    let next = FAIL_NEXT.with(|next| {
        let pending = next.get();
        next.set(pending.saturating_sub(1));
        pending > 0
    });

    next || len > FAIL_ABOVE.with(Cell::get)
}

/// Wrapper to use [`Kernel::request_memory`]
#[inline]
pub(crate) unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
    #[cfg(test)]
    if injected_failure(len) {
        log::trace!("refusing request of {len} bytes");
        return None;
    }

    let addr = unsafe { Kernel::request_memory(len)? };

    BYTES_IN_USE.with(|used| used.set(used.get() + len));
    log::trace!("obtained {len} bytes at {addr:p} from the system allocator");

    Some(addr)
}

/// Wrapper to use [`Kernel::resize_memory`]. `old_len` is only used for accounting.
#[inline]
pub(crate) unsafe fn resize_memory(addr: NonNull<u8>, old_len: usize, len: usize) -> Option<NonNull<u8>> {
    #[cfg(test)]
    if injected_failure(len) {
        log::trace!("refusing resize of {addr:p} to {len} bytes");
        return None;
    }

    let new_addr = unsafe { Kernel::resize_memory(addr, len)? };

    BYTES_IN_USE.with(|used| used.set(used.get() - old_len + len));
    log::trace!("resized {addr:p} from {old_len} to {len} bytes, now at {new_addr:p}");

    Some(new_addr)
}

/// Wrapper to use [`Kernel::return_memory`]
#[inline]
pub(crate) unsafe fn return_memory(addr: NonNull<u8>, len: usize) {
    unsafe { Kernel::return_memory(addr) };

    BYTES_IN_USE.with(|used| used.set(used.get().saturating_sub(len)));
    log::trace!("returned {len} bytes at {addr:p} to the system allocator");
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{c_void, size_t};

    use std::ptr::NonNull;

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            unsafe { NonNull::new(libc::malloc(len as size_t).cast::<u8>()) }
        }

        unsafe fn resize_memory(addr: NonNull<u8>, len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let resized = libc::realloc(addr.as_ptr().cast::<c_void>(), len as size_t);

                NonNull::new(resized.cast::<u8>())
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>) {
            unsafe { libc::free(addr.as_ptr().cast::<c_void>()) }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{os::raw::c_void, ptr::NonNull};

    use crate::kernel::{Kernel, PlatformMemory};

    use windows::Win32::System::Memory::{GetProcessHeap, HEAP_FLAGS, HeapAlloc, HeapFree, HeapReAlloc};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let heap = GetProcessHeap().ok()?;

                NonNull::new(HeapAlloc(heap, HEAP_FLAGS(0), len).cast())
            }
        }

        unsafe fn resize_memory(addr: NonNull<u8>, len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let heap = GetProcessHeap().ok()?;
                let old = addr.as_ptr().cast_const().cast::<c_void>();

                NonNull::new(HeapReAlloc(heap, HEAP_FLAGS(0), Some(old), len).cast())
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>) {
            unsafe {
                if let Ok(heap) = GetProcessHeap() {
                    let _ = HeapFree(heap, HEAP_FLAGS(0), Some(addr.as_ptr().cast_const().cast::<c_void>()));
                }
            }
        }
    }
}
