//! Strategy-independent part of a pool: the context header, the method
//! table every strategy provides, the registry mapping header method ids to
//! method tables and the parent/child tree.

use std::{mem, ptr::NonNull};

use crate::{
    aset,
    chunk::{MethodId, method_id_of},
    error::{CheckIssue, PoolError, PoolResult},
    stats::MemoryContextCounters,
};

/// Called once just before the owning context is next reset or deleted.
pub type ResetCallback = Box<dyn FnOnce()>;

/// Operations a pool strategy provides. Context-level operations receive the
/// context; chunk-level operations only receive the user pointer and find
/// their context through the chunk header.
pub(crate) struct ContextMethods {
    pub alloc: unsafe fn(NonNull<MemoryContext>, usize) -> PoolResult<NonNull<u8>>,
    pub free: unsafe fn(NonNull<u8>),
    pub realloc: unsafe fn(NonNull<u8>, usize) -> PoolResult<NonNull<u8>>,
    pub reset: unsafe fn(NonNull<MemoryContext>),
    pub delete: unsafe fn(NonNull<MemoryContext>),
    pub get_chunk_context: unsafe fn(NonNull<u8>) -> Option<NonNull<MemoryContext>>,
    pub get_chunk_space: unsafe fn(NonNull<u8>) -> usize,
    pub is_empty: unsafe fn(NonNull<MemoryContext>) -> bool,
    pub stats: unsafe fn(NonNull<MemoryContext>) -> MemoryContextCounters,
    pub check: unsafe fn(NonNull<MemoryContext>) -> Vec<CheckIssue>,
}

/// Installed for every id no strategy uses. Pointer-based entries refuse to
/// touch the memory, since a chunk carrying one of these ids was not handed
/// out by a pool.
static BOGUS_METHODS: ContextMethods = ContextMethods {
    alloc: bogus_alloc,
    free: bogus_free,
    realloc: bogus_realloc,
    reset: bogus_context_op,
    delete: bogus_context_op,
    get_chunk_context: bogus_get_chunk_context,
    get_chunk_space: bogus_get_chunk_space,
    is_empty: bogus_is_empty,
    stats: bogus_stats,
    check: bogus_check,
};

/// Method tables indexed by [`MethodId`]. Immutable for the whole process.
static REGISTRY: [&ContextMethods; MethodId::COUNT] = [
    &BOGUS_METHODS, // unused memory
    &BOGUS_METHODS, // glibc
    &BOGUS_METHODS, // glibc, large
    &aset::ALLOC_SET_METHODS,
    &BOGUS_METHODS,
    &BOGUS_METHODS,
    &BOGUS_METHODS,
    &BOGUS_METHODS,
    &BOGUS_METHODS,
    &BOGUS_METHODS,
    &BOGUS_METHODS,
    &BOGUS_METHODS,
    &BOGUS_METHODS,
    &BOGUS_METHODS,
    &BOGUS_METHODS,
    &BOGUS_METHODS, // wiped memory
];

#[inline]
pub(crate) fn methods(id: MethodId) -> &'static ContextMethods {
    REGISTRY[id.index()]
}

unsafe fn bogus_alloc(context: NonNull<MemoryContext>, _: usize) -> PoolResult<NonNull<u8>> {
    let id = unsafe { (*context.as_ptr()).method_id };
    log::error!("allocation requested from a context without a registered strategy (method id {})", id.index());
    Err(PoolError::UnknownMethod(id.index()))
}

unsafe fn bogus_free(ptr: NonNull<u8>) {
    let id = unsafe { method_id_of(ptr) };
    log::error!("pfree called with invalid pointer {ptr:p} (header method id {})", id.index());
}

unsafe fn bogus_realloc(ptr: NonNull<u8>, _: usize) -> PoolResult<NonNull<u8>> {
    let id = unsafe { method_id_of(ptr) };
    log::error!("repalloc called with invalid pointer {ptr:p} (header method id {})", id.index());
    Err(PoolError::UnknownMethod(id.index()))
}

fn bogus_context_op(_: NonNull<MemoryContext>) {
    log::error!("reset or delete requested on a context without a registered strategy");
}

fn bogus_get_chunk_context(ptr: NonNull<u8>) -> Option<NonNull<MemoryContext>> {
    log::error!("no context owns pointer {ptr:p}");
    None
}

fn bogus_get_chunk_space(_: NonNull<u8>) -> usize {
    0
}

fn bogus_is_empty(_: NonNull<MemoryContext>) -> bool {
    true
}

fn bogus_stats(_: NonNull<MemoryContext>) -> MemoryContextCounters {
    MemoryContextCounters::default()
}

fn bogus_check(_: NonNull<MemoryContext>) -> Vec<CheckIssue> {
    Vec::new()
}

/// Header shared by every context, whatever its strategy. Strategies embed it
/// as their first field so a context pointer can be cast to the strategy's
/// own type.
#[repr(C)]
pub(crate) struct MemoryContext {
    pub method_id: MethodId,
    /// Nothing was allocated since creation or the last reset.
    pub is_reset: bool,
    pub allow_in_critical_section: bool,
    /// Bytes obtained from the system allocator for this context's own blocks.
    pub mem_allocated: usize,
    pub methods: &'static ContextMethods,
    pub parent: Option<NonNull<MemoryContext>>,
    pub first_child: Option<NonNull<MemoryContext>>,
    pub prev_child: Option<NonNull<MemoryContext>>,
    pub next_child: Option<NonNull<MemoryContext>>,
    pub name: &'static str,
    pub reset_callbacks: Vec<ResetCallback>,
}

impl MemoryContext {
    /// A fresh, unlinked header. [`link_to_parent`] must follow once the
    /// header sits at its final address.
    pub fn new(method_id: MethodId, name: &'static str) -> Self {
        Self {
            method_id,
            is_reset: true,
            allow_in_critical_section: false,
            mem_allocated: 0,
            methods: methods(method_id),
            parent: None,
            first_child: None,
            prev_child: None,
            next_child: None,
            name,
            reset_callbacks: Vec::new(),
        }
    }
}

/// Inserts `context` at the head of `parent`'s children, inheriting the
/// parent's critical-section flag. Root contexts get the flag cleared.
pub(crate) unsafe fn link_to_parent(context: NonNull<MemoryContext>, parent: Option<NonNull<MemoryContext>>) {
    let node = context.as_ptr();

    unsafe {
        (*node).parent = parent;
        (*node).prev_child = None;

        match parent {
            Some(parent) => {
                let parent = parent.as_ptr();

                (*node).next_child = (*parent).first_child;
                if let Some(first) = (*parent).first_child {
                    (*first.as_ptr()).prev_child = Some(context);
                }
                (*parent).first_child = Some(context);
                (*node).allow_in_critical_section = (*parent).allow_in_critical_section;
            }
            None => {
                (*node).next_child = None;
                (*node).allow_in_critical_section = false;
            }
        }
    }
}

unsafe fn unlink_from_parent(context: NonNull<MemoryContext>) {
    let node = context.as_ptr();

    unsafe {
        let Some(parent) = (*node).parent else {
            return;
        };

        match (*node).prev_child {
            Some(prev) => (*prev.as_ptr()).next_child = (*node).next_child,
            None => (*parent.as_ptr()).first_child = (*node).next_child,
        }

        if let Some(next) = (*node).next_child {
            (*next.as_ptr()).prev_child = (*node).prev_child;
        }

        (*node).parent = None;
        (*node).prev_child = None;
        (*node).next_child = None;
    }
}

/// Iterates over the direct children of `context`.
pub(crate) unsafe fn children(context: NonNull<MemoryContext>) -> impl Iterator<Item = NonNull<MemoryContext>> {
    let mut current = unsafe { (*context.as_ptr()).first_child };

    std::iter::from_fn(move || {
        let child = current?;
        current = unsafe { (*child.as_ptr()).next_child };
        Some(child)
    })
}

pub(crate) unsafe fn register_reset_callback(context: NonNull<MemoryContext>, callback: ResetCallback) {
    unsafe { (*context.as_ptr()).reset_callbacks.push(callback) }
}

/// Runs the registered callbacks in registration order, then forgets them.
unsafe fn call_reset_callbacks(context: NonNull<MemoryContext>) {
    let callbacks = unsafe { mem::take(&mut (*context.as_ptr()).reset_callbacks) };

    for callback in callbacks {
        callback();
    }
}

/// Releases everything allocated in `context` and deletes its descendants.
/// The context itself stays usable.
pub(crate) unsafe fn reset(context: NonNull<MemoryContext>) {
    unsafe {
        delete_children(context);

        if !(*context.as_ptr()).is_reset {
            reset_only(context);
        }
    }
}

/// Releases everything allocated in `context`, leaving its children alone.
pub(crate) unsafe fn reset_only(context: NonNull<MemoryContext>) {
    unsafe {
        log::debug!("resetting memory pool \"{}\"", (*context.as_ptr()).name);

        call_reset_callbacks(context);
        ((*context.as_ptr()).methods.reset)(context);
        (*context.as_ptr()).is_reset = true;
    }
}

/// Deletes every descendant of `context`.
pub(crate) unsafe fn delete_children(context: NonNull<MemoryContext>) {
    unsafe {
        while let Some(child) = (*context.as_ptr()).first_child {
            delete(child);
        }
    }
}

/// Deletes `context` and all its descendants. `context` is dangling afterwards.
pub(crate) unsafe fn delete(context: NonNull<MemoryContext>) {
    unsafe {
        delete_children(context);

        log::debug!("deleting memory pool \"{}\"", (*context.as_ptr()).name);

        call_reset_callbacks(context);
        unlink_from_parent(context);
        ((*context.as_ptr()).methods.delete)(context);
    }
}

#[inline]
pub(crate) unsafe fn alloc(context: NonNull<MemoryContext>, size: usize) -> PoolResult<NonNull<u8>> {
    unsafe {
        (*context.as_ptr()).is_reset = false;
        ((*context.as_ptr()).methods.alloc)(context, size)
    }
}

pub(crate) unsafe fn alloc_zeroed(context: NonNull<MemoryContext>, size: usize) -> PoolResult<NonNull<u8>> {
    unsafe {
        let ptr = alloc(context, size)?;
        ptr.as_ptr().write_bytes(0, size);
        Ok(ptr)
    }
}

/// Frees a chunk of any pool, dispatching on the method id in its header.
#[inline]
pub(crate) unsafe fn free(ptr: NonNull<u8>) {
    unsafe { (methods(method_id_of(ptr)).free)(ptr) }
}

pub(crate) unsafe fn realloc(ptr: NonNull<u8>, size: usize) -> PoolResult<NonNull<u8>> {
    unsafe {
        let methods = methods(method_id_of(ptr));

        // Bogus tables log on every call; let realloc report the pointer once.
        if !std::ptr::eq(methods, &BOGUS_METHODS) {
            if let Some(context) = (methods.get_chunk_context)(ptr) {
                (*context.as_ptr()).is_reset = false;
            }
        }

        (methods.realloc)(ptr, size)
    }
}

pub(crate) unsafe fn chunk_context(ptr: NonNull<u8>) -> Option<NonNull<MemoryContext>> {
    unsafe { (methods(method_id_of(ptr)).get_chunk_context)(ptr) }
}

pub(crate) unsafe fn chunk_space(ptr: NonNull<u8>) -> usize {
    unsafe { (methods(method_id_of(ptr)).get_chunk_space)(ptr) }
}

pub(crate) unsafe fn is_empty(context: NonNull<MemoryContext>) -> bool {
    unsafe { ((*context.as_ptr()).methods.is_empty)(context) }
}

pub(crate) unsafe fn stats(context: NonNull<MemoryContext>) -> MemoryContextCounters {
    unsafe { ((*context.as_ptr()).methods.stats)(context) }
}

/// Counters of `context` and all its descendants. Each context's own line is
/// logged at debug level, indented by depth.
pub(crate) unsafe fn total_stats(context: NonNull<MemoryContext>, level: usize) -> MemoryContextCounters {
    unsafe {
        let mut totals = stats(context);

        log::debug!(
            "{:indent$}{}: {}",
            "",
            (*context.as_ptr()).name,
            totals,
            indent = level * 2
        );

        for child in children(context) {
            totals += total_stats(child, level + 1);
        }

        totals
    }
}

pub(crate) unsafe fn check(context: NonNull<MemoryContext>) -> Vec<CheckIssue> {
    unsafe { ((*context.as_ptr()).methods.check)(context) }
}

/// Bytes obtained from the system allocator by `context`, optionally
/// including its descendants.
pub(crate) unsafe fn mem_allocated(context: NonNull<MemoryContext>, recurse: bool) -> usize {
    unsafe {
        let mut total = (*context.as_ptr()).mem_allocated;

        if recurse {
            for child in children(context) {
                total += mem_allocated(child, true);
            }
        }

        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkHeader;

    #[test]
    fn registry_serves_alloc_set_only() {
        for index in 0..MethodId::COUNT {
            let is_alloc_set = std::ptr::eq(REGISTRY[index], &aset::ALLOC_SET_METHODS);
            assert_eq!(is_alloc_set, index == MethodId::ALLOC_SET.index());
        }
    }

    #[test]
    fn tree_links_and_unlinks() {
        let mut parent = MemoryContext::new(MethodId::ALLOC_SET, "parent");
        let mut first = MemoryContext::new(MethodId::ALLOC_SET, "first");
        let mut second = MemoryContext::new(MethodId::ALLOC_SET, "second");

        let parent = NonNull::from(&mut parent);
        let first = NonNull::from(&mut first);
        let second = NonNull::from(&mut second);

        unsafe {
            link_to_parent(parent, None);
            assert!(!(*parent.as_ptr()).allow_in_critical_section);

            (*parent.as_ptr()).allow_in_critical_section = true;
            link_to_parent(first, Some(parent));
            link_to_parent(second, Some(parent));

            let names: Vec<&str> = children(parent).map(|c| (*c.as_ptr()).name).collect();
            assert_eq!(names, vec!["second", "first"]);
            assert!((*first.as_ptr()).allow_in_critical_section);
            assert!((*second.as_ptr()).allow_in_critical_section);

            unlink_from_parent(second);
            let names: Vec<&str> = children(parent).map(|c| (*c.as_ptr()).name).collect();
            assert_eq!(names, vec!["first"]);
            assert!((*second.as_ptr()).parent.is_none());

            unlink_from_parent(first);
            assert!(children(parent).next().is_none());
        }
    }

    #[test]
    fn callbacks_run_once_in_registration_order() {
        use std::{cell::RefCell, rc::Rc};

        let order = Rc::new(RefCell::new(Vec::new()));
        let mut context = MemoryContext::new(MethodId::ALLOC_SET, "callbacks");
        let context = NonNull::from(&mut context);

        unsafe {
            for i in 0..3 {
                let order = Rc::clone(&order);
                register_reset_callback(context, Box::new(move || order.borrow_mut().push(i)));
            }

            call_reset_callbacks(context);
            call_reset_callbacks(context);
        }

        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn foreign_pointer_dispatches_to_bogus_methods() {
        // A zeroed header carries the reserved "unused memory" id.
        let mut words = [0u64; 2];
        words[0] = ChunkHeader::normal(0, 0, MethodId::RESERVED_UNUSED_MEMORY).bits();
        let ptr = NonNull::new(words.as_mut_ptr().wrapping_add(1).cast::<u8>()).unwrap();

        unsafe {
            free(ptr);
            assert_eq!(chunk_space(ptr), 0);
            assert!(chunk_context(ptr).is_none());
            assert_eq!(
                realloc(ptr, 16),
                Err(PoolError::UnknownMethod(MethodId::RESERVED_UNUSED_MEMORY.index()))
            );
        }

        assert_eq!(words, [0, 0]);
    }

    #[test]
    fn unregistered_context_reports_its_method_id() {
        let mut context = MemoryContext::new(MethodId::RESERVED_GLIBC, "unregistered");
        let context = NonNull::from(&mut context);

        unsafe {
            assert_eq!(
                alloc(context, 8),
                Err(PoolError::UnknownMethod(MethodId::RESERVED_GLIBC.index()))
            );
            assert!(is_empty(context));
        }
    }
}
