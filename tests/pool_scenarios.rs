use std::{cell::RefCell, ptr::NonNull, rc::Rc};

use mempool::{
    BLOCK_HEADER_SIZE, CHUNK_HEADER_SIZE, MemoryPool, PoolConfig, PoolError, chunk_space, free, pool_alloc,
    pool_create, pool_destroy, pool_free, realloc, system_bytes_in_use,
};
use proptest::prelude::*;

fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
    unsafe { ptr.as_ptr().write_bytes(byte, len) }
}

fn all_equal(ptr: NonNull<u8>, len: usize, byte: u8) -> bool {
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
        .iter()
        .all(|&b| b == byte)
}

#[test]
fn freed_chunks_are_reused_last_in_first_out() {
    let pool = pool_create("lifo", 0, 1024, 8192);

    let ptrs: Vec<_> = (0..10).map(|_| pool_alloc(pool.as_ref(), 16).unwrap()).collect();
    for ptr in ptrs.iter().rev() {
        unsafe { pool_free(Some(*ptr)) };
    }

    // ptrs[0] was freed last.
    assert_eq!(pool_alloc(pool.as_ref(), 16), Some(ptrs[0]));
    assert_eq!(pool_alloc(pool.as_ref(), 9), Some(ptrs[1]));

    pool_destroy(pool);
}

#[test]
fn large_chunk_memory_goes_back_to_the_system() {
    let baseline = system_bytes_in_use();
    let pool = pool_create("large", 0, 0, 0).unwrap();
    assert_eq!(system_bytes_in_use(), baseline + 8192);

    let ptr = pool.alloc(9000).unwrap();
    let block_size = unsafe { chunk_space(ptr) } + BLOCK_HEADER_SIZE;
    assert!(block_size >= 9000 + CHUNK_HEADER_SIZE + BLOCK_HEADER_SIZE);
    assert_eq!(pool.stats().nblocks, 2);
    assert_eq!(pool.mem_allocated(), 8192 + block_size);
    assert_eq!(system_bytes_in_use(), baseline + 8192 + block_size);

    unsafe { free(ptr) };
    assert_eq!(pool.stats().nblocks, 1);
    assert_eq!(pool.mem_allocated(), 8192);

    let ptr = pool.alloc(9000).unwrap();
    fill(ptr, 9000, 0xAB);
    pool_destroy(Some(pool));
    assert_eq!(system_bytes_in_use(), baseline);
}

#[test]
fn block_sizes_double_until_capped() {
    let pool = MemoryPool::new("doubling", PoolConfig::new(0, 1024, 8192)).unwrap();

    let mut growth = Vec::new();
    let mut allocated = pool.mem_allocated();

    while growth.len() < 6 {
        pool.alloc(64).unwrap();

        if pool.mem_allocated() != allocated {
            growth.push(pool.mem_allocated() - allocated);
            allocated = pool.mem_allocated();
        }
    }

    assert_eq!(growth[0], 1024);
    for pair in growth.windows(2) {
        assert_eq!(pair[1], (pair[0] * 2).min(8192));
    }
    assert_eq!(growth, vec![1024, 2048, 4096, 8192, 8192, 8192]);
}

#[test]
fn repeated_alloc_free_of_one_size_does_not_grow() {
    let pool = MemoryPool::new("steady", PoolConfig::SMALL).unwrap();

    let ptr = pool.alloc(100).unwrap();
    unsafe { free(ptr) };
    let allocated = pool.mem_allocated();

    for _ in 0..1000 {
        let ptr = pool.alloc(100).unwrap();
        unsafe { free(ptr) };
    }

    assert_eq!(pool.mem_allocated(), allocated);
}

#[test]
fn each_large_request_costs_one_block() {
    let pool = MemoryPool::new("dedicated", PoolConfig::SMALL).unwrap();
    let limit = pool.chunk_limit();

    for size in [limit + 1, 2 * limit, 10_000, 123_457] {
        let before = pool.stats();
        let allocated = pool.mem_allocated();

        let ptr = pool.alloc(size).unwrap();
        assert_eq!(pool.stats().nblocks, before.nblocks + 1);

        let block_size = pool.mem_allocated() - allocated;
        assert_eq!(block_size, unsafe { chunk_space(ptr) } + BLOCK_HEADER_SIZE);

        unsafe { free(ptr) };
        assert_eq!(pool.mem_allocated(), allocated);
        assert_eq!(pool.stats(), before);
    }
}

#[test]
fn reset_keeps_only_the_first_block() {
    let baseline = system_bytes_in_use();
    let mut pool = MemoryPool::with_defaults("reset").unwrap();

    for _ in 0..100 {
        pool.alloc(1000).unwrap();
    }
    pool.alloc(100_000).unwrap();
    assert!(pool.stats().nblocks > 2);

    pool.reset();
    assert!(pool.is_empty());
    assert_eq!(pool.stats().nblocks, 1);
    assert_eq!(pool.mem_allocated(), 8192);
    assert_eq!(system_bytes_in_use(), baseline + 8192);

    // Half the initial block size still fits in the keeper.
    let ptr = pool.alloc(4096).unwrap();
    fill(ptr, 4096, 1);
    assert_eq!(system_bytes_in_use(), baseline + 8192);
    assert_eq!(pool.stats().nblocks, 1);
}

#[test]
fn alloc_zeroed_clears_recycled_chunks() {
    let pool = MemoryPool::new("zeroed", PoolConfig::SMALL).unwrap();

    for size in 0..=pool.chunk_limit() {
        let dirty = pool.alloc(size).unwrap();
        fill(dirty, size, 0xFF);
        unsafe { free(dirty) };

        let ptr = pool.alloc_zeroed(size).unwrap();
        assert!(all_equal(ptr, size, 0), "size {size} not zeroed");
        unsafe { free(ptr) };
    }
}

#[test]
fn realloc_preserves_contents_across_kinds() {
    let pool = MemoryPool::new("realloc", PoolConfig::SMALL).unwrap();
    let limit = pool.chunk_limit();

    let ptr = pool.alloc(100).unwrap();
    fill(ptr, 100, 0x11);

    let ptr = unsafe { realloc(ptr, 500) }.unwrap();
    assert!(all_equal(ptr, 100, 0x11));
    fill(ptr, 500, 0x22);

    // Normal to large.
    let ptr = unsafe { realloc(ptr, limit * 4) }.unwrap();
    assert!(all_equal(ptr, 500, 0x22));
    fill(ptr, limit * 4, 0x33);

    // Large to larger, then smaller.
    let ptr = unsafe { realloc(ptr, limit * 16) }.unwrap();
    assert!(all_equal(ptr, limit * 4, 0x33));
    let ptr = unsafe { realloc(ptr, limit * 2) }.unwrap();
    assert!(all_equal(ptr, limit * 2, 0x33));

    unsafe { free(ptr) };
    assert!(pool.check().is_empty());
}

#[test]
fn oversized_requests_are_rejected() {
    let pool = MemoryPool::new("oversized", PoolConfig::SMALL).unwrap();

    assert_eq!(
        pool.alloc(mempool::MAX_ALLOC_SIZE + 1),
        Err(PoolError::InvalidAllocSize(mempool::MAX_ALLOC_SIZE + 1))
    );

    let ptr = pool.alloc(pool.chunk_limit() + 1).unwrap();
    assert!(unsafe { realloc(ptr, usize::MAX) }.is_err());
    assert!(pool.check().is_empty());
}

#[test]
fn invalid_parameters_create_nothing() {
    let baseline = system_bytes_in_use();

    assert!(pool_create("tiny-init", 0, 512, 0).is_none());
    assert!(pool_create("max-below-init", 0, 8192, 4096).is_none());
    assert!(pool_create("unaligned", 0, 1028, 0).is_none());
    assert!(matches!(
        MemoryPool::new("huge", PoolConfig::new(0, 8192, 1 << 31)),
        Err(PoolError::MaxBlockSizeTooLarge { .. })
    ));

    assert_eq!(system_bytes_in_use(), baseline);
}

#[test]
fn tree_is_released_with_the_root() {
    let baseline = system_bytes_in_use();
    let deleted = Rc::new(RefCell::new(Vec::new()));

    {
        let root = MemoryPool::new("root", PoolConfig::SMALL).unwrap();
        let child = root.child("child", PoolConfig::START_SMALL).unwrap();
        let grandchild = child.child("grandchild", PoolConfig::SMALL).unwrap();

        for (pool, name) in [(&root, "root"), (&child, "child"), (&grandchild, "grandchild")] {
            let deleted = Rc::clone(&deleted);
            pool.register_reset_callback(move || deleted.borrow_mut().push(name));
            pool.alloc(300).unwrap();
            pool.alloc(5000).unwrap();
        }

        let totals = root.total_stats();
        assert_eq!(totals.nblocks, 6);
        assert_eq!(totals.totalspace, root.total_mem_allocated());
        assert_eq!(root.total_mem_allocated(), system_bytes_in_use() - baseline);

        // A chunk can be freed without naming its pool.
        let ptr = grandchild.alloc(40).unwrap();
        unsafe {
            assert!(grandchild.owns(ptr));
            free(ptr);
        }
    }

    assert_eq!(*deleted.borrow(), vec!["grandchild", "child", "root"]);
    assert_eq!(system_bytes_in_use(), baseline);
}

#[test]
fn callbacks_run_once_per_reset() {
    let calls = Rc::new(RefCell::new(0));
    let mut pool = MemoryPool::new("callbacks", PoolConfig::SMALL).unwrap();

    let counter = Rc::clone(&calls);
    pool.register_reset_callback(move || *counter.borrow_mut() += 1);
    pool.alloc(8).unwrap();

    pool.reset();
    pool.alloc(8).unwrap();
    pool.reset();
    drop(pool);

    assert_eq!(*calls.borrow(), 1);
}

proptest! {
    #[test]
    fn chunk_space_is_smallest_fitting_class(size in 0usize..=mempool::CHUNK_LIMIT) {
        let pool = MemoryPool::with_defaults("classes").unwrap();
        let ptr = pool.alloc(size).unwrap();
        let space = unsafe { chunk_space(ptr) } - CHUNK_HEADER_SIZE;

        prop_assert_eq!(space, size.max(8).next_power_of_two());
        prop_assert_eq!(ptr.as_ptr() as usize % mempool::MAXIMUM_ALIGNOF, 0);
    }

    #[test]
    fn mixed_workload_stays_consistent(sizes in proptest::collection::vec(0usize..20_000, 1..64)) {
        let baseline = system_bytes_in_use();
        let mut pool = MemoryPool::new("workload", PoolConfig::START_SMALL).unwrap();

        let mut live = Vec::new();
        for (i, size) in sizes.iter().copied().enumerate() {
            let ptr = pool.alloc(size).unwrap();
            fill(ptr, size, i as u8);
            live.push((ptr, size, i as u8));

            if i % 3 == 2 {
                let (ptr, _, _) = live.remove(0);
                unsafe { free(ptr) };
            }
        }

        for &(ptr, size, byte) in &live {
            prop_assert!(all_equal(ptr, size, byte));
        }
        prop_assert!(pool.check().is_empty());
        prop_assert_eq!(pool.total_mem_allocated(), system_bytes_in_use() - baseline);

        pool.reset();
        prop_assert_eq!(pool.stats().nblocks, 1);
    }
}
