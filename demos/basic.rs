use std::ptr::NonNull;

use mempool::{MemoryPool, PoolConfig};

fn log_alloc(pool: &MemoryPool, addr: NonNull<u8>, size: usize) {
    println!("Requested {size} bytes of memory from \"{}\"", pool.name());
    println!("Received this address: {addr:?} ({} bytes in the pool)", unsafe {
        mempool::chunk_space(addr)
    });
}

fn main() {
    let mut pool = MemoryPool::new("basic", PoolConfig::SMALL).expect("could not create pool");

    let addr1 = pool.alloc(8).expect("allocation failed");
    log_alloc(&pool, addr1, 8);

    let addr2 = pool.alloc(100).expect("allocation failed");
    log_alloc(&pool, addr2, 100);

    let addr3 = pool.alloc(4000).expect("allocation failed");
    log_alloc(&pool, addr3, 4000);

    unsafe {
        mempool::free(addr1);
        mempool::free(addr3);
    }

    println!("{}", pool.stats());
    println!("{} bytes held from the system", mempool::system_bytes_in_use());

    pool.reset();
    println!("After reset: {}", pool.stats());
}
