//! Consistency walk over an allocation set: every block header, every chunk
//! header and the recorded byte count are checked against each other.

use std::ptr::NonNull;

#[cfg(feature = "checking")]
use crate::chunk::{INVALID_ALLOC_SIZE, sentinel_ok};
use crate::{
    aset::{AllocSet, keeper_block},
    block::{self, BlockNode},
    chunk::{CHUNK_HEADER_SIZE, Chunk},
    context::MemoryContext,
    error::CheckIssue,
    freelist::{NUM_FREELISTS, class_size},
};

/// Walks every block of the set and returns what looks wrong. Each issue is
/// also logged as a warning. The walk only reads pool memory.
pub(crate) unsafe fn check_alloc_set(context: NonNull<MemoryContext>) -> Vec<CheckIssue> {
    let set = context.cast::<AllocSet>();
    let mut issues = Vec::new();

    unsafe {
        let s = set.as_ptr();
        let keeper = keeper_block(set);
        let mut found = 0;
        let mut prev = None;

        for node in (*s).blocks.nodes() {
            let block = &(*node.as_ptr()).data;
            let addr = node.as_ptr() as usize;
            let start = block::data_start(node).as_ptr() as usize;
            let free = block.free_ptr.as_ptr() as usize;
            let end = block.end_ptr.as_ptr() as usize;

            // The keeper shares its allocation with the set header.
            found += if node == keeper { end - s as usize } else { end - addr };

            if block.set != set || (*node.as_ptr()).prev != prev || free < start || free > end {
                issues.push(CheckIssue::CorruptBlockHeader { block: addr });
                prev = Some(node);
                continue;
            }
            prev = Some(node);

            let used = free - start;
            if used == 0 && node != keeper {
                issues.push(CheckIssue::EmptyBlock { block: addr });
            }

            check_chunks(node, &mut issues);
        }

        let recorded = (*s).header.mem_allocated;
        if found != recorded {
            issues.push(CheckIssue::AllocatedMismatch { found, recorded });
        }

        for issue in &issues {
            log::warn!("problem in memory pool \"{}\": {issue}", (*s).header.name);
        }
    }

    issues
}

/// Walks the chunks between the start of `node`'s data and its free pointer.
unsafe fn check_chunks(node: NonNull<BlockNode>, issues: &mut Vec<CheckIssue>) {
    unsafe {
        let block = &(*node.as_ptr()).data;
        let addr = node.as_ptr() as usize;
        let data = block::data_start(node);
        let used = block.free_ptr.as_ptr() as usize - data.as_ptr() as usize;
        let end = block.end_ptr.as_ptr() as usize;

        let mut offset = 0;
        let mut chunks_space = 0;
        let mut nchunks = 0;
        let mut has_large = false;

        while offset + CHUNK_HEADER_SIZE <= used {
            let chunk = data.add(offset).cast::<Chunk>();
            let chunk_addr = chunk.as_ptr() as usize;
            let header = (*chunk.as_ptr()).header;

            let chunk_size = if header.is_large() {
                has_large = true;
                let chunk_size = end - (chunk_addr + CHUNK_HEADER_SIZE);

                if !header.has_magic() || offset != 0 || chunk_size + CHUNK_HEADER_SIZE != used {
                    issues.push(CheckIssue::BadSingleChunk {
                        block: addr,
                        chunk: chunk_addr,
                    });
                }

                chunk_size
            } else {
                let index = header.value();
                if index >= NUM_FREELISTS {
                    issues.push(CheckIssue::BadChunkSize {
                        block: addr,
                        chunk: chunk_addr,
                    });
                    // Sizes can no longer be trusted to find the next chunk.
                    return;
                }

                if header.block_address(chunk_addr) != addr {
                    issues.push(CheckIssue::BadBlockOffset {
                        block: addr,
                        chunk: chunk_addr,
                    });
                }

                class_size(index)
            };

            #[cfg(feature = "checking")]
            {
                let requested = (*chunk.as_ptr()).requested_size;

                if requested != INVALID_ALLOC_SIZE {
                    if requested > chunk_size {
                        issues.push(CheckIssue::RequestedSizeExceedsChunk {
                            block: addr,
                            chunk: chunk_addr,
                        });
                    } else if requested < chunk_size && !sentinel_ok(Chunk::pointer(chunk), requested) {
                        issues.push(CheckIssue::WritePastChunkEnd {
                            block: addr,
                            chunk: chunk_addr,
                        });
                    }
                }
            }

            chunks_space += CHUNK_HEADER_SIZE + chunk_size;
            nchunks += 1;
            offset += CHUNK_HEADER_SIZE + chunk_size;
        }

        if chunks_space != used {
            issues.push(CheckIssue::InconsistentBlock { block: addr });
        }

        if has_large && nchunks > 1 {
            issues.push(CheckIssue::ExternalChunkOnSharedBlock { block: addr });
        }
    }
}
