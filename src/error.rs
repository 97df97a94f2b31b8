use thiserror::Error;

/// Pool operation result
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors reported by pool operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("out of memory: failed on request of size {size} in memory pool \"{pool}\"")]
    OutOfMemory { pool: &'static str, size: usize },

    #[error("invalid memory allocation request size {0}")]
    InvalidAllocSize(usize),

    #[error("initial block size {0} must be a multiple of 8 and at least 1024 bytes")]
    InvalidInitBlockSize(usize),

    #[error("maximum block size {max} must be a multiple of 8 and at least the initial block size {init}")]
    InvalidMaxBlockSize { max: usize, init: usize },

    #[error("maximum block size {max} exceeds the chunk header's block offset limit {limit}")]
    MaxBlockSizeTooLarge { max: usize, limit: usize },

    #[error("minimum context size {min} must be 0 or a multiple of 8 between 1024 and {max}")]
    InvalidMinContextSize { min: usize, max: usize },

    #[error("no pool strategy is registered for method id {0}")]
    UnknownMethod(usize),
}

/// An anomaly found by the consistency walk over a pool's blocks and chunks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckIssue {
    #[error("empty block {block:#x}")]
    EmptyBlock { block: usize },

    #[error("corrupt header in block {block:#x}")]
    CorruptBlockHeader { block: usize },

    #[error("bad chunk size for chunk {chunk:#x} in block {block:#x}")]
    BadChunkSize { block: usize, chunk: usize },

    #[error("bad block offset for chunk {chunk:#x} in block {block:#x}")]
    BadBlockOffset { block: usize, chunk: usize },

    #[error("bad single-chunk {chunk:#x} in block {block:#x}")]
    BadSingleChunk { block: usize, chunk: usize },

    #[error("requested size larger than chunk size for chunk {chunk:#x} in block {block:#x}")]
    RequestedSizeExceedsChunk { block: usize, chunk: usize },

    #[error("detected write past chunk end in block {block:#x}, chunk {chunk:#x}")]
    WritePastChunkEnd { block: usize, chunk: usize },

    #[error("found inconsistent memory block {block:#x}")]
    InconsistentBlock { block: usize },

    #[error("external chunk on non-dedicated block {block:#x}")]
    ExternalChunkOnSharedBlock { block: usize },

    #[error("{found} bytes found in blocks but {recorded} bytes recorded as allocated")]
    AllocatedMismatch { found: usize, recorded: usize },
}
