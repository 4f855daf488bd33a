//! Free-list error types.

use thiserror::Error;

/// Errors from free-list pools and the allocator context.
#[derive(Debug, Error)]
pub enum FreeListError {
    /// Backing allocator refused a request, even after a sweep.
    #[error("memory allocation failed for {size} bytes")]
    CantAlloc { size: usize },

    /// Mutex is already held by the calling thread.
    #[error("can't lock {0}")]
    CantLock(&'static str),

    /// Block pool asked for zero bytes.
    #[error("zero-sized block request")]
    ZeroSize,

    /// Block was not carved by this pool.
    #[error("block of {size} bytes does not belong to pool '{pool}'")]
    ForeignBlock { pool: String, size: usize },

    /// Array pool element count at or past its maximum.
    #[error("element count {nelem} out of range for pool '{pool}' (max {maxelem})")]
    ElementCountOutOfRange {
        pool: String,
        nelem: usize,
        maxelem: usize,
    },

    /// Factory terminated with blocks still handed out.
    #[error("factory still has {outstanding} blocks outstanding")]
    StillAllocated { outstanding: usize },

    /// Factory used after termination.
    #[error("factory has been terminated")]
    Terminated,
}

impl FreeListError {
    pub fn foreign(pool: impl Into<String>, size: usize) -> Self {
        Self::ForeignBlock {
            pool: pool.into(),
            size,
        }
    }

    /// True when the underlying allocator ran out of memory.
    pub fn is_cant_alloc(&self) -> bool {
        matches!(self, Self::CantAlloc { .. })
    }
}

/// Result type for free-list operations.
pub type FreeListResult<T> = Result<T, FreeListError>;
