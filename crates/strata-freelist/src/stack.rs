//! Fixed-size free stack shared by regular and factory pools.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::AtomicUsize;

use crate::context::sub_freed;

/// A fixed-size block handed out by a regular or factory pool.
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Id of the pool that carved it.
    pub(crate) pool: u64,
    pub(crate) data: Box<[u8]>,
}

impl Chunk {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Chunk {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Counters for a single fixed-size pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks carved from the raw allocator, in use or on the list.
    pub allocated: usize,
    /// Blocks currently on the free list.
    pub onlist: usize,
    pub size: usize,
}

impl PoolStats {
    pub fn outstanding(&self) -> usize {
        self.allocated.saturating_sub(self.onlist)
    }

    pub fn freed_bytes(&self) -> usize {
        self.onlist * self.size
    }
}

#[derive(Debug, Default)]
pub(crate) struct FreeStack {
    pub(crate) free: Vec<Box<[u8]>>,
    pub(crate) allocated: usize,
}

impl FreeStack {
    /// Drop every free block. Returns bytes released.
    pub(crate) fn sweep(&mut self, size: usize, freed: &AtomicUsize) -> usize {
        let count = self.free.len();
        self.free.clear();
        self.allocated = self.allocated.saturating_sub(count);
        let bytes = count * size;
        sub_freed(freed, bytes);
        bytes
    }

    pub(crate) fn stats(&self, size: usize) -> PoolStats {
        PoolStats {
            allocated: self.allocated,
            onlist: self.free.len(),
            size,
        }
    }
}
