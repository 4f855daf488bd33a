//! Regular pools: one fixed block size per pool, recycled through a stack.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use tracing::trace;

use crate::context::{PoolList, SharedAllocator, add_freed, sub_freed};
use crate::dlftt::DlfttMutex;
use crate::error::{FreeListError, FreeListResult};
use crate::limits::Flavor;
use crate::stack::{Chunk, FreeStack, PoolStats};

#[derive(Debug)]
struct RegularState {
    id: u64,
    name: String,
    size: usize,
    registered: AtomicBool,
    list: DlfttMutex<FreeStack>,
}

impl PoolList for RegularState {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn registered(&self) -> &AtomicBool {
        &self.registered
    }

    fn gc(&self, freed: &AtomicUsize) -> FreeListResult<usize> {
        Ok(self.list.acquire()?.sweep(self.size, freed))
    }

    fn allocated_bytes(&self) -> FreeListResult<usize> {
        Ok(self.list.acquire()?.allocated * self.size)
    }

    fn is_quiescent(&self) -> FreeListResult<bool> {
        Ok(self.list.acquire()?.allocated == 0)
    }
}

/// A pool of identically sized blocks.
#[derive(Debug, Clone)]
pub struct RegularPool {
    ctx: SharedAllocator,
    state: Arc<RegularState>,
}

impl RegularPool {
    pub fn new(ctx: &SharedAllocator, name: impl Into<String>, size: usize) -> Self {
        Self {
            ctx: ctx.clone(),
            state: Arc::new(RegularState {
                id: ctx.next_id(),
                name: name.into(),
                size,
                registered: AtomicBool::new(false),
                list: DlfttMutex::new("regular free list", FreeStack::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn size(&self) -> usize {
        self.state.size
    }

    /// Take a block from the free list, or carve a new one.
    ///
    /// Recycled blocks keep whatever bytes they held when freed.
    pub fn alloc(&self) -> FreeListResult<Chunk> {
        let head = &self.ctx.regular;
        head.register(&self.state)?;
        {
            let mut list = self.state.list.acquire()?;
            if let Some(data) = list.free.pop() {
                sub_freed(&head.mem_freed, self.state.size);
                return Ok(Chunk {
                    pool: self.state.id,
                    data,
                });
            }
        }

        let data = self.ctx.malloc(self.state.size)?;
        self.state.list.acquire()?.allocated += 1;
        trace!(pool = %self.state.name, size = self.state.size, "carved regular block");
        Ok(Chunk {
            pool: self.state.id,
            data,
        })
    }

    /// Allocate a zeroed block.
    pub fn calloc(&self) -> FreeListResult<Chunk> {
        let mut chunk = self.alloc()?;
        chunk.fill(0);
        Ok(chunk)
    }

    /// Return a block to the free list, sweeping if a ceiling is crossed.
    pub fn free(&self, chunk: Chunk) -> FreeListResult<()> {
        let size = self.state.size;
        if chunk.pool != self.state.id || chunk.size() != size {
            return Err(FreeListError::foreign(&self.state.name, chunk.size()));
        }

        let head = &self.ctx.regular;
        let list_freed = {
            let mut list = self.state.list.acquire()?;
            list.free.push(chunk.data);
            add_freed(&head.mem_freed, size);
            list.free.len() * size
        };

        if self.ctx.limits.list_exceeded(Flavor::Regular, list_freed) {
            self.state.gc(&head.mem_freed)?;
        }
        if self.ctx.limits.global_exceeded(Flavor::Regular, head.freed()) {
            head.gc_all()?;
        }
        Ok(())
    }

    /// Release this pool's free blocks.
    pub fn gc(&self) -> FreeListResult<usize> {
        self.state.gc(&self.ctx.regular.mem_freed)
    }

    pub fn stats(&self) -> FreeListResult<PoolStats> {
        Ok(self.state.list.acquire()?.stats(self.state.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AllocatorContext, shared_allocator};
    use crate::limits::FreeListLimits;

    fn setup(size: usize) -> (SharedAllocator, RegularPool) {
        let ctx = shared_allocator();
        let pool = RegularPool::new(&ctx, "nodes", size);
        (ctx, pool)
    }

    #[test]
    fn test_alloc_free_recycles() {
        let (ctx, pool) = setup(32);
        let mut chunk = pool.alloc().unwrap();
        chunk[0] = 0xAB;
        pool.free(chunk).unwrap();

        let stats = pool.stats().unwrap();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.onlist, 1);
        assert_eq!(ctx.mem_freed(Flavor::Regular), 32);

        let again = pool.alloc().unwrap();
        assert_eq!(again[0], 0xAB);
        assert_eq!(pool.stats().unwrap().allocated, 1);
        assert_eq!(ctx.mem_freed(Flavor::Regular), 0);
        pool.free(again).unwrap();
    }

    #[test]
    fn test_calloc_zeroes_recycled() {
        let (_ctx, pool) = setup(8);
        let mut chunk = pool.alloc().unwrap();
        chunk.fill(0xFF);
        pool.free(chunk).unwrap();
        let zeroed = pool.calloc().unwrap();
        assert!(zeroed.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_foreign_block_rejected() {
        let (ctx, pool) = setup(16);
        let other = RegularPool::new(&ctx, "other", 24);
        let chunk = other.alloc().unwrap();
        let err = pool.free(chunk).unwrap_err();
        assert!(matches!(err, FreeListError::ForeignBlock { size: 24, .. }));
    }

    #[test]
    fn test_list_limit_triggers_gc() {
        let ctx = AllocatorContext::new()
            .with_limits(FreeListLimits::default().with_list_limit(Flavor::Regular, Some(100)))
            .into_shared();
        let pool = RegularPool::new(&ctx, "small", 32);
        let chunks: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
        let mut iter = chunks.into_iter();

        // 3 × 32 = 96 stays under the ceiling
        for chunk in iter.by_ref().take(3) {
            pool.free(chunk).unwrap();
        }
        assert_eq!(pool.stats().unwrap().onlist, 3);

        // 128 > 100 sweeps the list
        pool.free(iter.next().unwrap()).unwrap();
        let stats = pool.stats().unwrap();
        assert_eq!(stats.onlist, 0);
        assert_eq!(stats.allocated, 0);
        assert_eq!(stats.freed_bytes(), 0);
        assert_eq!(ctx.mem_freed(Flavor::Regular), 0);
    }

    #[test]
    fn test_global_limit_sweeps_all_pools() {
        let limits = FreeListLimits::unlimited().with_global_limit(Flavor::Regular, Some(40));
        let ctx = AllocatorContext::new().with_limits(limits).into_shared();
        let a = RegularPool::new(&ctx, "a", 16);
        let b = RegularPool::new(&ctx, "b", 16);

        let ca = a.alloc().unwrap();
        let cb1 = b.alloc().unwrap();
        let cb2 = b.alloc().unwrap();
        a.free(ca).unwrap();
        b.free(cb1).unwrap();
        assert_eq!(ctx.mem_freed(Flavor::Regular), 32);

        b.free(cb2).unwrap();
        assert_eq!(ctx.mem_freed(Flavor::Regular), 0);
        assert_eq!(a.stats().unwrap().onlist, 0);
        assert_eq!(b.stats().unwrap().onlist, 0);
    }

    #[test]
    fn test_registers_once() {
        let (ctx, pool) = setup(8);
        assert_eq!(ctx.registered_pools(Flavor::Regular).unwrap(), 0);
        let a = pool.alloc().unwrap();
        let b = pool.clone().alloc().unwrap();
        assert_eq!(ctx.registered_pools(Flavor::Regular).unwrap(), 1);
        pool.free(a).unwrap();
        pool.free(b).unwrap();
    }

    #[test]
    fn test_same_size_block_from_other_pool_rejected() {
        let (ctx, pool) = setup(16);
        let other = RegularPool::new(&ctx, "twin", 16);
        let chunk = other.alloc().unwrap();

        let err = pool.free(chunk).unwrap_err();
        assert!(matches!(err, FreeListError::ForeignBlock { size: 16, .. }));
        let stats = pool.stats().unwrap();
        assert_eq!((stats.allocated, stats.onlist), (0, 0));
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(pool.gc().unwrap(), 0);
        assert_eq!(other.stats().unwrap().outstanding(), 1);
    }
}
