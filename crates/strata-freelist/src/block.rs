//! Block pools: one pool serving many sizes.
//!
//! Free blocks are kept in per-size buckets. Looking up a bucket moves it to
//! the front of the bucket list, so workloads that reuse a handful of sizes
//! find them in one or two probes.
//!
//! A [`Block`] carries its own size, which is how [`BlockPool::free`] finds
//! the right bucket.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use tracing::trace;

use crate::context::{PoolList, SharedAllocator, add_freed, sub_freed};
use crate::dlftt::DlfttMutex;
use crate::error::{FreeListError, FreeListResult};
use crate::limits::Flavor;

/// A variable-size block owned by the caller until it is freed.
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    /// Id of the pool that carved it.
    pool: u64,
    data: Box<[u8]>,
}

impl Block {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Debug)]
struct SizeBucket {
    size: usize,
    allocated: usize,
    free: Vec<Box<[u8]>>,
}

#[derive(Debug, Default)]
struct BlockList {
    /// Most recently used first.
    buckets: VecDeque<SizeBucket>,
    allocated: usize,
    onlist: usize,
    list_mem: usize,
}

impl BlockList {
    /// Move the bucket for `size` to the front. Returns false if none exists.
    fn promote(&mut self, size: usize) -> bool {
        match self.buckets.iter().position(|b| b.size == size) {
            Some(0) => true,
            Some(idx) => {
                if let Some(bucket) = self.buckets.remove(idx) {
                    self.buckets.push_front(bucket);
                }
                true
            }
            None => false,
        }
    }

    fn front_for(&mut self, size: usize) -> &mut SizeBucket {
        if !self.promote(size) {
            self.buckets.push_front(SizeBucket {
                size,
                allocated: 0,
                free: Vec::new(),
            });
        }
        &mut self.buckets[0]
    }

    fn sweep(&mut self, freed: &AtomicUsize) -> usize {
        let mut count = 0;
        let mut bytes = 0;
        for bucket in self.buckets.iter_mut() {
            let n = bucket.free.len();
            bucket.free.clear();
            bucket.allocated = bucket.allocated.saturating_sub(n);
            count += n;
            bytes += n * bucket.size;
        }
        self.buckets.retain(|b| b.allocated > 0);
        self.allocated = self.allocated.saturating_sub(count);
        self.onlist = self.onlist.saturating_sub(count);
        self.list_mem = self.list_mem.saturating_sub(bytes);
        sub_freed(freed, bytes);
        bytes
    }
}

#[derive(Debug)]
struct BlockState {
    id: u64,
    name: String,
    registered: AtomicBool,
    list: DlfttMutex<BlockList>,
}

impl PoolList for BlockState {
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
        Ok(self.list.acquire()?.sweep(freed))
    }

    fn allocated_bytes(&self) -> FreeListResult<usize> {
        let list = self.list.acquire()?;
        Ok(list.buckets.iter().map(|b| b.allocated * b.size).sum())
    }

    fn is_quiescent(&self) -> FreeListResult<bool> {
        Ok(self.list.acquire()?.allocated == 0)
    }
}

/// Counters for a block pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPoolStats {
    pub allocated: usize,
    pub onlist: usize,
    pub list_mem: usize,
    /// Bucket sizes, most recently used first.
    pub bucket_sizes: Vec<usize>,
}

/// A pool of blocks of arbitrary size.
#[derive(Debug, Clone)]
pub struct BlockPool {
    ctx: SharedAllocator,
    state: Arc<BlockState>,
}

impl BlockPool {
    pub fn new(ctx: &SharedAllocator, name: impl Into<String>) -> Self {
        Self {
            ctx: ctx.clone(),
            state: Arc::new(BlockState {
                id: ctx.next_id(),
                name: name.into(),
                registered: AtomicBool::new(false),
                list: DlfttMutex::new("block free list", BlockList::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Whether a free block of exactly `size` bytes is waiting.
    pub fn free_block_avail(&self, size: usize) -> FreeListResult<bool> {
        let mut list = self.state.list.acquire()?;
        Ok(list.promote(size) && !list.buckets[0].free.is_empty())
    }

    /// Get a block of `size` bytes. Recycled blocks keep stale contents.
    pub fn alloc(&self, size: usize) -> FreeListResult<Block> {
        if size == 0 {
            return Err(FreeListError::ZeroSize);
        }
        let head = &self.ctx.block;
        head.register(&self.state)?;
        {
            let mut list = self.state.list.acquire()?;
            if list.promote(size) {
                if let Some(data) = list.buckets[0].free.pop() {
                    list.onlist -= 1;
                    list.list_mem -= size;
                    sub_freed(&head.mem_freed, size);
                    return Ok(Block {
                        pool: self.state.id,
                        data,
                    });
                }
            }
        }

        let data = self.ctx.malloc(size)?;
        let mut list = self.state.list.acquire()?;
        list.front_for(size).allocated += 1;
        list.allocated += 1;
        trace!(pool = %self.state.name, size, "carved block");
        Ok(Block {
            pool: self.state.id,
            data,
        })
    }

    pub fn calloc(&self, size: usize) -> FreeListResult<Block> {
        let mut block = self.alloc(size)?;
        block.fill(0);
        Ok(block)
    }

    pub fn free(&self, block: Block) -> FreeListResult<()> {
        let size = block.size();
        if block.pool != self.state.id {
            return Err(FreeListError::foreign(&self.state.name, size));
        }
        let head = &self.ctx.block;
        let list_mem = {
            let mut list = self.state.list.acquire()?;
            if !list.promote(size) {
                return Err(FreeListError::foreign(&self.state.name, size));
            }
            list.buckets[0].free.push(block.data);
            list.onlist += 1;
            list.list_mem += size;
            add_freed(&head.mem_freed, size);
            list.list_mem
        };

        if self.ctx.limits.list_exceeded(Flavor::Block, list_mem) {
            self.state.gc(&head.mem_freed)?;
        }
        if self.ctx.limits.global_exceeded(Flavor::Block, head.freed()) {
            head.gc_all()?;
        }
        Ok(())
    }

    /// Change a block's size in place, keeping the common prefix.
    ///
    /// On failure `block` is left untouched.
    pub fn resize(&self, block: &mut Block, new_size: usize) -> FreeListResult<()> {
        if block.pool != self.state.id {
            return Err(FreeListError::foreign(&self.state.name, block.size()));
        }
        if block.size() == new_size {
            return Ok(());
        }
        let mut grown = self.alloc(new_size)?;
        let keep = block.size().min(new_size);
        grown[..keep].copy_from_slice(&block[..keep]);
        let old = std::mem::replace(block, grown);
        self.free(old)
    }

    /// Reallocate `block` to `new_size`, allocating fresh when `None`.
    pub fn realloc(&self, block: Option<Block>, new_size: usize) -> FreeListResult<Block> {
        match block {
            None => self.alloc(new_size),
            Some(mut block) => {
                self.resize(&mut block, new_size)?;
                Ok(block)
            }
        }
    }

    /// Release this pool's free blocks and empty buckets.
    pub fn gc(&self) -> FreeListResult<usize> {
        self.state.gc(&self.ctx.block.mem_freed)
    }

    pub fn stats(&self) -> FreeListResult<BlockPoolStats> {
        let list = self.state.list.acquire()?;
        Ok(BlockPoolStats {
            allocated: list.allocated,
            onlist: list.onlist,
            list_mem: list.list_mem,
            bucket_sizes: list.buckets.iter().map(|b| b.size).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::shared_allocator;

    fn setup() -> (SharedAllocator, BlockPool) {
        let ctx = shared_allocator();
        let pool = BlockPool::new(&ctx, "blocks");
        (ctx, pool)
    }

    #[test]
    fn test_one_bucket_per_size() {
        let (_ctx, pool) = setup();
        let a = pool.alloc(64).unwrap();
        let b = pool.alloc(128).unwrap();
        let c = pool.alloc(64).unwrap();
        let stats = pool.stats().unwrap();
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.bucket_sizes, vec![64, 128]);

        pool.free(a).unwrap();
        pool.free(b).unwrap();
        pool.free(c).unwrap();
        let stats = pool.stats().unwrap();
        assert_eq!(stats.onlist, 3);
        assert_eq!(stats.list_mem, 64 + 128 + 64);
    }

    #[test]
    fn test_lookup_promotes_bucket() {
        let (_ctx, pool) = setup();
        let blocks: Vec<_> = [8, 16, 32].iter().map(|&s| pool.alloc(s).unwrap()).collect();
        assert_eq!(pool.stats().unwrap().bucket_sizes, vec![32, 16, 8]);

        assert!(!pool.free_block_avail(8).unwrap());
        assert_eq!(pool.stats().unwrap().bucket_sizes, vec![8, 32, 16]);

        for block in blocks {
            pool.free(block).unwrap();
        }
        assert!(pool.free_block_avail(16).unwrap());
    }

    #[test]
    fn test_realloc_keeps_prefix() {
        let (_ctx, pool) = setup();
        let mut block = pool.alloc(4).unwrap();
        block.copy_from_slice(b"abcd");

        let grown = pool.realloc(Some(block), 8).unwrap();
        assert_eq!(&grown[..4], b"abcd");
        assert!(pool.free_block_avail(4).unwrap());

        let shrunk = pool.realloc(Some(grown), 2).unwrap();
        assert_eq!(&shrunk[..], b"ab");

        let same = pool.realloc(Some(shrunk), 2).unwrap();
        assert_eq!(same.size(), 2);
        pool.free(same).unwrap();
    }

    #[test]
    fn test_gc_drops_empty_buckets() {
        let (ctx, pool) = setup();
        let keep = pool.alloc(16).unwrap();
        let drop_me = pool.alloc(32).unwrap();
        pool.free(drop_me).unwrap();
        assert_eq!(ctx.mem_freed(Flavor::Block), 32);

        assert_eq!(pool.gc().unwrap(), 32);
        let stats = pool.stats().unwrap();
        assert_eq!(stats.bucket_sizes, vec![16]);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.list_mem, 0);
        assert_eq!(ctx.mem_freed(Flavor::Block), 0);
        pool.free(keep).unwrap();
    }

    #[test]
    fn test_zero_size_rejected() {
        let (_ctx, pool) = setup();
        assert!(matches!(pool.alloc(0), Err(FreeListError::ZeroSize)));
    }

    #[test]
    fn test_free_unknown_size_rejected() {
        let (ctx, pool) = setup();
        let other = BlockPool::new(&ctx, "other");
        let block = other.alloc(100).unwrap();
        assert!(matches!(
            pool.free(block),
            Err(FreeListError::ForeignBlock { size: 100, .. })
        ));
    }

    #[test]
    fn test_same_size_block_from_other_pool_rejected() {
        let (ctx, pool) = setup();
        let other = BlockPool::new(&ctx, "twin");
        let mine = pool.alloc(100).unwrap();
        let theirs = other.alloc(100).unwrap();

        assert!(matches!(
            pool.free(theirs),
            Err(FreeListError::ForeignBlock { size: 100, .. })
        ));
        let stats = pool.stats().unwrap();
        assert_eq!((stats.allocated, stats.onlist, stats.list_mem), (1, 0, 0));

        let mut stray = other.alloc(100).unwrap();
        assert!(matches!(
            pool.resize(&mut stray, 200),
            Err(FreeListError::ForeignBlock { .. })
        ));
        assert_eq!(stray.size(), 100);

        pool.free(mine).unwrap();
        assert_eq!(pool.gc().unwrap(), 100);
        assert_eq!(pool.stats().unwrap().allocated, 0);
        other.free(stray).unwrap();
    }
}
