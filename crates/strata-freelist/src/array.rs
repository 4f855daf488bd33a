//! Array pools: blocks sized by element count.
//!
//! Bucket `n` holds blocks of `base_size + elem_size * n` bytes, for
//! `n < maxelem`.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use crate::context::{PoolList, SharedAllocator, add_freed, sub_freed};
use crate::dlftt::DlfttMutex;
use crate::error::{FreeListError, FreeListResult};
use crate::limits::Flavor;

/// An array block tagged with its element count.
#[derive(Debug, PartialEq, Eq)]
pub struct ArrayBlock {
    /// Id of the pool that carved it.
    pool: u64,
    nelem: usize,
    data: Box<[u8]>,
}

impl ArrayBlock {
    pub fn nelem(&self) -> usize {
        self.nelem
    }
}

impl Deref for ArrayBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for ArrayBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Debug, Default)]
struct ArrayBucket {
    allocated: usize,
    free: Vec<Box<[u8]>>,
}

#[derive(Debug)]
struct ArrayList {
    buckets: Vec<ArrayBucket>,
    allocated: usize,
    list_mem: usize,
}

#[derive(Debug)]
struct ArrayState {
    id: u64,
    name: String,
    base_size: usize,
    elem_size: usize,
    maxelem: usize,
    registered: AtomicBool,
    list: DlfttMutex<ArrayList>,
}

impl ArrayState {
    fn bucket_size(&self, nelem: usize) -> usize {
        self.base_size + self.elem_size * nelem
    }
}

impl PoolList for ArrayState {
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
        let mut guard = self.list.acquire()?;
        let list = &mut *guard;
        let mut bytes = 0;
        for (nelem, bucket) in list.buckets.iter_mut().enumerate() {
            let n = bucket.free.len();
            bucket.free.clear();
            bucket.allocated = bucket.allocated.saturating_sub(n);
            list.allocated = list.allocated.saturating_sub(n);
            bytes += n * self.bucket_size(nelem);
        }
        list.list_mem = list.list_mem.saturating_sub(bytes);
        sub_freed(freed, bytes);
        Ok(bytes)
    }

    fn allocated_bytes(&self) -> FreeListResult<usize> {
        let list = self.list.acquire()?;
        Ok(list
            .buckets
            .iter()
            .enumerate()
            .map(|(nelem, b)| b.allocated * self.bucket_size(nelem))
            .sum())
    }

    fn is_quiescent(&self) -> FreeListResult<bool> {
        Ok(self.list.acquire()?.allocated == 0)
    }
}

/// A pool of arrays of up to `maxelem - 1` elements.
#[derive(Debug, Clone)]
pub struct ArrayPool {
    ctx: SharedAllocator,
    state: Arc<ArrayState>,
}

impl ArrayPool {
    pub fn new(
        ctx: &SharedAllocator,
        name: impl Into<String>,
        base_size: usize,
        elem_size: usize,
        maxelem: usize,
    ) -> Self {
        let buckets = std::iter::repeat_with(ArrayBucket::default)
            .take(maxelem)
            .collect();
        Self {
            ctx: ctx.clone(),
            state: Arc::new(ArrayState {
                id: ctx.next_id(),
                name: name.into(),
                base_size,
                elem_size,
                maxelem,
                registered: AtomicBool::new(false),
                list: DlfttMutex::new(
                    "array free list",
                    ArrayList {
                        buckets,
                        allocated: 0,
                        list_mem: 0,
                    },
                ),
            }),
        }
    }

    pub fn maxelem(&self) -> usize {
        self.state.maxelem
    }

    /// Bytes in a block holding `nelem` elements.
    pub fn block_size(&self, nelem: usize) -> usize {
        self.state.bucket_size(nelem)
    }

    fn check_range(&self, nelem: usize) -> FreeListResult<()> {
        if nelem >= self.state.maxelem {
            return Err(FreeListError::ElementCountOutOfRange {
                pool: self.state.name.clone(),
                nelem,
                maxelem: self.state.maxelem,
            });
        }
        Ok(())
    }

    pub fn alloc(&self, nelem: usize) -> FreeListResult<ArrayBlock> {
        self.check_range(nelem)?;
        let size = self.state.bucket_size(nelem);
        let head = &self.ctx.array;
        head.register(&self.state)?;
        {
            let mut list = self.state.list.acquire()?;
            if let Some(data) = list.buckets[nelem].free.pop() {
                list.list_mem -= size;
                sub_freed(&head.mem_freed, size);
                return Ok(ArrayBlock {
                    pool: self.state.id,
                    nelem,
                    data,
                });
            }
        }

        let data = self.ctx.malloc(size)?;
        let mut list = self.state.list.acquire()?;
        list.buckets[nelem].allocated += 1;
        list.allocated += 1;
        Ok(ArrayBlock {
            pool: self.state.id,
            nelem,
            data,
        })
    }

    pub fn calloc(&self, nelem: usize) -> FreeListResult<ArrayBlock> {
        let mut block = self.alloc(nelem)?;
        block.fill(0);
        Ok(block)
    }

    pub fn free(&self, block: ArrayBlock) -> FreeListResult<()> {
        let nelem = block.nelem;
        let size = self.state.bucket_size(nelem);
        let owned = block.pool == self.state.id;
        if !owned || nelem >= self.state.maxelem || block.data.len() != size {
            return Err(FreeListError::foreign(&self.state.name, block.data.len()));
        }

        let head = &self.ctx.array;
        let list_mem = {
            let mut list = self.state.list.acquire()?;
            list.buckets[nelem].free.push(block.data);
            list.list_mem += size;
            add_freed(&head.mem_freed, size);
            list.list_mem
        };

        if self.ctx.limits.list_exceeded(Flavor::Array, list_mem) {
            self.state.gc(&head.mem_freed)?;
        }
        if self.ctx.limits.global_exceeded(Flavor::Array, head.freed()) {
            head.gc_all()?;
        }
        Ok(())
    }

    /// Resize to `new_elem` elements, copying the shorter block's bytes.
    pub fn realloc(&self, block: Option<ArrayBlock>, new_elem: usize) -> FreeListResult<ArrayBlock> {
        let Some(block) = block else {
            return self.alloc(new_elem);
        };
        if block.pool != self.state.id {
            return Err(FreeListError::foreign(&self.state.name, block.len()));
        }
        if block.nelem == new_elem {
            return Ok(block);
        }
        let mut fresh = self.alloc(new_elem)?;
        let keep = block.len().min(fresh.len());
        fresh[..keep].copy_from_slice(&block[..keep]);
        self.free(block)?;
        Ok(fresh)
    }

    pub fn gc(&self) -> FreeListResult<usize> {
        self.state.gc(&self.ctx.array.mem_freed)
    }

    /// Total blocks carved and bytes waiting on the free lists.
    pub fn stats(&self) -> FreeListResult<(usize, usize)> {
        let list = self.state.list.acquire()?;
        Ok((list.allocated, list.list_mem))
    }
}
