//! Factory pools: caller-created fixed-size pools with explicit teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::debug;

use crate::context::{PoolList, SharedAllocator, add_freed, sub_freed};
use crate::dlftt::DlfttMutex;
use crate::error::{FreeListError, FreeListResult};
use crate::limits::Flavor;
use crate::stack::{Chunk, FreeStack, PoolStats};

#[derive(Debug)]
struct FactoryState {
    id: u64,
    name: String,
    size: usize,
    registered: AtomicBool,
    terminated: AtomicBool,
    list: DlfttMutex<FreeStack>,
}

impl PoolList for FactoryState {
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

/// A fixed-size pool the caller creates with [`FactoryPool::init`] and
/// tears down with [`FactoryPool::term`].
#[derive(Debug, Clone)]
pub struct FactoryPool {
    ctx: SharedAllocator,
    state: Arc<FactoryState>,
}

impl FactoryPool {
    /// Create a factory for `size`-byte blocks and link it into the registry.
    pub fn init(ctx: &SharedAllocator, size: usize) -> FreeListResult<Self> {
        if size == 0 {
            return Err(FreeListError::ZeroSize);
        }
        let id = ctx.next_id();
        let pool = Self {
            ctx: ctx.clone(),
            state: Arc::new(FactoryState {
                id,
                name: format!("factory-{id}-{size}"),
                size,
                registered: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                list: DlfttMutex::new("factory free list", FreeStack::default()),
            }),
        };
        ctx.factory.register(&pool.state)?;
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.state.size
    }

    fn check_live(&self) -> FreeListResult<()> {
        if self.state.terminated.load(Ordering::Acquire) {
            return Err(FreeListError::Terminated);
        }
        Ok(())
    }

    pub fn alloc(&self) -> FreeListResult<Chunk> {
        self.check_live()?;
        let head = &self.ctx.factory;
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
        Ok(Chunk {
            pool: self.state.id,
            data,
        })
    }

    pub fn calloc(&self) -> FreeListResult<Chunk> {
        let mut chunk = self.alloc()?;
        chunk.fill(0);
        Ok(chunk)
    }

    pub fn free(&self, chunk: Chunk) -> FreeListResult<()> {
        let size = self.state.size;
        if chunk.pool != self.state.id || chunk.size() != size {
            return Err(FreeListError::foreign(&self.state.name, chunk.size()));
        }

        let head = &self.ctx.factory;
        let list_freed = {
            let mut list = self.state.list.acquire()?;
            list.free.push(chunk.data);
            add_freed(&head.mem_freed, size);
            list.free.len() * size
        };

        if self.ctx.limits.list_exceeded(Flavor::Factory, list_freed) {
            self.state.gc(&head.mem_freed)?;
        }
        if self.ctx.limits.global_exceeded(Flavor::Factory, head.freed()) {
            head.gc_all()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> FreeListResult<PoolStats> {
        Ok(self.state.list.acquire()?.stats(self.state.size))
    }

    /// Release the free list and unlink the factory.
    ///
    /// Fails with [`FreeListError::StillAllocated`] while any block is
    /// outstanding; the factory stays usable in that case.
    #[tracing::instrument(skip(self), name = "freelist.factory_term", fields(pool = %self.state.name))]
    pub fn term(&self) -> FreeListResult<()> {
        self.check_live()?;
        let outstanding = {
            let mut list = self.state.list.acquire()?;
            list.sweep(self.state.size, &self.ctx.factory.mem_freed);
            list.allocated
        };
        if outstanding > 0 {
            return Err(FreeListError::StillAllocated { outstanding });
        }

        self.ctx.factory.deregister(self.state.id)?;
        self.state.terminated.store(true, Ordering::Release);
        debug!("factory terminated");
        Ok(())
    }
}
