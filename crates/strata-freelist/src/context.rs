//! AllocatorContext: the registry every pool reports to.
//!
//! One context holds the garbage-collection heads for all four flavors, the
//! GC ceilings and the raw allocator. Pools are created against a
//! [`SharedAllocator`] and register themselves with their flavor's head on
//! first use, so independent contexts never interfere (tests run them in
//! parallel).
//!
//! Lock order is always registry before pool. Pool operations release their
//! own mutex before touching a registry or the raw allocator.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tracing::{debug, warn};

use crate::dlftt::DlfttMutex;
use crate::error::{FreeListError, FreeListResult};
use crate::limits::{AtomicLimits, Flavor, FreeListLimits};

/// Source of raw, zero-initialized memory.
pub trait BackingAllocator: Send + Sync + fmt::Debug {
    /// Allocate `size` zeroed bytes, or `None` when memory is exhausted.
    fn allocate(&self, size: usize) -> Option<Box<[u8]>>;
}

/// Allocates from the global Rust allocator without aborting on failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl BackingAllocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Option<Box<[u8]>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).ok()?;
        buf.resize(size, 0);
        Some(buf.into_boxed_slice())
    }
}

/// Per-pool hooks used by the flavor registry.
pub(crate) trait PoolList: Send + Sync + fmt::Debug {
    fn id(&self) -> u64;
    fn name(&self) -> &str;
    fn registered(&self) -> &AtomicBool;

    /// Release every block on the free list. Returns the bytes released.
    fn gc(&self, freed: &AtomicUsize) -> FreeListResult<usize>;

    /// Bytes carved from the raw allocator and not yet released.
    fn allocated_bytes(&self) -> FreeListResult<usize>;

    /// True when no block is carved (in use or on the free list).
    fn is_quiescent(&self) -> FreeListResult<bool>;
}

pub(crate) fn add_freed(counter: &AtomicUsize, bytes: usize) {
    counter.fetch_add(bytes, Ordering::Relaxed);
}

pub(crate) fn sub_freed(counter: &AtomicUsize, bytes: usize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(bytes))
    });
}

/// Garbage-collection head for one flavor: the list of lists plus the
/// flavor-wide freed-byte counter.
#[derive(Debug)]
pub(crate) struct GcHead {
    flavor: Flavor,
    lists: DlfttMutex<BTreeMap<u64, Arc<dyn PoolList>>>,
    pub(crate) mem_freed: AtomicUsize,
}

impl GcHead {
    fn new(flavor: Flavor, lock_name: &'static str) -> Self {
        Self {
            flavor,
            lists: DlfttMutex::new(lock_name, BTreeMap::new()),
            mem_freed: AtomicUsize::new(0),
        }
    }

    /// Link a pool into the registry the first time it is used.
    pub(crate) fn register<P: PoolList + 'static>(&self, pool: &Arc<P>) -> FreeListResult<()> {
        if pool.registered().swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.lists.acquire() {
            Ok(mut lists) => {
                let entry: Arc<dyn PoolList> = pool.clone();
                lists.insert(pool.id(), entry);
                debug!(flavor = %self.flavor, pool = pool.name(), "registered free list");
                Ok(())
            }
            Err(e) => {
                pool.registered().store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub(crate) fn deregister(&self, id: u64) -> FreeListResult<()> {
        let mut lists = self.lists.acquire()?;
        if let Some(pool) = lists.remove(&id) {
            pool.registered().store(false, Ordering::Release);
        }
        Ok(())
    }

    pub(crate) fn freed(&self) -> usize {
        self.mem_freed.load(Ordering::Relaxed)
    }

    /// Sweep every registered pool of this flavor.
    pub(crate) fn gc_all(&self) -> FreeListResult<usize> {
        let lists = self.lists.acquire()?;
        let mut released = 0;
        for pool in lists.values() {
            released += pool.gc(&self.mem_freed)?;
        }
        if released > 0 {
            debug!(flavor = %self.flavor, released, "collected free lists");
        }
        Ok(released)
    }

    fn allocated_bytes(&self) -> FreeListResult<usize> {
        let lists = self.lists.acquire()?;
        lists
            .values()
            .try_fold(0usize, |acc, pool| -> FreeListResult<usize> {
                Ok(acc + pool.allocated_bytes()?)
            })
    }

    fn len(&self) -> FreeListResult<usize> {
        Ok(self.lists.acquire()?.len())
    }

    /// Drop quiescent pools from the registry, returning how many remain.
    fn term(&self) -> FreeListResult<usize> {
        let mut lists = self.lists.acquire()?;
        let mut first_err = None;
        lists.retain(|_, pool| match pool.is_quiescent() {
            Ok(true) => {
                pool.registered().store(false, Ordering::Release);
                false
            }
            Ok(false) => true,
            Err(e) => {
                first_err.get_or_insert(e);
                true
            }
        });
        if let Some(e) = first_err {
            return Err(e);
        }
        for pool in lists.values() {
            debug!(flavor = %self.flavor, pool = pool.name(), "free list still active");
        }
        Ok(lists.len())
    }
}

/// Bytes currently carved from the raw allocator, per flavor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FreeListSizes {
    pub regular: usize,
    pub array: usize,
    pub block: usize,
    pub factory: usize,
}

/// Shared handle to an allocator context.
pub type SharedAllocator = Arc<AllocatorContext>;

/// Create a new shared allocator with default limits.
pub fn shared_allocator() -> SharedAllocator {
    Arc::new(AllocatorContext::new())
}

/// Registry and tuning state for all free-list flavors.
#[derive(Debug)]
pub struct AllocatorContext {
    backing: Box<dyn BackingAllocator>,
    pub(crate) limits: AtomicLimits,
    pub(crate) regular: GcHead,
    pub(crate) array: GcHead,
    pub(crate) block: GcHead,
    pub(crate) factory: GcHead,
    next_id: AtomicU64,
}

impl Default for AllocatorContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocatorContext {
    pub fn new() -> Self {
        Self::with_backing(Box::new(SystemAllocator))
    }

    /// Build a context over a custom raw allocator.
    pub fn with_backing(backing: Box<dyn BackingAllocator>) -> Self {
        Self {
            backing,
            limits: AtomicLimits::new(FreeListLimits::default()),
            regular: GcHead::new(Flavor::Regular, "regular free list registry"),
            array: GcHead::new(Flavor::Array, "array free list registry"),
            block: GcHead::new(Flavor::Block, "block free list registry"),
            factory: GcHead::new(Flavor::Factory, "factory registry"),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_limits(self, limits: FreeListLimits) -> Self {
        self.limits.store(limits);
        self
    }

    pub fn into_shared(self) -> SharedAllocator {
        Arc::new(self)
    }

    pub fn limits(&self) -> FreeListLimits {
        self.limits.load()
    }

    /// Replace the GC ceilings. Takes effect on the next free.
    pub fn set_limits(&self, limits: FreeListLimits) {
        self.limits.store(limits);
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn head(&self, flavor: Flavor) -> &GcHead {
        match flavor {
            Flavor::Regular => &self.regular,
            Flavor::Array => &self.array,
            Flavor::Block => &self.block,
            Flavor::Factory => &self.factory,
        }
    }

    /// Allocate raw memory, sweeping every free list and retrying once if
    /// the first attempt fails.
    pub(crate) fn malloc(&self, size: usize) -> FreeListResult<Box<[u8]>> {
        if let Some(buf) = self.backing.allocate(size) {
            return Ok(buf);
        }
        warn!(size, "allocation failed, collecting free lists and retrying");
        self.garbage_collect()?;
        self.backing
            .allocate(size)
            .ok_or(FreeListError::CantAlloc { size })
    }

    /// Free-list bytes waiting for reuse across one flavor.
    pub fn mem_freed(&self, flavor: Flavor) -> usize {
        self.head(flavor).freed()
    }

    /// Number of pools of a flavor currently registered.
    pub fn registered_pools(&self, flavor: Flavor) -> FreeListResult<usize> {
        self.head(flavor).len()
    }

    /// Release every free block of every flavor back to the raw allocator.
    #[tracing::instrument(skip(self), name = "freelist.gc")]
    pub fn garbage_collect(&self) -> FreeListResult<()> {
        self.array.gc_all()?;
        self.block.gc_all()?;
        self.regular.gc_all()?;
        self.factory.gc_all()?;
        Ok(())
    }

    /// Bytes currently carved per flavor, whether in use or on a free list.
    pub fn sizes(&self) -> FreeListResult<FreeListSizes> {
        Ok(FreeListSizes {
            regular: self.regular.allocated_bytes()?,
            array: self.array.allocated_bytes()?,
            block: self.block.allocated_bytes()?,
            factory: self.factory.allocated_bytes()?,
        })
    }

    /// Tear down quiescent pools.
    ///
    /// Returns the number of pools that still have blocks outstanding. A
    /// positive value asks the caller to retry once those are released.
    #[tracing::instrument(skip(self), name = "freelist.term")]
    pub fn term(&self) -> FreeListResult<usize> {
        self.garbage_collect()?;
        let active = self.array.term()?
            + self.block.term()?
            + self.regular.term()?
            + self.factory.term()?;
        debug!(active, "free list termination pass");
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_allocator_zeroes() {
        let buf = SystemAllocator.allocate(64).unwrap();
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_freed_counter_saturates() {
        let counter = AtomicUsize::new(8);
        sub_freed(&counter, 16);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        add_freed(&counter, 4);
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_set_limits_visible() {
        let ctx = AllocatorContext::new();
        ctx.set_limits(FreeListLimits::unlimited());
        assert_eq!(ctx.limits(), FreeListLimits::unlimited());
    }

    #[test]
    fn test_empty_context_terms_clean() {
        let ctx = shared_allocator();
        assert_eq!(ctx.term().unwrap(), 0);
        assert_eq!(ctx.sizes().unwrap(), FreeListSizes::default());
    }
}
