//! Recycling free-list pools for strata.
//!
//! Four pool flavors cut down allocation churn for objects that are created
//! and destroyed constantly:
//!
//! - [`RegularPool`]: one fixed size per pool
//! - [`BlockPool`]: many sizes, most-recently-used bucket first
//! - [`ArrayPool`]: sized by element count
//! - [`FactoryPool`]: fixed size, created and torn down by the caller
//!
//! Every pool reports to an [`AllocatorContext`]. Freeing into a pool grows
//! that pool's freed-byte total and the flavor-wide total; crossing either
//! ceiling in [`FreeListLimits`] sweeps the free blocks back to the raw
//! allocator. A failed raw allocation sweeps everything and retries once.
//!
//! Mutexes follow the DLFTT protocol from [`dlftt`].

pub mod array;
pub mod block;
pub mod context;
pub mod dlftt;
pub mod error;
pub mod factory;
pub mod limits;
pub mod regular;
pub mod stack;

pub use array::{ArrayBlock, ArrayPool};
pub use block::{Block, BlockPool, BlockPoolStats};
pub use context::{
    AllocatorContext, BackingAllocator, FreeListSizes, SharedAllocator, SystemAllocator,
    shared_allocator,
};
pub use dlftt::{
    DisableLocking, DlfttGuard, DlfttMutex, disable_locking_for_thread, locking_disabled,
};
pub use error::{FreeListError, FreeListResult};
pub use factory::FactoryPool;
pub use limits::{Flavor, FreeListLimits};
pub use regular::RegularPool;
pub use stack::{Chunk, PoolStats};
