//! Disable-locking-for-this-thread (DLFTT) mutex.
//!
//! A per-thread counter marks scopes where the caller already holds a
//! coarser lock, or runs a callback that may re-enter a pool. Each mutex
//! remembers which thread holds it, so [`DlfttMutex::acquire`] can tell
//! re-entry from ordinary contention: re-entry reports
//! [`FreeListError::CantLock`] instead of deadlocking, while a lock held by
//! another thread is simply waited for.
//!
//! ## Design Decisions
//!
//! - **Guard-scoped counter**: [`DisableLocking`] increments on creation and
//!   decrements on drop, so early returns and panics cannot leak a disabled
//!   state. Guards nest.
//! - **Never skip the lock outright**: eliding acquisition entirely would
//!   hand out aliased `&mut T`. Re-entry is refused rather than granted.
//! - **Owner token, not `try_lock`**: a failed `try_lock` cannot distinguish
//!   the caller's own guard from another thread's, and turning plain
//!   contention into an error makes disabled scopes fail at random.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::error::{FreeListError, FreeListResult};

/// Owner value of a mutex nobody holds.
const NO_OWNER: u64 = 0;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DLFTT: Cell<u32> = const { Cell::new(0) };
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// Current DLFTT depth for the calling thread.
pub fn dlftt_depth() -> u32 {
    DLFTT.with(Cell::get)
}

/// Whether locking is disabled for the calling thread.
pub fn locking_disabled() -> bool {
    dlftt_depth() > 0
}

/// RAII token that disables blocking lock acquisition on this thread.
///
/// Not `Send`: the counter it adjusts is thread-local.
#[derive(Debug)]
#[must_use = "locking is re-enabled as soon as the guard is dropped"]
pub struct DisableLocking {
    _not_send: PhantomData<*const ()>,
}

impl DisableLocking {
    pub fn new() -> Self {
        DLFTT.with(|c| c.set(c.get().saturating_add(1)));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for DisableLocking {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DisableLocking {
    fn drop(&mut self) {
        DLFTT.with(|c| c.set(c.get().saturating_sub(1)));
    }
}

/// Convenience wrapper for [`DisableLocking::new`].
pub fn disable_locking_for_thread() -> DisableLocking {
    DisableLocking::new()
}

/// A mutex that honors the DLFTT protocol.
#[derive(Debug)]
pub struct DlfttMutex<T> {
    name: &'static str,
    owner: AtomicU64,
    inner: Mutex<T>,
}

impl<T> DlfttMutex<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            owner: AtomicU64::new(NO_OWNER),
            inner: Mutex::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the mutex, waiting out other threads. Release happens when
    /// the guard drops.
    ///
    /// Fails with [`FreeListError::CantLock`] if the calling thread already
    /// holds it.
    pub fn acquire(&self) -> FreeListResult<DlfttGuard<'_, T>> {
        let me = thread_token();
        // Only this thread ever stores `me`, so a stale read cannot match.
        if self.owner.load(Ordering::Relaxed) == me {
            if locking_disabled() {
                trace!(mutex = self.name, "re-entry refused while locking disabled");
            } else {
                warn!(mutex = self.name, "re-entrant acquire refused");
            }
            return Err(FreeListError::CantLock(self.name));
        }
        let guard = self.inner.lock();
        self.owner.store(me, Ordering::Relaxed);
        Ok(DlfttGuard {
            owner: &self.owner,
            guard,
        })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Exclusive access to a [`DlfttMutex`]'s value.
#[derive(Debug)]
pub struct DlfttGuard<'a, T> {
    owner: &'a AtomicU64,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for DlfttGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for DlfttGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for DlfttGuard<'_, T> {
    fn drop(&mut self) {
        // Runs before `guard` unlocks.
        self.owner.store(NO_OWNER, Ordering::Relaxed);
    }
}
