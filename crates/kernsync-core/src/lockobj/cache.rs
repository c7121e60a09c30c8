//! Object cache backing lock-object allocation.
//!
//! Retired slots go onto a free list instead of back to the system
//! allocator, the same way freed arena slots sit in quarantine before
//! reuse. Reuse bumps nothing by itself: the generation was already
//! advanced by the final release, so handles from the previous life of a
//! slot fail their liveness check.
//!
//! Two knobs make memory exhaustion reproducible:
//! - a live-object budget (`limit`), after which `try_alloc` fails and
//!   `alloc` sleeps until a release makes room;
//! - a fault injector: a count of upcoming `try_alloc` calls to fail, and a
//!   memory-pressure switch that fails every `try_alloc` and parks every
//!   `alloc` until it is turned off.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::{EmbeddedLock, LockObj, ObjSlot};
use crate::error::{KernSyncError, Result};

/// Retired slots kept for reuse. Beyond this they are dropped.
const MAX_CACHED_SLOTS: usize = 1024;

/// Point-in-time counters for one cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjCacheStats {
    pub name: &'static str,
    pub limit: Option<usize>,
    pub live: usize,
    pub peak: usize,
    pub cached: usize,
    pub allocs: u64,
    pub frees: u64,
    pub failed_try_allocs: u64,
    pub blocked_allocs: u64,
}

struct CacheState<L> {
    free: Vec<Arc<ObjSlot<L>>>,
    live: usize,
    peak: usize,
    allocs: u64,
    frees: u64,
    failed_try_allocs: u64,
    blocked_allocs: u64,
}

pub(super) struct CacheInner<L> {
    name: &'static str,
    limit: Option<usize>,
    state: Mutex<CacheState<L>>,
    space: Condvar,
    fail_next: AtomicUsize,
    pressure: AtomicBool,
}

impl<L: EmbeddedLock> CacheInner<L> {
    fn has_room(&self, state: &CacheState<L>) -> bool {
        !self.pressure.load(Ordering::Acquire) && self.limit.is_none_or(|l| state.live < l)
    }

    /// Return a slot whose last reference was just released.
    pub(super) fn retire(&self, slot: Arc<ObjSlot<L>>) {
        let mut state = self.state.lock();
        kassert!(
            state.live > 0,
            "{}: retire with no live objects",
            self.name
        );
        state.live -= 1;
        state.frees += 1;
        if state.free.len() < MAX_CACHED_SLOTS {
            state.free.push(slot);
        }
        drop(state);
        self.space.notify_one();
    }
}

/// Allocator for lock objects of one embedded lock type.
pub struct ObjCache<L: EmbeddedLock> {
    inner: Arc<CacheInner<L>>,
}

impl<L: EmbeddedLock> ObjCache<L> {
    /// A cache named `name`, optionally bounded to `limit` live objects.
    #[must_use]
    pub fn new(name: &'static str, limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name,
                limit: limit.filter(|&n| n > 0),
                state: Mutex::new(CacheState {
                    free: Vec::new(),
                    live: 0,
                    peak: 0,
                    allocs: 0,
                    frees: 0,
                    failed_try_allocs: 0,
                    blocked_allocs: 0,
                }),
                space: Condvar::new(),
                fail_next: AtomicUsize::new(0),
                pressure: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    #[must_use]
    pub fn limit(&self) -> Option<usize> {
        self.inner.limit
    }

    /// Allocate a lock object with a reference count of one, sleeping until
    /// the cache has room. Never fails.
    pub fn alloc(&self) -> LockObj<L> {
        let mut state = self.inner.state.lock();
        if !self.inner.has_room(&state) {
            state.blocked_allocs += 1;
            log::debug!("{}: alloc waiting for memory", self.inner.name);
            while !self.inner.has_room(&state) {
                self.inner.space.wait(&mut state);
            }
        }
        self.take_slot(&mut state)
    }

    /// Allocate without sleeping.
    ///
    /// Fails with [`KernSyncError::Exhausted`] when the budget is used up,
    /// memory pressure is on, or an injected failure is due.
    pub fn try_alloc(&self) -> Result<LockObj<L>> {
        let injected = self
            .inner
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        let mut state = self.inner.state.lock();
        if injected || self.inner.pressure.load(Ordering::Acquire) {
            state.failed_try_allocs += 1;
            log::warn!("{}: try_alloc failed (injected)", self.inner.name);
            return Err(KernSyncError::Exhausted {
                cache: self.inner.name,
                limit: None,
            });
        }
        if !self.inner.has_room(&state) {
            state.failed_try_allocs += 1;
            log::warn!(
                "{}: try_alloc failed, {} live objects at limit",
                self.inner.name,
                state.live
            );
            return Err(KernSyncError::Exhausted {
                cache: self.inner.name,
                limit: self.inner.limit,
            });
        }
        Ok(self.take_slot(&mut state))
    }

    fn take_slot(&self, state: &mut CacheState<L>) -> LockObj<L> {
        state.live += 1;
        state.peak = state.peak.max(state.live);
        state.allocs += 1;
        let slot = state
            .free
            .pop()
            .unwrap_or_else(|| Arc::new(ObjSlot::new(Arc::downgrade(&self.inner))));
        LockObj::activate(slot)
    }

    /// Fail the next `n` calls to [`try_alloc`](Self::try_alloc).
    pub fn inject_failures(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::Release);
    }

    /// Simulate memory exhaustion: while on, `try_alloc` fails and `alloc`
    /// sleeps. Turning it off wakes every sleeper.
    pub fn set_memory_pressure(&self, on: bool) {
        let _state = self.inner.state.lock();
        self.inner.pressure.store(on, Ordering::Release);
        if !on {
            self.inner.space.notify_all();
        }
    }

    /// Drop every retired slot held for reuse. Returns how many were dropped.
    pub fn shrink(&self) -> usize {
        let mut state = self.inner.state.lock();
        let n = state.free.len();
        state.free.clear();
        n
    }

    #[must_use]
    pub fn stats(&self) -> ObjCacheStats {
        let state = self.inner.state.lock();
        ObjCacheStats {
            name: self.inner.name,
            limit: self.inner.limit,
            live: state.live,
            peak: state.peak,
            cached: state.free.len(),
            allocs: state.allocs,
            frees: state.frees,
            failed_try_allocs: state.failed_try_allocs,
            blocked_allocs: state.blocked_allocs,
        }
    }
}

impl<L: EmbeddedLock> std::fmt::Debug for ObjCache<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjCache")
            .field("name", &self.inner.name)
            .field("limit", &self.inner.limit)
            .finish_non_exhaustive()
    }
}

pub(super) type CacheRef<L> = Weak<CacheInner<L>>;

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::time::Duration;

    type RwCache = ObjCache<RwLock<()>>;

    #[test]
    fn alloc_starts_with_one_reference() {
        let cache = RwCache::new("test_rw", None);
        let obj = cache.alloc();
        assert_eq!(obj.refcnt(), 1);
        let stats = cache.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.allocs, 1);
        assert!(obj.release());
    }

    #[test]
    fn released_slot_is_reused() {
        let cache = RwCache::new("test_rw", None);
        let first = cache.alloc();
        assert!(first.release());
        assert_eq!(cache.stats().cached, 1);

        let second = cache.alloc();
        assert!(second.same_slot(&first));
        assert_eq!(cache.stats().cached, 0);
        assert!(second.release());
    }

    #[test]
    fn try_alloc_fails_at_limit() {
        let cache = RwCache::new("test_rw", Some(2));
        let a = cache.try_alloc().unwrap();
        let b = cache.try_alloc().unwrap();
        let err = cache.try_alloc().unwrap_err();
        assert!(matches!(
            err,
            KernSyncError::Exhausted {
                cache: "test_rw",
                limit: Some(2)
            }
        ));
        assert_eq!(cache.stats().failed_try_allocs, 1);

        assert!(a.release());
        let c = cache.try_alloc().unwrap();
        assert!(b.release());
        assert!(c.release());
        assert_eq!(cache.stats().peak, 2);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let cache = RwCache::new("test_rw", None);
        cache.inject_failures(2);
        assert!(cache.try_alloc().unwrap_err().is_exhausted());
        assert!(cache.try_alloc().unwrap_err().is_exhausted());
        let obj = cache.try_alloc().unwrap();
        assert!(obj.release());
        assert_eq!(cache.stats().failed_try_allocs, 2);
    }

    #[test]
    fn memory_pressure_fails_try_alloc() {
        let cache = RwCache::new("test_rw", None);
        cache.set_memory_pressure(true);
        assert!(cache.try_alloc().is_err());
        cache.set_memory_pressure(false);
        assert!(cache.try_alloc().unwrap().release());
    }

    #[test]
    fn blocking_alloc_waits_for_release() {
        let cache = Arc::new(RwCache::new("test_rw", Some(1)));
        let held = cache.alloc();

        let waiter = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let obj = cache.alloc();
                obj.release()
            })
        };

        // Give the waiter time to park, then make room.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.stats().live, 1);
        assert!(held.release());
        assert!(waiter.join().unwrap());

        let stats = cache.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.allocs, 2);
        assert_eq!(stats.frees, 2);
    }

    #[test]
    fn blocking_alloc_waits_out_memory_pressure() {
        let cache = Arc::new(RwCache::new("test_rw", None));
        cache.set_memory_pressure(true);

        let waiter = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.alloc().release())
        };

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.stats().allocs, 0);
        cache.set_memory_pressure(false);
        assert!(waiter.join().unwrap());
        assert_eq!(cache.stats().blocked_allocs, 1);
    }

    #[test]
    fn shrink_drops_retired_slots() {
        let cache = RwCache::new("test_rw", None);
        let objs: Vec<_> = (0..4).map(|_| cache.alloc()).collect();
        for obj in &objs {
            assert!(obj.release());
        }
        assert_eq!(cache.shrink(), 4);
        assert_eq!(cache.stats().cached, 0);
    }

    #[test]
    fn zero_limit_means_unbounded() {
        let cache = RwCache::new("test_rw", Some(0));
        assert_eq!(cache.limit(), None);
    }
}
