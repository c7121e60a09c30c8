//! Reference-counted lock objects.
//!
//! A lock object is a lock whose storage is not owned by any one structure.
//! Several holders share it; each takes a reference with [`LockObj::hold`]
//! and drops it with [`LockObj::release`]. The release that brings the count
//! from one to zero destroys the embedded lock and hands the storage back to
//! its [`ObjCache`].
//!
//! # Design
//!
//! - Each object is an `ObjSlot`: the embedded lock, a magic tag, the
//!   reference count and a generation, padded to whole cache lines.
//! - [`LockObj`] is a plain handle (slot pointer + generation). Cloning it
//!   copies the pointer and does **not** take a reference, exactly like
//!   passing a `krwlock_t *` around. [`LockObjRef`] is the RAII flavour.
//! - Release publishes the releaser's writes (release ordering on the
//!   decrement) and the destroyer synchronises with every earlier releaser
//!   (acquire fence after observing zero).
//! - Magic and generation are checked on every hold and release. A stale
//!   handle (object already destroyed, possibly recycled) or an unbalanced
//!   release is fatal.

mod cache;

use std::ops::Deref;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

use parking_lot::{Mutex, RwLock};

pub use cache::{ObjCache, ObjCacheStats};
use cache::CacheRef;

use crate::config::config;
use crate::error::Result;
use crate::percpu::CACHE_LINE;

/// Magic of a destroyed object.
pub const OBJ_DEAD: u32 = 0xdead_0b1e;

/// A lock type that can be embedded in a lock object.
pub trait EmbeddedLock: Send + Sync + 'static {
    /// Name used in diagnostics and cache statistics.
    const KIND: &'static str;
    /// Tag stored while an object is live.
    const MAGIC: u32;

    fn new() -> Self;

    /// True while any thread holds the lock in any mode.
    fn is_locked(&self) -> bool;
}

impl EmbeddedLock for RwLock<()> {
    const KIND: &'static str = "rw_obj";
    const MAGIC: u32 = 0x85d3_c85d;

    fn new() -> Self {
        RwLock::new(())
    }

    fn is_locked(&self) -> bool {
        RwLock::is_locked(self)
    }
}

impl EmbeddedLock for Mutex<()> {
    const KIND: &'static str = "mutex_obj";
    const MAGIC: u32 = 0x5aa3_c85d;

    fn new() -> Self {
        Mutex::new(())
    }

    fn is_locked(&self) -> bool {
        Mutex::is_locked(self)
    }
}

/// Storage of one lock object.
#[repr(C, align(64))]
pub(crate) struct ObjSlot<L> {
    lock: L,
    magic: AtomicU32,
    refcnt: AtomicU32,
    generation: AtomicU64,
    cache: CacheRef<L>,
}

const _: () = assert!(std::mem::size_of::<ObjSlot<RwLock<()>>>() % CACHE_LINE == 0);
const _: () = assert!(std::mem::size_of::<ObjSlot<Mutex<()>>>() % CACHE_LINE == 0);

impl<L: EmbeddedLock> ObjSlot<L> {
    fn new(cache: CacheRef<L>) -> Self {
        Self {
            lock: L::new(),
            magic: AtomicU32::new(OBJ_DEAD),
            refcnt: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            cache,
        }
    }
}

/// Handle to a lock object.
pub struct LockObj<L: EmbeddedLock> {
    slot: Arc<ObjSlot<L>>,
    generation: u64,
}

/// Reader/writer lock object.
pub type RwObj = LockObj<RwLock<()>>;
/// Mutex lock object.
pub type MutexObj = LockObj<Mutex<()>>;

impl<L: EmbeddedLock> LockObj<L> {
    /// Bring a fresh or recycled slot to life with one reference.
    fn activate(slot: Arc<ObjSlot<L>>) -> Self {
        let generation = slot.generation.load(Ordering::Acquire);
        slot.refcnt.store(1, Ordering::Relaxed);
        slot.magic.store(L::MAGIC, Ordering::Release);
        Self { slot, generation }
    }

    fn check(&self, op: &str) {
        let magic = self.slot.magic.load(Ordering::Acquire);
        kassert!(
            magic == L::MAGIC,
            "{}_{op}: lock {:p}: bad magic {magic:#x}",
            L::KIND,
            Arc::as_ptr(&self.slot)
        );
        let generation = self.slot.generation.load(Ordering::Acquire);
        kassert!(
            generation == self.generation,
            "{}_{op}: lock {:p}: stale handle (generation {} != {generation})",
            L::KIND,
            Arc::as_ptr(&self.slot),
            self.generation
        );
    }

    /// Take an additional reference.
    ///
    /// The caller must already own a reference; holding an object whose
    /// count may have dropped to zero is a contract violation.
    pub fn hold(&self) {
        self.check("hold");
        let prev = self.slot.refcnt.fetch_add(1, Ordering::Relaxed);
        kassert!(
            prev > 0,
            "{}_hold: lock {:p}: refcnt was zero",
            L::KIND,
            Arc::as_ptr(&self.slot)
        );
    }

    /// Drop one reference. Returns `true` if this was the last one and the
    /// object has been destroyed.
    ///
    /// After a `false` return the caller must not touch the object again
    /// through this reference.
    pub fn release(&self) -> bool {
        self.check("free");
        let prev = self.slot.refcnt.fetch_sub(1, Ordering::Release);
        kassert!(
            prev > 0,
            "{}_free: lock {:p}: refcnt underflow",
            L::KIND,
            Arc::as_ptr(&self.slot)
        );
        if prev > 1 {
            return false;
        }
        fence(Ordering::Acquire);
        self.destroy();
        true
    }

    /// Alias of [`release`](Self::release).
    pub fn free(&self) -> bool {
        self.release()
    }

    fn destroy(&self) {
        kassert!(
            !self.slot.lock.is_locked(),
            "{}_free: lock {:p}: destroyed while held",
            L::KIND,
            Arc::as_ptr(&self.slot)
        );
        self.slot.magic.store(OBJ_DEAD, Ordering::Relaxed);
        self.slot.generation.fetch_add(1, Ordering::Release);
        if let Some(cache) = self.slot.cache.upgrade() {
            cache.retire(Arc::clone(&self.slot));
        }
    }

    /// Current reference count. A racy snapshot for diagnostics only.
    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.slot.refcnt.load(Ordering::Relaxed)
    }

    /// True while this handle refers to a live object.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.slot.magic.load(Ordering::Acquire) == L::MAGIC
            && self.slot.generation.load(Ordering::Acquire) == self.generation
    }

    /// True if both handles point at the same storage, in any generation.
    #[must_use]
    pub fn same_slot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<L: EmbeddedLock> Clone for LockObj<L> {
    /// Copies the handle. The reference count is untouched.
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            generation: self.generation,
        }
    }
}

impl<L: EmbeddedLock> PartialEq for LockObj<L> {
    fn eq(&self, other: &Self) -> bool {
        self.same_slot(other) && self.generation == other.generation
    }
}

impl<L: EmbeddedLock> Eq for LockObj<L> {}

impl<L: EmbeddedLock> Deref for LockObj<L> {
    type Target = L;

    fn deref(&self) -> &L {
        self.check("lock");
        &self.slot.lock
    }
}

impl<L: EmbeddedLock> std::fmt::Debug for LockObj<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(L::KIND)
            .field("addr", &Arc::as_ptr(&self.slot))
            .field("generation", &self.generation)
            .field("refcnt", &self.refcnt())
            .finish()
    }
}

/// Owned reference to a lock object: clone holds, drop releases.
pub struct LockObjRef<L: EmbeddedLock> {
    obj: LockObj<L>,
}

impl<L: EmbeddedLock> LockObjRef<L> {
    /// Adopt one reference already owned by the caller (typically the one
    /// returned by an allocation).
    #[must_use]
    pub fn adopt(obj: LockObj<L>) -> Self {
        Self { obj }
    }

    /// Give the reference back as a bare handle without releasing it.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn into_inner(self) -> LockObj<L> {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped or used again, so `obj` is moved
        // out exactly once and its reference is not released.
        unsafe { std::ptr::read(&this.obj) }
    }

    #[must_use]
    pub fn handle(&self) -> &LockObj<L> {
        &self.obj
    }
}

impl<L: EmbeddedLock> Clone for LockObjRef<L> {
    fn clone(&self) -> Self {
        self.obj.hold();
        Self {
            obj: self.obj.clone(),
        }
    }
}

impl<L: EmbeddedLock> Drop for LockObjRef<L> {
    fn drop(&mut self) {
        self.obj.release();
    }
}

impl<L: EmbeddedLock> Deref for LockObjRef<L> {
    type Target = L;

    fn deref(&self) -> &L {
        &*self.obj
    }
}

impl<L: EmbeddedLock> std::fmt::Debug for LockObjRef<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LockObjRef").field(&self.obj).finish()
    }
}

// ---------------------------------------------------------------------------
// Process-wide caches
// ---------------------------------------------------------------------------

static RW_OBJ_CACHE: LazyLock<ObjCache<RwLock<()>>> =
    LazyLock::new(|| ObjCache::new("rw_obj", config().lockobj_limit));

static MUTEX_OBJ_CACHE: LazyLock<ObjCache<Mutex<()>>> =
    LazyLock::new(|| ObjCache::new("mutex_obj", config().lockobj_limit));

#[must_use]
pub fn rw_obj_cache() -> &'static ObjCache<RwLock<()>> {
    &RW_OBJ_CACHE
}

#[must_use]
pub fn mutex_obj_cache() -> &'static ObjCache<Mutex<()>> {
    &MUTEX_OBJ_CACHE
}

/// Allocate a reader/writer lock object, sleeping for memory if needed.
pub fn rw_obj_alloc() -> RwObj {
    RW_OBJ_CACHE.alloc()
}

/// Allocate a reader/writer lock object without sleeping.
pub fn rw_obj_tryalloc() -> Result<RwObj> {
    RW_OBJ_CACHE.try_alloc()
}

pub fn rw_obj_hold(lock: &RwObj) {
    lock.hold();
}

/// Drop a reference; `true` if the object was destroyed.
pub fn rw_obj_free(lock: &RwObj) -> bool {
    lock.release()
}

#[must_use]
pub fn rw_obj_refcnt(lock: &RwObj) -> u32 {
    lock.refcnt()
}

/// Allocate a mutex lock object, sleeping for memory if needed.
pub fn mutex_obj_alloc() -> MutexObj {
    MUTEX_OBJ_CACHE.alloc()
}

/// Allocate a mutex lock object without sleeping.
pub fn mutex_obj_tryalloc() -> Result<MutexObj> {
    MUTEX_OBJ_CACHE.try_alloc()
}

pub fn mutex_obj_hold(lock: &MutexObj) {
    lock.hold();
}

pub fn mutex_obj_free(lock: &MutexObj) -> bool {
    lock.release()
}

#[must_use]
pub fn mutex_obj_refcnt(lock: &MutexObj) -> u32 {
    lock.refcnt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw_cache() -> ObjCache<RwLock<()>> {
        ObjCache::new("test_rw", None)
    }

    #[test]
    fn slot_fills_whole_cache_lines() {
        assert_eq!(std::mem::align_of::<ObjSlot<RwLock<()>>>(), CACHE_LINE);
        assert_eq!(std::mem::size_of::<ObjSlot<Mutex<()>>>() % CACHE_LINE, 0);
    }

    #[test]
    fn hold_and_release_balance() {
        let cache = rw_cache();
        let obj = cache.alloc();
        obj.hold();
        obj.hold();
        assert_eq!(obj.refcnt(), 3);
        assert!(!obj.release());
        assert!(!obj.release());
        assert!(obj.is_live());
        assert!(obj.release());
        assert!(!obj.is_live());
        assert_eq!(cache.stats().frees, 1);
    }

    #[test]
    fn clone_copies_handle_without_reference() {
        let cache = rw_cache();
        let obj = cache.alloc();
        let copy = obj.clone();
        assert_eq!(obj.refcnt(), 1);
        assert_eq!(obj, copy);
        assert!(copy.release());
        assert!(!obj.is_live());
    }

    #[test]
    fn embedded_lock_is_usable() {
        let cache = rw_cache();
        let obj = cache.alloc();
        {
            let _r1 = obj.read();
            let _r2 = obj.read();
            assert!(obj.try_write().is_none());
        }
        assert!(obj.try_write().is_some());
        assert!(obj.release());
    }

    #[test]
    fn recycled_slot_gets_new_generation() {
        let cache = rw_cache();
        let old = cache.alloc();
        assert!(old.release());
        let new = cache.alloc();
        assert!(new.same_slot(&old));
        assert_ne!(new, old);
        assert!(new.is_live());
        assert!(!old.is_live());
        assert!(new.release());
    }

    #[test]
    #[should_panic(expected = "bad magic")]
    fn release_after_destroy_is_fatal() {
        let cache = rw_cache();
        let obj = cache.alloc();
        let stale = obj.clone();
        assert!(obj.release());
        stale.release();
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn hold_through_recycled_slot_is_fatal() {
        let cache = rw_cache();
        let stale = cache.alloc();
        assert!(stale.release());
        let _fresh = cache.alloc();
        stale.hold();
    }

    #[test]
    #[should_panic(expected = "destroyed while held")]
    fn destroying_held_lock_is_fatal() {
        let cache: ObjCache<Mutex<()>> = ObjCache::new("test_mutex", None);
        let obj = cache.alloc();
        let _guard = obj.lock();
        obj.release();
    }

    #[test]
    fn lock_obj_ref_releases_on_drop() {
        let cache = rw_cache();
        let owned = LockObjRef::adopt(cache.alloc());
        let handle = owned.handle().clone();
        let second = owned.clone();
        assert_eq!(handle.refcnt(), 2);
        drop(owned);
        assert_eq!(handle.refcnt(), 1);
        {
            let _w = second.write();
        }
        drop(second);
        assert!(!handle.is_live());
        assert_eq!(cache.stats().live, 0);
    }

    #[test]
    fn into_inner_keeps_reference() {
        let cache = rw_cache();
        let owned = LockObjRef::adopt(cache.alloc());
        let bare = owned.into_inner();
        assert!(bare.is_live());
        assert_eq!(bare.refcnt(), 1);
        // Moving the handle out neither leaks nor drops a slot owner.
        let owners = Arc::strong_count(&bare.slot);
        let again = LockObjRef::adopt(bare.clone()).into_inner();
        assert_eq!(Arc::strong_count(&bare.slot), owners + 1);
        drop(again);
        assert_eq!(Arc::strong_count(&bare.slot), owners);
        assert_eq!(bare.refcnt(), 1);
        assert!(bare.release());
    }

    #[test]
    fn global_rw_and_mutex_caches() {
        let rw = rw_obj_alloc();
        rw_obj_hold(&rw);
        assert_eq!(rw_obj_refcnt(&rw), 2);
        assert!(!rw_obj_free(&rw));
        assert!(rw_obj_free(&rw));

        let m = mutex_obj_tryalloc().expect("no budget configured in tests");
        mutex_obj_hold(&m);
        assert!(!mutex_obj_free(&m));
        assert_eq!(mutex_obj_refcnt(&m), 1);
        assert!(mutex_obj_free(&m));

        assert_eq!(rw_obj_cache().name(), "rw_obj");
        assert_eq!(mutex_obj_cache().name(), "mutex_obj");
        let _ = mutex_obj_alloc().release();
    }
}
