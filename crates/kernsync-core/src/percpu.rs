//! Per-CPU storage and current-CPU identification.
//!
//! [`PerCpu<T>`] holds one cache-line padded `T` per virtual CPU so that
//! neighbouring CPUs never false-share a line.
//!
//! User space cannot pin a thread the way `percpu_getref` disables
//! preemption, so [`current_cpu`] is only a hint: a thread may migrate right
//! after asking. Everything stored per CPU therefore keeps its own lock; the
//! CPU index only decides which shard takes the traffic.
//!
//! Resolution order for [`current_cpu`]:
//! 1. an explicit binding from [`bind_current_thread`] (drain threads, tests);
//! 2. `sched_getcpu()` on Linux;
//! 3. a stable hash of the thread id.

use std::cell::Cell;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Index;

use serde::Serialize;

/// Cache-line size used for padding.
pub const CACHE_LINE: usize = 64;

/// Index of a virtual CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CpuId(pub usize);

impl CpuId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

#[repr(C, align(64))]
struct CachePadded<T>(T);

const _: () = assert!(std::mem::align_of::<CachePadded<u8>>() == CACHE_LINE);

/// One `T` per virtual CPU.
pub struct PerCpu<T> {
    slots: Box<[CachePadded<T>]>,
}

impl<T> PerCpu<T> {
    /// Build `ncpu` slots, calling `init` once per CPU in index order.
    ///
    /// `ncpu` of zero is raised to one.
    pub fn new(ncpu: usize, mut init: impl FnMut(CpuId) -> T) -> Self {
        let slots: Vec<CachePadded<T>> = (0..ncpu.max(1))
            .map(|i| CachePadded(init(CpuId(i))))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn ncpu(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn get(&self, cpu: CpuId) -> Option<&T> {
        self.slots.get(cpu.0).map(|slot| &slot.0)
    }

    /// The slot of the CPU the calling thread is (probably) running on.
    #[must_use]
    pub fn current(&self) -> (CpuId, &T) {
        let cpu = current_cpu(self.ncpu());
        (cpu, &self.slots[cpu.0].0)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (CpuId, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (CpuId(i), &slot.0))
    }
}

impl<T> Index<CpuId> for PerCpu<T> {
    type Output = T;

    fn index(&self, cpu: CpuId) -> &T {
        &self.slots[cpu.0].0
    }
}

impl<T: fmt::Debug> fmt::Debug for PerCpu<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.slots.iter().map(|slot| &slot.0))
            .finish()
    }
}

thread_local! {
    static BOUND_CPU: Cell<Option<usize>> = const { Cell::new(None) };
    static THREAD_HASH: usize = {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish() as usize
    };
}

/// Restores the previous binding of the current thread on drop.
///
/// Not `Send`: the binding belongs to the thread that created it.
#[must_use = "the binding is undone when this guard is dropped"]
pub struct CpuBinding {
    prev: Option<usize>,
    _thread: PhantomData<*const ()>,
}

impl Drop for CpuBinding {
    fn drop(&mut self) {
        BOUND_CPU.with(|bound| bound.set(self.prev));
    }
}

/// Make [`current_cpu`] report `cpu` on this thread until the guard drops.
pub fn bind_current_thread(cpu: CpuId) -> CpuBinding {
    let prev = BOUND_CPU.with(|bound| bound.replace(Some(cpu.0)));
    CpuBinding {
        prev,
        _thread: PhantomData,
    }
}

/// The explicit binding of the calling thread, if any.
#[must_use]
pub fn bound_cpu() -> Option<CpuId> {
    BOUND_CPU.with(Cell::get).map(CpuId)
}

/// The virtual CPU the calling thread should use, in `0..ncpu`.
#[must_use]
pub fn current_cpu(ncpu: usize) -> CpuId {
    let ncpu = ncpu.max(1);
    if let Some(cpu) = BOUND_CPU.with(Cell::get) {
        return CpuId(cpu % ncpu);
    }
    let raw = hardware_cpu().unwrap_or_else(|| THREAD_HASH.with(|h| *h));
    CpuId(raw % ncpu)
}

#[cfg(target_os = "linux")]
fn hardware_cpu() -> Option<usize> {
    // SAFETY: sched_getcpu takes no arguments and only reads per-thread state.
    let cpu = unsafe { libc::sched_getcpu() };
    usize::try_from(cpu).ok()
}

#[cfg(not(target_os = "linux"))]
fn hardware_cpu() -> Option<usize> {
    None
}
