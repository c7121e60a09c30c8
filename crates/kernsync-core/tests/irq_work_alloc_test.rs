//! Queueing must not touch the heap: callers may be in contexts that cannot
//! allocate. Lives in its own test binary because it installs a counting
//! global allocator.
#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kernsync_core::{CpuId, IrqWork, IrqWorkDomain, KernSyncConfig, SoftIntMode};

struct CountingAlloc;

static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static COUNTING: Cell<bool> = const { Cell::new(false) };
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if COUNTING.with(Cell::get) {
            ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        }
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if COUNTING.with(Cell::get) {
            ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        }
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

/// Allocations made by `f` on this thread.
fn allocations_during(f: impl FnOnce()) -> usize {
    let before = ALLOCATIONS.load(Ordering::SeqCst);
    COUNTING.with(|c| c.set(true));
    f();
    COUNTING.with(|c| c.set(false));
    ALLOCATIONS.load(Ordering::SeqCst) - before
}

fn manual(ncpu: usize) -> IrqWorkDomain {
    let cfg = KernSyncConfig::default()
        .with_ncpu(ncpu)
        .with_softint(SoftIntMode::Manual);
    IrqWorkDomain::new(&cfg).unwrap()
}

#[test]
fn queue_and_coalesce_do_not_allocate() {
    let domain = manual(2);
    let items: Vec<Arc<IrqWork>> = (0..64).map(|_| IrqWork::new(|_| {})).collect();

    let n = allocations_during(|| {
        for (i, work) in items.iter().enumerate() {
            assert!(domain.queue_on(CpuId(i % 2), work));
        }
        // Coalesced requests too.
        for work in &items {
            assert!(!domain.queue_on(CpuId(0), work));
        }
    });
    assert_eq!(n, 0, "queue path allocated {n} times");
    assert_eq!(domain.pending(CpuId(0)) + domain.pending(CpuId(1)), 64);

    assert_eq!(domain.run_softints(), 64);
    domain.fini();
}

#[test]
fn requeue_from_callback_does_not_allocate() {
    let domain = manual(1);
    let again = Arc::new(AtomicBool::new(true));
    let a = Arc::clone(&again);
    let work = IrqWork::new(move |ctx| {
        if a.load(Ordering::SeqCst) {
            ctx.requeue();
        }
    });
    domain.queue_on(CpuId(0), &work);

    let n = allocations_during(|| {
        for _ in 0..32 {
            assert_eq!(domain.drain(CpuId(0)), 1);
        }
    });
    assert_eq!(n, 0, "drain with requeue allocated {n} times");

    again.store(false, Ordering::SeqCst);
    assert_eq!(domain.drain(CpuId(0)), 1);
    assert!(!work.is_busy());
    domain.fini();
}
