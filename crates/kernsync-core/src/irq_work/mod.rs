//! Deferred work queued from restricted contexts.
//!
//! An [`IrqWork`] is a caller-owned callback that can be queued from code
//! that must not block or allocate (the hard-interrupt analogue). Queueing
//! appends it to the current CPU's queue and schedules that CPU's softint;
//! the softint later drains the queue and runs each callback.
//!
//! # State
//!
//! - `IRQ_WORK_PENDING`: set by a successful queue, cleared just before the
//!   callback runs. While set, further queue calls are no-ops that return
//!   `false`, so any number of requests before a drain collapse into one run.
//! - a running count: callbacks of this item currently in progress. An item
//!   queued on a second CPU while its callback runs on the first can run on
//!   both at once, so this is a count and not a bit. [`irq_work_sync`] waits
//!   until the item is neither pending nor running anywhere.
//!
//! Because `PENDING` is cleared before the callback runs, a callback may
//! queue its own item. The new request lands in the next drain pass, never
//! the batch currently being processed.
//!
//! Queues are intrusive lists threaded through the items themselves, so
//! queueing never allocates.
//!
//! # Ordering
//!
//! FIFO per CPU within one batch. No ordering between CPUs.

mod domain;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

pub use domain::{IrqWorkCpuStats, IrqWorkDomain, IrqWorkStats};
use domain::IrqWorkShared;

use crate::config::KernSyncConfig;
use crate::error::{KernSyncError, Result};
use crate::percpu::CpuId;

pub const IRQ_WORK_PENDING: u32 = 1 << 0;

type IrqWorkFn = dyn Fn(&IrqWorkContext<'_>) + Send + Sync;

/// A deferred callback and its pending state.
pub struct IrqWork {
    flags: AtomicU32,
    running: AtomicU32,
    /// Queue linkage. Only the list the item is on touches it.
    next: Mutex<Option<Arc<IrqWork>>>,
    func: Box<IrqWorkFn>,
}

impl IrqWork {
    /// A new idle work item that will run `func` each time it is drained.
    pub fn new<F>(func: F) -> Arc<Self>
    where
        F: Fn(&IrqWorkContext<'_>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            flags: AtomicU32::new(0),
            running: AtomicU32::new(0),
            next: Mutex::new(None),
            func: Box::new(func),
        })
    }

    /// Queued and not yet started.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.flags.load(Ordering::Acquire) & IRQ_WORK_PENDING != 0
    }

    /// Callbacks of this item in progress, on any CPU.
    #[must_use]
    pub fn running(&self) -> u32 {
        self.running.load(Ordering::Acquire)
    }

    /// Queued or running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        // PENDING first: run() raises the count before clearing it.
        self.is_pending() || self.running() != 0
    }

    /// Test-and-set `PENDING`. True if this call made the item pending.
    fn claim(&self) -> bool {
        let prev = self.flags.fetch_or(IRQ_WORK_PENDING, Ordering::AcqRel);
        prev & IRQ_WORK_PENDING == 0
    }

    fn run(self: &Arc<Self>, cpu: CpuId, domain: &IrqWorkShared) {
        self.running.fetch_add(1, Ordering::AcqRel);
        let _running = RunningGuard(&self.running);
        // Acquire pairs with the release in claim(): writes made before any
        // coalesced queue call are visible to this run.
        self.flags.fetch_and(!IRQ_WORK_PENDING, Ordering::AcqRel);
        let ctx = IrqWorkContext {
            work: self,
            cpu,
            domain,
        };
        (self.func)(&ctx);
    }
}

/// Drops the running count even if the callback panics.
struct RunningGuard<'a>(&'a AtomicU32);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Release);
    }
}

impl std::fmt::Debug for IrqWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqWork")
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// What a running callback can see and do.
pub struct IrqWorkContext<'a> {
    work: &'a Arc<IrqWork>,
    cpu: CpuId,
    domain: &'a IrqWorkShared,
}

impl IrqWorkContext<'_> {
    /// The item being run.
    #[must_use]
    pub fn work(&self) -> &Arc<IrqWork> {
        self.work
    }

    /// The CPU whose queue is being drained.
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Queue the running item again, for the next drain of this CPU.
    pub fn requeue(&self) -> bool {
        self.domain.queue_on(self.cpu, self.work)
    }

    /// Queue another item on this CPU.
    pub fn queue(&self, work: &Arc<IrqWork>) -> bool {
        self.domain.queue_on(self.cpu, work)
    }
}

/// Build a work item. Equivalent to [`IrqWork::new`].
pub fn init_irq_work<F>(func: F) -> Arc<IrqWork>
where
    F: Fn(&IrqWorkContext<'_>) + Send + Sync + 'static,
{
    IrqWork::new(func)
}

// ---------------------------------------------------------------------------
// Process-wide subsystem
// ---------------------------------------------------------------------------

static IRQ_WORK: RwLock<Option<Arc<IrqWorkDomain>>> = RwLock::new(None);

/// Bring up the process-wide dispatcher. Called once at load time.
pub fn irq_work_init(cfg: &KernSyncConfig) -> Result<()> {
    let mut slot = IRQ_WORK.write();
    if slot.is_some() {
        return Err(KernSyncError::AlreadyInitialized);
    }
    *slot = Some(Arc::new(IrqWorkDomain::new(cfg)?));
    Ok(())
}

/// Tear down the process-wide dispatcher.
///
/// The caller guarantees no queue call starts once this begins. Pending
/// work that the softint does not drain during teardown is fatal.
pub fn irq_work_fini() -> Result<()> {
    let domain = IRQ_WORK.write().take().ok_or(KernSyncError::NotInitialized)?;
    domain.fini();
    Ok(())
}

fn global(op: &str) -> Arc<IrqWorkDomain> {
    match IRQ_WORK.read().as_ref() {
        Some(domain) => Arc::clone(domain),
        None => crate::diag::fatal(format_args!("{op}: irq_work not initialised")),
    }
}

/// Queue `work` on the current CPU of the process-wide dispatcher.
///
/// Returns `false` if it was already pending.
pub fn irq_work_queue(work: &Arc<IrqWork>) -> bool {
    global("irq_work_queue").queue(work)
}

/// Queue `work` on a specific CPU of the process-wide dispatcher.
pub fn irq_work_queue_on(cpu: CpuId, work: &Arc<IrqWork>) -> bool {
    global("irq_work_queue_on").queue_on(cpu, work)
}

#[must_use]
pub fn irq_work_is_pending(work: &IrqWork) -> bool {
    work.is_pending()
}

/// Wait until `work` is neither queued nor running.
///
/// Sleepable contexts only. With a manual softint the caller must keep
/// draining, or this never returns.
pub fn irq_work_sync(work: &IrqWork) {
    while work.is_busy() {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoftIntMode;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn new_item_is_idle() {
        let work = IrqWork::new(|_| {});
        assert!(!work.is_pending());
        assert!(!work.is_busy());
        assert!(!irq_work_is_pending(&work));
    }

    #[test]
    fn claim_is_test_and_set() {
        let work = init_irq_work(|_| {});
        assert!(work.claim());
        assert!(work.is_pending());
        assert!(work.is_busy());
        assert_eq!(work.running(), 0);
        assert!(!work.claim());
    }

    #[test]
    fn sync_returns_once_idle() {
        let work = IrqWork::new(|_| {});
        irq_work_sync(&work);
    }

    // The only test that touches the process-wide slot; keep it that way so
    // parallel tests never race on init/fini.
    #[test]
    fn global_lifecycle() {
        let cfg = KernSyncConfig::default()
            .with_ncpu(2)
            .with_softint(SoftIntMode::Thread);
        assert!(matches!(
            irq_work_fini(),
            Err(KernSyncError::NotInitialized)
        ));
        irq_work_init(&cfg).unwrap();
        assert!(matches!(
            irq_work_init(&cfg),
            Err(KernSyncError::AlreadyInitialized)
        ));

        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let work = IrqWork::new(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert!(irq_work_queue_on(CpuId(1), &work));
        irq_work_sync(&work);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert!(irq_work_queue(&work));
        irq_work_sync(&work);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        irq_work_fini().unwrap();
    }
}
