//! Per-CPU queues and the softint that drains them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::IrqWork;
use crate::config::{KernSyncConfig, SoftIntMode};
use crate::error::{KernSyncError, Result};
use crate::percpu::{CpuId, PerCpu, current_cpu};
use crate::softint::{SoftInt, SoftIntTrigger};

/// FIFO threaded through the items' `next` links. Push and pop are O(1) and never
/// allocate; taking the whole list detaches it in one step.
#[derive(Default)]
struct WorkList {
    head: Option<Arc<IrqWork>>,
    tail: Option<Arc<IrqWork>>,
    len: usize,
}

impl WorkList {
    fn push_back(&mut self, work: Arc<IrqWork>) {
        match self.tail.replace(Arc::clone(&work)) {
            Some(tail) => *tail.next.lock() = Some(work),
            None => self.head = Some(work),
        }
        self.len += 1;
    }

    /// Unlinks the head, so the item can be queued again as soon as it is
    /// returned.
    fn pop_front(&mut self) -> Option<Arc<IrqWork>> {
        let work = self.head.take()?;
        self.head = work.next.lock().take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(work)
    }
}

impl Drop for WorkList {
    fn drop(&mut self) {
        // Unlink one by one instead of recursing through the chain.
        while self.pop_front().is_some() {}
    }
}

struct IrqWorkCpu {
    /// Items queued since the last drain took the list.
    todo: Mutex<WorkList>,
    /// Serialises drains of one CPU.
    draining: Mutex<()>,
    queued: AtomicU64,
    coalesced: AtomicU64,
    executed: AtomicU64,
    drains: AtomicU64,
}

impl IrqWorkCpu {
    fn new() -> Self {
        Self {
            todo: Mutex::new(WorkList::default()),
            draining: Mutex::new(()),
            queued: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            drains: AtomicU64::new(0),
        }
    }

    fn pending(&self) -> usize {
        self.todo.lock().len
    }
}

/// State shared between the domain and its drain threads.
pub(crate) struct IrqWorkShared {
    cpus: PerCpu<IrqWorkCpu>,
    trigger: SoftIntTrigger,
    live: AtomicBool,
}

impl IrqWorkShared {
    pub(crate) fn queue_on(&self, cpu: CpuId, work: &Arc<IrqWork>) -> bool {
        kassert!(
            self.live.load(Ordering::Acquire),
            "irq_work_queue: queued after fini"
        );
        let Some(q) = self.cpus.get(cpu) else {
            crate::diag::fatal(format_args!(
                "irq_work_queue: {cpu} out of range (ncpu {})",
                self.cpus.ncpu()
            ));
        };
        if !work.claim() {
            q.coalesced.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        q.todo.lock().push_back(Arc::clone(work));
        q.queued.fetch_add(1, Ordering::Relaxed);
        self.trigger.schedule(cpu);
        true
    }

    /// Run everything queued on `cpu` so far. Items queued while the batch
    /// runs wait for the next pass.
    pub(crate) fn drain(&self, cpu: CpuId) -> usize {
        let q = &self.cpus[cpu];
        let _serial = q.draining.lock();
        let mut batch = std::mem::take(&mut *q.todo.lock());
        q.drains.fetch_add(1, Ordering::Relaxed);
        let n = batch.len;
        while let Some(work) = batch.pop_front() {
            work.run(cpu, self);
            q.executed.fetch_add(1, Ordering::Relaxed);
        }
        if n > 0 {
            log::trace!("irq_work {cpu}: ran {n} items");
        }
        n
    }

    fn pending(&self, cpu: CpuId) -> usize {
        self.cpus.get(cpu).map_or(0, IrqWorkCpu::pending)
    }
}

/// Per-CPU counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IrqWorkCpuStats {
    pub cpu: CpuId,
    /// Successful queue calls.
    pub queued: u64,
    /// Queue calls that found the item already pending.
    pub coalesced: u64,
    pub executed: u64,
    pub drains: u64,
    /// Items waiting for the next drain.
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IrqWorkStats {
    pub softint: &'static str,
    pub cpus: Vec<IrqWorkCpuStats>,
}

impl IrqWorkStats {
    #[must_use]
    pub fn total_queued(&self) -> u64 {
        self.cpus.iter().map(|c| c.queued).sum()
    }

    #[must_use]
    pub fn total_coalesced(&self) -> u64 {
        self.cpus.iter().map(|c| c.coalesced).sum()
    }

    #[must_use]
    pub fn total_executed(&self) -> u64 {
        self.cpus.iter().map(|c| c.executed).sum()
    }

    #[must_use]
    pub fn total_pending(&self) -> usize {
        self.cpus.iter().map(|c| c.pending).sum()
    }
}

/// An independent deferred-work dispatcher: per-CPU queues plus the softint
/// that drains them.
///
/// The process-wide functions in the parent module wrap one of these; tests
/// and embedders can build as many as they like.
pub struct IrqWorkDomain {
    shared: Arc<IrqWorkShared>,
    softint: SoftInt,
    finished: AtomicBool,
}

impl IrqWorkDomain {
    /// Allocate the per-CPU queues and establish the softint.
    pub fn new(cfg: &KernSyncConfig) -> Result<Self> {
        let softint = SoftInt::new("irqwork", cfg.ncpu, cfg.softint);
        let shared = Arc::new(IrqWorkShared {
            cpus: PerCpu::new(cfg.ncpu, |_| IrqWorkCpu::new()),
            trigger: softint.trigger(),
            live: AtomicBool::new(true),
        });
        let handler = Arc::clone(&shared);
        softint.establish(move |cpu| {
            handler.drain(cpu);
        })?;
        log::debug!(
            "irq_work: {} cpus, softint {}",
            shared.cpus.ncpu(),
            cfg.softint.as_str()
        );
        Ok(Self {
            shared,
            softint,
            finished: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn ncpu(&self) -> usize {
        self.shared.cpus.ncpu()
    }

    #[must_use]
    pub fn softint_mode(&self) -> SoftIntMode {
        self.softint.mode()
    }

    /// Queue `work` on the calling thread's CPU.
    ///
    /// Returns `false`, and does nothing else, if `work` was already pending.
    pub fn queue(&self, work: &Arc<IrqWork>) -> bool {
        self.shared.queue_on(current_cpu(self.ncpu()), work)
    }

    /// Queue `work` on `cpu`. Out-of-range CPUs are fatal.
    pub fn queue_on(&self, cpu: CpuId, work: &Arc<IrqWork>) -> bool {
        self.shared.queue_on(cpu, work)
    }

    /// Like [`queue_on`](Self::queue_on), but an out-of-range CPU is an
    /// error instead of a fatal assertion. For callers taking CPU numbers
    /// from outside input.
    pub fn try_queue_on(&self, cpu: CpuId, work: &Arc<IrqWork>) -> Result<bool> {
        if cpu.index() >= self.ncpu() {
            return Err(KernSyncError::InvalidCpu {
                cpu,
                ncpu: self.ncpu(),
            });
        }
        Ok(self.shared.queue_on(cpu, work))
    }

    /// Drain `cpu` on the calling thread, whatever the softint mode.
    ///
    /// Must not be called from a callback running on the same CPU.
    pub fn drain(&self, cpu: CpuId) -> usize {
        kassert!(
            cpu.index() < self.ncpu(),
            "irq_work_drain: {cpu} out of range (ncpu {})",
            self.ncpu()
        );
        self.shared.drain(cpu)
    }

    /// Drain every CPU whose softint is pending. The `Manual` mode pump.
    pub fn run_softints(&self) -> usize {
        self.softint
            .take_pending()
            .into_iter()
            .map(|cpu| self.shared.drain(cpu))
            .sum()
    }

    /// Items waiting on `cpu`.
    #[must_use]
    pub fn pending(&self, cpu: CpuId) -> usize {
        self.shared.pending(cpu)
    }

    #[must_use]
    pub fn stats(&self) -> IrqWorkStats {
        IrqWorkStats {
            softint: self.softint.mode().as_str(),
            cpus: self
                .shared
                .cpus
                .iter()
                .map(|(cpu, q)| IrqWorkCpuStats {
                    cpu,
                    queued: q.queued.load(Ordering::Relaxed),
                    coalesced: q.coalesced.load(Ordering::Relaxed),
                    executed: q.executed.load(Ordering::Relaxed),
                    drains: q.drains.load(Ordering::Relaxed),
                    pending: q.pending(),
                })
                .collect(),
        }
    }

    /// Stop the softint and verify every queue is empty.
    ///
    /// Work still queued after the drain threads' last pass is fatal: its
    /// owner would wait forever for a callback that cannot run. Further
    /// queue calls are fatal too. Idempotent.
    pub fn fini(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.softint.disestablish();
        self.shared.live.store(false, Ordering::Release);
        for (cpu, q) in self.shared.cpus.iter() {
            let n = q.pending();
            kassert!(n == 0, "irq_work_fini: {cpu} has {n} undrained items");
        }
        log::debug!("irq_work: finalised");
    }
}

impl Drop for IrqWorkDomain {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.softint.disestablish();
        self.shared.live.store(false, Ordering::Release);
        let stranded: usize = (0..self.ncpu()).map(|i| self.pending(CpuId(i))).sum();
        if stranded > 0 {
            log::warn!("irq_work: dropped with {stranded} undrained items");
        }
    }
}

impl std::fmt::Debug for IrqWorkDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqWorkDomain")
            .field("ncpu", &self.ncpu())
            .field("softint", &self.softint.mode())
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
