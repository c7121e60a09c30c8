//! Software-interrupt stand-in.
//!
//! A kernel softint is a per-CPU "run this handler soon, at low priority"
//! bit. Here each CPU gets a pending flag and, depending on
//! [`SoftIntMode`], either a dedicated drain thread or nothing at all:
//!
//! - `Thread`: `irqwork/<n>` threads, each bound to its virtual CPU, sleep on
//!   a condvar and run the handler whenever their bit is set.
//! - `Manual`: [`SoftInt::take_pending`] hands the scheduled CPUs to the
//!   owner, which runs the handler itself.
//!
//! Scheduling never blocks for longer than it takes to hand a condvar
//! notification to a sleeping thread. A CPU whose bit is already set is
//! not signalled again, so back-to-back schedules coalesce into one run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::config::SoftIntMode;
use crate::error::Result;
use crate::percpu::{CpuId, PerCpu, bind_current_thread};

struct SoftIntCpu {
    pending: AtomicBool,
    /// Guards the sleep/wake handshake; holds the stop request.
    stop: Mutex<bool>,
    wake: Condvar,
}

impl SoftIntCpu {
    fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            stop: Mutex::new(false),
            wake: Condvar::new(),
        }
    }
}

/// Cloneable handle that can schedule a softint without owning its threads.
#[derive(Clone)]
pub struct SoftIntTrigger {
    mode: SoftIntMode,
    cpus: Arc<PerCpu<SoftIntCpu>>,
}

impl SoftIntTrigger {
    /// Mark `cpu`'s softint pending and wake its drain thread.
    pub fn schedule(&self, cpu: CpuId) {
        kassert!(
            cpu.index() < self.cpus.ncpu(),
            "softint: schedule on {cpu} with ncpu {}",
            self.cpus.ncpu()
        );
        let slot = &self.cpus[cpu];
        if slot.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.mode == SoftIntMode::Thread {
            let _guard = slot.stop.lock();
            slot.wake.notify_one();
        }
    }

    #[must_use]
    pub fn is_pending(&self, cpu: CpuId) -> bool {
        self.cpus
            .get(cpu)
            .is_some_and(|slot| slot.pending.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn ncpu(&self) -> usize {
        self.cpus.ncpu()
    }

    #[must_use]
    pub fn mode(&self) -> SoftIntMode {
        self.mode
    }
}

/// A per-CPU software interrupt with its drain threads.
pub struct SoftInt {
    name: &'static str,
    trigger: SoftIntTrigger,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SoftInt {
    /// Create the per-CPU pending bits. Nothing runs until [`establish`].
    ///
    /// [`establish`]: SoftInt::establish
    #[must_use]
    pub fn new(name: &'static str, ncpu: usize, mode: SoftIntMode) -> Self {
        Self {
            name,
            trigger: SoftIntTrigger {
                mode,
                cpus: Arc::new(PerCpu::new(ncpu, |_| SoftIntCpu::new())),
            },
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Install `handler`. In `Thread` mode this starts one drain thread per
    /// CPU; the handler always runs with the thread bound to its CPU.
    pub fn establish<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        if self.trigger.mode != SoftIntMode::Thread {
            return Ok(());
        }
        let handler = Arc::new(handler);
        let mut threads = self.threads.lock();
        kassert!(
            threads.is_empty(),
            "softint {}: established twice",
            self.name
        );
        for (cpu, _) in self.trigger.cpus.iter() {
            let cpus = Arc::clone(&self.trigger.cpus);
            let handler = Arc::clone(&handler);
            let spawned = std::thread::Builder::new()
                .name(format!("{}/{}", self.name, cpu.index()))
                .spawn(move || softint_thread(cpu, &cpus, &*handler));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    drop(threads);
                    self.disestablish();
                    return Err(err.into());
                }
            }
        }
        log::debug!(
            "softint {}: established {} drain threads",
            self.name,
            self.trigger.cpus.ncpu()
        );
        Ok(())
    }

    pub fn schedule(&self, cpu: CpuId) {
        self.trigger.schedule(cpu);
    }

    #[must_use]
    pub fn trigger(&self) -> SoftIntTrigger {
        self.trigger.clone()
    }

    /// Clear and return every CPU whose softint is pending, in index order.
    ///
    /// Meant for `Manual` mode; in `Thread` mode it races with the drain
    /// threads and whatever it takes is no longer run by them.
    #[must_use]
    pub fn take_pending(&self) -> Vec<CpuId> {
        self.trigger
            .cpus
            .iter()
            .filter(|(_, slot)| slot.pending.swap(false, Ordering::AcqRel))
            .map(|(cpu, _)| cpu)
            .collect()
    }

    #[must_use]
    pub fn is_pending(&self, cpu: CpuId) -> bool {
        self.trigger.is_pending(cpu)
    }

    #[must_use]
    pub fn ncpu(&self) -> usize {
        self.trigger.ncpu()
    }

    #[must_use]
    pub fn mode(&self) -> SoftIntMode {
        self.trigger.mode
    }

    /// Stop the drain threads and wait for them.
    ///
    /// A thread whose bit is set when the stop arrives runs the handler one
    /// last time before exiting. Idempotent.
    pub fn disestablish(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }
        for (_, slot) in self.trigger.cpus.iter() {
            let mut stop = slot.stop.lock();
            *stop = true;
            slot.wake.notify_one();
        }
        let current = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                // Disestablishing from inside the handler: the thread exits
                // on its own once the handler returns.
                continue;
            }
            if handle.join().is_err() {
                log::error!("softint {}: drain thread panicked", self.name);
            }
        }
        log::debug!("softint {}: disestablished", self.name);
    }
}

impl Drop for SoftInt {
    fn drop(&mut self) {
        self.disestablish();
    }
}

fn softint_thread(cpu: CpuId, cpus: &PerCpu<SoftIntCpu>, handler: &(dyn Fn(CpuId) + Send + Sync)) {
    let _binding = bind_current_thread(cpu);
    let slot = &cpus[cpu];
    loop {
        {
            let mut stop = slot.stop.lock();
            while !slot.pending.load(Ordering::Acquire) && !*stop {
                slot.wake.wait(&mut stop);
            }
            if *stop && !slot.pending.load(Ordering::Acquire) {
                break;
            }
        }
        if slot.pending.swap(false, Ordering::AcqRel) {
            handler(cpu);
        }
    }
    log::trace!("softint {cpu}: drain thread exiting");
}
