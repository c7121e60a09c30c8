//! # kernsync-core
//!
//! Kernel-style concurrency infrastructure for user space.
//!
//! Two independent primitives live here:
//! - [`lockobj`]: heap-allocated, manually reference-counted lock objects whose
//!   storage outlives any single owner. The last release destroys the lock.
//! - [`irq_work`]: per-CPU queues of deferred callbacks, drained by a
//!   software-interrupt stand-in ([`softint`]), safe to call from contexts
//!   that must not block.
//!
//! Support modules provide per-CPU storage, environment configuration, the
//! error type, and the fatal assertion macro.

#![deny(unsafe_code)]

#[macro_use]
pub mod diag;

pub mod config;
pub mod error;
pub mod irq_work;
pub mod lockobj;
#[allow(unsafe_code)]
pub mod percpu;
pub mod softint;

pub use config::{KernSyncConfig, SoftIntMode, config};
pub use error::{KernSyncError, Result};
pub use irq_work::{
    IRQ_WORK_PENDING, IrqWork, IrqWorkContext, IrqWorkCpuStats, IrqWorkDomain,
    IrqWorkStats, init_irq_work, irq_work_fini, irq_work_init, irq_work_is_pending,
    irq_work_queue, irq_work_queue_on, irq_work_sync,
};
pub use lockobj::{
    EmbeddedLock, LockObj, LockObjRef, MutexObj, ObjCache, ObjCacheStats, RwObj,
    mutex_obj_alloc, mutex_obj_cache, mutex_obj_free, mutex_obj_hold, mutex_obj_refcnt,
    mutex_obj_tryalloc, rw_obj_alloc, rw_obj_cache, rw_obj_free, rw_obj_hold, rw_obj_refcnt,
    rw_obj_tryalloc,
};
pub use percpu::{CpuBinding, CpuId, PerCpu, bind_current_thread, current_cpu};
pub use softint::{SoftInt, SoftIntTrigger};
