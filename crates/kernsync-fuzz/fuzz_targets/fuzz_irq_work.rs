#![no_main]
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use kernsync_core::{CpuId, IrqWork, IrqWorkDomain, KernSyncConfig, SoftIntMode};
use libfuzzer_sys::fuzz_target;

const NCPU: usize = 4;
const ITEMS: usize = 8;

// Drives a manual-softint domain with queue / queue_on / drain / requeue
// operations and checks that every accepted request runs exactly once.
fuzz_target!(|data: &[u8]| {
    let cfg = KernSyncConfig::default()
        .with_ncpu(NCPU)
        .with_softint(SoftIntMode::Manual);
    let Ok(domain) = IrqWorkDomain::new(&cfg) else {
        return;
    };

    // Per item: runs so far, and how many more times it should requeue itself.
    let runs: Vec<Arc<AtomicU32>> = (0..ITEMS).map(|_| Arc::new(AtomicU32::new(0))).collect();
    let requeues: Vec<Arc<AtomicU32>> = (0..ITEMS).map(|_| Arc::new(AtomicU32::new(0))).collect();
    let items: Vec<Arc<IrqWork>> = (0..ITEMS)
        .map(|i| {
            let runs = Arc::clone(&runs[i]);
            let requeues = Arc::clone(&requeues[i]);
            IrqWork::new(move |ctx| {
                runs.fetch_add(1, Ordering::Relaxed);
                let left = requeues.load(Ordering::Relaxed);
                if left > 0 && ctx.requeue() {
                    requeues.store(left - 1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    let mut accepted = 0_u64;

    for &byte in data {
        let item = usize::from(byte >> 4) % ITEMS;
        let cpu = CpuId(usize::from(byte >> 2) % NCPU);
        match byte & 0x3 {
            0 => {
                if domain.queue_on(cpu, &items[item]) {
                    accepted += 1;
                }
            }
            1 => {
                // Out-of-range CPUs must be rejected, not queued.
                let bad = CpuId(NCPU + usize::from(byte >> 2));
                assert!(domain.try_queue_on(bad, &items[item]).is_err());
            }
            2 => {
                domain.drain(cpu);
            }
            _ => {
                requeues[item].store(u32::from(byte >> 6), Ordering::Relaxed);
            }
        }
    }

    // Stop requeueing and drain to quiescence.
    for r in &requeues {
        r.store(0, Ordering::Relaxed);
    }
    while domain.run_softints() > 0 {}

    let stats = domain.stats();
    let total_runs: u64 = runs.iter().map(|r| u64::from(r.load(Ordering::Relaxed))).sum();
    assert_eq!(stats.total_pending(), 0);
    assert_eq!(stats.total_executed(), stats.total_queued());
    assert_eq!(total_runs, stats.total_executed());
    assert!(stats.total_queued() >= accepted);
    assert!(items.iter().all(|w| !w.is_busy()));
    domain.fini();
});
