//! Stress and contract scenarios.
//!
//! Each scenario builds private caches and dispatchers (never the
//! process-wide ones), drives them, and checks the contract it is named
//! after. A broken contract is a `Fail` outcome; an environment problem
//! (thread spawn, I/O) is an `Error`.

use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use kernsync_core::config::MAX_CPUS;
use kernsync_core::{
    CpuId, IrqWork, IrqWorkDomain, KernSyncConfig, ObjCache, SoftIntMode, bind_current_thread,
    irq_work_sync,
};
use log::Level;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;

use crate::error::{HarnessError, ensure};
use crate::logger::to_log_level;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome, Subsystem};

/// Cap on self-requeue passes, independent of `--iterations`.
const MAX_REQUEUE_PASSES: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Concurrent hold/release on one lock object; exactly one destroy.
    RefcountStorm,
    /// Non-sleeping allocation fails at the budget and under injected faults.
    TryallocExhaustion,
    /// Sleeping allocation waits for a release instead of failing.
    BlockingAlloc,
    /// Repeated queue calls before a drain collapse into one run.
    Coalesce,
    /// A callback that queues itself runs once per drain pass.
    RequeueNextPass,
    /// Draining one CPU leaves the other CPUs' queues alone.
    CpuIsolation,
    /// Producers on several CPUs with drain threads doing the work.
    ThreadedDrain,
}

impl Scenario {
    pub const ALL: [Self; 7] = [
        Self::RefcountStorm,
        Self::TryallocExhaustion,
        Self::BlockingAlloc,
        Self::Coalesce,
        Self::RequeueNextPass,
        Self::CpuIsolation,
        Self::ThreadedDrain,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RefcountStorm => "refcount-storm",
            Self::TryallocExhaustion => "tryalloc-exhaustion",
            Self::BlockingAlloc => "blocking-alloc",
            Self::Coalesce => "coalesce",
            Self::RequeueNextPass => "requeue-next-pass",
            Self::CpuIsolation => "cpu-isolation",
            Self::ThreadedDrain => "threaded-drain",
        }
    }

    #[must_use]
    pub const fn subsystem(self) -> Subsystem {
        match self {
            Self::RefcountStorm | Self::TryallocExhaustion | Self::BlockingAlloc => {
                Subsystem::Lockobj
            }
            Self::Coalesce | Self::RequeueNextPass | Self::CpuIsolation | Self::ThreadedDrain => {
                Subsystem::IrqWork
            }
        }
    }

    /// Softint backend the scenario runs with, for irq_work scenarios.
    #[must_use]
    pub const fn softint(self) -> Option<SoftIntMode> {
        match self {
            Self::Coalesce | Self::RequeueNextPass | Self::CpuIsolation => {
                Some(SoftIntMode::Manual)
            }
            Self::ThreadedDrain => Some(SoftIntMode::Thread),
            _ => None,
        }
    }
}

/// Load shape for a scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScenarioParams {
    pub threads: usize,
    pub iterations: u64,
    pub ncpu: usize,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 1000,
            ncpu: 4,
        }
    }
}

impl ScenarioParams {
    fn normalized(self) -> Self {
        Self {
            threads: self.threads.max(1),
            iterations: self.iterations.max(1),
            ncpu: self.ncpu.clamp(1, MAX_CPUS),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub details: serde_json::Value,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }
}

/// Run one scenario, logging a `scenario_start` and a `scenario_result`.
pub fn run_scenario(
    scenario: Scenario,
    params: &ScenarioParams,
    log: &mut LogEmitter,
) -> Result<ScenarioReport, HarnessError> {
    let params = params.normalized();
    let entry = |level: LogLevel, event: &str| {
        let mut e = LogEntry::new("", level, event)
            .with_subsystem(scenario.subsystem())
            .with_scenario(scenario.name())
            .with_shape(params.ncpu, params.threads, params.iterations);
        if let Some(mode) = scenario.softint() {
            e = e.with_softint(mode.as_str());
        }
        e
    };
    log.emit_entry(entry(LogLevel::Info, "scenario_start"))?;
    log::info!("{}: starting", scenario.name());

    let start = Instant::now();
    let result = match scenario {
        Scenario::RefcountStorm => refcount_storm(&params),
        Scenario::TryallocExhaustion => tryalloc_exhaustion(&params),
        Scenario::BlockingAlloc => blocking_alloc(&params),
        Scenario::Coalesce => coalesce(&params),
        Scenario::RequeueNextPass => requeue_next_pass(&params),
        Scenario::CpuIsolation => cpu_isolation(&params),
        Scenario::ThreadedDrain => threaded_drain(&params),
    };
    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    let (outcome, details) = match result {
        Ok(details) => (Outcome::Pass, details),
        Err(HarnessError::Check(reason)) => (Outcome::Fail, json!({ "reason": reason })),
        Err(err) => (Outcome::Error, json!({ "error": err.to_string() })),
    };
    let level = if outcome == Outcome::Pass {
        Level::Info
    } else {
        Level::Error
    };
    log::log!(level, "{}: {outcome:?} in {duration_ms} ms", scenario.name());
    log.emit_entry(
        entry(to_log_level(level), "scenario_result")
            .with_outcome(outcome)
            .with_duration_ms(duration_ms)
            .with_details(details.clone()),
    )?;

    Ok(ScenarioReport {
        name: scenario.name(),
        outcome,
        duration_ms,
        details,
    })
}

/// Run every scenario in order.
pub fn run_all(
    params: &ScenarioParams,
    log: &mut LogEmitter,
) -> Result<Vec<ScenarioReport>, HarnessError> {
    Scenario::ALL
        .iter()
        .map(|&scenario| run_scenario(scenario, params, log))
        .collect()
}

fn join_all<T>(handles: Vec<JoinHandle<T>>, scenario: &'static str) -> Result<Vec<T>, HarnessError> {
    handles
        .into_iter()
        .map(|h| h.join().map_err(|_| HarnessError::WorkerPanicked(scenario)))
        .collect()
}

fn manual_domain(ncpu: usize) -> Result<IrqWorkDomain, HarnessError> {
    let cfg = KernSyncConfig::default()
        .with_ncpu(ncpu)
        .with_softint(SoftIntMode::Manual);
    Ok(IrqWorkDomain::new(&cfg)?)
}

// ---------------------------------------------------------------------------
// Lock objects
// ---------------------------------------------------------------------------

fn refcount_storm(p: &ScenarioParams) -> Result<serde_json::Value, HarnessError> {
    let cache: Arc<ObjCache<RwLock<()>>> = Arc::new(ObjCache::new("storm_rw", None));
    let obj = cache.alloc();
    // One long-lived reference per worker, taken by the owner.
    for _ in 0..p.threads {
        obj.hold();
    }
    let destroys = Arc::new(AtomicUsize::new(0));
    let early = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..p.threads)
        .map(|_| {
            let obj = obj.clone();
            let destroys = Arc::clone(&destroys);
            let early = Arc::clone(&early);
            let iterations = p.iterations;
            std::thread::spawn(move || {
                for _ in 0..iterations {
                    obj.hold();
                    drop(obj.read());
                    if obj.release() {
                        early.fetch_add(1, Ordering::SeqCst);
                    }
                }
                if obj.release() {
                    destroys.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    join_all(workers, "refcount-storm")?;
    if obj.release() {
        destroys.fetch_add(1, Ordering::SeqCst);
    }

    let early = early.load(Ordering::SeqCst);
    let destroys = destroys.load(Ordering::SeqCst);
    let stats = cache.stats();
    ensure!(early == 0, "{early} destroys while references remained");
    ensure!(destroys == 1, "expected exactly one destroy, saw {destroys}");
    ensure!(!obj.is_live(), "object still live after the last release");
    ensure!(stats.live == 0, "{} objects still live", stats.live);
    Ok(json!({
        "holds": (p.threads as u64) * (p.iterations + 1),
        "destroys": destroys,
        "cache": stats,
    }))
}

fn tryalloc_exhaustion(p: &ScenarioParams) -> Result<serde_json::Value, HarnessError> {
    let limit = p.threads;
    let cache: ObjCache<Mutex<()>> = ObjCache::new("budget_mutex", Some(limit));
    let mut objs = Vec::with_capacity(limit);
    for _ in 0..limit {
        objs.push(cache.try_alloc()?);
    }

    let past_budget = Instant::now();
    let over = cache.try_alloc();
    let fail_us = past_budget.elapsed().as_micros();
    ensure!(
        matches!(over, Err(ref e) if e.is_exhausted()),
        "try_alloc past a budget of {limit} did not fail"
    );

    // Free one slot so only the fault knobs stand in the way.
    if let Some(obj) = objs.pop() {
        ensure!(obj.release(), "single reference did not destroy");
    }
    cache.set_memory_pressure(true);
    let under_pressure = cache.try_alloc().is_err();
    cache.set_memory_pressure(false);
    ensure!(under_pressure, "try_alloc succeeded under memory pressure");

    cache.inject_failures(2);
    let injected = (0..2).filter(|_| cache.try_alloc().is_err()).count();
    ensure!(injected == 2, "{injected} of 2 injected failures observed");
    objs.push(cache.try_alloc()?);

    for obj in &objs {
        ensure!(obj.release(), "single reference did not destroy");
    }
    let stats = cache.stats();
    ensure!(stats.live == 0, "{} objects still live", stats.live);
    ensure!(
        stats.failed_try_allocs == 4,
        "expected 4 failed try_allocs, counted {}",
        stats.failed_try_allocs
    );
    Ok(json!({
        "limit": limit,
        "fail_us": fail_us,
        "cache": stats,
    }))
}

fn blocking_alloc(p: &ScenarioParams) -> Result<serde_json::Value, HarnessError> {
    let cache: Arc<ObjCache<RwLock<()>>> = Arc::new(ObjCache::new("sleep_rw", Some(1)));
    let gate = cache.alloc();

    let waiters: Vec<_> = (0..p.threads)
        .map(|_| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.alloc().release())
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(5);
    while cache.stats().blocked_allocs == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    let before = cache.stats();
    ensure!(before.blocked_allocs >= 1, "no alloc waited on a full cache");
    ensure!(
        before.live == 1,
        "{} objects live while the budget is 1",
        before.live
    );

    ensure!(gate.release(), "gate object did not destroy");
    let destroyed = join_all(waiters, "blocking-alloc")?;
    ensure!(
        destroyed.iter().all(|&d| d),
        "a waiter's object survived its only release"
    );

    let stats = cache.stats();
    ensure!(stats.live == 0, "{} objects still live", stats.live);
    ensure!(
        stats.allocs == p.threads as u64 + 1,
        "expected {} allocs, counted {}",
        p.threads + 1,
        stats.allocs
    );
    ensure!(stats.peak == 1, "peak {} exceeded the budget", stats.peak);
    Ok(json!({ "waiters": p.threads, "cache": stats }))
}

// ---------------------------------------------------------------------------
// Deferred work
// ---------------------------------------------------------------------------

fn coalesce(p: &ScenarioParams) -> Result<serde_json::Value, HarnessError> {
    let domain = manual_domain(p.ncpu)?;
    let runs = Arc::new(AtomicU64::new(0));
    let r = Arc::clone(&runs);
    let work = IrqWork::new(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });

    let cpu = CpuId(domain.ncpu() - 1);
    let accepted = (0..p.iterations)
        .filter(|_| domain.queue_on(cpu, &work))
        .count();
    ensure!(accepted == 1, "{accepted} of {} requests accepted", p.iterations);
    ensure!(domain.pending(cpu) == 1, "queue holds {} entries", domain.pending(cpu));

    let ran = domain.run_softints();
    let runs = runs.load(Ordering::SeqCst);
    ensure!(ran == 1 && runs == 1, "drain ran {ran} callbacks, {runs} runs");
    ensure!(!work.is_pending(), "item still pending after its run");

    let stats = domain.stats();
    ensure!(
        stats.total_coalesced() == p.iterations - 1,
        "coalesced {} of {} requests",
        stats.total_coalesced(),
        p.iterations - 1
    );
    domain.fini();
    Ok(json!({ "requests": p.iterations, "runs": runs, "irq_work": stats }))
}

fn requeue_next_pass(p: &ScenarioParams) -> Result<serde_json::Value, HarnessError> {
    let domain = manual_domain(1)?;
    let target = p.iterations.min(MAX_REQUEUE_PASSES);
    let runs = Arc::new(AtomicU64::new(0));
    let r = Arc::clone(&runs);
    let work = IrqWork::new(move |ctx| {
        if r.fetch_add(1, Ordering::SeqCst) + 1 < target {
            ctx.requeue();
        }
    });
    domain.queue_on(CpuId(0), &work);

    let mut passes = 0_u64;
    loop {
        let ran = domain.run_softints();
        if ran == 0 {
            break;
        }
        passes += 1;
        ensure!(
            ran == 1,
            "pass {passes} ran {ran} callbacks; a requeue ran in its own batch"
        );
        ensure!(passes <= target, "still requeueing after {passes} passes");
        let seen = runs.load(Ordering::SeqCst);
        ensure!(seen == passes, "{seen} runs after {passes} passes");
    }
    ensure!(passes == target, "{passes} passes, expected {target}");
    domain.fini();
    Ok(json!({ "passes": passes }))
}

fn cpu_isolation(p: &ScenarioParams) -> Result<serde_json::Value, HarnessError> {
    let ncpu = p.ncpu.max(2);
    let domain = manual_domain(ncpu)?;
    let seen: Arc<Mutex<Vec<(usize, CpuId)>>> = Arc::new(Mutex::new(Vec::new()));
    let items: Vec<_> = (0..ncpu)
        .map(|i| {
            let seen = Arc::clone(&seen);
            IrqWork::new(move |ctx| seen.lock().push((i, ctx.cpu())))
        })
        .collect();

    for (i, work) in items.iter().enumerate() {
        let _bound = bind_current_thread(CpuId(i));
        ensure!(domain.queue(work), "item {i} was already pending");
    }

    for i in (0..ncpu).rev() {
        let before = seen.lock().len();
        let ran = domain.drain(CpuId(i));
        let seen = seen.lock();
        ensure!(
            ran == 1 && seen.len() == before + 1,
            "draining cpu{i} ran {ran} callbacks"
        );
        ensure!(
            seen[before] == (i, CpuId(i)),
            "draining cpu{i} ran item {} on {}",
            seen[before].0,
            seen[before].1
        );
        for j in 0..i {
            ensure!(
                domain.pending(CpuId(j)) == 1,
                "cpu{j} lost its item while cpu{i} drained"
            );
        }
    }
    // Clears the softint bits; every queue is already empty.
    let leftover = domain.run_softints();
    ensure!(leftover == 0, "{leftover} callbacks ran twice");

    // Queue on cpu1 while cpu0's drain is inside a callback.
    let domain = Arc::new(domain);
    let gate = Arc::new(Barrier::new(2));
    let g = Arc::clone(&gate);
    let blocker = IrqWork::new(move |_| {
        g.wait();
        g.wait();
    });
    let late_runs = Arc::new(AtomicUsize::new(0));
    let lr = Arc::clone(&late_runs);
    let late = IrqWork::new(move |_| {
        lr.fetch_add(1, Ordering::SeqCst);
    });
    domain.queue_on(CpuId(0), &blocker);
    let d = Arc::clone(&domain);
    let drainer = std::thread::spawn(move || d.drain(CpuId(0)));
    gate.wait();
    let queued = domain.queue_on(CpuId(1), &late);
    let pending_mid = domain.pending(CpuId(1));
    gate.wait();
    let ran0 = drainer
        .join()
        .map_err(|_| HarnessError::WorkerPanicked("cpu-isolation"))?;

    ensure!(queued && pending_mid == 1, "cpu1 did not take the mid-drain item");
    ensure!(ran0 == 1, "cpu0 drain ran {ran0} callbacks, expected its own 1");
    ensure!(
        late_runs.load(Ordering::SeqCst) == 0,
        "cpu1 item ran inside cpu0's drain"
    );
    let ran1 = domain.drain(CpuId(1));
    ensure!(
        ran1 == 1 && late_runs.load(Ordering::SeqCst) == 1,
        "cpu1 drain ran {ran1} callbacks"
    );
    domain.run_softints();
    domain.fini();
    Ok(json!({ "ncpu": ncpu, "irq_work": domain.stats() }))
}

fn threaded_drain(p: &ScenarioParams) -> Result<serde_json::Value, HarnessError> {
    let cfg = KernSyncConfig::default()
        .with_ncpu(p.ncpu)
        .with_softint(SoftIntMode::Thread);
    let domain = Arc::new(IrqWorkDomain::new(&cfg)?);
    let ncpu = domain.ncpu();

    let producers: Vec<_> = (0..p.threads)
        .map(|t| {
            let domain = Arc::clone(&domain);
            let iterations = p.iterations;
            std::thread::spawn(move || {
                let runs = Arc::new(AtomicU64::new(0));
                let r = Arc::clone(&runs);
                let work = IrqWork::new(move |_| {
                    r.fetch_add(1, Ordering::Relaxed);
                });
                let _bound = bind_current_thread(CpuId(t % ncpu));
                let mut accepted = 0_u64;
                for _ in 0..iterations {
                    if domain.queue(&work) {
                        accepted += 1;
                    }
                    irq_work_sync(&work);
                }
                (accepted, runs.load(Ordering::Acquire))
            })
        })
        .collect();
    let results = join_all(producers, "threaded-drain")?;
    domain.fini();

    for (t, &(accepted, runs)) in results.iter().enumerate() {
        ensure!(
            accepted == p.iterations && runs == p.iterations,
            "producer {t}: {accepted} accepted, {runs} runs of {}",
            p.iterations
        );
    }
    let stats = domain.stats();
    let expected = p.threads as u64 * p.iterations;
    ensure!(
        stats.total_executed() == expected,
        "{} callbacks executed, expected {expected}",
        stats.total_executed()
    );
    Ok(json!({ "irq_work": stats }))
}
