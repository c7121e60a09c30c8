use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kernsync_core::{EmbeddedLock, LockObj, LockObjRef, ObjCache, RwObj};
use parking_lot::{Mutex, RwLock};

#[derive(Clone, Copy, Debug)]
enum Op {
    Hold,
    Release,
}

#[derive(Clone, Copy)]
struct Case {
    name: &'static str,
    ops: &'static [Op],
    expected_refcnt: u32,
    expected_destroyed: bool,
}

fn matrix_cases() -> Vec<Case> {
    vec![
        Case {
            name: "alloc_only",
            ops: &[],
            expected_refcnt: 1,
            expected_destroyed: false,
        },
        Case {
            name: "alloc_release",
            ops: &[Op::Release],
            expected_refcnt: 0,
            expected_destroyed: true,
        },
        Case {
            name: "hold_release_pair",
            ops: &[Op::Hold, Op::Release],
            expected_refcnt: 1,
            expected_destroyed: false,
        },
        Case {
            name: "three_holds_three_releases",
            ops: &[Op::Hold, Op::Hold, Op::Hold, Op::Release, Op::Release, Op::Release],
            expected_refcnt: 1,
            expected_destroyed: false,
        },
        Case {
            name: "interleaved_to_zero",
            ops: &[Op::Hold, Op::Release, Op::Hold, Op::Release, Op::Release],
            expected_refcnt: 0,
            expected_destroyed: true,
        },
    ]
}

fn run_case<L: EmbeddedLock>(cache: &ObjCache<L>, case: Case) {
    let obj = cache.alloc();
    let mut destroyed = false;
    for op in case.ops {
        assert!(!destroyed, "{}: op {op:?} after destroy", case.name);
        match op {
            Op::Hold => obj.hold(),
            Op::Release => destroyed = obj.release(),
        }
    }
    assert_eq!(destroyed, case.expected_destroyed, "{}", case.name);
    assert_eq!(obj.is_live(), !case.expected_destroyed, "{}", case.name);
    if !destroyed {
        assert_eq!(obj.refcnt(), case.expected_refcnt, "{}", case.name);
        assert!(obj.release(), "{}: cleanup release", case.name);
    }
}

#[test]
fn refcount_matrix_rw_and_mutex() {
    let rw: ObjCache<RwLock<()>> = ObjCache::new("matrix_rw", None);
    let mutex: ObjCache<Mutex<()>> = ObjCache::new("matrix_mutex", None);
    for case in matrix_cases() {
        run_case(&rw, case);
        run_case(&mutex, case);
    }
    assert_eq!(rw.stats().live, 0);
    assert_eq!(mutex.stats().live, 0);
}

#[test]
fn concurrent_hold_release_destroys_exactly_once() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 2_000;

    let cache: Arc<ObjCache<RwLock<()>>> = Arc::new(ObjCache::new("storm_rw", None));
    for _ in 0..20 {
        let obj = cache.alloc();
        // One reference per worker, taken up front by the owner.
        for _ in 0..THREADS {
            obj.hold();
        }
        let destroyed = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let obj = obj.clone();
                let destroyed = Arc::clone(&destroyed);
                std::thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        obj.hold();
                        {
                            let _r = obj.read();
                        }
                        assert!(!obj.release());
                    }
                    if obj.release() {
                        destroyed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        if obj.release() {
            destroyed.fetch_add(1, Ordering::SeqCst);
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(!obj.is_live());
    }
    let stats = cache.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.allocs, stats.frees);
}

#[test]
fn writes_before_release_are_visible_to_destroyer() {
    let cache: Arc<ObjCache<Mutex<()>>> = Arc::new(ObjCache::new("publish_mutex", None));
    let obj = cache.alloc();
    obj.hold();
    let shared = Arc::new(AtomicUsize::new(0));

    let writer = {
        let obj = obj.clone();
        let shared = Arc::clone(&shared);
        std::thread::spawn(move || {
            shared.store(42, Ordering::Relaxed);
            obj.release()
        })
    };
    let writer_destroyed = writer.join().unwrap();
    if !writer_destroyed {
        assert!(obj.release());
        assert_eq!(shared.load(Ordering::Relaxed), 42);
    }
}

#[test]
fn owned_refs_across_threads() {
    let cache: Arc<ObjCache<RwLock<()>>> = Arc::new(ObjCache::new("owned_rw", None));
    let root = LockObjRef::adopt(cache.alloc());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let r = root.clone();
            std::thread::spawn(move || {
                let _w = r.write();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(root.handle().refcnt(), 1);
    drop(root);
    assert_eq!(cache.stats().live, 0);
}

#[test]
fn try_alloc_exhaustion_and_recovery() {
    let cache: ObjCache<RwLock<()>> = ObjCache::new("budget_rw", Some(3));
    let objs: Vec<RwObj> = (0..3).map(|_| cache.try_alloc().unwrap()).collect();
    let err = cache.try_alloc().unwrap_err();
    assert!(err.is_exhausted());
    assert_eq!(err.to_string(), "budget_rw: object cache exhausted (limit 3)");

    assert!(objs[1].release());
    let again = cache.try_alloc().unwrap();
    assert!(again.same_slot(&objs[1]));
    assert!(again.release());
    assert!(objs[0].release());
    assert!(objs[2].release());
}

#[test]
fn blocked_alloc_resumes_after_release() {
    let cache: Arc<ObjCache<Mutex<()>>> = Arc::new(ObjCache::new("sleep_mutex", Some(1)));
    let first = cache.alloc();
    let waiter = {
        let cache = Arc::clone(&cache);
        std::thread::spawn(move || {
            let obj: LockObj<Mutex<()>> = cache.alloc();
            obj.release()
        })
    };
    std::thread::sleep(Duration::from_millis(20));
    assert!(first.release());
    assert!(waiter.join().unwrap());
    assert_eq!(cache.stats().blocked_allocs, 1);
}

#[test]
#[should_panic(expected = "rw_obj_free")]
fn double_free_is_fatal() {
    let cache: ObjCache<RwLock<()>> = ObjCache::new("double_rw", None);
    let obj = cache.alloc();
    let copy = obj.clone();
    assert!(obj.release());
    copy.release();
}

#[test]
fn stats_serialize_as_json() {
    let cache: ObjCache<RwLock<()>> = ObjCache::new("json_rw", Some(8));
    let obj = cache.alloc();
    let json = serde_json::to_value(cache.stats()).unwrap();
    assert_eq!(json["name"], "json_rw");
    assert_eq!(json["limit"], 8);
    assert_eq!(json["live"], 1);
    assert!(obj.release());
}
