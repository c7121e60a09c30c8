#![no_main]
use kernsync_core::{LockObj, ObjCache};
use libfuzzer_sys::fuzz_target;
use parking_lot::RwLock;

// Each byte is one operation on a small pool of objects. The model tracks
// how many references the fuzzer owns per object and never releases one it
// does not own, so every fatal assertion reached here is a real bug.
fuzz_target!(|data: &[u8]| {
    let cache: ObjCache<RwLock<()>> = ObjCache::new("fuzz_rw", Some(8));
    let mut live: Vec<(LockObj<RwLock<()>>, u32)> = Vec::new();

    for &byte in data {
        let slot = usize::from(byte >> 3);
        match byte & 0x7 {
            0 => {
                if let Ok(obj) = cache.try_alloc() {
                    live.push((obj, 1));
                }
            }
            1 => cache.inject_failures(usize::from(byte >> 6)),
            2 | 3 => {
                if let Some((obj, refs)) = live.get_mut(slot % live.len().max(1)) {
                    obj.hold();
                    *refs += 1;
                }
            }
            4 | 5 => {
                if live.is_empty() {
                    continue;
                }
                let idx = slot % live.len();
                let destroyed = live[idx].0.release();
                live[idx].1 -= 1;
                assert_eq!(destroyed, live[idx].1 == 0);
                if destroyed {
                    let (obj, _) = live.swap_remove(idx);
                    assert!(!obj.is_live());
                }
            }
            6 => {
                if let Some((obj, _)) = live.get(slot % live.len().max(1)) {
                    let _r = obj.try_read();
                }
            }
            _ => {
                let _ = cache.shrink();
            }
        }
        for (obj, refs) in &live {
            assert_eq!(obj.refcnt(), *refs);
        }
        assert_eq!(cache.stats().live, live.len());
    }

    for (obj, refs) in live {
        for i in 1..=refs {
            assert_eq!(obj.release(), i == refs);
        }
    }
    assert_eq!(cache.stats().live, 0);
});
