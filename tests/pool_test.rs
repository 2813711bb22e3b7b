//! Integration tests for named resource pools
//!
//! These tests validate:
//! - All-or-nothing acquisition of pool sets
//! - Limits hold under concurrent acquisition from many threads
//! - Leases release on drop
//! - Pool waits through suspension directives

use flowmaster::core::{ResourcePool, SchedulerError, SuspensionDirective};
use flowmaster::util::SystemClock;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

// ============================================================================
// ACQUISITION SEMANTICS
// ============================================================================

#[test]
fn test_set_is_acquired_all_or_nothing() {
    let pool = ResourcePool::from_limits([("db", 1), ("api", 2)]);
    assert!(pool.try_acquire(&names(&["db"])).unwrap());

    // db is full, so api must stay untouched
    assert!(!pool.try_acquire(&names(&["api", "db"])).unwrap());
    assert_eq!(pool.usage("api").unwrap().current, 0);

    pool.release(&names(&["db"]));
    assert!(pool.try_acquire(&names(&["api", "db"])).unwrap());
    assert_eq!(pool.usage("api").unwrap().current, 1);
    assert_eq!(pool.usage("db").unwrap().current, 1);
}

#[test]
fn test_unknown_pool_is_an_error() {
    let pool = ResourcePool::from_limits([("db", 1)]);
    let err = pool.try_acquire(&names(&["db", "ghost"])).unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownPool(name) if name == "ghost"));
    assert_eq!(pool.usage("db").unwrap().current, 0);
}

#[test]
fn test_lease_releases_on_drop() {
    let pool = Arc::new(ResourcePool::from_limits([("db", 1)]));
    {
        let lease = pool.try_lease(&names(&["db"])).unwrap();
        assert!(lease.is_some());
        assert!(pool.try_lease(&names(&["db"])).unwrap().is_none());
    }
    assert_eq!(pool.usage("db").unwrap().current, 0);
}

#[test]
fn test_pool_wait_directive_tracks_availability() {
    let pool = ResourcePool::from_limits([("db", 1)]);
    let clock = SystemClock;
    let directive = SuspensionDirective::pools(["db"]);
    assert!(directive.is_ready(&pool, &clock).unwrap());

    pool.try_acquire(&names(&["db"])).unwrap();
    assert!(!directive.is_ready(&pool, &clock).unwrap());
    pool.release(&names(&["db"]));
    assert!(directive.is_ready(&pool, &clock).unwrap());
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn test_limits_hold_under_contention() {
    let pool = Arc::new(ResourcePool::from_limits([("a", 2), ("b", 3), ("c", 1)]));
    let sets = [names(&["a"]), names(&["a", "b"]), names(&["b", "c"]), names(&["c", "a", "b"])];
    let peak_a = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let sets = sets.clone();
            let peak_a = Arc::clone(&peak_a);
            thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..500 {
                    let set = &sets[rng.random_range(0..sets.len())];
                    if let Some(lease) = pool.try_lease(set).unwrap() {
                        for usage in pool.snapshot() {
                            assert!(usage.current <= usage.limit, "{} over limit", usage.name);
                        }
                        let current = pool.usage("a").unwrap().current;
                        peak_a.fetch_max(current, Ordering::Relaxed);
                        drop(lease);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(peak_a.load(Ordering::Relaxed) <= 2);
    for usage in pool.snapshot() {
        assert_eq!(usage.current, 0, "{} leaked a slot", usage.name);
    }
}
