// ==============================================
// CART CONCURRENCY TESTS (integration)
// ==============================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};
use std::thread;
use std::time::Duration;

use cartcache::policy::cart::CartCache;
use cartcache::traits::PageSource;

/// Structural validation is only compiled with debug assertions.
fn validate<K, V, S>(cache: &CartCache<K, V, S>)
where
    K: Eq + std::hash::Hash + Clone,
    S: PageSource<K, V>,
{
    #[cfg(debug_assertions)]
    cache.debug_validate_invariants();
    #[cfg(not(debug_assertions))]
    {
        let _ = cache;
    }
}

/// Source that stamps loaded values with a unique instance id and records
/// every release, so handle-safety and exactly-once release are checkable
/// across threads.
#[derive(Default)]
struct TrackingSource {
    loads: AtomicUsize,
    next_instance: AtomicUsize,
    released: Mutex<HashSet<usize>>,
}

impl TrackingSource {
    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn was_released(&self, instance: usize) -> bool {
        self.released.lock().unwrap().contains(&instance)
    }

    fn released_count(&self) -> usize {
        self.released.lock().unwrap().len()
    }
}

impl PageSource<u64, (u64, usize)> for TrackingSource {
    fn load(&self, key: &u64) -> (u64, usize) {
        self.loads.fetch_add(1, Ordering::SeqCst);
        // Simulate a loader that actually does work; widens race windows.
        thread::sleep(Duration::from_micros(50));
        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
        (*key, instance)
    }

    fn release(&self, key: &u64, value: (u64, usize)) {
        let (value_key, instance) = value;
        assert_eq!(*key, value_key, "released under the wrong key");
        assert!(
            self.released.lock().unwrap().insert(instance),
            "instance {instance} released twice"
        );
    }
}

mod loader_races {
    use super::*;

    /// N concurrent lookups of one cold key: the loader runs exactly once
    /// and every thread sees the same value instance.
    #[test]
    fn cold_key_loads_once() {
        const THREADS: usize = 8;

        let cache = CartCache::new(TrackingSource::default(), 8, 0);
        let barrier = Barrier::new(THREADS);
        let instances: Mutex<HashSet<usize>> = Mutex::default();

        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    barrier.wait();
                    let handle = cache.find_or_create(42);
                    let (key, instance) = *handle.value();
                    assert_eq!(key, 42);
                    instances.lock().unwrap().insert(instance);
                });
            }
        });

        assert_eq!(cache.source().loads(), 1, "exactly one loader call");
        assert_eq!(
            instances.lock().unwrap().len(),
            1,
            "every caller must see the same instance"
        );
        validate(&cache);
    }

    /// Two threads hammering the same key: loader invocations are bounded by
    /// eviction events, not by access count.
    #[test]
    fn repeated_lookups_bounded_by_evictions() {
        const ITERATIONS: usize = 10_000;

        let cache = CartCache::new(TrackingSource::default(), 4, 0);

        thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..ITERATIONS {
                        let handle = cache.find_or_create(7);
                        assert_eq!(handle.value().0, 7);
                    }
                });
            }
        });

        let loads = cache.source().loads() as u64;
        let evictions = cache.metrics().evictions;
        assert!(
            loads <= evictions + 1,
            "loads ({loads}) must be bounded by evictions ({evictions}) + 1"
        );
        assert_eq!(loads, 1, "a single hot key never gets evicted");
        validate(&cache);
    }

    /// Concurrent insert and lookup of the same key agree on one published
    /// value; the loser's value goes back through the releaser.
    #[test]
    fn insert_and_lookup_publish_one_value() {
        const ROUNDS: usize = 200;

        for round in 0..ROUNDS {
            let cache = CartCache::new(TrackingSource::default(), 4, 0);
            let key = round as u64;
            let barrier = Barrier::new(2);

            let (lookup_instance, insert_instance) = thread::scope(|scope| {
                let looker = scope.spawn(|| {
                    barrier.wait();
                    let handle = cache.find_or_create(key);
                    handle.value().1
                });
                let inserter = scope.spawn(|| {
                    barrier.wait();
                    let handle = cache.insert(key, (key, 900_000 + round));
                    handle.value().1
                });
                (looker.join().unwrap(), inserter.join().unwrap())
            });

            assert_eq!(
                lookup_instance, insert_instance,
                "both threads must observe the published instance"
            );
            validate(&cache);
        }
    }
}

mod handle_safety {
    use super::*;

    /// One thread holds a handle on K while another floods the cache far
    /// past capacity: K's value stays valid and is never released while the
    /// handle is live; after the handle drops, pressure reclaims it.
    #[test]
    fn pinned_value_survives_eviction_pressure() {
        let cache = CartCache::new(TrackingSource::default(), 8, 0);

        let pinned = cache.find_or_create(1);
        let pinned_instance = pinned.value().1;

        thread::scope(|scope| {
            scope.spawn(|| {
                for key in 100..1100u64 {
                    drop(cache.find_or_create(key));
                }
            });

            // Concurrently observe the pinned value while pressure runs.
            for _ in 0..1000 {
                assert_eq!(pinned.value().0, 1);
                assert_eq!(pinned.value().1, pinned_instance);
            }
        });

        assert!(
            !cache.source().was_released(pinned_instance),
            "pinned instance released while a handle is live"
        );
        assert!(cache.contains(&1), "pinned entry must not be demoted");

        drop(pinned);
        for key in 2000..2100u64 {
            drop(cache.find_or_create(key));
        }
        assert!(
            cache.source().was_released(pinned_instance),
            "unpinned entry must eventually fall to pressure"
        );
        validate(&cache);
    }

    /// Duplicated handles keep the pin alive until the last one drops.
    #[test]
    fn duplicate_handles_extend_the_pin() {
        let cache = CartCache::new(TrackingSource::default(), 2, 0);
        let first = cache.find_or_create(1);
        let instance = first.value().1;
        let second = first.duplicate();
        drop(first);

        for key in 10..40u64 {
            drop(cache.find_or_create(key));
        }
        assert!(!cache.source().was_released(instance));
        assert_eq!(second.value().1, instance);

        drop(second);
        for key in 50..80u64 {
            drop(cache.find_or_create(key));
        }
        assert!(cache.source().was_released(instance));
        validate(&cache);
    }
}

mod mixed_traffic {
    use super::*;

    /// Several threads running every public operation over a shared key
    /// range: no instance is ever double-released and the structure settles
    /// into a valid state.
    #[test]
    fn mixed_operations_stay_consistent() {
        const THREADS: usize = 8;
        const OPS_PER_THREAD: usize = 2_000;

        let cache = CartCache::new(TrackingSource::default(), 16, 0);

        thread::scope(|scope| {
            let cache = &cache;
            for thread_id in 0..THREADS {
                scope.spawn(move || {
                    for i in 0..OPS_PER_THREAD {
                        let key = ((thread_id * 31 + i * 7) % 64) as u64;
                        // Inserted instances live far above loader-assigned
                        // ones and are unique per (thread, iteration).
                        let instance = usize::MAX - (thread_id * OPS_PER_THREAD + i);
                        match i % 5 {
                            0 | 1 => {
                                let handle = cache.find_or_create(key);
                                assert_eq!(handle.value().0, key);
                            },
                            2 => {
                                let handle = cache.is_in_cache(&key);
                                if !handle.is_empty() {
                                    assert_eq!(handle.value().0, key);
                                }
                            },
                            3 => {
                                let handle = cache.insert(key, (key, instance));
                                assert_eq!(handle.value().0, key);
                            },
                            _ => cache.remove(&key),
                        }
                    }
                });
            }
        });

        assert!(cache.len() <= 16);
        validate(&cache);
    }

    /// clear() under concurrent traffic releases every loaded instance
    /// exactly once (the TrackingSource asserts on double release).
    #[test]
    fn clear_under_traffic_releases_exactly_once() {
        let cache = CartCache::new(TrackingSource::default(), 8, 0);

        thread::scope(|scope| {
            scope.spawn(|| {
                for key in 0..500u64 {
                    drop(cache.find_or_create(key % 32));
                }
            });
            scope.spawn(|| {
                for _ in 0..20 {
                    thread::sleep(Duration::from_millis(1));
                    cache.clear();
                }
            });
        });

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(
            cache.source().released_count(),
            cache.source().loads(),
            "every loaded instance must be released exactly once"
        );
        validate(&cache);
    }
}
