use core::time::Duration;
use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use tokio::sync::Semaphore;

use crate::{
    Error, MemoryRangeStore, RangeStore, RetryPolicy, SegmentAllocator, SegmentConfig, StoreError,
};

fn quick_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    }
}

fn config(step: u64) -> SegmentConfig {
    SegmentConfig {
        exhausted_wait: Duration::from_secs(5),
        retry: quick_retry(3),
        ..SegmentConfig::fixed_step(step)
    }
}

/// Fails the first `failures` calls, then behaves like a memory store.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryRangeStore,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyStore {
    fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }
}

impl RangeStore for FlakyStore {
    async fn fetch_and_advance(&self, key: &str, step: u64) -> Result<u64, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StoreError::new("connection reset"));
        }
        self.inner.fetch_and_advance(key, step).await
    }
}

/// Serves the first call immediately and every later call only once a permit
/// is released.
struct GatedStore {
    inner: MemoryRangeStore,
    gate: Semaphore,
    calls: AtomicU32,
}

impl GatedStore {
    fn new() -> Self {
        Self {
            inner: MemoryRangeStore::new(),
            gate: Semaphore::new(0),
            calls: AtomicU32::new(0),
        }
    }
}

impl RangeStore for GatedStore {
    async fn fetch_and_advance(&self, key: &str, step: u64) -> Result<u64, StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            self.gate
                .acquire()
                .await
                .map_err(|e| StoreError::new(e.to_string()))?
                .forget();
        }
        self.inner.fetch_and_advance(key, step).await
    }
}

/// Serves the first call, then fails forever.
#[derive(Default)]
struct DyingStore {
    inner: MemoryRangeStore,
    calls: AtomicU32,
}

impl RangeStore for DyingStore {
    async fn fetch_and_advance(&self, key: &str, step: u64) -> Result<u64, StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(StoreError::new("database is gone"));
        }
        self.inner.fetch_and_advance(key, step).await
    }
}

async fn take<S: RangeStore>(ids: &SegmentAllocator<S>, key: &str, n: usize) -> Vec<u64> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(ids.next_segment_id(key).await.unwrap());
    }
    out
}

#[tokio::test]
async fn exhausting_a_segment_swaps_to_the_prefetched_one() {
    let ids = SegmentAllocator::new(MemoryRangeStore::new(), config(10)).unwrap();

    let first = take(&ids, "orders", 10).await;
    assert_eq!(first, (0..10).collect::<Vec<_>>());

    assert_eq!(ids.next_segment_id("orders").await.unwrap(), 10);
    let stats = ids.stats("orders").unwrap();
    assert_eq!(stats.current_max, 20);
    assert_eq!(stats.remaining, 9);
    assert_eq!(ids.store().current("orders"), Some(20));
}

#[tokio::test]
async fn step_grows_when_refills_come_quickly() {
    let config = SegmentConfig {
        default_step: 10,
        min_step: 10,
        max_step: 40,
        ..config(10)
    };
    let ids = SegmentAllocator::new(MemoryRangeStore::new(), config).unwrap();

    let issued = take(&ids, "k", 30).await;
    assert_eq!(issued, (0..30).collect::<Vec<_>>());
    // [0, 10) then a doubled [10, 30).
    assert_eq!(ids.stats("k").unwrap().step, 20);

    assert_eq!(ids.next_segment_id("k").await.unwrap(), 30);
    assert_eq!(ids.stats("k").unwrap().step, 40);
    assert_eq!(ids.stats("k").unwrap().current_max, 70);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_get_distinct_contiguous_ids() {
    const TASKS: usize = 16;
    const PER_TASK: usize = 500;

    let ids = Arc::new(SegmentAllocator::new(MemoryRangeStore::new(), config(64)).unwrap());
    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let ids = Arc::clone(&ids);
            tokio::spawn(async move {
                let mut mine = Vec::with_capacity(PER_TASK);
                for _ in 0..PER_TASK {
                    mine.push(ids.next_segment_id("shared").await.unwrap());
                }
                mine
            })
        })
        .collect();

    let mut all = Vec::with_capacity(TASKS * PER_TASK);
    for handle in handles {
        let mine = handle.await.unwrap();
        assert!(mine.windows(2).all(|w| w[0] < w[1]), "per-caller order");
        all.extend(mine);
    }

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len(), "duplicate IDs issued");
    all.sort_unstable();
    assert_eq!(all, (0..(TASKS * PER_TASK) as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn store_failures_are_retried() {
    let ids = SegmentAllocator::new(FlakyStore::failing(2), config(10)).unwrap();
    assert_eq!(ids.next_segment_id("k").await, Ok(0));
    assert_eq!(ids.store().calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn initial_load_failure_is_unavailable_and_recoverable() {
    let config = SegmentConfig {
        retry: quick_retry(2),
        ..config(10)
    };
    let ids = SegmentAllocator::new(FlakyStore::failing(3), config).unwrap();

    let err = ids.next_segment_id("k").await.unwrap_err();
    assert!(
        matches!(&err, Error::SegmentUnavailable { key, reason } if key == "k" && reason == "connection reset"),
        "{err:?}"
    );
    assert!(ids.keys().is_empty());
    assert_eq!(ids.stats("k"), None);

    // The next call loads again and the store has recovered.
    assert_eq!(ids.next_segment_id("k").await, Ok(0));
    assert_eq!(ids.keys(), vec!["k".to_owned()]);
}

#[tokio::test]
async fn failed_refill_surfaces_as_unavailable() {
    let ids = SegmentAllocator::new(DyingStore::default(), config(2)).unwrap();
    assert_eq!(ids.next_segment_id("k").await, Ok(0));
    assert_eq!(ids.next_segment_id("k").await, Ok(1));

    let err = ids.next_segment_id("k").await.unwrap_err();
    assert!(matches!(err, Error::SegmentUnavailable { .. }), "{err:?}");
}

#[tokio::test]
async fn slow_refill_exhausts_then_recovers() {
    let config = SegmentConfig {
        exhausted_wait: Duration::from_millis(20),
        ..config(2)
    };
    let ids = SegmentAllocator::new(GatedStore::new(), config).unwrap();
    assert_eq!(take(&ids, "k", 2).await, vec![0, 1]);

    let err = ids.next_segment_id("k").await.unwrap_err();
    assert_eq!(
        err,
        Error::SegmentExhausted {
            key: "k".to_owned()
        }
    );
    assert!(err.is_transient());

    ids.store().gate.add_permits(1);
    assert_eq!(ids.next_segment_id("k").await, Ok(2));
}

#[tokio::test(flavor = "current_thread")]
async fn refill_released_at_exhaustion_boundary_leaves_no_gap() {
    const CONSUMERS: u64 = 8;
    const PER_CONSUMER: u64 = 10;

    let ids = Arc::new(SegmentAllocator::new(GatedStore::new(), config(100)).unwrap());
    // [0, 100) is served; the refill claimed at 89 blocks on the gate.
    assert_eq!(take(&ids, "k", 100).await, (0..100).collect::<Vec<_>>());

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let ids = Arc::clone(&ids);
            tokio::spawn(async move {
                let mut mine = Vec::new();
                for _ in 0..PER_CONSUMER {
                    mine.push(ids.next_segment_id("k").await.unwrap());
                }
                mine
            })
        })
        .collect();
    // Let every consumer run into the empty segment and park.
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
    let stats = ids.stats("k").unwrap();
    assert_eq!((stats.remaining, stats.next_ready, stats.refilling), (0, false, true));

    ids.store().gate.add_permits(1);
    let mut issued = Vec::new();
    for consumer in consumers {
        let mine = consumer.await.unwrap();
        assert!(mine.windows(2).all(|w| w[0] < w[1]));
        issued.extend(mine);
    }
    issued.sort_unstable();
    assert_eq!(issued, (100..100 + CONSUMERS * PER_CONSUMER).collect::<Vec<_>>());
    assert_eq!(ids.stats("k").unwrap().current_max, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_id_and_refill_install_race_without_gap_or_duplicate() {
    const CONSUMERS: usize = 8;
    const PER_CONSUMER: usize = 5;

    for _ in 0..50 {
        let ids = Arc::new(SegmentAllocator::new(GatedStore::new(), config(10)).unwrap());
        // One ID left in [0, 10), the refill claimed at 8 is held.
        let mut issued = take(&ids, "k", 9).await;

        let start = Arc::new(tokio::sync::Barrier::new(CONSUMERS + 1));
        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let ids = Arc::clone(&ids);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    take(&ids, "k", PER_CONSUMER).await
                })
            })
            .collect();
        start.wait().await;
        ids.store().gate.add_permits(100);

        for consumer in consumers {
            issued.extend(consumer.await.unwrap());
        }
        let unique: HashSet<_> = issued.iter().copied().collect();
        assert_eq!(unique.len(), issued.len(), "duplicate IDs issued");
        issued.sort_unstable();
        assert_eq!(issued, (0..(9 + CONSUMERS * PER_CONSUMER) as u64).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn shutdown_stops_refills() {
    let ids = SegmentAllocator::new(MemoryRangeStore::new(), config(2)).unwrap();
    assert_eq!(ids.next_segment_id("k").await, Ok(0));
    ids.shutdown();
    assert!(ids.is_shut_down());

    // The cached segment is still served.
    assert_eq!(ids.next_segment_id("k").await, Ok(1));
    let err = ids.next_segment_id("k").await.unwrap_err();
    assert!(
        matches!(&err, Error::SegmentUnavailable { reason, .. } if reason == "allocator shut down"),
        "{err:?}"
    );
}

#[tokio::test]
async fn invalid_keys_are_rejected() {
    let ids = SegmentAllocator::new(MemoryRangeStore::new(), config(10)).unwrap();
    let too_long = "k".repeat(129);
    for key in ["", "has space", "tab\there", "line\n", too_long.as_str()] {
        assert_eq!(
            ids.next_segment_id(key).await,
            Err(Error::InvalidKey {
                key: key.to_owned()
            })
        );
    }
    assert_eq!(ids.next_segment_id(&"k".repeat(128)).await, Ok(0));
    assert_eq!(ids.next_segment_id("order-items:eu").await, Ok(0));
}

#[tokio::test]
async fn keys_are_independent() {
    let ids = SegmentAllocator::new(MemoryRangeStore::with_base(1_000), config(10)).unwrap();
    assert_eq!(ids.next_segment_id("b").await, Ok(1_000));
    assert_eq!(ids.next_segment_id("a").await, Ok(1_000));
    assert_eq!(ids.next_segment_id("b").await, Ok(1_001));
    assert_eq!(ids.keys(), vec!["a".to_owned(), "b".to_owned()]);
}

#[tokio::test]
async fn concurrent_first_calls_load_once() {
    let ids = Arc::new(SegmentAllocator::new(FlakyStore::default(), config(100)).unwrap());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ids = Arc::clone(&ids);
            tokio::spawn(async move { ids.next_segment_id("fresh").await.unwrap() })
        })
        .collect();
    let mut issued = Vec::new();
    for handle in handles {
        issued.push(handle.await.unwrap());
    }
    issued.sort_unstable();
    assert_eq!(issued, (0..8).collect::<Vec<_>>());
    assert_eq!(ids.store().calls.load(Ordering::SeqCst), 1);
}

#[test]
fn rejects_invalid_config() {
    let bad = SegmentConfig {
        low_water: 1.5,
        ..SegmentConfig::default()
    };
    assert!(matches!(
        SegmentAllocator::new(MemoryRangeStore::new(), bad),
        Err(Error::InvalidConfig { .. })
    ));
}
