//! Integration tests across components sharing one store

use crate::prelude::*;
use crate::{
    Component, Event, EventSink, KeyTtl, Outcome, PublicError, RunOutcome, TaskPhase, WindowCount,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Profile {
    id: u64,
    name: String,
}

/// Captures events for assertions
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(Component, &'static str, String, Outcome)>>,
}

impl RecordingSink {
    fn count(&self, component: Component, outcome: Outcome) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(c, _, _, o)| *c == component && *o == outcome)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: &Event<'_>) {
        self.events.lock().push((
            event.component,
            event.operation,
            event.subject.to_string(),
            event.outcome,
        ));
    }
}

/// Memory store whose reads and writes can be switched to fail
struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::with_defaults(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn check(&self, flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(KvError::Connection("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check(&self.fail_reads)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.check(&self.fail_writes)?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check(&self.fail_writes)?;
        self.inner.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        self.check(&self.fail_writes)?;
        self.inner.delete_many(keys).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.check(&self.fail_writes)?;
        self.inner.incr(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check(&self.fail_writes)?;
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.check(&self.fail_reads)?;
        self.inner.ttl(key).await
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        self.check(&self.fail_reads)?;
        self.inner.keys_matching(pattern).await
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        self.check(&self.fail_writes)?;
        self.inner.incr_window(key, window).await
    }
}

fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(MemoryConfig::default()))
}

fn reader_with_sink<St: KeyValueStore>(
    store: Arc<St>,
    sink: Arc<RecordingSink>,
) -> CacheAsideReader<St, JsonSerializer, RecordingSink> {
    CacheAsideReader::with_parts(store, JsonSerializer, sink, ReaderConfig::default())
}

// ---- keys ----

#[test]
fn test_key_is_permutation_invariant() {
    let mut forward = HashMap::new();
    forward.insert("page", "2");
    forward.insert("category", "shoes");
    forward.insert("sort", "price");

    let reversed: Vec<(&str, &str)> = vec![("sort", "price"), ("page", "2"), ("category", "shoes")];

    assert_eq!(build_key("products", forward), build_key("products", reversed));
    assert_eq!(
        build_key("products", [("page", "2"), ("category", "shoes"), ("sort", "price")]),
        "products:category:shoes:page:2:sort:price"
    );
}

// ---- cache-aside reads ----

#[tokio::test]
async fn test_get_cached_fetches_once_then_hits() {
    let store = memory_store();
    let sink = Arc::new(RecordingSink::default());
    let reader = reader_with_sink(store.clone(), sink.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = calls.clone();
        let profile: Profile = reader
            .get_cached(
                "user:1",
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Profile {
                        id: 1,
                        name: "Ada".into(),
                    })
                },
                Some(Duration::from_secs(60)),
                FailurePolicy::FailClosed,
            )
            .await
            .unwrap();
        assert_eq!(profile.name, "Ada");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.count(Component::Cache, Outcome::Miss), 1);
    assert_eq!(sink.count(Component::Cache, Outcome::Hit), 1);
    assert!(store.get("user:1").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_get_cached_refetches_after_ttl() {
    let reader = CacheAsideReader::new(memory_store());
    let calls = Arc::new(AtomicUsize::new(0));

    let fetch = |calls: Arc<AtomicUsize>| {
        move || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) as u64) }
    };

    let first: u64 = reader
        .get_cached("n", fetch(calls.clone()), Some(Duration::from_secs(5)), FailurePolicy::FailClosed)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(4)).await;
    let cached: u64 = reader
        .get_cached("n", fetch(calls.clone()), Some(Duration::from_secs(5)), FailurePolicy::FailClosed)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    let refreshed: u64 = reader
        .get_cached("n", fetch(calls.clone()), Some(Duration::from_secs(5)), FailurePolicy::FailClosed)
        .await
        .unwrap();

    assert_eq!((first, cached, refreshed), (0, 0, 1));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_default_ttl_and_namespace() {
    let store = memory_store();
    let reader = CacheAsideReader::with_config(store.clone(), ReaderConfig::default().namespace("svc"));

    reader.put("greeting", &"hi".to_string(), None).await.unwrap();

    let ttl = store.ttl("svc:greeting").await.unwrap().remaining().unwrap();
    assert!(ttl <= Duration::from_secs(3600));
    assert!(ttl > Duration::from_secs(3590));
    assert_eq!(reader.get::<String>("greeting").await.unwrap().as_deref(), Some("hi"));
    assert!(reader.remove("greeting").await.unwrap());
}

#[tokio::test]
async fn test_get_cached_with_unbounded_ttl() {
    let store = memory_store();
    let reader = CacheAsideReader::with_config(
        store.clone(),
        ReaderConfig::default().jitter(0.5),
    );

    let value: String = reader
        .get_cached(
            "forever",
            || async { Ok("kept".to_string()) },
            Some(Duration::MAX),
            FailurePolicy::FailClosed,
        )
        .await
        .unwrap();

    assert_eq!(value, "kept");
    assert_eq!(store.ttl("forever").await.unwrap(), KeyTtl::Persistent);
    assert_eq!(reader.get::<String>("forever").await.unwrap().as_deref(), Some("kept"));
}

#[tokio::test]
async fn test_type_mismatch_is_an_error_under_both_policies() {
    let store = memory_store();
    store
        .set("user:2", br#"{"unexpected":true}"#.to_vec(), None)
        .await
        .unwrap();
    let reader = CacheAsideReader::new(store);

    for policy in [FailurePolicy::FailOpen, FailurePolicy::FailClosed] {
        let err = reader
            .get_cached::<Profile, _, _>(
                "user:2",
                || async { Err(KvError::fetch("fetch must not run on a hit")) },
                None,
                policy,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Deserialization(ref msg) if msg.contains("Profile")));
    }
}

#[tokio::test]
async fn test_fail_open_read_falls_back_to_fetch() {
    let store = Arc::new(FlakyStore::new());
    store.fail_reads.store(true, Ordering::SeqCst);
    let sink = Arc::new(RecordingSink::default());
    let reader = reader_with_sink(store.clone(), sink.clone());

    let value: u32 = reader
        .get_cached("k", || async { Ok(7) }, None, FailurePolicy::FailOpen)
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(sink.count(Component::Cache, Outcome::Degraded), 1);

    let fetched = Arc::new(AtomicBool::new(false));
    let flag = fetched.clone();
    let err = reader
        .get_cached::<u32, _, _>(
            "k",
            || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(7)
            },
            None,
            FailurePolicy::FailClosed,
        )
        .await
        .unwrap_err();
    assert!(err.is_store_error());
    assert!(!fetched.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_write_failure_by_policy() {
    let store = Arc::new(FlakyStore::new());
    store.fail_writes.store(true, Ordering::SeqCst);
    let reader = CacheAsideReader::new(store.clone());

    let value: String = reader
        .get_cached("k", || async { Ok("v".to_string()) }, None, FailurePolicy::FailOpen)
        .await
        .unwrap();
    assert_eq!(value, "v");

    let err = reader
        .get_cached::<String, _, _>(
            "k",
            || async { Ok("v".to_string()) },
            None,
            FailurePolicy::FailClosed,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::Connection(_)));
}

#[tokio::test]
async fn test_fetch_error_propagates_and_writes_nothing() {
    let store = memory_store();
    let reader = CacheAsideReader::new(store.clone());

    let err = reader
        .get_cached::<u32, _, _>(
            "missing",
            || async { Err(KvError::fetch("upstream 503")) },
            None,
            FailurePolicy::FailOpen,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, KvError::Fetch(ref msg) if msg == "upstream 503"));
    assert!(store.get("missing").await.unwrap().is_none());
}

// ---- rate limiting ----

#[tokio::test(start_paused = true)]
async fn test_rate_limit_fixed_window() {
    let limiter = RateLimiter::new(memory_store());
    let window = Duration::from_secs(1);

    for expected_remaining in [2, 1, 0] {
        let status = assert_ok!(limiter.check("client-a", 3, window).await);
        assert_eq!(status.remaining, expected_remaining);
        assert!(!status.degraded);
    }

    let err = assert_err!(limiter.check("client-a", 3, window).await);
    match &err {
        KvError::RateLimitExceeded {
            limit,
            remaining,
            reset,
            ..
        } => {
            assert_eq!(*limit, 3);
            assert_eq!(*remaining, 0);
            assert!(*reset <= window);
        }
        other => panic!("expected rate limit error, got {other:?}"),
    }
    assert_eq!(err.retry_after(), Some(window));
    assert_eq!(err.to_public().status_code(), 429);

    tokio::time::advance(window).await;
    let status = assert_ok!(limiter.check("client-a", 3, window).await);
    assert_eq!(status.used(), 1);
}

#[tokio::test]
async fn test_rate_limit_keys_are_independent() {
    let limiter = RateLimiter::new(memory_store());
    let window = Duration::from_secs(60);

    assert_ok!(limiter.check("a", 1, window).await);
    assert_err!(limiter.check("a", 1, window).await);
    assert_ok!(limiter.check("b", 1, window).await);
}

#[tokio::test]
async fn test_rate_limit_window_beyond_clock_range() {
    let limiter = RateLimiter::new(memory_store());
    let window = Duration::from_secs(u64::MAX);

    let status = assert_ok!(limiter.check("client-z", 1, window).await);
    assert_eq!(status.remaining, 0);
    assert_eq!(status.reset, window);

    let err = assert_err!(limiter.check("client-z", 1, window).await);
    assert!(matches!(err, KvError::RateLimitExceeded { .. }));
}

#[tokio::test]
async fn test_rate_limit_store_failure_policy() {
    let store = Arc::new(FlakyStore::new());
    store.fail_writes.store(true, Ordering::SeqCst);
    let sink = Arc::new(RecordingSink::default());

    let open = RateLimiter::with_sink(store.clone(), sink.clone(), RateLimiterConfig::default());
    let status = open.check("ip:1", 10, Duration::from_secs(60)).await.unwrap();
    assert!(status.degraded);
    assert_eq!(sink.count(Component::RateLimiter, Outcome::Degraded), 1);

    let closed = RateLimiter::with_config(store, RateLimiterConfig::default().fail_closed());
    let err = closed.check("ip:1", 10, Duration::from_secs(60)).await.unwrap_err();
    assert!(err.is_store_error());
    assert_eq!(err.to_public(), PublicError::Internal);
}

#[tokio::test]
async fn test_rate_limit_validation() {
    let limiter = RateLimiter::new(memory_store());
    assert!(matches!(
        limiter.check("k", 0, Duration::from_secs(1)).await,
        Err(KvError::Validation(_))
    ));
    assert!(matches!(
        limiter.check("k", 5, Duration::ZERO).await,
        Err(KvError::Validation(_))
    ));
}

#[tokio::test]
async fn test_rate_limit_status_and_reset() {
    let store = memory_store();
    let limiter = RateLimiter::with_config(store.clone(), RateLimiterConfig::default().prefix("rl"));
    let window = Duration::from_secs(30);

    limiter.check("login:bob", 5, window).await.unwrap();
    limiter.check("login:bob", 5, window).await.unwrap();

    let status = limiter.status("login:bob", 5).await.unwrap();
    assert_eq!(status.remaining, 3);
    assert!(status.reset > Duration::ZERO);
    assert!(store.get("rl:login:bob").await.unwrap().is_some());

    assert!(limiter.reset("login:bob").await.unwrap());
    assert_eq!(limiter.status("login:bob", 5).await.unwrap().remaining, 5);
}

// ---- invalidation ----

async fn seed_users(store: &MemoryStore) {
    for key in ["user:42:profile", "user:42:orders", "user:7:profile"] {
        store.set(key, b"{}".to_vec(), None).await.unwrap();
    }
}

#[tokio::test]
async fn test_invalidate_after_successful_mutation() {
    let store = memory_store();
    seed_users(&store).await;
    let invalidator = CacheInvalidator::new(store.clone());

    let outcome: std::result::Result<&str, String> = Ok("updated");
    let report = invalidator
        .after_mutation(&outcome, &["user:42:*"])
        .await
        .unwrap();

    assert_eq!(report.deleted(), 2);
    assert_eq!(report.patterns[0].pattern, "user:42:*");
    assert!(store.get("user:42:profile").await.unwrap().is_none());
    assert!(store.get("user:7:profile").await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_mutation_deletes_nothing() {
    let store = memory_store();
    seed_users(&store).await;
    let sink = Arc::new(RecordingSink::default());
    let invalidator = CacheInvalidator::with_sink(store.clone(), sink.clone());

    let outcome: std::result::Result<(), String> = Err("conflict".into());
    assert!(invalidator.after_mutation(&outcome, &["user:42:*"]).await.is_none());

    assert_eq!(store.keys_matching("user:*").await.unwrap().len(), 3);
    assert_eq!(sink.count(Component::Invalidator, Outcome::Skipped), 1);
}

#[tokio::test]
async fn test_run_mutation() {
    let store = memory_store();
    seed_users(&store).await;
    let invalidator = CacheInvalidator::new(store.clone());

    let saved = invalidator
        .run_mutation(async { Ok::<_, String>(42u64) }, &["user:42:*", "user:7:*"])
        .await;
    assert_eq!(saved, Ok(42));
    assert!(store.keys_matching("user:*").await.unwrap().is_empty());

    store.set("user:1:profile", b"{}".to_vec(), None).await.unwrap();
    let failed = invalidator
        .run_mutation(async { Err::<u64, _>("db down".to_string()) }, &["user:*"])
        .await;
    assert!(failed.is_err());
    assert!(store.get("user:1:profile").await.unwrap().is_some());
}

#[tokio::test]
async fn test_invalidation_error_keeps_mutation_result() {
    let store = Arc::new(FlakyStore::new());
    store.fail_reads.store(true, Ordering::SeqCst);
    let sink = Arc::new(RecordingSink::default());
    let invalidator = CacheInvalidator::with_sink(store, sink.clone());

    let saved = invalidator
        .run_mutation(async { Ok::<_, String>("ok") }, &["user:*"])
        .await;
    assert_eq!(saved, Ok("ok"));
    assert_eq!(sink.count(Component::Invalidator, Outcome::Failure), 1);
}

#[tokio::test]
async fn test_invalidate_exact_keys() {
    let store = memory_store();
    seed_users(&store).await;
    let invalidator = CacheInvalidator::new(store.clone());

    let deleted = invalidator
        .invalidate_keys(&["user:7:profile", "user:9:profile"])
        .await
        .unwrap();
    assert_eq!(deleted, 1);
}

// ---- batches ----

#[tokio::test]
async fn test_batch_captures_item_failure() {
    let batch = BatchProcessor::new();
    let result = batch
        .run(
            vec![1, 2, 3, 4, 5],
            |n: i32| async move {
                if n == 3 {
                    Err(format!("item {n} failed"))
                } else {
                    Ok(n * 10)
                }
            },
            2,
        )
        .await
        .unwrap();

    assert_eq!(result.total, 5);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].item, 3);
    assert_eq!(result.failed[0].error, "item 3 failed");

    let ok: Vec<(i32, i32)> = result.successful.iter().map(|s| (s.item, s.result)).collect();
    assert_eq!(ok, vec![(1, 10), (2, 20), (4, 40), (5, 50)]);
    assert_eq!(result.successful.len() + result.failed.len(), result.total);
}

#[tokio::test(start_paused = true)]
async fn test_batch_chunks_run_in_sequence() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let batch = BatchProcessor::new();
    let result = batch
        .run(
            vec![1u64, 2, 3, 4, 5],
            |n: u64| {
                let log = log.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    log.lock().push(format!("start {n}"));
                    // Odd items are slower so chunk boundaries are visible.
                    tokio::time::sleep(Duration::from_millis(if n % 2 == 1 { 30 } else { 10 })).await;
                    log.lock().push(format!("end {n}"));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(n)
                }
            },
            2,
        )
        .await
        .unwrap();

    assert!(result.all_succeeded());
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    let log = log.lock();
    let at = |entry: &str| log.iter().position(|e| e == entry).unwrap();
    assert!(at("start 3") > at("end 1"));
    assert!(at("start 5") > at("end 3"));
}

#[tokio::test]
async fn test_batch_rejects_zero_concurrency() {
    let err = BatchProcessor::new()
        .run(vec![1], |n: i32| async move { Ok::<_, String>(n) }, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::Validation(_)));
}

#[tokio::test]
async fn test_batch_empty_input() {
    let result = BatchProcessor::new()
        .run(Vec::<i32>::new(), |n: i32| async move { Ok::<_, String>(n) }, 4)
        .await
        .unwrap();
    assert_eq!(result.total, 0);
    assert!(result.is_complete());
}

// ---- retries ----

#[tokio::test(start_paused = true)]
async fn test_retry_runs_initial_plus_max_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let retry = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(100)));
    let started = tokio::time::Instant::now();

    let result: std::result::Result<(), String> = retry
        .run(|| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("failure {n}"))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(result, Err("failure 4".to_string()));
    // 100 + 200 + 400
    assert_eq!(started.elapsed(), Duration::from_millis(700));
}

#[tokio::test(start_paused = true)]
async fn test_retry_predicate_stops_early() {
    let calls = Arc::new(AtomicUsize::new(0));
    let retry = RetryExecutor::new(RetryPolicy::new(5, Duration::from_millis(10)));

    let result: std::result::Result<(), KvError> = retry
        .run_if(
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(KvError::Validation("bad input".into()))
                }
            },
            |e| e.is_store_error(),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_per_call_budget() {
    let calls = Arc::new(AtomicUsize::new(0));
    // Executor defaults would allow far more attempts.
    let retry = RetryExecutor::new(RetryPolicy::new(10, Duration::from_secs(5)));
    let started = tokio::time::Instant::now();

    let result: std::result::Result<(), KvError> = retry
        .run_with(
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(KvError::Timeout)
                }
            },
            2,
            Duration::from_millis(100),
            |_| true,
        )
        .await;

    assert!(matches!(result, Err(KvError::Timeout)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 100 + 200
    assert_eq!(started.elapsed(), Duration::from_millis(300));

    calls.store(0, Ordering::SeqCst);
    let result: std::result::Result<(), KvError> = retry
        .run_with(
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(KvError::Validation("bad input".into()))
                }
            },
            4,
            Duration::from_millis(100),
            |e| e.is_store_error(),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_after_transient_errors() {
    let calls = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(RecordingSink::default());
    let retry = RetryExecutor::with_sink(RetryPolicy::new(5, Duration::from_millis(10)), sink.clone());

    let value = retry
        .run(|| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(KvError::Timeout)
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "done");
    assert_eq!(sink.count(Component::Retry, Outcome::Retrying), 2);
    assert_eq!(sink.count(Component::Retry, Outcome::Success), 1);
}

// ---- warmup ----

fn page_loader(loads: Arc<AtomicUsize>) -> impl Loader<String> {
    move |source: String| {
        let loads = loads.clone();
        async move {
            loads.fetch_add(1, Ordering::SeqCst);
            if source.contains("broken") {
                Err(KvError::fetch(format!("{source}: 404")))
            } else {
                Ok(format!("page {source}"))
            }
        }
    }
}

#[tokio::test]
async fn test_warm_once_stores_and_reports() {
    let store = memory_store();
    let sink = Arc::new(RecordingSink::default());
    let reader = reader_with_sink(store.clone(), sink.clone());
    let loads = Arc::new(AtomicUsize::new(0));

    let warmer = CacheWarmer::new(
        reader,
        vec!["/home".into(), "/broken".into(), "/pricing".into()],
        page_loader(loads.clone()),
        WarmerConfig::default().interval(Duration::from_secs(60)).concurrency(2),
    );

    let report = warmer.warm_once().await.unwrap();
    assert_eq!(report.total, 3);
    assert_eq!(report.stored.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "/broken");
    assert!(!report.is_complete());

    let key = warmer.key_for("/home");
    assert_eq!(key, "warmup:url:/home");
    let bytes = store.get(&key).await.unwrap().unwrap();
    assert_eq!(serde_json::from_slice::<String>(&bytes).unwrap(), "page /home");
    assert!(store.ttl(&key).await.unwrap().remaining().unwrap() <= Duration::from_secs(60));

    assert_eq!(sink.count(Component::Warmer, Outcome::Failure), 1);
}

#[tokio::test(start_paused = true)]
async fn test_warmer_loop_refreshes_until_shutdown() {
    let loads = Arc::new(AtomicUsize::new(0));
    let warmer = CacheWarmer::new(
        CacheAsideReader::new(memory_store()),
        vec!["/a".into(), "/b".into()],
        page_loader(loads.clone()),
        WarmerConfig::default().interval(Duration::from_secs(60)),
    );

    let handle = warmer.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(loads.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(loads.load(Ordering::SeqCst), 4);

    handle.shutdown().await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(loads.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_warmer_handle_stops_loop() {
    let loads = Arc::new(AtomicUsize::new(0));
    let warmer = CacheWarmer::new(
        CacheAsideReader::new(memory_store()),
        vec!["/a".into()],
        page_loader(loads.clone()),
        WarmerConfig::default().interval(Duration::from_secs(10)),
    );

    let handle = warmer.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    drop(handle);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_warmer_rejects_zero_interval() {
    let warmer = CacheWarmer::new(
        CacheAsideReader::new(memory_store()),
        vec!["/a".into()],
        page_loader(Arc::new(AtomicUsize::new(0))),
        WarmerConfig::default().interval(Duration::ZERO),
    );
    assert!(matches!(warmer.start(), Err(KvError::Validation(_))));
}

// ---- scheduled tasks ----

fn failing_then_ok(calls: Arc<AtomicUsize>, failures: usize) -> impl TaskHandler {
    move || {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(TaskError::new(format!("run {n} failed")))
            } else {
                Ok(())
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_gets_exactly_one_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(RecordingSink::default());
    let runner = TaskRunner::with_sink(
        sink.clone(),
        TaskRunnerConfig::default().retry_delay(Duration::from_secs(3)),
    );

    runner
        .register(
            "daily-audit",
            Schedule::every(Duration::from_secs(10)),
            failing_then_ok(calls.clone(), 2),
        )
        .unwrap();

    // Regular fire at 10s fails, the retry at 13s fails too.
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        runner.status("daily-audit").unwrap().phase,
        TaskPhase::RetryScheduled
    );

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let status = runner.status("daily-audit").unwrap();
    assert_eq!(status.failures, 2);
    assert_eq!(status.phase, TaskPhase::Idle);
    assert_eq!(sink.count(Component::Scheduler, Outcome::Retrying), 1);

    // Next regular fire at 20s succeeds.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let status = runner.status("daily-audit").unwrap();
    assert_eq!(status.last_outcome, Some(RunOutcome::Succeeded));
    assert!(status.last_run.is_some());

    runner.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pending_retry_outlives_a_regular_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = TaskRunner::with_config(
        TaskRunnerConfig::default().retry_delay(Duration::from_secs(25)),
    );

    runner
        .register(
            "export",
            Schedule::every(Duration::from_secs(10)),
            failing_then_ok(calls.clone(), 1),
        )
        .unwrap();

    // Fire at 10s fails, the regular run at 20s succeeds, the retry waits for 35s.
    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let status = runner.status("export").unwrap();
    assert_eq!(status.last_outcome, Some(RunOutcome::Succeeded));
    assert_eq!(status.phase, TaskPhase::RetryScheduled);
    assert_eq!(status.pending_retries, 1);

    // Regular run at 30s, retry at 35s.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let status = runner.status("export").unwrap();
    assert_eq!(status.phase, TaskPhase::Idle);
    assert_eq!(status.pending_retries, 0);

    runner.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = TaskRunner::with_config(TaskRunnerConfig::default().retry_delay(Duration::from_secs(3)));
    let counter = calls.clone();

    runner
        .register("sync", Schedule::every(Duration::from_secs(10)), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::permanent("bad credentials"))
            }
        })
        .unwrap();

    tokio::time::sleep(Duration::from_secs(19)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    runner.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_fires_are_skipped() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runner = TaskRunner::new();

    let (active, max) = (in_flight.clone(), peak.clone());
    runner
        .register("slow", Schedule::every(Duration::from_secs(1)), move || {
            let (active, max) = (active.clone(), max.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2500)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), TaskError>(())
            }
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5900)).await;

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let status = runner.status("slow").unwrap();
    assert!(status.skipped >= 2);
    assert!(status.runs >= 1);
    runner.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_run_now() {
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = TaskRunner::with_config(TaskRunnerConfig::default().retry_delay(Duration::from_secs(1)));
    runner
        .register(
            "report",
            Schedule::every(Duration::from_secs(3600)),
            failing_then_ok(calls.clone(), 1),
        )
        .unwrap();

    let err = runner.run_now("report").await.unwrap_err();
    assert!(matches!(err, KvError::Task(ref e) if e.message() == "run 1 failed"));

    // Manual failures do not schedule a retry.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    runner.run_now("report").await.unwrap();
    assert_eq!(runner.status("report").unwrap().runs, 2);
    assert!(matches!(runner.run_now("nope").await, Err(KvError::Validation(_))));

    runner.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_run_now_while_running() {
    let runner = Arc::new(TaskRunner::new());
    runner
        .register("slow", Schedule::every(Duration::from_secs(3600)), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), TaskError>(())
        })
        .unwrap();

    let background = runner.clone();
    let first = tokio::spawn(async move { background.run_now("slow").await });
    tokio::task::yield_now().await;

    let second = runner.run_now("slow").await;
    assert!(matches!(second, Err(KvError::AlreadyRunning(ref name)) if name == "slow"));
    assert!(first.await.unwrap().is_ok());
    runner.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_register_rules_and_shutdown() {
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = TaskRunner::new();
    runner
        .register("tick", Schedule::every(Duration::from_secs(1)), failing_then_ok(calls.clone(), 0))
        .unwrap();

    let duplicate = runner.register("tick", "every 5s".parse().unwrap(), failing_then_ok(calls.clone(), 0));
    assert!(matches!(duplicate, Err(KvError::Validation(_))));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    runner.shutdown().await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let late = runner.register("late", Schedule::every(Duration::from_secs(1)), failing_then_ok(calls, 0));
    assert!(matches!(late, Err(KvError::Validation(_))));
    assert_eq!(runner.tasks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_period_beyond_clock_range_runs_manually_only() {
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = TaskRunner::new();
    runner
        .register(
            "archive",
            Schedule::every(Duration::from_secs(u64::MAX)),
            failing_then_ok(calls.clone(), 0),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    runner.run_now("archive").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(runner.status("archive").unwrap().phase, TaskPhase::Idle);

    runner.shutdown().await;
}
