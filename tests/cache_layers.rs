use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use feedcache::cache::{
    BreakerState, CacheConfig, CacheServices, FeedKey, FetchError, Freshness, MemoryBackend, Stamped,
    StoreAdapter, Tab,
};
use serde_json::{Value, json};
use time::OffsetDateTime;

fn services() -> CacheServices {
    CacheServices::new(Arc::new(MemoryBackend::new()), &CacheConfig::default())
}

fn millis_ago(age: Duration) -> i64 {
    let now = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(now).expect("millis fit") - i64::try_from(age.as_millis()).expect("age fits")
}

#[tokio::test(start_paused = true)]
async fn entries_disappear_once_ttl_elapses() {
    let store = StoreAdapter::new(Arc::new(MemoryBackend::new()), Duration::from_secs(300));
    assert!(store.set("session:s1", &json!({"user": "u1"}), Duration::from_secs(10)).await);

    tokio::time::advance(Duration::from_secs(9)).await;
    assert_eq!(
        store.get::<Value>("session:s1").await,
        Some(json!({"user": "u1"}))
    );
    assert_eq!(store.ttl("session:s1").await, Some(Duration::from_secs(1)));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(store.get::<Value>("session:s1").await, None);
    assert!(!store.exists("session:s1").await);
}

#[tokio::test]
async fn large_values_round_trip_compressed() {
    let services = services();
    let posts: Vec<Value> = (0..200)
        .map(|i| json!({"id": i, "body": "the quick brown fox jumps over the lazy dog"}))
        .collect();

    assert!(
        services
            .compressed
            .set("timeline:u1:explore:0", &posts, Duration::from_secs(60))
            .await
            .expect("write")
    );
    let read: Option<Vec<Value>> = services
        .compressed
        .get("timeline:u1:explore:0")
        .await
        .expect("read");

    assert_eq!(read, Some(posts));
    let stats = services.compressed.stats();
    assert_eq!(stats.compressed_writes, 1);
    assert!(stats.stored_bytes < stats.original_bytes);
}

#[tokio::test]
async fn stale_timeline_is_served_then_refreshed() {
    let services = services();
    let key = FeedKey::timeline("u1", Tab::ForYou, 0).to_string();
    let aged = Stamped {
        value: json!(["old"]),
        written_at_ms: millis_ago(Tab::ForYou.ttl() + Duration::from_secs(30)),
    };
    services
        .compressed
        .set(&key, &aged, Duration::from_secs(3600))
        .await
        .expect("seed");

    let calls = Arc::new(AtomicU32::new(0));
    let fetcher = {
        let calls = Arc::clone(&calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<Value, FetchError>(json!(["new"])) }
        }
    };

    let first = services
        .timelines
        .get_timeline::<Value, _, _>("u1", Tab::ForYou, 0, fetcher.clone())
        .await
        .expect("stale read");
    assert_eq!(first.freshness, Freshness::Stale);
    assert_eq!(first.value, json!(["old"]));

    for _ in 0..200 {
        if !services.swr.is_refreshing(&key) && services.swr.last_refresh(&key).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let second = services
        .timelines
        .get_timeline::<Value, _, _>("u1", Tab::ForYou, 0, fetcher)
        .await
        .expect("fresh read");
    assert_eq!(second.freshness, Freshness::Fresh);
    assert_eq!(second.value, json!(["new"]));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_origin_opens_the_breaker() {
    let config = CacheConfig {
        resilience: feedcache::cache::ResilienceConfig {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            failure_threshold: 2,
            open_timeout: Duration::from_secs(60),
        },
        ..CacheConfig::default()
    };
    let services = CacheServices::new(Arc::new(MemoryBackend::new()), &config);

    for _ in 0..2 {
        let result = services
            .executor
            .execute::<u32, _, _>("user:down", Duration::from_secs(60), None, || async {
                Err::<u32, FetchError>("origin down".into())
            })
            .await;
        assert!(result.is_err());
    }

    let snapshot = services.executor.breaker_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].key, "user:down");
    assert_eq!(services.executor.breaker_state("user:down"), BreakerState::Open);

    let fallback = services
        .executor
        .execute("user:down", Duration::from_secs(60), Some(5u32), || async {
            Ok::<u32, FetchError>(9)
        })
        .await
        .expect("fallback while open");
    assert_eq!(fallback.value, 5);
    assert!(services.executor.reset_breaker("user:down"));
}
