//! Stale-while-revalidate reads.
//!
//! Values are stored as [`Stamped`] envelopes. Within `ttl` a value is fresh; between
//! `ttl` and `max_stale` it is served immediately while one background refresh per key
//! rewrites it; beyond that the caller waits on a fetch, falling back to the old value
//! if the fetch fails. Entries physically live for `max_stale + ttl` so a fallback
//! value is still around when the synchronous fetch fails.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{Instrument, debug, info_span, warn};

use super::error::{CacheError, FetchError};
use super::lock::mutex_lock;
use super::resilience::ResilientExecutor;
use super::unix_millis;

const SOURCE: &str = "cache::freshness";

pub const METRIC_SWR_REFRESH: &str = "feedcache_swr_refresh_total";

/// A value together with its write time in unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stamped<T> {
    pub value: T,
    pub written_at_ms: i64,
}

impl<T> Stamped<T> {
    pub fn now(value: T) -> Self {
        Self {
            value,
            written_at_ms: unix_millis(),
        }
    }

    pub fn age(&self) -> Duration {
        let age = unix_millis().saturating_sub(self.written_at_ms);
        Duration::from_millis(u64::try_from(age).unwrap_or(0))
    }
}

#[derive(Debug, Clone)]
pub struct FreshnessConfig {
    pub max_stale: Duration,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            max_stale: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Younger than its TTL.
    Fresh,
    /// Past its TTL; a background refresh was started or joined.
    Stale,
    /// Fetched synchronously from the origin.
    Fetched,
    /// The synchronous fetch failed and an expired value was served instead.
    StaleFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwrResult<T> {
    pub value: T,
    pub freshness: Freshness,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwrStats {
    pub fresh_hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub refreshes_started: u64,
    pub refreshes_completed: u64,
    pub refreshes_failed: u64,
    pub dedup_joins: u64,
}

#[derive(Debug, Default)]
struct Counters {
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    refreshes_started: AtomicU64,
    refreshes_completed: AtomicU64,
    refreshes_failed: AtomicU64,
    dedup_joins: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

type RefreshOutcome = Result<Value, CacheError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct Inner {
    executor: Arc<ResilientExecutor>,
    config: FreshnessConfig,
    inflight: Mutex<HashMap<String, SharedRefresh>>,
    refreshed_at: DashMap<String, OffsetDateTime>,
    counters: Counters,
}

impl Inner {
    fn store_ttl(&self, ttl: Duration) -> Duration {
        self.config.max_stale.max(ttl) + ttl
    }
}

/// Cheaply cloneable handle to the stale-while-revalidate layer.
#[derive(Clone)]
pub struct SwrCache {
    inner: Arc<Inner>,
}

impl SwrCache {
    pub fn new(executor: Arc<ResilientExecutor>, config: FreshnessConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                config,
                inflight: Mutex::new(HashMap::new()),
                refreshed_at: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn executor(&self) -> &Arc<ResilientExecutor> {
        &self.inner.executor
    }

    pub fn max_stale(&self) -> Duration {
        self.inner.config.max_stale
    }

    /// Physical store TTL used for envelopes whose freshness window is `ttl`.
    pub fn envelope_ttl(&self, ttl: Duration) -> Duration {
        self.inner.store_ttl(ttl)
    }

    pub async fn get<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetcher: F,
    ) -> Result<SwrResult<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let cached = match self.peek::<T>(key).await {
            Ok(cached) => cached,
            Err(err @ CacheError::Serialization { .. }) => {
                warn!(target_module = SOURCE, key, error = %err, "Ignoring entry with unexpected shape");
                None
            }
            Err(err) => return Err(err),
        };
        let counters = &self.inner.counters;

        let stale = match cached {
            Some(stamped) => {
                let age = stamped.age();
                if age < ttl {
                    bump(&counters.fresh_hits);
                    return Ok(SwrResult {
                        value: stamped.value,
                        freshness: Freshness::Fresh,
                    });
                }
                if age < self.inner.config.max_stale {
                    bump(&counters.stale_hits);
                    drop(self.refresh(key, ttl, fetcher));
                    return Ok(SwrResult {
                        value: stamped.value,
                        freshness: Freshness::Stale,
                    });
                }
                Some(stamped.value)
            }
            None => None,
        };

        bump(&counters.misses);
        let outcome = self.refresh(key, ttl, fetcher).await;
        match (outcome, stale) {
            (Ok(value), _) => {
                let stamped: Stamped<T> =
                    serde_json::from_value(value).map_err(|err| CacheError::serialization(key, err))?;
                Ok(SwrResult {
                    value: stamped.value,
                    freshness: Freshness::Fetched,
                })
            }
            (Err(err), Some(value)) => {
                warn!(
                    target_module = SOURCE,
                    key,
                    error = %err,
                    "Synchronous refresh failed; serving expired value"
                );
                Ok(SwrResult {
                    value,
                    freshness: Freshness::StaleFallback,
                })
            }
            (Err(err), None) => Err(err),
        }
    }

    /// Raw envelope read without freshness evaluation.
    pub async fn peek<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Stamped<T>>, CacheError> {
        self.inner.executor.store().get::<Stamped<T>>(key).await
    }

    /// Optimistic write: replace the envelope without waiting for the next read.
    pub async fn mutate<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: T,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let stamped = Stamped::now(value);
        self.inner
            .executor
            .store()
            .set(key, &stamped, self.inner.store_ttl(ttl))
            .await
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        self.inner.executor.store().delete(key).await
    }

    pub fn last_refresh(&self, key: &str) -> Option<OffsetDateTime> {
        self.inner.refreshed_at.get(key).map(|entry| *entry)
    }

    pub fn is_refreshing(&self, key: &str) -> bool {
        mutex_lock(&self.inner.inflight, SOURCE, "is_refreshing").contains_key(key)
    }

    pub fn stats(&self) -> SwrStats {
        let c = &self.inner.counters;
        SwrStats {
            fresh_hits: c.fresh_hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            refreshes_started: c.refreshes_started.load(Ordering::Relaxed),
            refreshes_completed: c.refreshes_completed.load(Ordering::Relaxed),
            refreshes_failed: c.refreshes_failed.load(Ordering::Relaxed),
            dedup_joins: c.dedup_joins.load(Ordering::Relaxed),
        }
    }

    /// Join the in-flight refresh for `key` or start one on its own task.
    fn refresh<T, F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> SharedRefresh
    where
        T: Serialize + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let mut inflight = mutex_lock(&self.inner.inflight, SOURCE, "refresh");
        if let Some(existing) = inflight.get(key) {
            bump(&self.inner.counters.dedup_joins);
            return existing.clone();
        }

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let fetcher = Arc::new(fetcher);
        let task: BoxFuture<'static, RefreshOutcome> = async move {
            let store_ttl = inner.store_ttl(ttl);
            let fetched = inner
                .executor
                .fetch_through(&owned_key, store_ttl, None, || {
                    let fetcher = Arc::clone(&fetcher);
                    async move { fetcher().await.map(Stamped::now) }
                })
                .await;
            let outcome = fetched.and_then(|fetched| {
                serde_json::to_value(&fetched.value)
                    .map_err(|err| CacheError::serialization(owned_key.as_str(), err))
            });

            mutex_lock(&inner.inflight, SOURCE, "refresh_done").remove(&owned_key);
            match &outcome {
                Ok(_) => {
                    inner
                        .refreshed_at
                        .insert(owned_key.clone(), OffsetDateTime::now_utc());
                    bump(&inner.counters.refreshes_completed);
                    counter!(METRIC_SWR_REFRESH, "outcome" => "ok").increment(1);
                    debug!(target_module = SOURCE, key = %owned_key, "Refresh completed");
                }
                Err(err) => {
                    bump(&inner.counters.refreshes_failed);
                    counter!(METRIC_SWR_REFRESH, "outcome" => "error").increment(1);
                    warn!(target_module = SOURCE, key = %owned_key, error = %err, "Refresh failed");
                }
            }
            outcome
        }
        .boxed();

        let shared = task.shared();
        inflight.insert(key.to_string(), shared.clone());
        drop(inflight);
        bump(&self.inner.counters.refreshes_started);

        let driver = shared.clone();
        tokio::spawn(
            async move {
                let _ = driver.await;
            }
            .instrument(info_span!("swr_refresh", key = %key)),
        );
        shared
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use futures::future::join_all;

    use super::*;
    use crate::cache::compression::{CompressedStore, CompressionConfig};
    use crate::cache::resilience::ResilienceConfig;
    use crate::cache::store::{MemoryBackend, StoreAdapter};

    const TTL: Duration = Duration::from_secs(60);

    fn swr() -> SwrCache {
        let adapter = StoreAdapter::new(Arc::new(MemoryBackend::new()), TTL);
        let store = Arc::new(CompressedStore::new(adapter, CompressionConfig::default()));
        let executor = Arc::new(ResilientExecutor::new(
            store,
            ResilienceConfig {
                max_retries: 0,
                ..ResilienceConfig::default()
            },
        ));
        SwrCache::new(
            executor,
            FreshnessConfig {
                max_stale: Duration::from_secs(600),
            },
        )
    }

    async fn seed(cache: &SwrCache, key: &str, value: u32, age: Duration) {
        let stamped = Stamped {
            value,
            written_at_ms: unix_millis() - i64::try_from(age.as_millis()).expect("age fits"),
        };
        cache
            .executor()
            .store()
            .set(key, &stamped, Duration::from_secs(3600))
            .await
            .expect("seed");
    }

    async fn wait_for_refresh(cache: &SwrCache, key: &str) {
        for _ in 0..200 {
            if cache.last_refresh(key).is_some() && !cache.is_refreshing(key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("refresh for {key} never completed");
    }

    fn counting(calls: Arc<AtomicU32>, value: u32) -> impl Fn() -> BoxFuture<'static, Result<u32, FetchError>> + Send + Sync + 'static {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(value) }.boxed()
        }
    }

    #[tokio::test]
    async fn miss_fetches_then_serves_fresh() {
        let cache = swr();
        let calls = Arc::new(AtomicU32::new(0));

        let first = cache.get("k", TTL, counting(calls.clone(), 1)).await.expect("fetch");
        assert_eq!(first, SwrResult { value: 1, freshness: Freshness::Fetched });

        let second = cache.get("k", TTL, counting(calls.clone(), 2)).await.expect("hit");
        assert_eq!(second, SwrResult { value: 1, freshness: Freshness::Fresh });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_stale_reads_trigger_one_refresh() {
        let cache = swr();
        seed(&cache, "k", 1, Duration::from_secs(120)).await;
        let calls = Arc::new(AtomicU32::new(0));

        let reads = (0..10).map(|_| cache.get("k", TTL, counting(calls.clone(), 2)));
        let results = join_all(reads).await;
        for result in results {
            let result = result.expect("stale read");
            assert_eq!(result.value, 1);
            assert_eq!(result.freshness, Freshness::Stale);
        }

        wait_for_refresh(&cache, "k").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().refreshes_started, 1);
        assert_eq!(cache.stats().dedup_joins, 9);

        let after = cache.get("k", TTL, counting(calls.clone(), 3)).await.expect("fresh");
        assert_eq!(after, SwrResult { value: 2, freshness: Freshness::Fresh });
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let cache = swr();
        let calls = Arc::new(AtomicU32::new(0));
        let slow = {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<u32, FetchError>(7)
                }
            }
        };

        let reads = (0..5).map(|_| cache.get("k", TTL, slow.clone()));
        for result in join_all(reads).await {
            assert_eq!(result.expect("fetched").value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_sync_fetch_falls_back_to_expired_value() {
        let cache = swr();
        seed(&cache, "k", 1, Duration::from_secs(630)).await;

        let result = cache
            .get("k", TTL, || async { Err::<u32, FetchError>("origin down".into()) })
            .await
            .expect("fallback");
        assert_eq!(result, SwrResult { value: 1, freshness: Freshness::StaleFallback });

        let err = cache
            .get("missing", TTL, || async { Err::<u32, FetchError>("origin down".into()) })
            .await
            .expect_err("nothing to fall back to");
        assert!(matches!(err, CacheError::Fetch { .. }));
    }

    #[tokio::test]
    async fn mutate_replaces_value_immediately() {
        let cache = swr();
        seed(&cache, "k", 1, Duration::from_secs(120)).await;
        assert!(cache.mutate("k", 5_u32, TTL).await.expect("mutate"));

        let calls = Arc::new(AtomicU32::new(0));
        let result = cache.get("k", TTL, counting(calls.clone(), 9)).await.expect("fresh");
        assert_eq!(result, SwrResult { value: 5, freshness: Freshness::Fresh });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(cache.invalidate("k").await);
        assert!(cache.peek::<u32>("k").await.expect("peek").is_none());
    }
}
