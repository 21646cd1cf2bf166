//! Cache-first execution with per-key circuit breaking and bounded retries.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

use super::compression::CompressedStore;
use super::error::{CacheError, FetchError};

const SOURCE: &str = "cache::resilience";

pub const METRIC_BREAKER_OPEN: &str = "feedcache_breaker_open_total";

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub failure_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-key breaker. Transitions only along
/// Closed→Open, Open→HalfOpen, HalfOpen→Closed and HalfOpen→Open.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

impl CircuitBreaker {
    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Ask permission for one call. An elapsed Open breaker admits exactly one trial.
    fn try_acquire(&mut self, now: Instant, open_timeout: Duration) -> Permit {
        match self.state {
            BreakerState::Closed => Permit::Call,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .is_some_and(|opened| now.duration_since(opened) >= open_timeout);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    Permit::Trial
                } else {
                    Permit::Rejected
                }
            }
            BreakerState::HalfOpen if self.trial_in_flight => Permit::Rejected,
            BreakerState::HalfOpen => {
                self.trial_in_flight = true;
                Permit::Trial
            }
        }
    }

    /// Reopen after a trial that ended without an outcome.
    fn abandon_trial(&mut self, now: Instant) -> bool {
        if self.state == BreakerState::HalfOpen && self.trial_in_flight {
            self.open(now);
            true
        } else {
            false
        }
    }

    fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    /// Returns `true` when this failure opened the breaker.
    fn record_failure(&mut self, now: Instant, threshold: u32) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        match self.state {
            BreakerState::Closed if self.failure_count >= threshold => {
                self.open(now);
                true
            }
            BreakerState::HalfOpen => {
                self.open(now);
                true
            }
            BreakerState::Closed | BreakerState::Open => false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Call,
    Trial,
    Rejected,
}

/// Held by the caller running a HalfOpen trial. If the caller is dropped before the
/// trial records success or failure, the breaker goes back to Open with a fresh timeout.
struct TrialGuard<'a> {
    breakers: &'a DashMap<String, CircuitBreaker>,
    key: &'a str,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut breaker) = self.breakers.get_mut(self.key)
            && breaker.abandon_trial(Instant::now())
        {
            warn!(target_module = SOURCE, key = self.key, "Trial call abandoned; circuit reopened");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Cache,
    Fresh,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub source: FetchSource,
    /// Failed attempts before the value was obtained.
    pub retries: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub failure_count: u32,
}

/// Wraps origin fetches with a cache read, a per-key breaker and retries.
pub struct ResilientExecutor {
    store: Arc<CompressedStore>,
    config: ResilienceConfig,
    breakers: DashMap<String, CircuitBreaker>,
}

impl ResilientExecutor {
    pub fn new(store: Arc<CompressedStore>, config: ResilienceConfig) -> Self {
        Self {
            store,
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<CompressedStore> {
        &self.store
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Serve from cache, otherwise fetch through the breaker and write the result back.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fallback: Option<T>,
        fetcher: F,
    ) -> Result<Fetched<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, FetchError>> + Send,
    {
        if let Some(value) = self.store.get::<T>(key).await? {
            return Ok(Fetched {
                value,
                source: FetchSource::Cache,
                retries: 0,
            });
        }
        self.fetch_through(key, ttl, fallback, fetcher).await
    }

    /// Fetch without consulting the cache first; used for refreshes.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn fetch_through<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fallback: Option<T>,
        mut fetcher: F,
    ) -> Result<Fetched<T>, CacheError>
    where
        T: Serialize + Send + Sync,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, FetchError>> + Send,
    {
        let _trial = match self.acquire(key) {
            Permit::Call => None,
            Permit::Trial => Some(TrialGuard {
                breakers: &self.breakers,
                key,
            }),
            Permit::Rejected => {
                debug!(target_module = SOURCE, outcome = "rejected", "Circuit open");
                return match fallback {
                    Some(value) => Ok(Fetched {
                        value,
                        source: FetchSource::Fallback,
                        retries: 0,
                    }),
                    None => Err(CacheError::circuit_open(key)),
                };
            }
        };

        let attempts = self.config.max_retries.saturating_add(1);
        let mut last_error = String::new();
        let mut made = 0;

        for attempt in 0..attempts {
            if attempt > 0 {
                if self.is_open(key) {
                    break;
                }
                sleep(self.config.base_delay * attempt).await;
            }
            made += 1;

            match fetcher().await {
                Ok(value) => {
                    self.record_success(key);
                    if !matches!(self.store.set(key, &value, ttl).await, Ok(true)) {
                        warn!(target_module = SOURCE, "Write-through after fetch did not persist");
                    }
                    return Ok(Fetched {
                        value,
                        source: FetchSource::Fresh,
                        retries: attempt,
                    });
                }
                Err(err) => {
                    warn!(
                        target_module = SOURCE,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %err,
                        "Origin fetch failed"
                    );
                    last_error = err.to_string();
                    self.record_failure(key);
                }
            }
        }

        match fallback {
            Some(value) => Ok(Fetched {
                value,
                source: FetchSource::Fallback,
                retries: made,
            }),
            None => Err(CacheError::Fetch {
                key: key.to_string(),
                attempts: made,
                message: last_error,
            }),
        }
    }

    fn acquire(&self, key: &str) -> Permit {
        match self.breakers.get_mut(key) {
            Some(mut breaker) => breaker.try_acquire(Instant::now(), self.config.open_timeout),
            None => Permit::Call,
        }
    }

    fn is_open(&self, key: &str) -> bool {
        self.breakers
            .get(key)
            .is_some_and(|breaker| breaker.is_open())
    }

    /// A success resets the breaker, so healthy keys keep no state at all.
    fn record_success(&self, key: &str) {
        if let Some((_, breaker)) = self.breakers.remove(key)
            && breaker.state() != BreakerState::Closed
        {
            info!(target_module = SOURCE, key, "Circuit closed after successful trial");
        }
    }

    fn record_failure(&self, key: &str) {
        let mut breaker = self.breakers.entry(key.to_string()).or_default();
        if breaker.record_failure(Instant::now(), self.config.failure_threshold) {
            counter!(METRIC_BREAKER_OPEN).increment(1);
            warn!(
                target_module = SOURCE,
                key,
                failures = breaker.failure_count(),
                "Circuit opened"
            );
        }
    }

    pub fn breaker_state(&self, key: &str) -> BreakerState {
        self.breakers
            .get(key)
            .map(|breaker| breaker.state())
            .unwrap_or(BreakerState::Closed)
    }

    pub fn breaker_snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshot: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                key: entry.key().clone(),
                state: entry.state(),
                failure_count: entry.failure_count(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    pub fn reset_breaker(&self, key: &str) -> bool {
        self.breakers.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::Notify;

    use super::*;
    use crate::cache::compression::CompressionConfig;
    use crate::cache::store::{MemoryBackend, StoreAdapter};

    const TTL: Duration = Duration::from_secs(60);

    fn executor(config: ResilienceConfig) -> ResilientExecutor {
        let adapter = StoreAdapter::new(Arc::new(MemoryBackend::new()), TTL);
        let store = Arc::new(CompressedStore::new(adapter, CompressionConfig::default()));
        ResilientExecutor::new(store, config)
    }

    fn no_retry() -> ResilienceConfig {
        ResilienceConfig {
            max_retries: 0,
            ..ResilienceConfig::default()
        }
    }

    #[test]
    fn breaker_follows_allowed_transitions() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut breaker = CircuitBreaker::default();

        assert_eq!(breaker.try_acquire(start, timeout), Permit::Call);
        assert!(!breaker.record_failure(start, 2));
        assert!(breaker.record_failure(start, 2));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(
            breaker.try_acquire(start + Duration::from_secs(5), timeout),
            Permit::Rejected
        );

        let later = start + timeout;
        assert_eq!(breaker.try_acquire(later, timeout), Permit::Trial);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.try_acquire(later, timeout), Permit::Rejected, "only one trial call");

        assert!(breaker.record_failure(later, 2));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.abandon_trial(later), "no trial in flight once reopened");

        assert_eq!(
            breaker.try_acquire(later + Duration::from_secs(1), timeout),
            Permit::Rejected
        );
        assert_eq!(breaker.try_acquire(later + timeout, timeout), Permit::Trial);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn cache_hit_skips_fetcher() {
        let executor = executor(no_retry());
        executor.store().set("k", &7_u32, TTL).await.expect("seed");
        let calls = AtomicU32::new(0);

        let fetched = executor
            .execute("k", TTL, None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u32, FetchError>(1) }
            })
            .await
            .expect("cached");

        assert_eq!(fetched.value, 7);
        assert_eq!(fetched.source, FetchSource::Cache);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_linear_backoff_then_succeeds() {
        let executor = executor(ResilienceConfig::default());
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let fetched = executor
            .execute("k", TTL, None, || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err::<u32, FetchError>("origin down".into())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .expect("eventually fresh");

        assert_eq!(fetched.value, 42);
        assert_eq!(fetched.source, FetchSource::Fresh);
        assert_eq!(fetched.retries, 2);
        // 1s after the first failure, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(
            executor.store().get::<u32>("k").await.expect("decode"),
            Some(42)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_fallback_or_last_error() {
        let executor = executor(ResilienceConfig {
            max_retries: 1,
            ..ResilienceConfig::default()
        });

        let fetched = executor
            .execute("a", TTL, Some(5_u32), || async {
                Err::<u32, FetchError>("boom".into())
            })
            .await
            .expect("fallback");
        assert_eq!(fetched.source, FetchSource::Fallback);
        assert_eq!(fetched.value, 5);

        let err = executor
            .execute("b", TTL, None, || async {
                Err::<u32, FetchError>("boom".into())
            })
            .await
            .expect_err("no fallback");
        assert_eq!(
            err,
            CacheError::Fetch {
                key: "b".into(),
                attempts: 2,
                message: "boom".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_until_timeout() {
        let executor = executor(no_retry());
        let calls = AtomicU32::new(0);
        let failing = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, FetchError>("down".into()) }
        };

        for _ in 0..5 {
            let fetched = executor
                .execute("k", TTL, Some(0), failing)
                .await
                .expect("fallback");
            assert_eq!(fetched.source, FetchSource::Fallback);
        }
        assert_eq!(executor.breaker_state("k"), BreakerState::Open);

        let sixth = executor
            .execute("k", TTL, Some(9), failing)
            .await
            .expect("fallback");
        assert_eq!(sixth.value, 9);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let err = executor
            .execute("k", TTL, None, failing)
            .await
            .expect_err("open without fallback");
        assert_eq!(err, CacheError::circuit_open("k"));

        tokio::time::advance(Duration::from_secs(60)).await;
        let trial = executor
            .execute("k", TTL, None, || async { Ok::<u32, FetchError>(1) })
            .await
            .expect("trial succeeds");
        assert_eq!(trial.source, FetchSource::Fresh);
        assert_eq!(executor.breaker_state("k"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_once_breaker_opens() {
        let executor = executor(ResilienceConfig {
            failure_threshold: 2,
            ..ResilienceConfig::default()
        });
        let calls = AtomicU32::new(0);

        let err = executor
            .execute("k", TTL, None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, FetchError>("down".into()) }
            })
            .await
            .expect_err("fails");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, CacheError::Fetch { attempts: 2, .. }));
        assert_eq!(executor.breaker_snapshot()[0].state, BreakerState::Open);
        assert!(executor.reset_breaker("k"));
        assert_eq!(executor.breaker_state("k"), BreakerState::Closed);
    }

    async fn open_breaker(executor: &ResilientExecutor, key: &str) {
        for _ in 0..executor.config().failure_threshold {
            executor
                .execute(key, TTL, Some(0_u32), || async {
                    Err::<u32, FetchError>("down".into())
                })
                .await
                .expect("fallback");
        }
        assert_eq!(executor.breaker_state(key), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_reopens_the_breaker() {
        let executor = executor(no_retry());
        open_breaker(&executor, "k").await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            executor.execute("k", TTL, None, std::future::pending::<Result<u32, FetchError>>),
        )
        .await;
        assert!(abandoned.is_err(), "trial never completes");
        assert_eq!(executor.breaker_state("k"), BreakerState::Open);

        let early = executor
            .execute("k", TTL, None, || async { Ok::<u32, FetchError>(1) })
            .await
            .expect_err("fresh open timeout");
        assert_eq!(early, CacheError::circuit_open("k"));

        tokio::time::advance(Duration::from_secs(60)).await;
        let recovered = executor
            .execute("k", TTL, None, || async { Ok::<u32, FetchError>(1) })
            .await
            .expect("new trial admitted");
        assert_eq!(recovered.source, FetchSource::Fresh);
        assert_eq!(executor.breaker_state("k"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_with_fresh_timeout() {
        let executor = executor(no_retry());
        open_breaker(&executor, "k").await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let trial = executor
            .execute("k", TTL, Some(7_u32), || async {
                Err::<u32, FetchError>("still down".into())
            })
            .await
            .expect("fallback after failed trial");
        assert_eq!(trial.source, FetchSource::Fallback);
        assert_eq!(trial.retries, 1);
        assert_eq!(executor.breaker_state("k"), BreakerState::Open);

        let calls = AtomicU32::new(0);
        let healthy = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<u32, FetchError>(1) }
        };

        tokio::time::advance(Duration::from_secs(59)).await;
        let err = executor
            .execute("k", TTL, None, healthy)
            .await
            .expect_err("timeout restarted at the failed trial");
        assert_eq!(err, CacheError::circuit_open("k"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        let fetched = executor.execute("k", TTL, None, healthy).await.expect("closed");
        assert_eq!(fetched.source, FetchSource::Fresh);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.breaker_state("k"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_concurrent_trial() {
        let executor = executor(no_retry());
        open_breaker(&executor, "k").await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let gate = Arc::new(Notify::new());
        let others_called = AtomicU32::new(0);

        let trial = executor.execute("k", TTL, None, || {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok::<u32, FetchError>(1)
            }
        });
        let others = async {
            while executor.breaker_state("k") != BreakerState::HalfOpen {
                tokio::task::yield_now().await;
            }
            let mut outcomes = Vec::new();
            for _ in 0..3 {
                let fetched = executor
                    .execute("k", TTL, Some(9_u32), || {
                        others_called.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<u32, FetchError>(2) }
                    })
                    .await
                    .expect("fallback while trial runs");
                outcomes.push((fetched.source, fetched.value));
            }
            gate.notify_one();
            outcomes
        };

        let (trial, outcomes) = tokio::join!(trial, others);
        assert_eq!(outcomes, vec![(FetchSource::Fallback, 9); 3]);
        assert_eq!(others_called.load(Ordering::SeqCst), 0);
        let trial = trial.expect("trial succeeds");
        assert_eq!((trial.source, trial.value), (FetchSource::Fresh, 1));
        assert_eq!(executor.breaker_state("k"), BreakerState::Closed);
    }
}
