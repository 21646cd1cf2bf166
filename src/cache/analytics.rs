//! Store operation analytics.
//!
//! [`RecordingBackend`] decorates a [`KvBackend`] and feeds every call into a shared
//! [`CacheAnalytics`], which keeps global counters, a rolling latency window, a bounded
//! operation history and per-key metrics. Reports derive a health score and rule-based
//! recommendations from those figures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use metrics::{counter, histogram};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::warn;

use super::lock::mutex_lock;
use super::store::{KvBackend, StoreResult};

const SOURCE: &str = "cache::analytics";

pub const METRIC_STORE_HIT: &str = "feedcache_store_hit_total";
pub const METRIC_STORE_MISS: &str = "feedcache_store_miss_total";
pub const METRIC_STORE_ERROR: &str = "feedcache_store_error_total";
pub const METRIC_STORE_LATENCY: &str = "feedcache_store_latency_ms";

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub history_limit: usize,
    pub latency_window: usize,
    pub max_tracked_keys: usize,
    pub slow_operation: Duration,
    pub low_hit_rate: f64,
    pub low_hit_rate_min_requests: u64,
    pub hot_key_share: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            latency_window: 100,
            max_tracked_keys: 10_000,
            slow_operation: Duration::from_secs(1),
            low_hit_rate: 0.7,
            low_hit_rate_min_requests: 100,
            hot_key_share: 0.10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Get,
    Set,
    Delete,
}

impl OperationKind {
    fn as_str(self) -> &'static str {
        match self {
            OperationKind::Get => "get",
            OperationKind::Set => "set",
            OperationKind::Delete => "delete",
        }
    }
}

/// One observed store call.
#[derive(Debug, Clone, Serialize)]
pub struct CacheOperation {
    pub key: String,
    pub kind: OperationKind,
    pub hit: bool,
    pub latency_ms: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub size: Option<usize>,
    pub error: Option<String>,
}

impl CacheOperation {
    pub fn new(key: impl Into<String>, kind: OperationKind, latency: Duration) -> Self {
        Self {
            key: key.into(),
            kind,
            hit: false,
            latency_ms: latency.as_secs_f64() * 1000.0,
            timestamp: OffsetDateTime::now_utc(),
            size: None,
            error: None,
        }
    }

    pub fn hit(mut self, hit: bool) -> Self {
        self.hit = hit;
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn failed(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheKeyMetrics {
    pub key: String,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub total_size: u64,
    pub avg_latency_ms: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
}

impl CacheKeyMetrics {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            hits: 0,
            misses: 0,
            sets: 0,
            deletes: 0,
            total_size: 0,
            avg_latency_ms: 0.0,
            last_accessed: OffsetDateTime::now_utc(),
        }
    }

    /// Hits plus sets. Misses and deletes do not make a key popular.
    pub fn popularity(&self) -> u64 {
        self.hits + self.sets
    }

    fn accesses(&self) -> u64 {
        self.hits + self.misses + self.sets + self.deletes
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub avg_response_time_ms: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    LowHitRate,
    HighLatency,
    HighErrorRate,
    HotKeys,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub global: GlobalMetrics,
    pub health_score: f64,
    pub recommendations: Vec<Recommendation>,
    pub top_keys: Vec<CacheKeyMetrics>,
    pub hot_keys: Vec<String>,
    pub recent_errors: Vec<CacheOperation>,
}

#[derive(Debug)]
struct AnalyticsState {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    errors: u64,
    total_requests: u64,
    latencies: VecDeque<f64>,
    history: VecDeque<CacheOperation>,
    /// Recency-ordered so overflow drops the least recently touched keys.
    keys: LruCache<String, CacheKeyMetrics>,
}

impl Default for AnalyticsState {
    fn default() -> Self {
        Self {
            hits: 0,
            misses: 0,
            sets: 0,
            deletes: 0,
            errors: 0,
            total_requests: 0,
            latencies: VecDeque::new(),
            history: VecDeque::new(),
            keys: LruCache::unbounded(),
        }
    }
}

impl AnalyticsState {
    fn global(&self) -> GlobalMetrics {
        let lookups = self.hits + self.misses;
        let hit_rate = ratio(self.hits, lookups);
        let avg_response_time_ms = if self.latencies.is_empty() {
            0.0
        } else {
            self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
        };

        GlobalMetrics {
            hits: self.hits,
            misses: self.misses,
            sets: self.sets,
            deletes: self.deletes,
            errors: self.errors,
            total_requests: self.total_requests,
            hit_rate,
            avg_response_time_ms,
            error_rate: ratio(self.errors, self.total_requests),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Shared analytics sink.
#[derive(Debug, Default)]
pub struct CacheAnalytics {
    config: AnalyticsConfig,
    state: Mutex<AnalyticsState>,
}

impl CacheAnalytics {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AnalyticsState::default()),
        }
    }

    pub fn record(&self, operation: CacheOperation) {
        let op = operation.kind.as_str();
        histogram!(METRIC_STORE_LATENCY, "op" => op).record(operation.latency_ms);
        if operation.error.is_some() {
            counter!(METRIC_STORE_ERROR, "op" => op).increment(1);
        } else if operation.kind == OperationKind::Get {
            if operation.hit {
                counter!(METRIC_STORE_HIT).increment(1);
            } else {
                counter!(METRIC_STORE_MISS).increment(1);
            }
        }

        if operation.latency_ms > self.config.slow_operation.as_secs_f64() * 1000.0 {
            warn!(
                target_module = SOURCE,
                key = %operation.key,
                op,
                latency_ms = operation.latency_ms,
                "Slow cache operation"
            );
        }

        let mut state = mutex_lock(&self.state, SOURCE, "record");
        state.total_requests += 1;
        match (&operation.error, operation.kind) {
            (Some(_), _) => state.errors += 1,
            (None, OperationKind::Get) if operation.hit => state.hits += 1,
            (None, OperationKind::Get) => state.misses += 1,
            (None, OperationKind::Set) => state.sets += 1,
            (None, OperationKind::Delete) => state.deletes += 1,
        }

        state.latencies.push_back(operation.latency_ms);
        while state.latencies.len() > self.config.latency_window {
            state.latencies.pop_front();
        }

        self.update_key(&mut state, &operation);

        state.history.push_back(operation);
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }

        let lookups = state.hits + state.misses;
        if state.total_requests >= self.config.low_hit_rate_min_requests
            && state.total_requests % self.config.low_hit_rate_min_requests == 0
            && lookups > 0
        {
            let hit_rate = ratio(state.hits, lookups);
            if hit_rate < self.config.low_hit_rate {
                warn!(
                    target_module = SOURCE,
                    hit_rate,
                    total_requests = state.total_requests,
                    "Cache hit rate below threshold"
                );
            }
        }
    }

    /// Latency of a call that is neither a lookup nor a write, such as `ping` or `ttl`.
    pub fn record_latency(&self, kind: OperationKind, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        histogram!(METRIC_STORE_LATENCY, "op" => kind.as_str()).record(latency_ms);
        let mut state = mutex_lock(&self.state, SOURCE, "record_latency");
        state.latencies.push_back(latency_ms);
        while state.latencies.len() > self.config.latency_window {
            state.latencies.pop_front();
        }
    }

    fn update_key(&self, state: &mut AnalyticsState, operation: &CacheOperation) {
        if operation.key.is_empty() {
            return;
        }
        let metrics = state
            .keys
            .get_or_insert_mut(operation.key.clone(), || CacheKeyMetrics::new(&operation.key));

        if operation.error.is_none() {
            match operation.kind {
                OperationKind::Get if operation.hit => metrics.hits += 1,
                OperationKind::Get => metrics.misses += 1,
                OperationKind::Set => metrics.sets += 1,
                OperationKind::Delete => metrics.deletes += 1,
            }
        }
        if let Some(size) = operation.size {
            metrics.total_size += size as u64;
        }
        let samples = metrics.accesses().max(1) as f64;
        metrics.avg_latency_ms += (operation.latency_ms - metrics.avg_latency_ms) / samples;
        metrics.last_accessed = operation.timestamp;

        if state.keys.len() > self.config.max_tracked_keys {
            let evict = state.keys.len().div_ceil(10);
            for _ in 0..evict {
                state.keys.pop_lru();
            }
        }
    }

    pub fn global(&self) -> GlobalMetrics {
        mutex_lock(&self.state, SOURCE, "global").global()
    }

    pub fn key_metrics(&self, key: &str) -> Option<CacheKeyMetrics> {
        mutex_lock(&self.state, SOURCE, "key_metrics")
            .keys
            .peek(key)
            .cloned()
    }

    pub fn tracked_keys(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "tracked_keys").keys.len()
    }

    /// Most recent operations, newest last.
    pub fn history(&self, limit: usize) -> Vec<CacheOperation> {
        let state = mutex_lock(&self.state, SOURCE, "history");
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn health_score(&self) -> f64 {
        health_score(&self.global())
    }

    pub fn report(&self, top: usize) -> AnalyticsReport {
        let state = mutex_lock(&self.state, SOURCE, "report");
        let global = state.global();

        let mut ranked: Vec<&CacheKeyMetrics> = state.keys.iter().map(|(_, metrics)| metrics).collect();
        ranked.sort_by(|a, b| {
            b.popularity()
                .cmp(&a.popularity())
                .then_with(|| a.key.cmp(&b.key))
        });

        let traffic: u64 = ranked.iter().map(|metrics| metrics.popularity()).sum();
        let hot_keys: Vec<String> = ranked
            .iter()
            .filter(|metrics| {
                traffic > 0 && ratio(metrics.popularity(), traffic) > self.config.hot_key_share
            })
            .map(|metrics| metrics.key.clone())
            .collect();

        let recent_errors = state
            .history
            .iter()
            .rev()
            .filter(|op| op.error.is_some())
            .take(top)
            .cloned()
            .collect();

        AnalyticsReport {
            health_score: health_score(&global),
            recommendations: recommendations(&global, &hot_keys),
            top_keys: ranked.into_iter().take(top).cloned().collect(),
            hot_keys,
            recent_errors,
            global,
        }
    }

    pub fn reset(&self) {
        *mutex_lock(&self.state, SOURCE, "reset") = AnalyticsState::default();
    }
}

/// Score in `[0, 100]`; an idle cache scores 100.
pub fn health_score(global: &GlobalMetrics) -> f64 {
    if global.total_requests == 0 {
        return 100.0;
    }
    let mut score = 100.0;
    score -= (1.0 - global.hit_rate) * 40.0;
    if global.avg_response_time_ms > 100.0 {
        score -= ((global.avg_response_time_ms - 100.0) / 10.0).min(30.0);
    }
    score -= global.error_rate * 30.0;
    score.clamp(0.0, 100.0)
}

fn recommendations(global: &GlobalMetrics, hot_keys: &[String]) -> Vec<Recommendation> {
    let mut out = Vec::new();
    if global.hits + global.misses > 0 && global.hit_rate < 0.8 {
        out.push(Recommendation {
            kind: RecommendationKind::LowHitRate,
            message: format!(
                "Hit rate is {:.1}%; review TTLs and key strategy for frequently missed keys",
                global.hit_rate * 100.0
            ),
        });
    }
    if global.avg_response_time_ms > 100.0 {
        out.push(Recommendation {
            kind: RecommendationKind::HighLatency,
            message: format!(
                "Average store latency is {:.0}ms; pre-warm hot paths or compress large values",
                global.avg_response_time_ms
            ),
        });
    }
    if global.error_rate > 0.05 {
        out.push(Recommendation {
            kind: RecommendationKind::HighErrorRate,
            message: format!(
                "{:.1}% of store operations fail; check store connectivity",
                global.error_rate * 100.0
            ),
        });
    }
    if !hot_keys.is_empty() {
        out.push(Recommendation {
            kind: RecommendationKind::HotKeys,
            message: format!(
                "Keys {} carry more than 10% of traffic each; consider partitioning them",
                hot_keys.join(", ")
            ),
        });
    }
    out
}

// ============================================================================
// Recording decorator
// ============================================================================

/// Backend decorator that records every call before passing results through.
pub struct RecordingBackend {
    inner: Arc<dyn KvBackend>,
    analytics: Arc<CacheAnalytics>,
}

impl RecordingBackend {
    pub fn new(inner: Arc<dyn KvBackend>, analytics: Arc<CacheAnalytics>) -> Self {
        Self { inner, analytics }
    }

    fn observe<T>(
        &self,
        key: &str,
        kind: OperationKind,
        started: Instant,
        result: &StoreResult<T>,
        hit: impl FnOnce(&T) -> bool,
        size: Option<usize>,
    ) {
        let mut op = CacheOperation::new(key, kind, started.elapsed());
        match result {
            Ok(value) => op = op.hit(hit(value)),
            Err(err) => op = op.failed(err),
        }
        if let Some(size) = size {
            op = op.size(size);
        }
        self.analytics.record(op);
    }

    /// Failures count like any other store error; successes only feed latency.
    fn observe_auxiliary<T>(
        &self,
        key: &str,
        kind: OperationKind,
        started: Instant,
        result: &StoreResult<T>,
    ) {
        match result {
            Ok(_) => self.analytics.record_latency(kind, started.elapsed()),
            Err(err) => self
                .analytics
                .record(CacheOperation::new(key, kind, started.elapsed()).failed(err)),
        }
    }
}

#[async_trait]
impl KvBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let started = Instant::now();
        let result = self.inner.get(key).await;
        let size = result.as_ref().ok().and_then(|v| v.as_ref().map(String::len));
        self.observe(key, OperationKind::Get, started, &result, Option::is_some, size);
        result
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let started = Instant::now();
        let result = self.inner.set(key, value, ttl).await;
        self.observe(key, OperationKind::Set, started, &result, |_| false, Some(value.len()));
        result
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let started = Instant::now();
        let result = self.inner.delete(keys).await;
        for key in keys {
            self.observe(key, OperationKind::Delete, started, &result, |_| false, None);
        }
        result
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let started = Instant::now();
        let result = self.inner.keys(pattern).await;
        self.observe_auxiliary(pattern, OperationKind::Get, started, &result);
        result
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let started = Instant::now();
        let result = self.inner.exists(key).await;
        self.observe_auxiliary(key, OperationKind::Get, started, &result);
        result
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let started = Instant::now();
        let result = self.inner.mget(keys).await;
        match &result {
            Ok(values) => {
                for (key, value) in keys.iter().zip(values) {
                    let mut op = CacheOperation::new(key.as_str(), OperationKind::Get, started.elapsed())
                        .hit(value.is_some());
                    if let Some(value) = value {
                        op = op.size(value.len());
                    }
                    self.analytics.record(op);
                }
            }
            Err(_) => {
                for key in keys {
                    self.observe(key, OperationKind::Get, started, &result, |_| false, None);
                }
            }
        }
        result
    }

    async fn mset(&self, pairs: &[(String, String)], ttl: Duration) -> StoreResult<()> {
        let started = Instant::now();
        let result = self.inner.mset(pairs, ttl).await;
        for (key, value) in pairs {
            self.observe(key, OperationKind::Set, started, &result, |_| false, Some(value.len()));
        }
        result
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let started = Instant::now();
        let result = self.inner.incr(key).await;
        self.observe(key, OperationKind::Set, started, &result, |_| false, None);
        result
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let started = Instant::now();
        let result = self.inner.expire(key, ttl).await;
        self.observe_auxiliary(key, OperationKind::Set, started, &result);
        result
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let started = Instant::now();
        let result = self.inner.ttl(key).await;
        self.observe_auxiliary(key, OperationKind::Get, started, &result);
        result
    }

    async fn flush_all(&self) -> StoreResult<()> {
        let started = Instant::now();
        let result = self.inner.flush_all().await;
        self.observe_auxiliary("", OperationKind::Delete, started, &result);
        result
    }

    async fn ping(&self) -> StoreResult<()> {
        let started = Instant::now();
        let result = self.inner.ping().await;
        self.observe_auxiliary("", OperationKind::Get, started, &result);
        result
    }

    async fn delete_pattern(&self, pattern: &str) -> StoreResult<u64> {
        let keys = self.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.delete(&keys).await
    }
}
