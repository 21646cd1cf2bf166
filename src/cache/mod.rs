//! Layered feed cache.
//!
//! Bottom to top:
//!
//! - **store**: best-effort key-value access over Redis or memory
//! - **analytics**: per-operation recording and health reporting
//! - **compression**: envelope codec shrinking large values
//! - **resilience**: cache-first fetches behind per-key circuit breakers
//! - **freshness**: stale-while-revalidate on top of the executor
//! - **domain**: timeline and profile caches with their TTL policy
//! - **router** / **prewarm**: event-driven invalidation and background warming
//! - **middleware** / **rate_limit**: HTTP read-through, invalidate-on-write, throttling
//!
//! [`CacheServices`] wires the layers together for one process.

mod analytics;
mod compression;
mod config;
pub mod domain;
mod error;
mod events;
mod freshness;
pub mod keys;
mod lock;
mod middleware;
mod planner;
mod prewarm;
mod rate_limit;
mod resilience;
mod router;
mod services;
pub mod store;

use time::OffsetDateTime;

pub use analytics::{
    AnalyticsConfig, AnalyticsReport, CacheAnalytics, CacheKeyMetrics, CacheOperation,
    GlobalMetrics, METRIC_STORE_ERROR, METRIC_STORE_HIT, METRIC_STORE_LATENCY, METRIC_STORE_MISS,
    OperationKind, Recommendation, RecommendationKind, RecordingBackend, health_score,
};
pub use compression::{
    CacheEntry, CompressedStore, CompressionAlgorithm, CompressionConfig, CompressionMetrics,
    CompressionStats, Compressor, METRIC_COMPRESSION_RATIO, compressor_for,
};
pub use config::CacheConfig;
pub use error::{CacheError, FetchError};
pub use events::{EventKind, InvalidationEvent};
pub use freshness::{
    Freshness, FreshnessConfig, METRIC_SWR_REFRESH, Stamped, SwrCache, SwrResult, SwrStats,
};
pub use keys::{FeedKey, KeyPattern, Tab};
pub use middleware::{
    ReadThroughState, RateLimitState, WriteInvalidationState, invalidate_on_write_layer,
    rate_limit_layer, read_through_layer,
};
pub use planner::{InvalidationPlan, PlanError};
pub use prewarm::{
    JobStatus, METRIC_PREWARM_JOBS, METRIC_PREWARM_QUEUE_LEN, PrewarmConfig, PrewarmError,
    PrewarmJob, PrewarmScheduler, PrewarmSource, PrewarmStats,
};
pub use rate_limit::{
    METRIC_RATE_LIMIT_REJECTED, RateLimitConfig, RateLimitDecision, RateLimiter,
};
pub use resilience::{
    BreakerSnapshot, BreakerState, CircuitBreaker, FetchSource, Fetched, METRIC_BREAKER_OPEN,
    ResilienceConfig, ResilientExecutor,
};
pub use router::{InvalidationReport, InvalidationRouter, METRIC_INVALIDATION_KEYS};
pub use services::CacheServices;
pub use store::{KvBackend, MemoryBackend, RedisBackend, StoreAdapter, StoreError};

/// Wall-clock milliseconds since the unix epoch.
pub(crate) fn unix_millis() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}
