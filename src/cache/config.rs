//! Cache configuration.
//!
//! One value per layer, resolved from deployment settings.

use std::time::Duration;

use super::analytics::AnalyticsConfig;
use super::compression::CompressionConfig;
use super::freshness::FreshnessConfig;
use super::prewarm::PrewarmConfig;
use super::rate_limit::RateLimitConfig;
use super::resilience::ResilienceConfig;

const DEFAULT_STORE_TTL_SECS: u64 = 300;
const DEFAULT_RESPONSE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when a write names none.
    pub default_ttl: Duration,
    pub compression: CompressionConfig,
    pub resilience: ResilienceConfig,
    pub freshness: FreshnessConfig,
    pub analytics: AnalyticsConfig,
    pub prewarm: PrewarmConfig,
    pub rate_limit: RateLimitConfig,
    /// Lifetime of cached HTTP responses.
    pub response_ttl: Duration,
    /// Patterns cleared after a successful write request.
    pub write_patterns: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_STORE_TTL_SECS),
            compression: CompressionConfig::default(),
            resilience: ResilienceConfig::default(),
            freshness: FreshnessConfig::default(),
            analytics: AnalyticsConfig::default(),
            prewarm: PrewarmConfig::default(),
            rate_limit: RateLimitConfig::default(),
            response_ttl: Duration::from_secs(DEFAULT_RESPONSE_TTL_SECS),
            write_patterns: vec!["http:*".to_string()],
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        let defaults = Self::default();
        Self {
            default_ttl: settings.store.default_ttl,
            compression: CompressionConfig {
                enabled: settings.compression.enabled,
                algorithm: settings.compression.algorithm,
                level: settings.compression.level,
                min_size: settings.compression.min_size_bytes,
                ..defaults.compression
            },
            resilience: ResilienceConfig {
                max_retries: settings.resilience.max_retries,
                base_delay: settings.resilience.base_delay,
                failure_threshold: settings.resilience.failure_threshold.get(),
                open_timeout: settings.resilience.breaker_timeout,
            },
            freshness: FreshnessConfig {
                max_stale: settings.freshness.max_stale,
            },
            analytics: AnalyticsConfig {
                history_limit: settings.analytics.history_limit.get() as usize,
                latency_window: settings.analytics.latency_window.get() as usize,
                max_tracked_keys: settings.analytics.max_tracked_keys.get() as usize,
                ..defaults.analytics
            },
            prewarm: PrewarmConfig {
                max_concurrency: settings.prewarm.max_concurrency.get() as usize,
                dequeue_delay: settings.prewarm.dequeue_delay,
                retention: settings.prewarm.retention,
            },
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(u64::from(settings.rate_limit.window_seconds.get())),
                max_requests: settings.rate_limit.max_requests.get(),
            },
            response_ttl: settings.response_cache.ttl,
            write_patterns: settings.response_cache.invalidate_patterns.clone(),
        }
    }
}
