//! Process-wide wiring of the cache layers.

use std::sync::Arc;

use super::analytics::{CacheAnalytics, RecordingBackend};
use super::compression::CompressedStore;
use super::config::CacheConfig;
use super::domain::{ProfileCache, TimelineCache};
use super::freshness::SwrCache;
use super::middleware::{RateLimitState, ReadThroughState, WriteInvalidationState};
use super::prewarm::{PrewarmScheduler, PrewarmSource};
use super::rate_limit::RateLimiter;
use super::resilience::ResilientExecutor;
use super::router::InvalidationRouter;
use super::store::{KvBackend, StoreAdapter};

/// Every cache layer built over one backend.
///
/// Cloning is cheap; all layers share state through `Arc`s.
#[derive(Clone)]
pub struct CacheServices {
    pub analytics: Arc<CacheAnalytics>,
    pub store: StoreAdapter,
    pub compressed: Arc<CompressedStore>,
    pub executor: Arc<ResilientExecutor>,
    pub swr: SwrCache,
    pub timelines: TimelineCache,
    pub profiles: ProfileCache,
    pub router: InvalidationRouter,
    pub rate_limiter: RateLimiter,
    config: CacheConfig,
}

impl CacheServices {
    /// Build the stack. Every backend call is recorded in `analytics`.
    pub fn new(backend: Arc<dyn KvBackend>, config: &CacheConfig) -> Self {
        let analytics = Arc::new(CacheAnalytics::new(config.analytics.clone()));
        let recorded: Arc<dyn KvBackend> =
            Arc::new(RecordingBackend::new(backend, Arc::clone(&analytics)));
        let store = StoreAdapter::new(recorded, config.default_ttl);

        let compressed = Arc::new(CompressedStore::new(
            store.clone(),
            config.compression.clone(),
        ));
        let executor = Arc::new(ResilientExecutor::new(
            Arc::clone(&compressed),
            config.resilience.clone(),
        ));
        let swr = SwrCache::new(Arc::clone(&executor), config.freshness.clone());
        let timelines = TimelineCache::new(swr.clone());
        let profiles = ProfileCache::new(swr.clone());
        let router = InvalidationRouter::new(store.clone(), profiles.clone(), timelines.clone());
        let rate_limiter = RateLimiter::new(store.clone(), config.rate_limit.clone());

        Self {
            analytics,
            store,
            compressed,
            executor,
            swr,
            timelines,
            profiles,
            router,
            rate_limiter,
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Start a pre-warm scheduler fed by `source`.
    pub fn prewarm(&self, source: Arc<dyn PrewarmSource>) -> PrewarmScheduler {
        PrewarmScheduler::new(
            source,
            self.profiles.clone(),
            self.timelines.clone(),
            Arc::clone(&self.compressed),
            self.config.prewarm.clone(),
        )
    }

    pub fn read_through_state(&self) -> ReadThroughState {
        ReadThroughState {
            store: Arc::clone(&self.compressed),
            ttl: self.config.response_ttl,
        }
    }

    pub fn write_invalidation_state(&self) -> WriteInvalidationState {
        WriteInvalidationState {
            store: self.store.clone(),
            patterns: self.config.write_patterns.clone().into(),
        }
    }

    pub fn rate_limit_state(&self) -> RateLimitState {
        RateLimitState {
            limiter: self.rate_limiter.clone(),
        }
    }
}
