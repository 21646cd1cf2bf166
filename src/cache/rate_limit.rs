//! Fixed-window rate limiting on the shared store.
//!
//! The counter lives in the store so every process sharing it enforces one budget.
//! `INCR` creates the key; the first increment of a window sets its expiry. A counter
//! found without an expiry (the process died between the two calls) gets one too, so a
//! window can never become permanent.

use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tracing::debug;

use super::error::CacheError;
use super::keys::FeedKey;
use super::store::StoreAdapter;

const SOURCE: &str = "cache::rate_limit";

pub const METRIC_RATE_LIMIT_REJECTED: &str = "feedcache_rate_limit_rejected_total";

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window closes.
    pub reset_after: Duration,
}

impl RateLimitDecision {
    /// Whole seconds until reset, never zero.
    pub fn reset_after_secs(&self) -> u64 {
        u64::try_from(self.reset_after.as_millis().div_ceil(1000))
            .unwrap_or(u64::MAX)
            .max(1)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: StoreAdapter,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: StoreAdapter, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request for `identity`. Allows everything when the store is down.
    pub async fn check(&self, identity: &str) -> RateLimitDecision {
        let key = FeedKey::RateLimit(identity.to_string()).to_string();
        let limit = self.config.max_requests;
        let window = self.config.window;

        let Some(count) = self.store.increment(&key).await else {
            debug!(target_module = SOURCE, identity, "Store unavailable; failing open");
            return RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit,
                reset_after: window,
            };
        };

        let reset_after = if count == 1 {
            self.store.expire(&key, window).await;
            window
        } else {
            match self.store.ttl(&key).await {
                Some(remaining) => remaining,
                None => {
                    self.store.expire(&key, window).await;
                    window
                }
            }
        };

        let used = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
        let allowed = used <= limit;
        if !allowed {
            counter!(METRIC_RATE_LIMIT_REJECTED).increment(1);
            debug!(target_module = SOURCE, identity, count, limit, "Rate limit exceeded");
        }
        RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(used),
            reset_after,
        }
    }

    /// Like [`check`](Self::check), but a rejection is an error.
    pub async fn enforce(&self, identity: &str) -> Result<RateLimitDecision, CacheError> {
        let decision = self.check(identity).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(CacheError::RateLimitExceeded {
                identity: identity.to_string(),
                retry_after_secs: decision.reset_after_secs(),
            })
        }
    }
}
