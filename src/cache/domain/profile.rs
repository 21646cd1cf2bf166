//! Profiles, social graph lists and recommendation data.
//!
//! Stats and recommendations carry their own write stamp. They are kept in the store
//! for twice their freshness window but read back as a miss once older than it, so a
//! caller gets "recent enough" data or nothing.

use std::future::Future;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::cache::compression::CompressedStore;
use crate::cache::error::{CacheError, FetchError};
use crate::cache::freshness::{Stamped, SwrCache, SwrResult};
use crate::cache::keys::{FeedKey, ttl};

const SOURCE: &str = "cache::domain::profile";

const PROFILE_TTL: Duration = Duration::from_secs(ttl::USER_PROFILE);
const STATS_WINDOW: Duration = Duration::from_secs(ttl::USER_STATS);
const RECOMMENDATIONS_WINDOW: Duration = Duration::from_secs(ttl::RECOMMENDATIONS);

#[derive(Clone)]
pub struct ProfileCache {
    swr: SwrCache,
}

impl ProfileCache {
    pub fn new(swr: SwrCache) -> Self {
        Self { swr }
    }

    fn store(&self) -> &CompressedStore {
        self.swr.executor().store()
    }

    // ========================================================================
    // Profiles
    // ========================================================================

    pub async fn get_profile<T, F, Fut>(
        &self,
        user_id: &str,
        fetcher: F,
    ) -> Result<SwrResult<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let key = FeedKey::User(user_id.to_string()).to_string();
        self.swr.get(&key, PROFILE_TTL, fetcher).await
    }

    pub async fn set_profile<T: Serialize + Send + Sync>(
        &self,
        user_id: &str,
        profile: T,
    ) -> Result<bool, CacheError> {
        let key = FeedKey::User(user_id.to_string()).to_string();
        self.swr.mutate(&key, profile, PROFILE_TTL).await
    }

    /// Batch read. Profiles past their TTL come back as `None`.
    pub async fn get_profiles<T: DeserializeOwned>(&self, user_ids: &[String]) -> Vec<Option<T>> {
        let keys: Vec<String> = user_ids
            .iter()
            .map(|id| FeedKey::User(id.clone()).to_string())
            .collect();
        self.store()
            .get_many::<Stamped<T>>(&keys)
            .await
            .into_iter()
            .map(|slot| slot.filter(|stamped| stamped.age() < PROFILE_TTL).map(|s| s.value))
            .collect()
    }

    /// Batch write of `(user_id, profile)` pairs.
    pub async fn prime_profiles<T: Serialize>(&self, profiles: Vec<(String, T)>) -> Result<bool, CacheError> {
        let count = profiles.len();
        let pairs: Vec<(String, Stamped<T>)> = profiles
            .into_iter()
            .map(|(id, profile)| (FeedKey::User(id).to_string(), Stamped::now(profile)))
            .collect();
        let stored = self
            .store()
            .set_many(&pairs, self.swr.envelope_ttl(PROFILE_TTL))
            .await?;
        debug!(target_module = SOURCE, count, stored, "Primed profiles");
        Ok(stored)
    }

    // ========================================================================
    // Stats and recommendations
    // ========================================================================

    pub async fn get_stats<T: DeserializeOwned>(&self, user_id: &str) -> Result<Option<T>, CacheError> {
        self.get_windowed(&FeedKey::UserStats(user_id.to_string()), STATS_WINDOW)
            .await
    }

    pub async fn set_stats<T: Serialize>(&self, user_id: &str, stats: T) -> Result<bool, CacheError> {
        self.set_windowed(&FeedKey::UserStats(user_id.to_string()), stats, STATS_WINDOW)
            .await
    }

    pub async fn get_recommendations<T: DeserializeOwned>(
        &self,
        user_id: &str,
    ) -> Result<Option<T>, CacheError> {
        self.get_windowed(
            &FeedKey::Recommendations(user_id.to_string()),
            RECOMMENDATIONS_WINDOW,
        )
        .await
    }

    pub async fn set_recommendations<T: Serialize>(
        &self,
        user_id: &str,
        recommendations: T,
    ) -> Result<bool, CacheError> {
        self.set_windowed(
            &FeedKey::Recommendations(user_id.to_string()),
            recommendations,
            RECOMMENDATIONS_WINDOW,
        )
        .await
    }

    async fn get_windowed<T: DeserializeOwned>(
        &self,
        key: &FeedKey,
        window: Duration,
    ) -> Result<Option<T>, CacheError> {
        let key = key.to_string();
        let Some(stamped) = self.store().get::<Stamped<T>>(&key).await? else {
            return Ok(None);
        };
        if stamped.age() >= window {
            debug!(target_module = SOURCE, key = %key, "Entry older than its freshness window");
            return Ok(None);
        }
        Ok(Some(stamped.value))
    }

    async fn set_windowed<T: Serialize>(
        &self,
        key: &FeedKey,
        value: T,
        window: Duration,
    ) -> Result<bool, CacheError> {
        self.store()
            .set(&key.to_string(), &Stamped::now(value), window * 2)
            .await
    }

    // ========================================================================
    // Social graph
    // ========================================================================

    /// Cached follower ids. `None` when nothing is cached.
    pub async fn followers(&self, user_id: &str) -> Result<Option<Vec<String>>, CacheError> {
        self.store()
            .get(&FeedKey::Followers(user_id.to_string()).to_string())
            .await
    }

    pub async fn set_followers(&self, user_id: &str, followers: &[String]) -> Result<bool, CacheError> {
        let key = FeedKey::Followers(user_id.to_string());
        self.store().set(&key.to_string(), followers, key.ttl()).await
    }

    pub async fn following(&self, user_id: &str) -> Result<Option<Vec<String>>, CacheError> {
        self.store()
            .get(&FeedKey::Following(user_id.to_string()).to_string())
            .await
    }

    pub async fn set_following(&self, user_id: &str, following: &[String]) -> Result<bool, CacheError> {
        let key = FeedKey::Following(user_id.to_string());
        self.store().set(&key.to_string(), following, key.ttl()).await
    }

    pub async fn who_to_follow<T: DeserializeOwned>(&self, user_id: &str) -> Result<Option<T>, CacheError> {
        self.store()
            .get(&FeedKey::WhoToFollow(user_id.to_string()).to_string())
            .await
    }

    pub async fn set_who_to_follow<T: Serialize>(&self, user_id: &str, value: &T) -> Result<bool, CacheError> {
        let key = FeedKey::WhoToFollow(user_id.to_string());
        self.store().set(&key.to_string(), value, key.ttl()).await
    }

    pub async fn preferences<T: DeserializeOwned>(&self, user_id: &str) -> Result<Option<T>, CacheError> {
        self.store()
            .get(&FeedKey::UserPreferences(user_id.to_string()).to_string())
            .await
    }

    pub async fn set_preferences<T: Serialize>(&self, user_id: &str, value: &T) -> Result<bool, CacheError> {
        let key = FeedKey::UserPreferences(user_id.to_string());
        self.store().set(&key.to_string(), value, key.ttl()).await
    }

    /// Drop the profile and everything derived from it.
    pub async fn invalidate_profile(&self, user_id: &str) -> u64 {
        let id = user_id.to_string();
        let keys: Vec<String> = [
            FeedKey::User(id.clone()),
            FeedKey::UserStats(id.clone()),
            FeedKey::Recommendations(id.clone()),
            FeedKey::WhoToFollow(id),
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        self.store().store().delete_many(&keys).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::Deserialize;

    use super::*;
    use crate::cache::compression::CompressionConfig;
    use crate::cache::freshness::FreshnessConfig;
    use crate::cache::resilience::{ResilienceConfig, ResilientExecutor};
    use crate::cache::store::{MemoryBackend, StoreAdapter};
    use crate::cache::unix_millis;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Stats {
        posts: u32,
        followers: u32,
    }

    fn profiles() -> ProfileCache {
        let adapter = StoreAdapter::new(Arc::new(MemoryBackend::new()), Duration::from_secs(60));
        let store = Arc::new(CompressedStore::new(adapter, CompressionConfig::default()));
        let executor = Arc::new(ResilientExecutor::new(store, ResilienceConfig::default()));
        ProfileCache::new(SwrCache::new(executor, FreshnessConfig::default()))
    }

    #[tokio::test]
    async fn stats_older_than_window_read_as_miss() {
        let cache = profiles();
        let stats = Stats { posts: 3, followers: 10 };
        cache.set_stats("u1", stats.clone()).await.unwrap();
        assert_eq!(cache.get_stats::<Stats>("u1").await.unwrap(), Some(stats.clone()));

        // Written 16 minutes ago: still physically present, but past the 15 minute window.
        let old = Stamped {
            value: stats,
            written_at_ms: unix_millis() - 16 * 60 * 1000,
        };
        cache
            .store()
            .set("user_stats:u1", &old, Duration::from_secs(1800))
            .await
            .unwrap();
        assert!(cache.store().store().exists("user_stats:u1").await);
        assert_eq!(cache.get_stats::<Stats>("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn recommendations_use_their_own_window() {
        let cache = profiles();
        let old = Stamped {
            value: vec!["u9".to_string()],
            written_at_ms: unix_millis() - 16 * 60 * 1000,
        };
        cache
            .store()
            .set("recommendations:u1", &old, Duration::from_secs(2400))
            .await
            .unwrap();
        // 16 minutes is inside the 20 minute recommendations window.
        assert_eq!(
            cache.get_recommendations::<Vec<String>>("u1").await.unwrap(),
            Some(vec!["u9".to_string()])
        );
    }

    #[tokio::test]
    async fn batch_priming_and_reads() {
        let cache = profiles();
        cache
            .prime_profiles(vec![("a".to_string(), 1_u32), ("b".to_string(), 2_u32)])
            .await
            .unwrap();
        let ids = ["a".to_string(), "missing".to_string(), "b".to_string()];
        assert_eq!(cache.get_profiles::<u32>(&ids).await, vec![Some(1), None, Some(2)]);

        let hit = cache
            .get_profile("a", || async { Ok::<u32, FetchError>(100) })
            .await
            .unwrap();
        assert_eq!(hit.value, 1);
    }

    #[tokio::test]
    async fn invalidate_profile_clears_derived_entries() {
        let cache = profiles();
        cache.set_profile("u1", "alice").await.unwrap();
        cache.set_stats("u1", Stats { posts: 1, followers: 1 }).await.unwrap();
        cache.set_recommendations("u1", vec!["u2"]).await.unwrap();
        cache.set_followers("u1", &["u2".to_string()]).await.unwrap();

        assert_eq!(cache.invalidate_profile("u1").await, 3);
        assert!(cache.get_stats::<Stats>("u1").await.unwrap().is_none());
        // Graph lists are not derived from the profile.
        assert_eq!(cache.followers("u1").await.unwrap(), Some(vec!["u2".to_string()]));
    }
}
