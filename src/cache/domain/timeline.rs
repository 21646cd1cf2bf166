//! Timeline pages keyed by `(user, tab, page)`.

use std::future::Future;

use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::cache::error::{CacheError, FetchError};
use crate::cache::freshness::{SwrCache, SwrResult};
use crate::cache::keys::{FeedKey, KeyPattern, Tab};
use crate::cache::store::StoreAdapter;

const SOURCE: &str = "cache::domain::timeline";

#[derive(Clone)]
pub struct TimelineCache {
    swr: SwrCache,
}

impl TimelineCache {
    pub fn new(swr: SwrCache) -> Self {
        Self { swr }
    }

    fn store(&self) -> &StoreAdapter {
        self.swr.executor().store().store()
    }

    /// Read one page, refreshing through `fetcher` per the tab's TTL.
    pub async fn get_timeline<T, F, Fut>(
        &self,
        user_id: &str,
        tab: Tab,
        page: u32,
        fetcher: F,
    ) -> Result<SwrResult<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let key = FeedKey::timeline(user_id, tab, page).to_string();
        self.swr.get(&key, tab.ttl(), fetcher).await
    }

    pub async fn set_timeline<T: Serialize + Send + Sync>(
        &self,
        user_id: &str,
        tab: Tab,
        page: u32,
        value: T,
    ) -> Result<bool, CacheError> {
        let key = FeedKey::timeline(user_id, tab, page).to_string();
        self.swr.mutate(&key, value, tab.ttl()).await
    }

    /// Whatever is cached for the page, regardless of age.
    pub async fn cached_timeline<T: DeserializeOwned>(
        &self,
        user_id: &str,
        tab: Tab,
        page: u32,
    ) -> Result<Option<T>, CacheError> {
        let key = FeedKey::timeline(user_id, tab, page).to_string();
        Ok(self.swr.peek::<T>(&key).await?.map(|stamped| stamped.value))
    }

    /// Drop every page of every tab for one user.
    pub async fn invalidate_user(&self, user_id: &str) -> u64 {
        let pattern = KeyPattern::UserTimelines(user_id.to_string());
        let deleted = self.store().delete_pattern(&pattern.to_string()).await;
        debug!(target_module = SOURCE, user_id, deleted, "Invalidated user timelines");
        deleted
    }

    /// Drop one tab for each of `user_ids`.
    pub async fn invalidate_tab_for_users(&self, user_ids: &[String], tab: Tab) -> u64 {
        let mut deleted = 0;
        for user_id in user_ids {
            let pattern = KeyPattern::UserTabTimelines {
                user_id: user_id.clone(),
                tab,
            };
            deleted += self.store().delete_pattern(&pattern.to_string()).await;
        }
        deleted
    }

    /// Drop one tab across all users.
    pub async fn invalidate_tab(&self, tab: Tab) -> u64 {
        self.store()
            .delete_pattern(&KeyPattern::TabTimelines(tab).to_string())
            .await
    }
}
