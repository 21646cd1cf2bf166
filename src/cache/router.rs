//! Executes invalidation plans against the store.
//!
//! Every delete is best effort and independent: the store adapter absorbs backend
//! failures, so a failing pattern never prevents the remaining deletes.

use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::domain::{ProfileCache, TimelineCache};
use super::events::InvalidationEvent;
use super::keys::Tab;
use super::planner::{InvalidationPlan, PlanError};
use super::store::StoreAdapter;

const SOURCE: &str = "cache::router";

pub const METRIC_INVALIDATION_KEYS: &str = "feedcache_invalidation_keys_total";

/// What one routing pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReport {
    pub keys_deleted: u64,
    pub patterns: usize,
    pub pattern_keys_deleted: u64,
    pub followers: usize,
    pub follower_keys_deleted: u64,
}

impl InvalidationReport {
    pub fn total_deleted(&self) -> u64 {
        self.keys_deleted + self.pattern_keys_deleted + self.follower_keys_deleted
    }
}

#[derive(Clone)]
pub struct InvalidationRouter {
    store: StoreAdapter,
    profiles: ProfileCache,
    timelines: TimelineCache,
}

impl InvalidationRouter {
    pub fn new(store: StoreAdapter, profiles: ProfileCache, timelines: TimelineCache) -> Self {
        Self {
            store,
            profiles,
            timelines,
        }
    }

    /// Plan and execute one event.
    pub async fn route(&self, event: &InvalidationEvent) -> Result<InvalidationReport, PlanError> {
        let plan = InvalidationPlan::from_event(event)?;
        info!(target_module = SOURCE, event = %event.event, %plan, "Routing invalidation");
        Ok(self.execute(&plan).await)
    }

    /// Merge a batch of events into one plan; malformed events are skipped.
    pub async fn route_many(&self, events: &[InvalidationEvent]) -> InvalidationReport {
        let plan = InvalidationPlan::from_events(events);
        self.execute(&plan).await
    }

    #[instrument(skip_all, fields(keys = plan.keys.len(), patterns = plan.patterns.len()))]
    pub async fn execute(&self, plan: &InvalidationPlan) -> InvalidationReport {
        let keys: Vec<String> = plan.keys.iter().cloned().collect();
        let key_deletes = async {
            if keys.is_empty() {
                0
            } else {
                self.store.delete_many(&keys).await
            }
        };
        let pattern_deletes = join_all(
            plan.patterns
                .iter()
                .map(|pattern| self.store.delete_pattern(pattern)),
        );
        let fanouts = join_all(plan.fanout.iter().map(|author| self.fan_out(author)));

        let (keys_deleted, pattern_counts, fanout_counts) =
            futures::join!(key_deletes, pattern_deletes, fanouts);

        let report = InvalidationReport {
            keys_deleted,
            patterns: plan.patterns.len(),
            pattern_keys_deleted: pattern_counts.iter().sum(),
            followers: fanout_counts.iter().map(|(followers, _)| followers).sum(),
            follower_keys_deleted: fanout_counts.iter().map(|(_, deleted)| deleted).sum(),
        };
        counter!(METRIC_INVALIDATION_KEYS).increment(report.total_deleted());
        report
    }

    /// Clear the "following" timelines of the author's cached followers.
    async fn fan_out(&self, author: &str) -> (usize, u64) {
        let followers = match self.profiles.followers(author).await {
            Ok(Some(followers)) => followers,
            Ok(None) => return (0, 0),
            Err(err) => {
                warn!(target_module = SOURCE, author, error = %err, "Follower list unreadable; skipping fan-out");
                return (0, 0);
            }
        };
        let deleted = self
            .timelines
            .invalidate_tab_for_users(&followers, Tab::Following)
            .await;
        (followers.len(), deleted)
    }
}
