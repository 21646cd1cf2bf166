//! Invalidation plan generation.
//!
//! Maps mutation events onto the exact keys, glob patterns and follower fan-outs to
//! clear. Planning is pure; [`InvalidationRouter`](super::router::InvalidationRouter)
//! executes the result against the store.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;
use tracing::warn;

use super::events::{EventKind, InvalidationEvent};
use super::keys::{FeedKey, KeyPattern, Tab};

const SOURCE: &str = "cache::planner";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("`{event}` event requires `{field}`")]
    MissingField {
        event: EventKind,
        field: &'static str,
    },
}

/// Deletes to perform for one or more events.
///
/// Sets are ordered so merged plans and their logs are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    /// Exact keys to delete.
    pub keys: BTreeSet<String>,
    /// Glob patterns to delete.
    pub patterns: BTreeSet<String>,
    /// Authors whose cached followers lose their "following" timelines.
    pub fanout: BTreeSet<String>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ keys: {}, patterns: {}, fanout: {} }}",
            self.keys.len(),
            self.patterns.len(),
            self.fanout.len(),
        )
    }
}

impl InvalidationPlan {
    pub fn from_event(event: &InvalidationEvent) -> Result<Self, PlanError> {
        let mut plan = Self::default();
        let kind = event.event;
        let require = |value: &Option<String>, field: &'static str| {
            value
                .clone()
                .ok_or(PlanError::MissingField { event: kind, field })
        };

        match kind {
            EventKind::UserUpdated | EventKind::ProfileUpdated => {
                let user = require(&event.user_id, "userId")?;
                plan.key(FeedKey::User(user.clone()));
                plan.key(FeedKey::UserStats(user.clone()));
                plan.key(FeedKey::Recommendations(user.clone()));
                plan.key(FeedKey::WhoToFollow(user.clone()));
                plan.pattern(KeyPattern::UserTimelines(user.clone()));
                plan.pattern(KeyPattern::UserPosts(user));
            }
            EventKind::PostCreated => {
                let author = require(&event.user_id, "userId")?;
                plan.key(FeedKey::PostCount(author.clone()));
                plan.pattern(KeyPattern::UserTimelines(author.clone()));
                plan.pattern(KeyPattern::TabTimelines(Tab::Explore));
                plan.pattern(KeyPattern::Trending);
                plan.fanout.insert(author);
            }
            EventKind::PostUpdated | EventKind::PostDeleted => {
                let post = require(&event.post_id, "postId")?;
                plan.key(FeedKey::Post(post.clone()));
                plan.key(FeedKey::PostDetails(post.clone()));
                plan.pattern(KeyPattern::PostComments(post));
                plan.pattern(KeyPattern::TabTimelines(Tab::Explore));
                if let Some(author) = &event.user_id {
                    plan.pattern(KeyPattern::UserTimelines(author.clone()));
                    plan.fanout.insert(author.clone());
                }
            }
            EventKind::PostLiked => {
                let post = require(&event.post_id, "postId")?;
                plan.key(FeedKey::Post(post.clone()));
                plan.key(FeedKey::PostDetails(post.clone()));
                plan.key(FeedKey::PostLikes(post));
                if let Some(liker) = &event.user_id {
                    plan.pattern(KeyPattern::LikedPosts(liker.clone()));
                }
            }
            EventKind::UserFollowed | EventKind::UserUnfollowed => {
                let follower = require(&event.user_id, "userId")?;
                let target = require(&event.target_user_id, "targetUserId")?;
                for user in [follower, target] {
                    plan.key(FeedKey::Following(user.clone()));
                    plan.key(FeedKey::Followers(user.clone()));
                    plan.key(FeedKey::Recommendations(user.clone()));
                    plan.key(FeedKey::WhoToFollow(user.clone()));
                    plan.pattern(KeyPattern::UserTimelines(user));
                }
            }
            EventKind::SubscriptionChanged => {
                let user = require(&event.user_id, "userId")?;
                plan.key(FeedKey::User(user.clone()));
                plan.key(FeedKey::UserStats(user.clone()));
                plan.key(FeedKey::Subscription(user.clone()));
                plan.pattern(KeyPattern::UserTimelines(user.clone()));
                plan.pattern(KeyPattern::PremiumContent(user));
            }
        }

        Ok(plan)
    }

    /// Merge several events into one plan. Malformed events are logged and skipped.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a InvalidationEvent>) -> Self {
        let mut plan = Self::default();
        for event in events {
            match Self::from_event(event) {
                Ok(next) => plan.merge(next),
                Err(err) => {
                    warn!(target_module = SOURCE, error = %err, "Skipping malformed invalidation event");
                }
            }
        }
        plan
    }

    pub fn merge(&mut self, other: Self) {
        self.keys.extend(other.keys);
        self.patterns.extend(other.patterns);
        self.fanout.extend(other.fanout);
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.patterns.is_empty() && self.fanout.is_empty()
    }

    fn key(&mut self, key: FeedKey) {
        self.keys.insert(key.to_string());
    }

    fn pattern(&mut self, pattern: KeyPattern) {
        self.patterns.insert(pattern.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn profile_update() {
        let plan =
            InvalidationPlan::from_event(&InvalidationEvent::user(EventKind::ProfileUpdated, "u1"))
                .unwrap();
        assert_eq!(
            plan.keys,
            set(&["recommendations:u1", "user:u1", "user_stats:u1", "who_to_follow:u1"])
        );
        assert_eq!(plan.patterns, set(&["timeline:u1:*", "user_posts:u1:*"]));
        assert!(plan.fanout.is_empty());
    }

    #[test]
    fn post_created_fans_out_to_followers() {
        let plan = InvalidationPlan::from_event(&InvalidationEvent::user(EventKind::PostCreated, "u1"))
            .unwrap();
        assert_eq!(plan.keys, set(&["post_count:u1"]));
        assert_eq!(
            plan.patterns,
            set(&["timeline:*:explore:*", "timeline:u1:*", "trending:*"])
        );
        assert_eq!(plan.fanout, set(&["u1"]));
    }

    #[test]
    fn post_deleted_without_author_skips_fanout() {
        let plan = InvalidationPlan::from_event(
            &InvalidationEvent::new(EventKind::PostDeleted).with_post("p1"),
        )
        .unwrap();
        assert_eq!(plan.keys, set(&["post:p1", "post_details:p1"]));
        assert_eq!(plan.patterns, set(&["post_comments:p1:*", "timeline:*:explore:*"]));
        assert!(plan.fanout.is_empty());

        let with_author =
            InvalidationPlan::from_event(&InvalidationEvent::post(EventKind::PostUpdated, "u1", "p1"))
                .unwrap();
        assert!(with_author.patterns.contains("timeline:u1:*"));
        assert_eq!(with_author.fanout, set(&["u1"]));
    }

    #[test]
    fn post_liked_leaves_timelines_alone() {
        let plan =
            InvalidationPlan::from_event(&InvalidationEvent::post(EventKind::PostLiked, "u1", "p1"))
                .unwrap();
        assert_eq!(plan.keys, set(&["post:p1", "post_details:p1", "post_likes:p1"]));
        assert_eq!(plan.patterns, set(&["liked_posts:u1:*"]));
    }

    #[test]
    fn follow_touches_both_users() {
        let plan = InvalidationPlan::from_event(&InvalidationEvent::follow(
            EventKind::UserFollowed,
            "a",
            "b",
        ))
        .unwrap();
        for user in ["a", "b"] {
            for prefix in ["following", "followers", "recommendations", "who_to_follow"] {
                assert!(plan.keys.contains(&format!("{prefix}:{user}")));
            }
            assert!(plan.patterns.contains(&format!("timeline:{user}:*")));
        }
        assert_eq!(plan.keys.len(), 8);
    }

    #[test]
    fn subscription_change() {
        let plan = InvalidationPlan::from_event(&InvalidationEvent::user(
            EventKind::SubscriptionChanged,
            "u1",
        ))
        .unwrap();
        assert_eq!(plan.keys, set(&["subscription:u1", "user:u1", "user_stats:u1"]));
        assert_eq!(plan.patterns, set(&["premium_content:u1:*", "timeline:u1:*"]));
    }

    #[test]
    fn missing_ids_are_reported() {
        let err = InvalidationPlan::from_event(&InvalidationEvent::user(EventKind::UserFollowed, "a"))
            .unwrap_err();
        assert_eq!(
            err,
            PlanError::MissingField {
                event: EventKind::UserFollowed,
                field: "targetUserId"
            }
        );
        assert!(InvalidationPlan::from_event(&InvalidationEvent::new(EventKind::PostLiked)).is_err());
    }

    #[test]
    fn merged_plans_deduplicate() {
        let events = [
            InvalidationEvent::user(EventKind::PostCreated, "u1"),
            InvalidationEvent::user(EventKind::PostCreated, "u1"),
            InvalidationEvent::new(EventKind::UserUpdated),
            InvalidationEvent::user(EventKind::PostCreated, "u2"),
        ];
        let plan = InvalidationPlan::from_events(&events);
        assert_eq!(plan.fanout, set(&["u1", "u2"]));
        assert_eq!(plan.keys, set(&["post_count:u1", "post_count:u2"]));
        assert_eq!(plan.to_string(), "InvalidationPlan { keys: 2, patterns: 4, fanout: 2 }");
        assert!(InvalidationPlan::default().is_empty());
    }
}
