//! Cache key scheme and TTL policy.
//!
//! Key strings are a compatibility surface shared with other services reading the
//! same store, so the rendered form of every [`FeedKey`] must stay stable.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// TTL table, in seconds.
pub mod ttl {
    pub const TIMELINE: u64 = 300;
    pub const POST_COMMENTS: u64 = 180;
    pub const TRENDING: u64 = 300;
    pub const USER_PROFILE: u64 = 1800;
    pub const USER_STATS: u64 = 900;
    pub const RECOMMENDATIONS: u64 = 1200;
    pub const WHO_TO_FOLLOW: u64 = 1800;
    pub const FOLLOWERS: u64 = 3600;
    pub const TRENDING_TOPICS: u64 = 7200;
    pub const UPCOMING_EVENTS: u64 = 14400;
    pub const FEED_ALGORITHM: u64 = 43200;
    pub const SESSION: u64 = 3600;
}

/// Timeline tab. Personalisation volatility differs per tab, so each carries its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tab {
    ForYou,
    Following,
    Explore,
}

impl Tab {
    pub const ALL: [Tab; 3] = [Tab::ForYou, Tab::Following, Tab::Explore];

    pub fn as_str(self) -> &'static str {
        match self {
            Tab::ForYou => "for-you",
            Tab::Following => "following",
            Tab::Explore => "explore",
        }
    }

    pub fn ttl(self) -> Duration {
        let secs = match self {
            Tab::ForYou => ttl::TIMELINE,
            Tab::Following => 600,
            Tab::Explore => 900,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for Tab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tab {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "for-you" => Ok(Tab::ForYou),
            "following" => Ok(Tab::Following),
            "explore" => Ok(Tab::Explore),
            other => Err(format!("unknown timeline tab `{other}`")),
        }
    }
}

/// A single cache entry address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedKey {
    // Feeds
    Timeline {
        user_id: String,
        tab: Tab,
        page: u32,
    },
    Trending(String),
    TrendingTopics,
    UpcomingEvents,
    FeedAlgorithm(String),

    // Users
    User(String),
    UserStats(String),
    Recommendations(String),
    Followers(String),
    Following(String),
    WhoToFollow(String),
    UserPreferences(String),
    PostCount(String),
    Subscription(String),
    Session(String),

    // Posts
    Post(String),
    PostDetails(String),
    PostComments { post_id: String, page: u32 },
    PostLikes(String),

    RateLimit(String),
}

impl FeedKey {
    pub fn timeline(user_id: impl Into<String>, tab: Tab, page: u32) -> Self {
        Self::Timeline {
            user_id: user_id.into(),
            tab,
            page,
        }
    }

    /// Default store TTL for this entry class.
    pub fn ttl(&self) -> Duration {
        let secs = match self {
            FeedKey::Timeline { tab, .. } => return tab.ttl(),
            FeedKey::Trending(_) => ttl::TRENDING,
            FeedKey::TrendingTopics => ttl::TRENDING_TOPICS,
            FeedKey::UpcomingEvents => ttl::UPCOMING_EVENTS,
            FeedKey::FeedAlgorithm(_) => ttl::FEED_ALGORITHM,
            FeedKey::User(_) | FeedKey::UserPreferences(_) | FeedKey::Subscription(_) => {
                ttl::USER_PROFILE
            }
            FeedKey::UserStats(_) | FeedKey::PostCount(_) => ttl::USER_STATS,
            FeedKey::Recommendations(_) => ttl::RECOMMENDATIONS,
            FeedKey::WhoToFollow(_) => ttl::WHO_TO_FOLLOW,
            FeedKey::Followers(_) | FeedKey::Following(_) => ttl::FOLLOWERS,
            FeedKey::Session(_) | FeedKey::RateLimit(_) => ttl::SESSION,
            FeedKey::Post(_) | FeedKey::PostDetails(_) | FeedKey::PostLikes(_) => ttl::TIMELINE,
            FeedKey::PostComments { .. } => ttl::POST_COMMENTS,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedKey::Timeline { user_id, tab, page } => write!(f, "timeline:{user_id}:{tab}:{page}"),
            FeedKey::Trending(scope) => write!(f, "trending:{scope}"),
            FeedKey::TrendingTopics => f.write_str("trending_topics"),
            FeedKey::UpcomingEvents => f.write_str("upcoming_events"),
            FeedKey::FeedAlgorithm(user_id) => write!(f, "feed_algorithm:{user_id}"),
            FeedKey::User(id) => write!(f, "user:{id}"),
            FeedKey::UserStats(id) => write!(f, "user_stats:{id}"),
            FeedKey::Recommendations(id) => write!(f, "recommendations:{id}"),
            FeedKey::Followers(id) => write!(f, "followers:{id}"),
            FeedKey::Following(id) => write!(f, "following:{id}"),
            FeedKey::WhoToFollow(id) => write!(f, "who_to_follow:{id}"),
            FeedKey::UserPreferences(id) => write!(f, "user_preferences:{id}"),
            FeedKey::PostCount(id) => write!(f, "post_count:{id}"),
            FeedKey::Subscription(id) => write!(f, "subscription:{id}"),
            FeedKey::Session(id) => write!(f, "session:{id}"),
            FeedKey::Post(id) => write!(f, "post:{id}"),
            FeedKey::PostDetails(id) => write!(f, "post_details:{id}"),
            FeedKey::PostComments { post_id, page } => write!(f, "post_comments:{post_id}:{page}"),
            FeedKey::PostLikes(id) => write!(f, "post_likes:{id}"),
            FeedKey::RateLimit(identity) => write!(f, "rate_limit:{identity}"),
        }
    }
}

/// Glob patterns used for family-wide deletes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPattern {
    /// Every page of every tab for one user.
    UserTimelines(String),
    /// Every page of one tab for one user.
    UserTabTimelines { user_id: String, tab: Tab },
    /// One tab across all users.
    TabTimelines(Tab),
    UserPosts(String),
    PostComments(String),
    LikedPosts(String),
    PremiumContent(String),
    Trending,
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::UserTimelines(id) => write!(f, "timeline:{id}:*"),
            KeyPattern::UserTabTimelines { user_id, tab } => write!(f, "timeline:{user_id}:{tab}:*"),
            KeyPattern::TabTimelines(tab) => write!(f, "timeline:*:{tab}:*"),
            KeyPattern::UserPosts(id) => write!(f, "user_posts:{id}:*"),
            KeyPattern::PostComments(id) => write!(f, "post_comments:{id}:*"),
            KeyPattern::LikedPosts(id) => write!(f, "liked_posts:{id}:*"),
            KeyPattern::PremiumContent(id) => write!(f, "premium_content:{id}:*"),
            KeyPattern::Trending => f.write_str("trending:*"),
        }
    }
}

// ============================================================================
// Request keys
// ============================================================================

/// Deterministic response-cache key: the path plus query parameters sorted by name.
pub fn request_key(path: &str, query: Option<&str>) -> String {
    let mut pairs: Vec<&str> = query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .collect();
    pairs.sort_unstable();

    if pairs.is_empty() {
        format!("http:{path}")
    } else {
        format!("http:{path}?{}", pairs.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_strings_are_stable() {
        assert_eq!(
            FeedKey::timeline("u1", Tab::ForYou, 0).to_string(),
            "timeline:u1:for-you:0"
        );
        assert_eq!(FeedKey::User("u1".into()).to_string(), "user:u1");
        assert_eq!(FeedKey::UserStats("u1".into()).to_string(), "user_stats:u1");
        assert_eq!(
            FeedKey::WhoToFollow("u1".into()).to_string(),
            "who_to_follow:u1"
        );
        assert_eq!(
            FeedKey::PostComments {
                post_id: "p9".into(),
                page: 2
            }
            .to_string(),
            "post_comments:p9:2"
        );
        assert_eq!(
            FeedKey::RateLimit("1.2.3.4".into()).to_string(),
            "rate_limit:1.2.3.4"
        );
    }

    #[test]
    fn patterns_cover_their_keys() {
        assert_eq!(
            KeyPattern::UserTimelines("u1".into()).to_string(),
            "timeline:u1:*"
        );
        assert_eq!(
            KeyPattern::TabTimelines(Tab::Explore).to_string(),
            "timeline:*:explore:*"
        );
        assert_eq!(
            KeyPattern::UserTabTimelines {
                user_id: "u2".into(),
                tab: Tab::Following
            }
            .to_string(),
            "timeline:u2:following:*"
        );
    }

    #[test]
    fn ttl_follows_table() {
        assert_eq!(Tab::ForYou.ttl(), Duration::from_secs(300));
        assert_eq!(Tab::Following.ttl(), Duration::from_secs(600));
        assert_eq!(Tab::Explore.ttl(), Duration::from_secs(900));
        assert_eq!(
            FeedKey::Followers("u".into()).ttl(),
            Duration::from_secs(3600)
        );
        assert_eq!(
            FeedKey::PostComments {
                post_id: "p".into(),
                page: 0
            }
            .ttl(),
            Duration::from_secs(180)
        );
        assert_eq!(FeedKey::FeedAlgorithm("u".into()).ttl(), Duration::from_secs(43200));
    }

    #[test]
    fn tab_round_trips_through_str() {
        for tab in Tab::ALL {
            assert_eq!(tab.as_str().parse::<Tab>(), Ok(tab));
        }
        assert!("home".parse::<Tab>().is_err());
    }

    #[test]
    fn request_key_sorts_query_parameters() {
        let a = request_key("/cache/timeline/u1", Some("tab=explore&page=1"));
        let b = request_key("/cache/timeline/u1", Some("page=1&tab=explore"));
        assert_eq!(a, b);
        assert_eq!(a, "http:/cache/timeline/u1?page=1&tab=explore");
        assert_eq!(request_key("/healthz", None), "http:/healthz");
    }
}
