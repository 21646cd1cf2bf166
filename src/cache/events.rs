//! Domain mutation events that drive invalidation.
//!
//! Producers (post, follow, subscription and user services) publish these as JSON:
//! `{"event": "post_created", "userId": "u1", "postId": "p1"}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserUpdated,
    ProfileUpdated,
    PostCreated,
    PostUpdated,
    PostDeleted,
    PostLiked,
    UserFollowed,
    UserUnfollowed,
    SubscriptionChanged,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::UserUpdated => "user_updated",
            EventKind::ProfileUpdated => "profile_updated",
            EventKind::PostCreated => "post_created",
            EventKind::PostUpdated => "post_updated",
            EventKind::PostDeleted => "post_deleted",
            EventKind::PostLiked => "post_liked",
            EventKind::UserFollowed => "user_followed",
            EventKind::UserUnfollowed => "user_unfollowed",
            EventKind::SubscriptionChanged => "subscription_changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transient invalidation message. Which ids are required depends on the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl InvalidationEvent {
    pub fn new(event: EventKind) -> Self {
        Self {
            event,
            user_id: None,
            post_id: None,
            target_user_id: None,
            payload: None,
        }
    }

    pub fn user(event: EventKind, user_id: impl Into<String>) -> Self {
        Self::new(event).with_user(user_id)
    }

    pub fn post(event: EventKind, user_id: impl Into<String>, post_id: impl Into<String>) -> Self {
        Self::user(event, user_id).with_post(post_id)
    }

    pub fn follow(
        event: EventKind,
        user_id: impl Into<String>,
        target_user_id: impl Into<String>,
    ) -> Self {
        Self::user(event, user_id).with_target(target_user_id)
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_post(mut self, post_id: impl Into<String>) -> Self {
        self.post_id = Some(post_id.into());
        self
    }

    pub fn with_target(mut self, target_user_id: impl Into<String>) -> Self {
        self.target_user_id = Some(target_user_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_shape() {
        let event: InvalidationEvent = serde_json::from_str(
            r#"{"event":"user_followed","userId":"u1","targetUserId":"u2","payload":{"source":"app"}}"#,
        )
        .unwrap();
        assert_eq!(event.event, EventKind::UserFollowed);
        assert_eq!(event.user_id.as_deref(), Some("u1"));
        assert_eq!(event.target_user_id.as_deref(), Some("u2"));
        assert!(event.post_id.is_none());
        assert!(event.payload.is_some());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let parsed = serde_json::from_str::<InvalidationEvent>(r#"{"event":"post_shared"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn serializes_without_absent_fields() {
        let json = serde_json::to_string(&InvalidationEvent::post(EventKind::PostLiked, "u1", "p1"))
            .unwrap();
        assert_eq!(json, r#"{"event":"post_liked","userId":"u1","postId":"p1"}"#);
    }
}
