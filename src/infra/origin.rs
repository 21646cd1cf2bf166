//! HTTP client for the origin API that owns feed data.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::cache::{FetchError, PrewarmSource, Tab};
use crate::config::OriginSettings;

const SOURCE: &str = "infra::origin";

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("origin base URL is not configured")]
    NotConfigured,
    #[error("invalid origin URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("origin answered {status} for {url}")]
    Status { status: u16, url: String },
}

/// Read-only client for the origin REST API.
///
/// Paths are relative to the configured base URL:
/// `users/{id}`, `users/{id}/recommendations`, `users/{id}/preferences`,
/// `users/{id}/timeline?tab=..&page=..` and `trending`.
#[derive(Clone, Debug)]
pub struct OriginClient {
    client: Client,
    base: Url,
}

impl OriginClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OriginError> {
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base = Url::parse(&normalized).map_err(|err| OriginError::InvalidUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()?;
        Ok(Self { client, base })
    }

    pub fn from_settings(settings: &OriginSettings) -> Result<Self, OriginError> {
        let base_url = settings
            .base_url
            .as_deref()
            .ok_or(OriginError::NotConfigured)?;
        Self::new(base_url, settings.timeout)
    }

    pub fn user_agent() -> &'static str {
        concat!("feedcache/", env!("CARGO_PKG_VERSION"))
    }

    /// Append `segments` to the base path. Each segment is percent-encoded, so ids
    /// containing `/`, `?` or `#` stay inside their own segment.
    fn url(&self, segments: &[&str]) -> Result<Url, OriginError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| OriginError::InvalidUrl {
                url: self.base.to_string(),
                reason: "base URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value, OriginError> {
        debug!(target_module = SOURCE, %url, "Fetching from origin");
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OriginError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp.json::<Value>().await?)
    }

    pub async fn timeline_page(
        &self,
        user_id: &str,
        tab: Tab,
        page: u32,
    ) -> Result<Value, OriginError> {
        let mut url = self.url(&["users", user_id, "timeline"])?;
        url.query_pairs_mut()
            .append_pair("tab", tab.as_str())
            .append_pair("page", &page.to_string());
        self.get_json(url).await
    }

    async fn user_resource(&self, user_id: &str, suffix: Option<&str>) -> Result<Value, OriginError> {
        let url = match suffix {
            Some(suffix) => self.url(&["users", user_id, suffix])?,
            None => self.url(&["users", user_id])?,
        };
        self.get_json(url).await
    }
}

#[async_trait]
impl PrewarmSource for OriginClient {
    async fn profile(&self, user_id: &str) -> Result<Value, FetchError> {
        Ok(self.user_resource(user_id, None).await?)
    }

    async fn recommendations(&self, user_id: &str) -> Result<Value, FetchError> {
        Ok(self.user_resource(user_id, Some("recommendations")).await?)
    }

    async fn timeline(&self, user_id: &str, tab: Tab) -> Result<Value, FetchError> {
        Ok(self.timeline_page(user_id, tab, 0).await?)
    }

    async fn trending(&self) -> Result<Value, FetchError> {
        let url = self.url(&["trending"])?;
        Ok(self.get_json(url).await?)
    }

    async fn preferences(&self, user_id: &str) -> Result<Value, FetchError> {
        Ok(self.user_resource(user_id, Some("preferences")).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_join_under_base_prefix() {
        let client = OriginClient::new("https://api.example.com/v1", Duration::from_secs(1))
            .expect("client");
        let url = client.url(&["users", "u1", "recommendations"]).expect("url");
        assert_eq!(url.as_str(), "https://api.example.com/v1/users/u1/recommendations");
    }

    #[test]
    fn user_ids_cannot_rewrite_the_path() {
        let client = OriginClient::new("https://api.example.com/v1/", Duration::from_secs(1))
            .expect("client");
        let url = client.url(&["users", "../admin?x=1#f", "timeline"]).expect("url");
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v1/users/..%2Fadmin%3Fx=1%23f/timeline"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.path_segments().map(|segments| segments.count()), Some(4));
    }

    #[test]
    fn rejects_relative_base() {
        let err = OriginClient::new("not a url", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, OriginError::InvalidUrl { .. }));
    }

    #[test]
    fn missing_base_url_is_reported() {
        let settings = OriginSettings {
            base_url: None,
            timeout: Duration::from_secs(1),
        };
        let err = OriginClient::from_settings(&settings).unwrap_err();
        assert!(matches!(err, OriginError::NotConfigured));
    }
}
