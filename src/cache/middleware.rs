//! HTTP middleware: read-through response caching, invalidate-on-write, rate limiting.
//!
//! All three are `axum::middleware::from_fn_with_state` functions. Cached responses
//! go through the compressing store, so large bodies are stored compressed.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use futures::future::join_all;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::compression::CompressedStore;
use super::keys::request_key;
use super::rate_limit::{RateLimitDecision, RateLimiter};
use super::store::StoreAdapter;

const SOURCE: &str = "cache::middleware";

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_CACHE_KEY: HeaderName = HeaderName::from_static("x-cache-key");
pub const X_RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_USER_ID: &str = "x-user-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

// ============================================================================
// Read-through
// ============================================================================

#[derive(Clone)]
pub struct ReadThroughState {
    pub store: Arc<CompressedStore>,
    pub ttl: Duration,
}

/// A buffered response as stored in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    /// Base64 body.
    body: String,
}

impl CachedResponse {
    fn new(status: StatusCode, headers: &HeaderMap, body: &Bytes) -> Self {
        let headers = headers
            .iter()
            .filter(|(name, _)| **name != X_CACHE && **name != X_CACHE_KEY)
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        Self {
            status: status.as_u16(),
            headers,
            body: STANDARD.encode(body),
        }
    }

    fn into_response(self) -> Option<Response> {
        let body = STANDARD.decode(self.body).ok()?;
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = StatusCode::from_u16(self.status).ok()?;
        let headers = response.headers_mut();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }
        Some(response)
    }
}

/// Serve GET requests from the cache; cache successful responses on a miss.
///
/// Marks every GET response with `X-Cache: HIT|MISS|ERROR` and `X-Cache-Key`.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn read_through_layer(
    State(state): State<ReadThroughState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let key = request_key(request.uri().path(), request.uri().query());

    let lookup = state.store.get::<CachedResponse>(&key).await;
    let marker = match lookup {
        Ok(Some(cached)) => {
            if let Some(response) = cached.into_response() {
                debug!(target_module = SOURCE, outcome = "hit", key = %key, "Serving cached response");
                return mark(response, "HIT", &key);
            }
            warn!(target_module = SOURCE, key = %key, "Cached response unusable; bypassing");
            "ERROR"
        }
        Ok(None) => "MISS",
        Err(err) => {
            warn!(target_module = SOURCE, key = %key, error = %err, "Response cache read failed");
            "ERROR"
        }
    };

    let response = next.run(request).await;
    if marker == "ERROR" || !should_store_response(&response) {
        return mark(response, marker, &key);
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(target_module = SOURCE, key = %key, error = %err, "Failed to buffer response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if !parts.headers.contains_key(header::CACHE_CONTROL)
        && let Ok(value) = HeaderValue::from_str(&format!("public, max-age={}", state.ttl.as_secs()))
    {
        parts.headers.insert(header::CACHE_CONTROL, value);
    }

    let cached = CachedResponse::new(parts.status, &parts.headers, &bytes);
    match state.store.set(&key, &cached, state.ttl).await {
        Ok(_) => debug!(target_module = SOURCE, outcome = "miss", key = %key, "Cached response"),
        Err(err) => warn!(target_module = SOURCE, key = %key, error = %err, "Failed to cache response"),
    }

    mark(Response::from_parts(parts, Body::from(bytes)), "MISS", &key)
}

/// Only complete, cookie-free 200 responses are shared between callers.
fn should_store_response(response: &Response) -> bool {
    if response.status() != StatusCode::OK {
        return false;
    }
    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }
    !response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

fn mark(mut response: Response, marker: &'static str, key: &str) -> Response {
    let headers = response.headers_mut();
    headers.insert(X_CACHE, HeaderValue::from_static(marker));
    if let Ok(value) = HeaderValue::from_str(key) {
        headers.insert(X_CACHE_KEY, value);
    }
    response
}

// ============================================================================
// Invalidate on write
// ============================================================================

#[derive(Clone)]
pub struct WriteInvalidationState {
    pub store: StoreAdapter,
    /// Glob patterns cleared after every successful write.
    pub patterns: Arc<[String]>,
}

/// Run the write first, then clear the configured patterns if it succeeded.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn invalidate_on_write_layer(
    State(state): State<WriteInvalidationState>,
    request: Request,
    next: Next,
) -> Response {
    let is_write = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    let response = next.run(request).await;
    if !is_write || !response.status().is_success() {
        return response;
    }

    let deleted: u64 = join_all(
        state
            .patterns
            .iter()
            .map(|pattern| state.store.delete_pattern(pattern)),
    )
    .await
    .into_iter()
    .sum();
    debug!(target_module = SOURCE, deleted, "Invalidated after write");
    response
}

// ============================================================================
// Rate limiting
// ============================================================================

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: RateLimiter,
}

#[derive(Serialize)]
struct RateLimitBody {
    error: &'static str,
    retry_after: u64,
}

/// Fixed-window limit per caller; rejected requests get 429 with `Retry-After`.
pub async fn rate_limit_layer(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let identity = identity(request.headers());
    let decision = state.limiter.check(&identity).await;

    if !decision.allowed {
        let retry_after = decision.reset_after_secs();
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitBody {
                error: "rate limit exceeded",
                retry_after,
            }),
        )
            .into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return with_rate_headers(response, &decision);
    }

    let response = next.run(request).await;
    with_rate_headers(response, &decision)
}

/// Authenticated user id, else the first forwarded address, else a shared bucket.
fn identity(headers: &HeaderMap) -> String {
    if let Some(user) = headers
        .get(X_USER_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        return format!("user:{user}");
    }
    if let Some(addr) = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return format!("ip:{addr}");
    }
    "anonymous".to_string()
}

fn with_rate_headers(mut response: Response, decision: &RateLimitDecision) -> Response {
    let headers = response.headers_mut();
    headers.insert(X_RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATE_LIMIT_RESET, HeaderValue::from(decision.reset_after_secs()));
    response
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Router, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;
    use crate::cache::compression::CompressionConfig;
    use crate::cache::rate_limit::RateLimitConfig;
    use crate::cache::store::MemoryBackend;

    fn adapter() -> StoreAdapter {
        StoreAdapter::new(Arc::new(MemoryBackend::new()), Duration::from_secs(60))
    }

    fn get_request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn identity_prefers_user_then_forwarded_address() {
        let mut headers = HeaderMap::new();
        assert_eq!(identity(&headers), "anonymous");
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        assert_eq!(identity(&headers), "ip:10.0.0.1");
        headers.insert(X_USER_ID, HeaderValue::from_static("u1"));
        assert_eq!(identity(&headers), "user:u1");
    }

    #[test]
    fn only_plain_ok_responses_are_stored() {
        assert!(should_store_response(&StatusCode::OK.into_response()));
        assert!(!should_store_response(&StatusCode::CREATED.into_response()));
        let mut with_cookie = StatusCode::OK.into_response();
        with_cookie
            .headers_mut()
            .insert(header::SET_COOKIE, HeaderValue::from_static("sid=1"));
        assert!(!should_store_response(&with_cookie));
    }

    #[tokio::test]
    async fn read_through_serves_second_request_from_cache() {
        let store = Arc::new(CompressedStore::new(adapter(), CompressionConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        let app = Router::new()
            .route(
                "/feed",
                get(move || {
                    let calls = handler_calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        "fresh body"
                    }
                }),
            )
            .layer(middleware::from_fn_with_state(
                ReadThroughState {
                    store,
                    ttl: Duration::from_secs(30),
                },
                read_through_layer,
            ));

        let first = app.clone().oneshot(get_request("/feed?b=2&a=1")).await.unwrap();
        assert_eq!(first.headers()[X_CACHE], "MISS");
        assert_eq!(first.headers()[X_CACHE_KEY], "http:/feed?a=1&b=2");
        assert_eq!(first.headers()[header::CACHE_CONTROL], "public, max-age=30");

        let second = app.clone().oneshot(get_request("/feed?a=1&b=2")).await.unwrap();
        assert_eq!(second.headers()[X_CACHE], "HIT");
        assert_eq!(second.status(), StatusCode::OK);
        let body = second.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"fresh body");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_success_clears_patterns() {
        let store = adapter();
        store.set_raw("http:/feed", "{}", Duration::from_secs(60)).await;
        store.set_raw("http:/feed?page=2", "{}", Duration::from_secs(60)).await;
        store.set_raw("user:u1", "{}", Duration::from_secs(60)).await;

        let app = Router::new()
            .route(
                "/posts",
                axum::routing::post(|| async { StatusCode::CREATED })
                    .delete(|| async { StatusCode::FORBIDDEN }),
            )
            .layer(middleware::from_fn_with_state(
                WriteInvalidationState {
                    store: store.clone(),
                    patterns: Arc::from(vec!["http:/feed*".to_string()]),
                },
                invalidate_on_write_layer,
            ));

        let rejected = Request::builder()
            .method(Method::DELETE)
            .uri("/posts")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(rejected).await.unwrap().status(), StatusCode::FORBIDDEN);
        assert!(store.exists("http:/feed").await);

        let created = Request::builder()
            .method(Method::POST)
            .uri("/posts")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(created).await.unwrap().status(), StatusCode::CREATED);
        assert!(!store.exists("http:/feed").await);
        assert!(!store.exists("http:/feed?page=2").await);
        assert!(store.exists("user:u1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rejects_with_headers() {
        let limiter = RateLimiter::new(
            adapter(),
            RateLimitConfig {
                window: Duration::from_secs(60),
                max_requests: 2,
            },
        );
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(
                RateLimitState { limiter },
                rate_limit_layer,
            ));

        let request = || {
            Request::builder()
                .uri("/")
                .header(X_USER_ID, "u1")
                .body(Body::empty())
                .unwrap()
        };

        let ok = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()[X_RATE_LIMIT_LIMIT], "2");
        assert_eq!(ok.headers()[X_RATE_LIMIT_REMAINING], "1");

        app.clone().oneshot(request()).await.unwrap();
        let rejected = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejected.headers()[header::RETRY_AFTER], "60");
        assert_eq!(rejected.headers()[X_RATE_LIMIT_REMAINING], "0");
    }
}
