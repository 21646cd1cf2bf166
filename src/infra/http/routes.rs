use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cache::{
    AnalyticsReport, BreakerSnapshot, CompressionStats, FetchError, Freshness, InvalidationEvent,
    InvalidationReport, PrewarmJob, PrewarmScheduler, PrewarmStats, SwrStats, Tab,
};

use super::{HttpError, HttpState};

const SOURCE: &str = "infra::http::routes";
const DEFAULT_TOP_KEYS: usize = 10;

// ============================================================================
// Health and diagnostics
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthView {
    status: &'static str,
    backend: &'static str,
    health_score: f64,
}

pub(super) async fn health(State(state): State<HttpState>) -> Response {
    let reachable = state.cache.store.ping().await;
    let view = HealthView {
        status: if reachable { "ok" } else { "unavailable" },
        backend: state.cache.store.backend_name(),
        health_score: state.cache.analytics.health_score(),
    };
    let status = if reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(view)).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct AnalyticsQuery {
    top: Option<usize>,
}

#[derive(Serialize)]
pub(super) struct CacheStatsView {
    analytics: AnalyticsReport,
    compression: CompressionStats,
    freshness: SwrStats,
    prewarm: Option<PrewarmStats>,
}

pub(super) async fn analytics(
    State(state): State<HttpState>,
    Query(query): Query<AnalyticsQuery>,
) -> Json<CacheStatsView> {
    let top = query.top.unwrap_or(DEFAULT_TOP_KEYS);
    Json(CacheStatsView {
        analytics: state.cache.analytics.report(top),
        compression: state.cache.compressed.stats(),
        freshness: state.cache.swr.stats(),
        prewarm: state.prewarm.as_ref().map(PrewarmScheduler::stats),
    })
}

pub(super) async fn breakers(State(state): State<HttpState>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.cache.executor.breaker_snapshot())
}

pub(super) async fn reset_breaker(
    State(state): State<HttpState>,
    Path(key): Path<String>,
) -> Result<StatusCode, HttpError> {
    if state.cache.executor.reset_breaker(&key) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Breaker not found",
            format!("no breaker tracked for `{key}`"),
        ))
    }
}

// ============================================================================
// Invalidation events
// ============================================================================

pub(super) async fn route_event(
    State(state): State<HttpState>,
    Json(event): Json<InvalidationEvent>,
) -> Result<Json<InvalidationReport>, HttpError> {
    let report = state.cache.router.route(&event).await?;
    Ok(Json(report))
}

pub(super) async fn route_events(
    State(state): State<HttpState>,
    Json(events): Json<Vec<InvalidationEvent>>,
) -> Json<InvalidationReport> {
    Json(state.cache.router.route_many(&events).await)
}

// ============================================================================
// Pre-warming
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PrewarmRequest {
    user_ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrewarmAccepted {
    job_ids: Vec<Uuid>,
}

fn scheduler(state: &HttpState) -> Result<&PrewarmScheduler, HttpError> {
    state.prewarm.as_ref().ok_or_else(|| {
        HttpError::new(
            SOURCE,
            StatusCode::SERVICE_UNAVAILABLE,
            "Pre-warming disabled",
            "origin.base_url is not configured",
        )
    })
}

pub(super) async fn enqueue_prewarm(
    State(state): State<HttpState>,
    Json(request): Json<PrewarmRequest>,
) -> Result<Response, HttpError> {
    let scheduler = scheduler(&state)?;
    let user_ids: Vec<&str> = request
        .user_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect();
    if user_ids.is_empty() {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::BAD_REQUEST,
            "userIds must not be empty",
            "prewarm request carried no user ids",
        ));
    }
    let job_ids = scheduler.enqueue_many(&user_ids);
    Ok((StatusCode::ACCEPTED, Json(PrewarmAccepted { job_ids })).into_response())
}

pub(super) async fn prewarm_jobs(
    State(state): State<HttpState>,
) -> Result<Json<Vec<PrewarmJob>>, HttpError> {
    Ok(Json(scheduler(&state)?.jobs()))
}

pub(super) async fn prewarm_job(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PrewarmJob>, HttpError> {
    scheduler(&state)?.job(id).map(Json).ok_or_else(|| {
        HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Job not found",
            format!("prewarm job {id} not found"),
        )
    })
}

pub(super) async fn cancel_prewarm_job(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PrewarmJob>, HttpError> {
    Ok(Json(scheduler(&state)?.cancel(id)?))
}

// ============================================================================
// Feed reads
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct TimelineQuery {
    tab: Option<String>,
    page: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TimelineView {
    user_id: String,
    tab: &'static str,
    page: u32,
    freshness: Freshness,
    data: Value,
}

pub(super) async fn timeline(
    State(state): State<HttpState>,
    Path(user_id): Path<String>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<TimelineView>, HttpError> {
    let tab = match query.tab.as_deref() {
        Some(raw) => raw.parse::<Tab>().map_err(|reason| {
            HttpError::new(SOURCE, StatusCode::BAD_REQUEST, "Unknown timeline tab", reason)
        })?,
        None => Tab::ForYou,
    };
    let page = query.page.unwrap_or(0);
    let origin = state.origin.clone().ok_or_else(|| {
        HttpError::new(
            SOURCE,
            StatusCode::SERVICE_UNAVAILABLE,
            "Origin not configured",
            "origin.base_url is not configured",
        )
    })?;

    let fetch_user = user_id.clone();
    let result = state
        .cache
        .timelines
        .get_timeline::<Value, _, _>(&user_id, tab, page, move || {
            let origin = Arc::clone(&origin);
            let user_id = fetch_user.clone();
            async move {
                origin
                    .timeline_page(&user_id, tab, page)
                    .await
                    .map_err(FetchError::from)
            }
        })
        .await?;

    Ok(Json(TimelineView {
        user_id,
        tab: tab.as_str(),
        page,
        freshness: result.freshness,
        data: result.value,
    }))
}
