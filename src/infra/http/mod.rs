//! Operational HTTP surface over the cache services.

mod error;
mod middleware;
mod routes;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post},
};
use tokio::{net::TcpListener, sync::watch, task::JoinError};
use tracing::{info, warn};

pub use error::{ErrorReport, HttpError};
pub use middleware::RequestContext;

use crate::cache::{
    CacheServices, PrewarmScheduler, invalidate_on_write_layer, rate_limit_layer,
    read_through_layer,
};
use crate::infra::{error::InfraError, origin::OriginClient};

const SOURCE: &str = "infra::http";

#[derive(Clone)]
pub struct HttpState {
    pub cache: CacheServices,
    /// Absent when no origin is configured.
    pub prewarm: Option<PrewarmScheduler>,
    pub origin: Option<Arc<OriginClient>>,
}

pub fn build_router(state: HttpState) -> Router {
    // Feed reads go through rate limiting first, then the response cache.
    let feed_routes = Router::new()
        .route("/cache/timeline/{user_id}", get(routes::timeline))
        .layer(axum_middleware::from_fn_with_state(
            state.cache.read_through_state(),
            read_through_layer,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.cache.rate_limit_state(),
            rate_limit_layer,
        ));

    // Successful event writes also clear cached responses.
    let event_routes = Router::new()
        .route("/cache/events", post(routes::route_event))
        .route("/cache/events/batch", post(routes::route_events))
        .layer(axum_middleware::from_fn_with_state(
            state.cache.write_invalidation_state(),
            invalidate_on_write_layer,
        ));

    let admin_routes = Router::new()
        .route("/healthz", get(routes::health))
        .route("/cache/analytics", get(routes::analytics))
        .route("/cache/breakers", get(routes::breakers))
        .route("/cache/breakers/{key}", delete(routes::reset_breaker))
        .route("/cache/prewarm", post(routes::enqueue_prewarm))
        .route("/cache/prewarm/jobs", get(routes::prewarm_jobs))
        .route(
            "/cache/prewarm/jobs/{id}",
            get(routes::prewarm_job).delete(routes::cancel_prewarm_job),
        );

    feed_routes
        .merge(event_routes)
        .merge(admin_routes)
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}

/// Serve `router` on `addr` until Ctrl-C, then drain for at most `graceful`.
pub async fn serve(addr: SocketAddr, graceful: Duration, router: Router) -> Result<(), InfraError> {
    let listener = TcpListener::bind(addr).await?;
    info!(target_module = SOURCE, %addr, "Listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            let _ = shutdown_rx.changed().await;
        },
    );
    let mut handle = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut handle => return flatten(result),
        () = shutdown_signal() => {}
    }

    info!(target_module = SOURCE, grace_secs = graceful.as_secs(), "Shutting down");
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(graceful, handle).await {
        Ok(result) => flatten(result),
        Err(_) => {
            warn!(target_module = SOURCE, "Connections still open after grace period; exiting");
            Ok(())
        }
    }
}

fn flatten(result: Result<std::io::Result<()>, JoinError>) -> Result<(), InfraError> {
    match result {
        Ok(outcome) => outcome.map_err(InfraError::from),
        Err(err) => Err(InfraError::Io(std::io::Error::other(err))),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target_module = SOURCE, error = %err, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
