use std::error::Error as StdError;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::cache::{CacheError, PlanError, PrewarmError};

/// Diagnostic chain attached to failed responses for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    retry_after: Option<u64>,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status,
            public_message,
            retry_after: None,
            report: ErrorReport::from_message(source, status, detail),
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        Self {
            status,
            public_message,
            retry_after: None,
            report: ErrorReport::from_error(source, status, error),
        }
    }

    fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            Json(ErrorBody {
                error: self.public_message,
            }),
        )
            .into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        self.report.attach(&mut response);
        response
    }
}

impl From<CacheError> for HttpError {
    fn from(error: CacheError) -> Self {
        const SOURCE: &str = "infra::http::cache_error_to_http_error";
        match &error {
            CacheError::CircuitOpen { .. } => HttpError::from_error(
                SOURCE,
                StatusCode::SERVICE_UNAVAILABLE,
                "Upstream temporarily unavailable",
                &error,
            ),
            CacheError::RateLimitExceeded {
                retry_after_secs, ..
            } => HttpError::from_error(
                SOURCE,
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded",
                &error,
            )
            .with_retry_after(*retry_after_secs),
            CacheError::Fetch { .. } => HttpError::from_error(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Upstream request failed",
                &error,
            ),
            CacheError::Serialization { .. }
            | CacheError::Decompression { .. } => HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &error,
            ),
        }
    }
}

impl From<PlanError> for HttpError {
    fn from(error: PlanError) -> Self {
        HttpError::from_error(
            "infra::http::plan_error_to_http_error",
            StatusCode::UNPROCESSABLE_ENTITY,
            "Event is missing required fields",
            &error,
        )
    }
}

impl From<PrewarmError> for HttpError {
    fn from(error: PrewarmError) -> Self {
        let (status, message) = match error {
            PrewarmError::UnknownJob(_) => (StatusCode::NOT_FOUND, "Job not found"),
            PrewarmError::AlreadyFinished(_) => (StatusCode::CONFLICT, "Job already finished"),
        };
        HttpError::from_error(
            "infra::http::prewarm_error_to_http_error",
            status,
            message,
            &error,
        )
    }
}
