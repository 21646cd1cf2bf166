use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_BREAKER_OPEN, METRIC_COMPRESSION_RATIO, METRIC_INVALIDATION_KEYS, METRIC_PREWARM_JOBS,
    METRIC_PREWARM_QUEUE_LEN, METRIC_RATE_LIMIT_REJECTED, METRIC_STORE_ERROR, METRIC_STORE_HIT,
    METRIC_STORE_LATENCY, METRIC_STORE_MISS, METRIC_SWR_REFRESH,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_STORE_HIT,
            Unit::Count,
            "Total number of store reads that found a value."
        );
        describe_counter!(
            METRIC_STORE_MISS,
            Unit::Count,
            "Total number of store reads that found nothing."
        );
        describe_counter!(
            METRIC_STORE_ERROR,
            Unit::Count,
            "Total number of failed store operations."
        );
        describe_histogram!(
            METRIC_STORE_LATENCY,
            Unit::Milliseconds,
            "Store operation latency in milliseconds."
        );
        describe_histogram!(
            METRIC_COMPRESSION_RATIO,
            "Compressed size divided by original size for compressed writes."
        );
        describe_counter!(
            METRIC_BREAKER_OPEN,
            Unit::Count,
            "Total number of circuit breaker transitions to open."
        );
        describe_counter!(
            METRIC_SWR_REFRESH,
            Unit::Count,
            "Total number of background stale-while-revalidate refreshes."
        );
        describe_counter!(
            METRIC_INVALIDATION_KEYS,
            Unit::Count,
            "Total number of keys removed by event-driven invalidation."
        );
        describe_gauge!(
            METRIC_PREWARM_QUEUE_LEN,
            Unit::Count,
            "Current number of pre-warm jobs waiting to run."
        );
        describe_counter!(
            METRIC_PREWARM_JOBS,
            Unit::Count,
            "Total number of finished pre-warm jobs by outcome."
        );
        describe_counter!(
            METRIC_RATE_LIMIT_REJECTED,
            Unit::Count,
            "Total number of requests rejected by the rate limiter."
        );
    });
}
