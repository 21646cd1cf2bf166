//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CompressionAlgorithm;

pub use cli::{
    CliArgs, Command, InvalidateArgs, PingArgs, ServeArgs, ServeOverrides, StoreOverride,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "feedcache";
const ENV_PREFIX: &str = "FEEDCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_STORE_URL: &str = "memory://";
const DEFAULT_STORE_TTL_SECS: u64 = 300;
const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
const DEFAULT_COMPRESSION_MIN_SIZE: u64 = 1024;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_FAILURE_THRESHOLD: u64 = 5;
const DEFAULT_BREAKER_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_STALE_SECS: u64 = 3600;
const DEFAULT_ANALYTICS_HISTORY: u64 = 1000;
const DEFAULT_ANALYTICS_LATENCY_WINDOW: u64 = 100;
const DEFAULT_ANALYTICS_MAX_KEYS: u64 = 10_000;
const DEFAULT_PREWARM_CONCURRENCY: u64 = 3;
const DEFAULT_PREWARM_DEQUEUE_DELAY_MS: u64 = 100;
const DEFAULT_PREWARM_RETENTION_SECS: u64 = 5;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u64 = 100;
const DEFAULT_RESPONSE_TTL_SECS: u64 = 60;
const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 10;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub compression: CompressionSettings,
    pub resilience: ResilienceSettings,
    pub freshness: FreshnessSettings,
    pub analytics: AnalyticsSettings,
    pub prewarm: PrewarmSettings,
    pub rate_limit: RateLimitSettings,
    pub response_cache: ResponseCacheSettings,
    pub origin: OriginSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub url: String,
    pub key_prefix: String,
    pub default_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct CompressionSettings {
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
    pub level: u32,
    pub min_size_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ResilienceSettings {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub failure_threshold: NonZeroU32,
    pub breaker_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FreshnessSettings {
    pub max_stale: Duration,
}

#[derive(Debug, Clone)]
pub struct AnalyticsSettings {
    pub history_limit: NonZeroU32,
    pub latency_window: NonZeroU32,
    pub max_tracked_keys: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct PrewarmSettings {
    pub max_concurrency: NonZeroU32,
    pub dequeue_delay: Duration,
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window_seconds: NonZeroU32,
    pub max_requests: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct ResponseCacheSettings {
    pub ttl: Duration,
    /// Patterns cleared after successful writes through the HTTP surface.
    pub invalidate_patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub base_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Ping(args)) => raw.apply_store_override(&args.store),
        Some(Command::Invalidate(args)) => raw.apply_store_override(&args.store),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    compression: RawCompressionSettings,
    resilience: RawResilienceSettings,
    freshness: RawFreshnessSettings,
    analytics: RawAnalyticsSettings,
    prewarm: RawPrewarmSettings,
    rate_limit: RawRateLimitSettings,
    response_cache: RawResponseCacheSettings,
    origin: RawOriginSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.origin_url.as_ref() {
            self.origin.base_url = Some(url.clone());
        }
        if let Some(max) = overrides.prewarm_max_concurrency {
            self.prewarm.max_concurrency = Some(max.into());
        }
        if let Some(window) = overrides.rate_limit_window_seconds {
            self.rate_limit.window_seconds = Some(window);
        }
        if let Some(max) = overrides.rate_limit_max_requests {
            self.rate_limit.max_requests = Some(max);
        }

        self.apply_store_override(&overrides.store);
    }

    fn apply_store_override(&mut self, overrides: &StoreOverride) {
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            store,
            compression,
            resilience,
            freshness,
            analytics,
            prewarm,
            rate_limit,
            response_cache,
            origin,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            store: build_store_settings(store)?,
            compression: build_compression_settings(compression)?,
            resilience: build_resilience_settings(resilience)?,
            freshness: build_freshness_settings(freshness)?,
            analytics: build_analytics_settings(analytics)?,
            prewarm: build_prewarm_settings(prewarm)?,
            rate_limit: build_rate_limit_settings(rate_limit)?,
            response_cache: build_response_cache_settings(response_cache)?,
            origin: build_origin_settings(origin)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown = positive_duration(
        graceful_secs,
        Duration::from_secs,
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let url = store
        .url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_STORE_URL.to_string());
    if !(url.starts_with("redis://") || url.starts_with("memory://")) {
        return Err(LoadError::invalid(
            "store.url",
            format!("unsupported scheme in `{url}`; expected redis:// or memory://"),
        ));
    }

    let default_ttl = positive_duration(
        store.default_ttl_seconds.unwrap_or(DEFAULT_STORE_TTL_SECS),
        Duration::from_secs,
        "store.default_ttl_seconds",
    )?;

    Ok(StoreSettings {
        url,
        key_prefix: store.key_prefix.unwrap_or_default(),
        default_ttl,
    })
}

fn build_compression_settings(
    compression: RawCompressionSettings,
) -> Result<CompressionSettings, LoadError> {
    let algorithm = match compression.algorithm {
        Some(name) => CompressionAlgorithm::from_str(&name)
            .map_err(|reason| LoadError::invalid("compression.algorithm", reason))?,
        None => CompressionAlgorithm::Gzip,
    };

    let level = compression.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
    let valid_levels = match algorithm {
        CompressionAlgorithm::Gzip | CompressionAlgorithm::Deflate => 0..=9,
        CompressionAlgorithm::Zstd => 1..=22,
    };
    if !valid_levels.contains(&level) {
        return Err(LoadError::invalid(
            "compression.level",
            format!(
                "{} level must be within {}..={}",
                algorithm.as_str(),
                valid_levels.start(),
                valid_levels.end()
            ),
        ));
    }

    let min_size = compression
        .min_size_bytes
        .unwrap_or(DEFAULT_COMPRESSION_MIN_SIZE);
    let min_size_bytes = usize::try_from(min_size).map_err(|_| {
        LoadError::invalid(
            "compression.min_size_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(CompressionSettings {
        enabled: compression.enabled.unwrap_or(true),
        algorithm,
        level,
        min_size_bytes,
    })
}

fn build_resilience_settings(
    resilience: RawResilienceSettings,
) -> Result<ResilienceSettings, LoadError> {
    let base_delay = positive_duration(
        resilience.base_delay_ms.unwrap_or(DEFAULT_BASE_DELAY_MS),
        Duration::from_millis,
        "resilience.base_delay_ms",
    )?;
    let failure_threshold = non_zero_u32(
        resilience
            .failure_threshold
            .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
        "resilience.failure_threshold",
    )?;
    let breaker_timeout = positive_duration(
        resilience
            .breaker_timeout_seconds
            .unwrap_or(DEFAULT_BREAKER_TIMEOUT_SECS),
        Duration::from_secs,
        "resilience.breaker_timeout_seconds",
    )?;

    Ok(ResilienceSettings {
        max_retries: resilience.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        base_delay,
        failure_threshold,
        breaker_timeout,
    })
}

fn build_freshness_settings(
    freshness: RawFreshnessSettings,
) -> Result<FreshnessSettings, LoadError> {
    let max_stale = positive_duration(
        freshness
            .max_stale_seconds
            .unwrap_or(DEFAULT_MAX_STALE_SECS),
        Duration::from_secs,
        "freshness.max_stale_seconds",
    )?;
    Ok(FreshnessSettings { max_stale })
}

fn build_analytics_settings(
    analytics: RawAnalyticsSettings,
) -> Result<AnalyticsSettings, LoadError> {
    Ok(AnalyticsSettings {
        history_limit: non_zero_u32(
            analytics.history_limit.unwrap_or(DEFAULT_ANALYTICS_HISTORY),
            "analytics.history_limit",
        )?,
        latency_window: non_zero_u32(
            analytics
                .latency_window
                .unwrap_or(DEFAULT_ANALYTICS_LATENCY_WINDOW),
            "analytics.latency_window",
        )?,
        max_tracked_keys: non_zero_u32(
            analytics
                .max_tracked_keys
                .unwrap_or(DEFAULT_ANALYTICS_MAX_KEYS),
            "analytics.max_tracked_keys",
        )?,
    })
}

fn build_prewarm_settings(prewarm: RawPrewarmSettings) -> Result<PrewarmSettings, LoadError> {
    let max_concurrency = non_zero_u32(
        prewarm
            .max_concurrency
            .unwrap_or(DEFAULT_PREWARM_CONCURRENCY),
        "prewarm.max_concurrency",
    )?;
    let dequeue_delay = Duration::from_millis(
        prewarm
            .dequeue_delay_ms
            .unwrap_or(DEFAULT_PREWARM_DEQUEUE_DELAY_MS),
    );
    let retention = Duration::from_secs(
        prewarm
            .retention_seconds
            .unwrap_or(DEFAULT_PREWARM_RETENTION_SECS),
    );

    Ok(PrewarmSettings {
        max_concurrency,
        dequeue_delay,
        retention,
    })
}

fn build_rate_limit_settings(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitSettings, LoadError> {
    let window_seconds_val = rate_limit
        .window_seconds
        .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS);
    let window_seconds = non_zero_u32(window_seconds_val, "rate_limit.window_seconds")?;

    let max_requests_val = rate_limit
        .max_requests
        .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS);
    let max_requests = non_zero_u32(max_requests_val, "rate_limit.max_requests")?;

    Ok(RateLimitSettings {
        window_seconds,
        max_requests,
    })
}

fn build_response_cache_settings(
    response_cache: RawResponseCacheSettings,
) -> Result<ResponseCacheSettings, LoadError> {
    let ttl = positive_duration(
        response_cache
            .ttl_seconds
            .unwrap_or(DEFAULT_RESPONSE_TTL_SECS),
        Duration::from_secs,
        "response_cache.ttl_seconds",
    )?;
    let invalidate_patterns = response_cache
        .invalidate_patterns
        .unwrap_or_else(|| vec!["http:*".to_string()]);
    if invalidate_patterns.iter().any(|pattern| pattern.trim().is_empty()) {
        return Err(LoadError::invalid(
            "response_cache.invalidate_patterns",
            "patterns must not be empty",
        ));
    }

    Ok(ResponseCacheSettings {
        ttl,
        invalidate_patterns,
    })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let base_url = origin.base_url.and_then(|value| {
        let trimmed = value.trim().trim_end_matches('/');
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if let Some(url) = base_url.as_ref()
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        return Err(LoadError::invalid(
            "origin.base_url",
            format!("`{url}` is not an http(s) URL"),
        ));
    }

    let timeout = positive_duration(
        origin.timeout_seconds.unwrap_or(DEFAULT_ORIGIN_TIMEOUT_SECS),
        Duration::from_secs,
        "origin.timeout_seconds",
    )?;

    Ok(OriginSettings { base_url, timeout })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    url: Option<String>,
    key_prefix: Option<String>,
    default_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCompressionSettings {
    enabled: Option<bool>,
    algorithm: Option<String>,
    level: Option<u32>,
    min_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawResilienceSettings {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    failure_threshold: Option<u64>,
    breaker_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFreshnessSettings {
    max_stale_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAnalyticsSettings {
    history_limit: Option<u64>,
    latency_window: Option<u64>,
    max_tracked_keys: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPrewarmSettings {
    max_concurrency: Option<u64>,
    dequeue_delay_ms: Option<u64>,
    retention_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    window_seconds: Option<u64>,
    max_requests: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawResponseCacheSettings {
    ttl_seconds: Option<u64>,
    invalidate_patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    base_url: Option<String>,
    timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_duration(
    value: u64,
    unit: fn(u64) -> Duration,
    key: &'static str,
) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(unit(value))
}

#[cfg(test)]
mod tests;
