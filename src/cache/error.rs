use thiserror::Error;

/// Boxed error returned by origin fetchers handed to the cache.
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// Failures surfaced by the cache layers.
///
/// Store faults are absorbed by [`StoreAdapter`](super::store::StoreAdapter) and failed
/// compression falls back to a plain write, so neither appears here. The enum is `Clone`
/// so a single outcome can be shared between callers joined onto one in-flight refresh.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("failed to (de)serialize cache value for `{key}`: {message}")]
    Serialization { key: String, message: String },
    #[error("failed to decompress cache entry `{key}`: {message}")]
    Decompression { key: String, message: String },
    #[error("circuit open for `{key}` and no fallback was supplied")]
    CircuitOpen { key: String },
    #[error("rate limit exceeded for `{identity}`; retry in {retry_after_secs}s")]
    RateLimitExceeded {
        identity: String,
        retry_after_secs: u64,
    },
    #[error("origin fetch failed for `{key}` after {attempts} attempt(s): {message}")]
    Fetch {
        key: String,
        attempts: u32,
        message: String,
    },
}

impl CacheError {
    pub fn serialization(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            key: key.into(),
            message: err.to_string(),
        }
    }

    pub fn decompression(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Decompression {
            key: key.into(),
            message: err.to_string(),
        }
    }

    pub fn circuit_open(key: impl Into<String>) -> Self {
        Self::CircuitOpen { key: key.into() }
    }

    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Serialization { .. } => "serialization",
            Self::Decompression { .. } => "decompression",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::Fetch { .. } => "fetch",
        }
    }
}
