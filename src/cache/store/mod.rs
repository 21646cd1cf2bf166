//! Key-value store abstraction.
//!
//! [`KvBackend`] is the raw, fallible contract of a Redis-compatible store.
//! [`StoreAdapter`] wraps a backend and never lets a store fault escape: every
//! failure is logged and degrades to "absent", `false` or zero.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::warn;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

const SOURCE: &str = "cache::store";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store command `{command}` failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },
    #[error("value stored at `{key}` is not an integer")]
    NotAnInteger { key: String },
    #[error("unsupported store url `{0}`")]
    UnsupportedUrl(String),
}

impl StoreError {
    pub fn command(command: &'static str, message: impl ToString) -> Self {
        Self::Command {
            command,
            message: message.to_string(),
        }
    }
}

/// Raw store contract. Values are serialized JSON text.
#[async_trait]
pub trait KvBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    async fn mset(&self, pairs: &[(String, String)], ttl: Duration) -> StoreResult<()>;

    /// Atomically increment an integer counter, creating it at 1. Existing expiry is kept.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining lifetime; `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    async fn flush_all(&self) -> StoreResult<()>;

    async fn ping(&self) -> StoreResult<()>;

    async fn delete_pattern(&self, pattern: &str) -> StoreResult<u64> {
        let keys = self.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.delete(&keys).await
    }
}

/// Open a backend from a store url: `redis://...` or `memory://`.
pub async fn connect(url: &str, key_prefix: &str) -> StoreResult<Arc<dyn KvBackend>> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme);
    match scheme {
        Some("memory") => Ok(Arc::new(MemoryBackend::new())),
        Some("redis") => Ok(Arc::new(RedisBackend::connect(url, key_prefix).await?)),
        _ => Err(StoreError::UnsupportedUrl(url.to_string())),
    }
}

/// Best-effort facade over a [`KvBackend`].
#[derive(Clone)]
pub struct StoreAdapter {
    backend: Arc<dyn KvBackend>,
    default_ttl: Duration,
}

impl std::fmt::Debug for StoreAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreAdapter")
            .field("backend", &self.backend.name())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl StoreAdapter {
    pub fn new(backend: Arc<dyn KvBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub async fn get_raw(&self, key: &str) -> Option<String> {
        match self.backend.get(key).await {
            Ok(value) => value,
            Err(err) => degraded("get", Some(key), &err, None),
        }
    }

    /// Typed read. A value that does not decode as `T` is reported as absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    target_module = SOURCE,
                    op = "get",
                    key,
                    error = %err,
                    "Discarding cache value that failed to decode"
                );
                None
            }
        }
    }

    /// Store a raw value. Zero TTLs are rejected so every entry expires.
    pub async fn set_raw(&self, key: &str, value: &str, ttl: Duration) -> bool {
        if ttl.is_zero() {
            warn!(
                target_module = SOURCE,
                op = "set",
                key,
                "Refusing to store cache entry without a TTL"
            );
            return false;
        }
        match self.backend.set(key, value, ttl).await {
            Ok(()) => true,
            Err(err) => degraded("set", Some(key), &err, false),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set_raw(key, &raw, ttl).await,
            Err(err) => {
                warn!(
                    target_module = SOURCE,
                    op = "set",
                    key,
                    error = %err,
                    "Failed to encode cache value"
                );
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.delete_many(&[key.to_string()]).await > 0
    }

    pub async fn delete_many(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        match self.backend.delete(keys).await {
            Ok(count) => count,
            Err(err) => degraded("delete", None, &err, 0),
        }
    }

    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        match self.backend.delete_pattern(pattern).await {
            Ok(count) => count,
            Err(err) => degraded("delete_pattern", Some(pattern), &err, 0),
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.backend.exists(key).await {
            Ok(found) => found,
            Err(err) => degraded("exists", Some(key), &err, false),
        }
    }

    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        match self.backend.keys(pattern).await {
            Ok(keys) => keys,
            Err(err) => degraded("keys", Some(pattern), &err, Vec::new()),
        }
    }

    /// Batch read. The result always has one slot per requested key.
    pub async fn mget_raw(&self, keys: &[String]) -> Vec<Option<String>> {
        if keys.is_empty() {
            return Vec::new();
        }
        match self.backend.mget(keys).await {
            Ok(values) if values.len() == keys.len() => values,
            Ok(values) => {
                warn!(
                    target_module = SOURCE,
                    op = "mget",
                    requested = keys.len(),
                    returned = values.len(),
                    "Store returned a mismatched batch; treating as misses"
                );
                vec![None; keys.len()]
            }
            Err(err) => degraded("mget", None, &err, vec![None; keys.len()]),
        }
    }

    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        self.mget_raw(keys)
            .await
            .into_iter()
            .map(|raw| raw.and_then(|raw| serde_json::from_str(&raw).ok()))
            .collect()
    }

    /// Batch write; `ttl` falls back to the adapter default.
    pub async fn mset_raw(&self, pairs: &[(String, String)], ttl: Option<Duration>) -> bool {
        if pairs.is_empty() {
            return true;
        }
        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return false;
        }
        match self.backend.mset(pairs, ttl).await {
            Ok(()) => true,
            Err(err) => degraded("mset", None, &err, false),
        }
    }

    pub async fn mset<T: Serialize>(&self, pairs: &[(String, T)], ttl: Option<Duration>) -> bool {
        let mut encoded = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match serde_json::to_string(value) {
                Ok(raw) => encoded.push((key.clone(), raw)),
                Err(err) => {
                    warn!(target_module = SOURCE, op = "mset", key = %key, error = %err, "Failed to encode cache value");
                    return false;
                }
            }
        }
        self.mset_raw(&encoded, ttl).await
    }

    /// Atomic increment; `None` when the store is unreachable.
    pub async fn increment(&self, key: &str) -> Option<i64> {
        match self.backend.incr(key).await {
            Ok(value) => Some(value),
            Err(err) => degraded("incr", Some(key), &err, None),
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        match self.backend.expire(key, ttl).await {
            Ok(applied) => applied,
            Err(err) => degraded("expire", Some(key), &err, false),
        }
    }

    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        match self.backend.ttl(key).await {
            Ok(ttl) => ttl,
            Err(err) => degraded("ttl", Some(key), &err, None),
        }
    }

    pub async fn flush_all(&self) -> bool {
        match self.backend.flush_all().await {
            Ok(()) => true,
            Err(err) => degraded("flush_all", None, &err, false),
        }
    }

    pub async fn ping(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(err) => degraded("ping", None, &err, false),
        }
    }
}

fn degraded<T>(op: &'static str, key: Option<&str>, err: &StoreError, fallback: T) -> T {
    warn!(
        target_module = SOURCE,
        op,
        key = key.unwrap_or_default(),
        error = %err,
        "Cache store operation failed; degrading"
    );
    fallback
}
