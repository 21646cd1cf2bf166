//! Transparent compression for large cache values.
//!
//! Values are wrapped in an envelope `{data, compressed, metrics, storedAtMs}`. A value is
//! compressed only when its serialized form reaches `min_size` and the base64 text of the
//! compressed bytes comes in under `max_ratio` of the original; otherwise the plain JSON is
//! stored.
//! Entries written without an envelope are read back as plain values.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use flate2::Compression;
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use metrics::histogram;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::error::CacheError;
use super::lock::mutex_lock;
use super::store::StoreAdapter;
use super::unix_millis;

const SOURCE: &str = "cache::compression";

pub const METRIC_COMPRESSION_RATIO: &str = "feedcache_compression_ratio";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
    Deflate,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Deflate => "deflate",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }
}

impl std::str::FromStr for CompressionAlgorithm {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "gzip" => Ok(Self::Gzip),
            "deflate" => Ok(Self::Deflate),
            "zstd" => Ok(Self::Zstd),
            other => Err(format!("unknown compression algorithm `{other}`")),
        }
    }
}

/// Byte-level codec.
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;
    fn compress(&self, input: &[u8]) -> io::Result<Vec<u8>>;
    fn decompress(&self, input: &[u8]) -> io::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: u32,
}

impl Compressor for GzipCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Gzip
    }

    fn compress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(input)?;
        encoder.finish()
    }

    fn decompress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        GzDecoder::new(input).read_to_end(&mut out)?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeflateCompressor {
    level: u32,
}

impl Compressor for DeflateCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Deflate
    }

    fn compress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(input)?;
        encoder.finish()
    }

    fn decompress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        DeflateDecoder::new(input).read_to_end(&mut out)?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl Compressor for ZstdCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Zstd
    }

    fn compress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
        zstd::stream::encode_all(input, self.level)
    }

    fn decompress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
        zstd::stream::decode_all(input)
    }
}

pub fn compressor_for(algorithm: CompressionAlgorithm, level: u32) -> Arc<dyn Compressor> {
    match algorithm {
        CompressionAlgorithm::Gzip => Arc::new(GzipCompressor {
            level: level.min(9),
        }),
        CompressionAlgorithm::Deflate => Arc::new(DeflateCompressor {
            level: level.min(9),
        }),
        CompressionAlgorithm::Zstd => Arc::new(ZstdCompressor {
            level: i32::try_from(level.min(22)).unwrap_or(3),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
    pub level: u32,
    pub min_size: usize,
    pub max_ratio: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: CompressionAlgorithm::Gzip,
            level: 6,
            min_size: 1024,
            max_ratio: 0.9,
        }
    }
}

/// Per-write figures, persisted alongside compressed payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionMetrics {
    pub original_size: usize,
    /// Length of the base64 text actually stored.
    pub compressed_size: usize,
    pub ratio: f64,
    pub algorithm: CompressionAlgorithm,
    pub elapsed_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompressionStats {
    pub writes: u64,
    pub compressed_writes: u64,
    pub skipped_small: u64,
    pub skipped_ineffective: u64,
    pub failures: u64,
    pub original_bytes: u64,
    pub stored_bytes: u64,
}

impl CompressionStats {
    /// Stored bytes over original bytes across all writes; 1.0 before any write.
    pub fn average_ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            1.0
        } else {
            self.stored_bytes as f64 / self.original_bytes as f64
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    data: String,
    compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metrics: Option<CompressionMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stored_at_ms: Option<i64>,
}

/// Diagnostic view of one stored entry.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    #[serde(with = "time::serde::rfc3339::option")]
    pub inserted_at: Option<OffsetDateTime>,
    pub ttl: Option<Duration>,
    pub compressed: bool,
    pub size: usize,
}

enum Outcome {
    Compressed(Vec<u8>, CompressionMetrics),
    TooSmall,
    Ineffective,
    Failed,
}

/// Compressing facade over a [`StoreAdapter`].
pub struct CompressedStore {
    store: StoreAdapter,
    compressor: Arc<dyn Compressor>,
    config: CompressionConfig,
    stats: Mutex<CompressionStats>,
}

impl CompressedStore {
    pub fn new(store: StoreAdapter, config: CompressionConfig) -> Self {
        let compressor = compressor_for(config.algorithm, config.level);
        Self::with_compressor(store, compressor, config)
    }

    pub fn with_compressor(
        store: StoreAdapter,
        compressor: Arc<dyn Compressor>,
        config: CompressionConfig,
    ) -> Self {
        Self {
            store,
            compressor,
            config,
            stats: Mutex::new(CompressionStats::default()),
        }
    }

    pub fn store(&self) -> &StoreAdapter {
        &self.store
    }

    pub fn stats(&self) -> CompressionStats {
        mutex_lock(&self.stats, SOURCE, "stats").clone()
    }

    /// Serialize, maybe compress, and store. `Ok(false)` means the store rejected the write.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let raw = self.encode(key, value)?;
        Ok(self.store.set_raw(key, &raw, ttl).await)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.store.get_raw(key).await {
            Some(raw) => self.decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.store.delete(key).await
    }

    /// Batch write of pre-keyed values sharing one TTL.
    pub async fn set_many<T: Serialize>(
        &self,
        pairs: &[(String, T)],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut encoded = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            encoded.push((key.clone(), self.encode(key, value)?));
        }
        Ok(self.store.mset_raw(&encoded, Some(ttl)).await)
    }

    /// Batch read. Entries that fail to decode are logged and reported as absent.
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        let raws = self.store.mget_raw(keys).await;
        keys.iter()
            .zip(raws)
            .map(|(key, raw)| {
                let raw = raw?;
                match self.decode(key, &raw) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!(target_module = SOURCE, key = %key, error = %err, "Dropping undecodable batch entry");
                        None
                    }
                }
            })
            .collect()
    }

    pub async fn entry(&self, key: &str) -> Result<Option<CacheEntry<serde_json::Value>>, CacheError> {
        let Some(raw) = self.store.get_raw(key).await else {
            return Ok(None);
        };
        let ttl = self.store.ttl(key).await;
        let size = raw.len();
        let (compressed, inserted_at) = match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => (
                envelope.compressed,
                envelope.stored_at_ms.and_then(|ms| {
                    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
                }),
            ),
            Err(_) => (false, None),
        };
        let value = self.decode(key, &raw)?;
        Ok(Some(CacheEntry {
            key: key.to_string(),
            value,
            inserted_at,
            ttl,
            compressed,
            size,
        }))
    }

    fn encode<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<String, CacheError> {
        let json = serde_json::to_string(value).map_err(|err| CacheError::serialization(key, err))?;
        let original_size = json.len();

        let envelope = match self.try_compress(key, json.as_bytes()) {
            Outcome::Compressed(bytes, metrics) => Envelope {
                data: STANDARD.encode(bytes),
                compressed: true,
                metrics: Some(metrics),
                stored_at_ms: Some(unix_millis()),
            },
            Outcome::TooSmall | Outcome::Ineffective | Outcome::Failed => Envelope {
                data: json,
                compressed: false,
                metrics: None,
                stored_at_ms: Some(unix_millis()),
            },
        };

        let raw = serde_json::to_string(&envelope).map_err(|err| CacheError::serialization(key, err))?;
        self.record_write(original_size, raw.len());
        Ok(raw)
    }

    fn try_compress(&self, key: &str, input: &[u8]) -> Outcome {
        if !self.config.enabled || input.len() < self.config.min_size {
            self.bump(|stats| stats.skipped_small += 1);
            return Outcome::TooSmall;
        }

        let started = Instant::now();
        let compressed = match self.compressor.compress(input) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    target_module = SOURCE,
                    key,
                    algorithm = self.compressor.algorithm().as_str(),
                    error = %err,
                    "Compression failed; storing uncompressed"
                );
                self.bump(|stats| stats.failures += 1);
                return Outcome::Failed;
            }
        };

        let stored = base64::encoded_len(compressed.len(), true).unwrap_or(usize::MAX);
        let ratio = stored as f64 / input.len() as f64;
        if ratio >= self.config.max_ratio {
            debug!(target_module = SOURCE, key, ratio, "Compression not beneficial; storing original");
            self.bump(|stats| stats.skipped_ineffective += 1);
            return Outcome::Ineffective;
        }

        histogram!(METRIC_COMPRESSION_RATIO, "algorithm" => self.compressor.algorithm().as_str())
            .record(ratio);
        self.bump(|stats| stats.compressed_writes += 1);
        let metrics = CompressionMetrics {
            original_size: input.len(),
            compressed_size: stored,
            ratio,
            algorithm: self.compressor.algorithm(),
            elapsed_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        };
        Outcome::Compressed(compressed, metrics)
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, raw: &str) -> Result<T, CacheError> {
        let envelope = match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => envelope,
            Err(_) => {
                return serde_json::from_str(raw).map_err(|err| CacheError::serialization(key, err));
            }
        };

        if !envelope.compressed {
            return serde_json::from_str(&envelope.data)
                .map_err(|err| CacheError::serialization(key, err));
        }

        let bytes = STANDARD
            .decode(envelope.data.as_bytes())
            .map_err(|err| CacheError::decompression(key, err))?;
        let algorithm = envelope
            .metrics
            .as_ref()
            .map(|metrics| metrics.algorithm)
            .unwrap_or_else(|| self.compressor.algorithm());
        let codec = if algorithm == self.compressor.algorithm() {
            Arc::clone(&self.compressor)
        } else {
            compressor_for(algorithm, self.config.level)
        };
        let plain = codec
            .decompress(&bytes)
            .map_err(|err| CacheError::decompression(key, err))?;
        serde_json::from_slice(&plain).map_err(|err| CacheError::serialization(key, err))
    }

    fn record_write(&self, original: usize, stored: usize) {
        self.bump(|stats| {
            stats.writes += 1;
            stats.original_bytes += original as u64;
            stats.stored_bytes += stored as u64;
        });
    }

    fn bump(&self, apply: impl FnOnce(&mut CompressionStats)) {
        apply(&mut mutex_lock(&self.stats, SOURCE, "bump"));
    }
}
