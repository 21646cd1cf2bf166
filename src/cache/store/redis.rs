use std::time::Duration;

use ::redis::{AsyncCommands, Client, RedisError, aio::MultiplexedConnection};
use async_trait::async_trait;
use tracing::info;

use super::{KvBackend, StoreError, StoreResult};

/// Redis backend over a multiplexed async connection.
///
/// Every key is namespaced with `prefix`; the prefix is stripped again from `KEYS` results.
#[derive(Clone)]
pub struct RedisBackend {
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisBackend {
    pub async fn connect(url: &str, prefix: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|err| StoreError::Connection(err.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::Connection(err.to_string()))?;

        info!(
            target = "feedcache::store",
            prefix, "Connected to redis cache store"
        );

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn keys_with_prefix(&self, keys: &[String]) -> Vec<String> {
        keys.iter().map(|key| self.key(key)).collect()
    }

    fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

fn failed(command: &'static str) -> impl FnOnce(RedisError) -> StoreError {
    move |err| {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::command(command, err)
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KvBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.conn().get(self.key(key)).await.map_err(failed("GET"))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.conn()
            .pset_ex(self.key(key), value, millis(ttl))
            .await
            .map_err(failed("PSETEX"))
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.conn()
            .del(self.keys_with_prefix(keys))
            .await
            .map_err(failed("DEL"))
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let found: Vec<String> = self
            .conn()
            .keys(self.key(pattern))
            .await
            .map_err(failed("KEYS"))?;
        Ok(found
            .iter()
            .map(|key| self.strip(key).to_string())
            .collect())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.conn()
            .exists(self.key(key))
            .await
            .map_err(failed("EXISTS"))
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = ::redis::cmd("MGET");
        for key in keys {
            cmd.arg(self.key(key));
        }
        cmd.query_async(&mut self.conn())
            .await
            .map_err(failed("MGET"))
    }

    async fn mset(&self, pairs: &[(String, String)], ttl: Duration) -> StoreResult<()> {
        let ttl = millis(ttl);
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for (key, value) in pairs {
            pipe.pset_ex(self.key(key), value, ttl).ignore();
        }
        pipe.query_async(&mut self.conn())
            .await
            .map_err(failed("MULTI/PSETEX"))
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.conn()
            .incr(self.key(key), 1_i64)
            .await
            .map_err(|err| match err.kind() {
                ::redis::ErrorKind::ResponseError => StoreError::NotAnInteger {
                    key: key.to_string(),
                },
                _ => failed("INCR")(err),
            })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let ttl = i64::try_from(millis(ttl)).unwrap_or(i64::MAX);
        self.conn()
            .pexpire(self.key(key), ttl)
            .await
            .map_err(failed("PEXPIRE"))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let remaining: i64 = self
            .conn()
            .pttl(self.key(key))
            .await
            .map_err(failed("PTTL"))?;
        // -2: missing key, -1: no expiry.
        Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
    }

    async fn flush_all(&self) -> StoreResult<()> {
        ::redis::cmd("FLUSHDB")
            .query_async(&mut self.conn())
            .await
            .map_err(failed("FLUSHDB"))
    }

    async fn ping(&self) -> StoreResult<()> {
        let reply: String = ::redis::cmd("PING")
            .query_async(&mut self.conn())
            .await
            .map_err(failed("PING"))?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::command("PING", format!("unexpected reply `{reply}`")))
        }
    }
}
