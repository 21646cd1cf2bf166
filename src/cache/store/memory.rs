use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::time::Instant;

use super::{KvBackend, StoreError, StoreResult};
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store::memory";

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// A TTL too large for the clock saturates to "never expires".
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

/// In-process backend with Redis expiry semantics, driven by the tokio clock.
///
/// Expired slots are invisible to every read even before they are reclaimed.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    slots: RwLock<HashMap<String, Slot>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str, now: Instant) -> Option<String> {
        let slots = rw_read(&self.slots, SOURCE, "get");
        slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone())
    }

    fn purge_expired(&self, now: Instant) {
        let mut slots = rw_write(&self.slots, SOURCE, "purge");
        slots.retain(|_, slot| slot.is_live(now));
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.live_value(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let slot = Slot {
            value: value.to_string(),
            expires_at: deadline(Instant::now(), ttl),
        };
        rw_write(&self.slots, SOURCE, "set").insert(key.to_string(), slot);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let now = Instant::now();
        let mut slots = rw_write(&self.slots, SOURCE, "delete");
        let removed = keys
            .iter()
            .filter_map(|key| slots.remove(key))
            .filter(|slot| slot.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        self.purge_expired(now);
        let matcher = glob_to_regex(pattern)?;
        let slots = rw_read(&self.slots, SOURCE, "keys");
        let mut keys: Vec<String> = slots
            .keys()
            .filter(|key| matcher.is_match(key))
            .cloned()
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.live_value(key, Instant::now()).is_some())
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let now = Instant::now();
        Ok(keys.iter().map(|key| self.live_value(key, now)).collect())
    }

    async fn mset(&self, pairs: &[(String, String)], ttl: Duration) -> StoreResult<()> {
        let expires_at = deadline(Instant::now(), ttl);
        let mut slots = rw_write(&self.slots, SOURCE, "mset");
        for (key, value) in pairs {
            slots.insert(
                key.clone(),
                Slot {
                    value: value.clone(),
                    expires_at,
                },
            );
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let now = Instant::now();
        let mut slots = rw_write(&self.slots, SOURCE, "incr");
        let slot = slots
            .entry(key.to_string())
            .and_modify(|slot| {
                if !slot.is_live(now) {
                    *slot = Slot {
                        value: "0".to_string(),
                        expires_at: None,
                    };
                }
            })
            .or_insert_with(|| Slot {
                value: "0".to_string(),
                expires_at: None,
            });

        let current: i64 = slot.value.parse().map_err(|_| StoreError::NotAnInteger {
            key: key.to_string(),
        })?;
        let next = current
            .checked_add(1)
            .ok_or_else(|| StoreError::command("incr", "increment would overflow"))?;
        slot.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut slots = rw_write(&self.slots, SOURCE, "expire");
        match slots.get_mut(key).filter(|slot| slot.is_live(now)) {
            Some(slot) => {
                slot.expires_at = deadline(now, ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        let slots = rw_read(&self.slots, SOURCE, "ttl");
        Ok(slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .and_then(|slot| slot.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now)))
    }

    async fn flush_all(&self) -> StoreResult<()> {
        rw_write(&self.slots, SOURCE, "flush_all").clear();
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Translate a Redis glob (`*`, `?`, `[...]`, `\x`) into an anchored regex.
pub(crate) fn glob_to_regex(pattern: &str) -> StoreResult<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    out.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                out.push(']');
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|err| StoreError::command("keys", err))
}
