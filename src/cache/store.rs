//! Cache backend abstraction and the in-process implementation.
//!
//! # Design Decisions
//! - The gateway only needs get / set-with-ttl / scan-delete, so the trait stays that small
//! - Integers are stored as decimal text, the way a Redis backend keeps them
//! - Expired entries are dropped lazily on access and during scans, and every
//!   `SWEEP_EVERY` writes a full sweep reclaims keys that are never read again

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("value at {key:?} is not an integer")]
    NotAnInteger { key: String },

    #[error("invalid key pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// A value written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreValue {
    Bytes(Bytes),
    Int(i64),
}

impl From<Bytes> for StoreValue {
    fn from(value: Bytes) -> Self {
        StoreValue::Bytes(value)
    }
}

impl From<i64> for StoreValue {
    fn from(value: i64) -> Self {
        StoreValue::Int(value)
    }
}

/// Key/value backend used by the cache layer. Every call may fail; callers fail open.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn get_int(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Store `value` under `key`. A zero `ttl` keeps the value until flushed.
    async fn set(&self, key: &str, value: StoreValue, ttl: Duration) -> Result<(), StoreError>;

    /// Expire every key matching the glob `pattern` (`*` and `?`). Returns the number removed.
    async fn flush(&self, pattern: &str) -> Result<usize, StoreError>;

    async fn flush_all(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Writes between two sweeps of expired entries.
const SWEEP_EVERY: u64 = 128;

/// Process-local store over a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn live(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        None
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.live(key))
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Some)
                .ok_or_else(|| StoreError::NotAnInteger {
                    key: key.to_string(),
                }),
        }
    }

    async fn set(&self, key: &str, value: StoreValue, ttl: Duration) -> Result<(), StoreError> {
        let value = match value {
            StoreValue::Bytes(bytes) => bytes,
            StoreValue::Int(n) => Bytes::from(n.to_string()),
        };
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "Swept expired cache entries");
            }
        }
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn flush(&self, pattern: &str) -> Result<usize, StoreError> {
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            if entry.is_expired(now) {
                return false;
            }
            if matcher.is_match(key) {
                removed += 1;
                return false;
            }
            true
        });
        Ok(removed)
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }
}

/// Translate a Redis-style glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|e| StoreError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
