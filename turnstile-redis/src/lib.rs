//! Redis-backed [`BucketStore`] for `turnstile` (companion crate).
//! Bring your own `redis::aio::MultiplexedConnection`; each bucket is a hash at
//! `prefix:<endpoint>:<tier>:<identity>` with fields `t` (tokens), `ts`
//! (last refill, nanos), and `v` (version).
//!
//! The compare-and-swap runs as a Lua script, so the version check and the
//! write are one atomic step on the server. That is what lets many processes
//! share one bucket without client-side locking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use turnstile::{BucketKey, BucketState, BucketStore, Versioned};

/// Errors from the Redis store.
#[derive(Debug, thiserror::Error)]
pub enum RedisStoreError {
    /// The key prefix failed validation at construction.
    #[error("invalid key prefix: {0}")]
    InvalidPrefix(String),
    /// The Redis command failed.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

// Compares the stored version against ARGV[1] ("" means "create only"),
// then writes the new state and bumps the version in the same script call.
// ARGV[4] is a PEXPIRE lifetime in milliseconds, 0 for none.
const CAS_SCRIPT: &str = r#"
local v = redis.call('HGET', KEYS[1], 'v')
if ARGV[1] == '' then
  if v then return 0 end
  v = 0
else
  if not v or v ~= ARGV[1] then return 0 end
end
redis.call('HSET', KEYS[1], 't', ARGV[2], 'ts', ARGV[3], 'v', v + 1)
if tonumber(ARGV[4]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[4])
end
return 1
"#;

/// A [`BucketStore`] on shared Redis.
#[derive(Clone)]
pub struct RedisStore {
    prefix: String,
    conn: MultiplexedConnection,
    script: Arc<Script>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("conn", &"<redis::aio::MultiplexedConnection>")
            .finish()
    }
}

fn normalize_prefix(prefix: &str) -> Result<String, RedisStoreError> {
    // Normalize: trim whitespace and strip trailing separators
    let p = prefix.trim().trim_end_matches(':').to_string();

    if p.is_empty() {
        return Err(RedisStoreError::InvalidPrefix("prefix cannot be empty".to_string()));
    }
    if p.chars().any(|c| c.is_control()) {
        return Err(RedisStoreError::InvalidPrefix(
            "prefix cannot contain control characters".to_string(),
        ));
    }
    Ok(p)
}

impl RedisStore {
    /// Create a store using an existing multiplexed connection; buckets live at
    /// `prefix:<bucket key>`.
    ///
    /// # Errors
    /// Returns `Err` if the prefix is empty after trimming or contains control
    /// characters.
    pub fn new(
        prefix: impl Into<String>,
        conn: MultiplexedConnection,
    ) -> Result<Self, RedisStoreError> {
        let prefix = normalize_prefix(&prefix.into())?;
        Ok(Self { prefix, conn, script: Arc::new(Script::new(CAS_SCRIPT)) })
    }

    fn entry_key(&self, key: &BucketKey) -> String {
        format!("{}:{}", self.prefix, key.storage_key())
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    type Error = RedisStoreError;

    async fn fetch(&self, key: &BucketKey) -> Result<Option<Versioned>, Self::Error> {
        let mut conn = self.conn.clone();
        let entry_key = self.entry_key(key);
        let (tokens, ts, version): (Option<f64>, Option<u64>, Option<u64>) = redis::cmd("HMGET")
            .arg(&entry_key)
            .arg("t")
            .arg("ts")
            .arg("v")
            .query_async(&mut conn)
            .await?;

        match (tokens, ts, version) {
            (Some(tokens), Some(ts), Some(version)) => {
                Ok(Some(Versioned { state: BucketState::new(tokens, ts), version }))
            }
            (None, None, None) => Ok(None),
            _ => {
                tracing::warn!(
                    target: "turnstile::redis",
                    key = %entry_key,
                    "partial bucket hash in redis, treating as absent"
                );
                Ok(None)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: Option<u64>,
        next: BucketState,
        ttl: Option<Duration>,
    ) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let expected = expected.map(|v| v.to_string()).unwrap_or_default();
        let ttl_ms = ttl.map_or(0, |t| t.as_millis() as u64);

        let landed: i64 = self
            .script
            .key(self.entry_key(key))
            .arg(expected)
            .arg(next.tokens)
            .arg(next.last_refill_nanos)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(landed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_trimmed_and_stripped() {
        assert_eq!(normalize_prefix("  rl::  ").unwrap(), "rl");
        assert_eq!(normalize_prefix("turnstile").unwrap(), "turnstile");
        assert_eq!(normalize_prefix("a:b:").unwrap(), "a:b");
        // A trailing newline is whitespace and trims away like any other.
        assert_eq!(normalize_prefix("rl\n").unwrap(), "rl");
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(matches!(normalize_prefix(""), Err(RedisStoreError::InvalidPrefix(_))));
        assert!(matches!(normalize_prefix("  :: "), Err(RedisStoreError::InvalidPrefix(_))));
    }

    #[test]
    fn interior_control_characters_are_rejected() {
        assert!(matches!(normalize_prefix("r\nl"), Err(RedisStoreError::InvalidPrefix(_))));
        assert!(matches!(normalize_prefix("r\0l"), Err(RedisStoreError::InvalidPrefix(_))));
    }
}
