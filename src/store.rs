//! Bucket state persistence: the shared-store contract and an in-memory
//! reference implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::identity::Tier;

/// Uniquely addresses one bucket's state in the store.
///
/// Two requests with the same key always observe and mutate the same bucket;
/// different keys are fully independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub identity: String,
    pub endpoint: String,
    pub tier: Tier,
}

impl BucketKey {
    pub fn new(identity: impl Into<String>, endpoint: impl Into<String>, tier: Tier) -> Self {
        Self { identity: identity.into(), endpoint: endpoint.into(), tier }
    }

    /// Store-side rendering of the key.
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.endpoint, self.tier, self.identity)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.endpoint, self.tier, self.identity)
    }
}

/// Persisted per-key bucket state.
///
/// `tokens` stays within `0.0..=capacity`; `last_refill_nanos` is wall-clock
/// nanos shared by every instance through the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_nanos: u64,
}

impl BucketState {
    pub fn new(tokens: f64, last_refill_nanos: u64) -> Self {
        Self { tokens, last_refill_nanos }
    }
}

/// A state snapshot paired with the opaque version token guarding its
/// replacement. Versions are never reissued within a store's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Versioned {
    pub state: BucketState,
    pub version: u64,
}

/// Abstract storage for bucket state.
///
/// The store is the single shared source of truth across all instances, so it
/// must supply an atomic compare-and-swap per key; client-side locking cannot
/// substitute for it across processes. Backends range from the in-memory
/// [`MemoryStore`] to distributed stores like `turnstile-redis`.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the current state and version for a key, `None` if absent.
    async fn fetch(&self, key: &BucketKey) -> Result<Option<Versioned>, Self::Error>;

    /// Replace a key's state if its version still matches `expected`.
    ///
    /// * `expected`: version observed by the preceding [`fetch`](Self::fetch);
    ///   `None` means "create only if the key is absent".
    /// * `ttl`: optional idle-eviction lifetime for the entry. Safe because a
    ///   missing bucket is reinterpreted as a fresh full bucket on next access.
    ///
    /// Returns `Ok(true)` if the write landed, `Ok(false)` if another caller
    /// got there first (refetch and retry).
    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: Option<u64>,
        next: BucketState,
        ttl: Option<Duration>,
    ) -> Result<bool, Self::Error>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: BucketState,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// In-memory [`BucketStore`].
///
/// Single-process only; shared state across a fleet needs a remote backend.
/// Version tokens come from a monotonic counter, so a deleted-and-recreated
/// key can never satisfy a stale `expected`. TTL expiry is lazy: expired
/// entries read as absent.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_version: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries, for inspection in tests.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    type Error = std::convert::Infallible;

    async fn fetch(&self, key: &BucketKey) -> Result<Option<Versioned>, Self::Error> {
        let storage_key = key.storage_key();
        let now = Instant::now();
        let mut guard = self.entries.lock().unwrap();
        match guard.get(&storage_key) {
            Some(entry) if entry.live(now) => {
                Ok(Some(Versioned { state: entry.state, version: entry.version }))
            }
            Some(_) => {
                guard.remove(&storage_key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: Option<u64>,
        next: BucketState,
        ttl: Option<Duration>,
    ) -> Result<bool, Self::Error> {
        let storage_key = key.storage_key();
        let now = Instant::now();
        let mut guard = self.entries.lock().unwrap();

        let current = guard.get(&storage_key).filter(|e| e.live(now)).map(|e| e.version);
        if current != expected {
            return Ok(false);
        }

        let version = self.next_version.fetch_add(1, Ordering::Relaxed) + 1;
        guard.insert(
            storage_key,
            Entry { state: next, version, expires_at: ttl.map(|t| now + t) },
        );
        Ok(true)
    }
}
