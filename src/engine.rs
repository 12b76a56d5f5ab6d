//! The token bucket engine: atomic consume of one token against the shared
//! store, with lazy refill computed from elapsed wall time.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::policy::PolicySpec;
use crate::store::{BucketKey, BucketState, BucketStore, Versioned};

/// Budget for the whole consume operation, all store round-trips included.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// Optimistic-update retries before giving up on a contested key.
pub const DEFAULT_CAS_ATTEMPTS: usize = 16;

/// Failure of a consume operation. Every variant is a transient store-side
/// condition; the admission layer maps all of them to its fallback posture.
#[derive(Debug, Clone)]
pub enum ConsumeError<E> {
    /// The operation exceeded the configured store timeout.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The optimistic update kept losing races on a contested key.
    Contention { attempts: usize },
    /// The store itself failed.
    Store(E),
}

impl<E: fmt::Display> fmt::Display for ConsumeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "store operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::Contention { attempts } => {
                write!(f, "bucket update contested for {} attempts", attempts)
            }
            Self::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ConsumeError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ConsumeError<E> {
    /// Check if this error is due to timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to CAS contention.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }

    /// Access timeout details as (elapsed, limit).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// Borrow the store error if present.
    pub fn as_store(&self) -> Option<&E> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of [`TokenBucketEngine::try_consume`]: whether the token was
/// granted, and the bucket state as persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumed {
    pub admitted: bool,
    pub state: BucketState,
}

/// Performs the atomic "try consume one token" against a [`BucketStore`].
///
/// Refill is continuous and lazy: computed on demand from elapsed wall time,
/// so no background timer runs anywhere in the fleet. The fetch-modify-persist
/// sequence is linearized per key by the store's compare-and-swap; this engine
/// retries a bounded number of times when the swap loses a race, and bounds
/// the whole operation with one timeout.
pub struct TokenBucketEngine<S> {
    store: Arc<S>,
    store_timeout: Duration,
    bucket_ttl: Option<Duration>,
    cas_attempts: usize,
}

impl<S> TokenBucketEngine<S>
where
    S: BucketStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            bucket_ttl: None,
            cas_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    /// Sets the timeout bounding the whole consume operation.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Sets an idle-eviction TTL passed through to the store on every write.
    pub fn with_bucket_ttl(mut self, ttl: Duration) -> Self {
        self.bucket_ttl = Some(ttl);
        self
    }

    /// Sets how many optimistic-update races to tolerate before failing.
    pub fn with_cas_attempts(mut self, attempts: usize) -> Self {
        self.cas_attempts = attempts.max(1);
        self
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Atomically consume one token from the bucket at `key`.
    ///
    /// `now_nanos` is the caller's wall-clock timestamp; passing it in keeps
    /// the math deterministic under test. A missing bucket is synthesized
    /// full, so the first burst is always allowed up to capacity. On refusal
    /// the partial refill credit is kept and the refill timestamp still
    /// advances.
    pub async fn try_consume(
        &self,
        key: &BucketKey,
        spec: &PolicySpec,
        now_nanos: u64,
    ) -> Result<Consumed, ConsumeError<S::Error>> {
        let start = Instant::now();
        match tokio::time::timeout(self.store_timeout, self.consume_inner(key, spec, now_nanos))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ConsumeError::Timeout {
                elapsed: start.elapsed(),
                timeout: self.store_timeout,
            }),
        }
    }

    async fn consume_inner(
        &self,
        key: &BucketKey,
        spec: &PolicySpec,
        now_nanos: u64,
    ) -> Result<Consumed, ConsumeError<S::Error>> {
        let capacity = f64::from(spec.capacity());
        let rate = spec.refill_per_sec();

        for attempt in 1..=self.cas_attempts {
            let (tokens, last_refill, expected) =
                match self.store.fetch(key).await.map_err(ConsumeError::Store)? {
                    Some(Versioned { state, version }) => {
                        (state.tokens, state.last_refill_nanos, Some(version))
                    }
                    // First sighting of this key: full bucket.
                    None => (capacity, now_nanos, None),
                };

            let elapsed_secs = now_nanos.saturating_sub(last_refill) as f64 / 1_000_000_000.0;
            let refilled = (tokens + elapsed_secs * rate).min(capacity);

            let (admitted, remaining) =
                if refilled >= 1.0 { (true, refilled - 1.0) } else { (false, refilled) };
            let next = BucketState::new(remaining, now_nanos);

            if self
                .store
                .compare_and_swap(key, expected, next, self.bucket_ttl)
                .await
                .map_err(ConsumeError::Store)?
            {
                return Ok(Consumed { admitted, state: next });
            }
            tracing::debug!(key = %key, attempt, "bucket update raced, refetching");
        }

        Err(ConsumeError::Contention { attempts: self.cas_attempts })
    }
}
