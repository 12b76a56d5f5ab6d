//! Bucket policies and the static (endpoint, tier) registry they live in.

use std::collections::HashMap;

use crate::identity::Tier;

/// Policy parameters rejected at construction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidPolicy {
    #[error("refill rate must be finite and positive, got {0}")]
    Rate(f64),
}

/// Token bucket parameters for one (endpoint, tier) pairing.
///
/// `capacity` is the burst ceiling; `refill_per_sec` the steady-state rate.
/// A capacity of zero is a blocked policy: every request is refused.
/// Immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicySpec {
    capacity: u32,
    refill_per_sec: f64,
}

impl PolicySpec {
    /// Validates and builds a policy. The rate must be finite and positive;
    /// the rate is bounded above zero, never below it.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Result<Self, InvalidPolicy> {
        if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
            return Err(InvalidPolicy::Rate(refill_per_sec));
        }
        Ok(Self { capacity, refill_per_sec })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    /// Nanoseconds for one whole token to accrue at the configured rate.
    pub fn refill_interval_nanos(&self) -> u64 {
        (1e9 / self.refill_per_sec) as u64
    }
}

/// No policy matched and no default was configured.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no policy for endpoint '{endpoint}' tier '{tier}' and no default configured")]
pub struct UnknownEndpoint {
    pub endpoint: String,
    pub tier: Tier,
}

/// Static (endpoint class, tier) → [`PolicySpec`] table with an optional
/// global default.
///
/// Loaded once at startup and read-only afterwards, so it is shared across
/// tasks without locking.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    rules: HashMap<(String, Tier), PolicySpec>,
    default: Option<PolicySpec>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a policy for (endpoint, tier), replacing any existing entry.
    pub fn with_policy(mut self, endpoint: impl Into<String>, tier: Tier, spec: PolicySpec) -> Self {
        let endpoint = endpoint.into();
        if self
            .rules
            .insert((endpoint.clone(), tier), spec)
            .is_some()
        {
            tracing::warn!(endpoint = %endpoint, tier = %tier, "replacing existing policy");
        }
        self
    }

    /// Sets the fallback policy used when no (endpoint, tier) entry matches.
    pub fn with_default(mut self, spec: PolicySpec) -> Self {
        self.default = Some(spec);
        self
    }

    pub fn default_policy(&self) -> Option<&PolicySpec> {
        self.default.as_ref()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolves the policy for an endpoint class and tier, falling back to the
    /// default when no exact entry exists.
    pub fn lookup(&self, endpoint: &str, tier: Tier) -> Result<&PolicySpec, UnknownEndpoint> {
        self.rules
            .get(&(endpoint.to_owned(), tier))
            .or(self.default.as_ref())
            .ok_or_else(|| UnknownEndpoint { endpoint: endpoint.to_owned(), tier })
    }
}
