//! Static configuration for the admission gate.
//!
//! Policies, tiers, the bypass list, and the fallback posture are read once
//! at startup; there is no live reload. [`AdmissionConfig::from_json`] parses
//! and validates, [`crate::AdmissionGate::from_config`] assembles the gate.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::FallbackMode;
use crate::identity::{KeyResolver, ResolverMode, Tier, DEFAULT_API_KEY_HEADER};
use crate::policy::{InvalidPolicy, PolicyRegistry, PolicySpec};

/// Errors from parsing or validating configuration.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The input was not valid JSON for this schema.
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A policy entry failed validation.
    #[error("invalid policy for endpoint '{endpoint}' tier '{tier}': {source}")]
    InvalidPolicy {
        endpoint: String,
        tier: Tier,
        #[source]
        source: InvalidPolicy,
    },
    /// The default policy failed validation.
    #[error("invalid default policy: {0}")]
    InvalidDefault(#[source] InvalidPolicy),
    /// Neither per-endpoint policies nor a default were given.
    #[error("no policies and no default policy configured")]
    NoPolicies,
}

/// One bucket rule: burst capacity plus steady refill rate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Max tokens the bucket holds; zero blocks the endpoint entirely.
    pub capacity: u32,
    /// Tokens per second.
    pub refill_per_sec: f64,
}

impl PolicyRule {
    fn to_spec(self) -> Result<PolicySpec, InvalidPolicy> {
        PolicySpec::new(self.capacity, self.refill_per_sec)
    }
}

/// Posture when the store is slow or unreachable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    /// Admit and log the degradation.
    #[default]
    FailOpen,
    /// Refuse with `retry_after_secs`.
    FailClosed,
}

/// Fallback configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub mode: FallbackKind,
    /// Retry hint returned while failing closed.
    #[serde(default = "default_fallback_retry_secs")]
    pub retry_after_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { mode: FallbackKind::default(), retry_after_secs: default_fallback_retry_secs() }
    }
}

fn default_fallback_retry_secs() -> u64 {
    1
}

fn default_api_key_header() -> String {
    DEFAULT_API_KEY_HEADER.to_owned()
}

fn default_store_timeout_ms() -> u64 {
    50
}

/// The whole configuration surface consumed by the gate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Header the routing layer reads the API key from.
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    /// How identities are derived from request metadata.
    #[serde(default)]
    pub resolver: ResolverMode,
    /// API key → tier table. Unknown keys are free tier.
    #[serde(default)]
    pub tiers: HashMap<String, Tier>,
    /// Admin/internal identities exempt from rate limiting.
    #[serde(default)]
    pub bypass: Vec<String>,
    /// endpoint class → tier → rule.
    #[serde(default)]
    pub policies: HashMap<String, HashMap<Tier, PolicyRule>>,
    /// Rule applied when no (endpoint, tier) entry matches.
    #[serde(default)]
    pub default_policy: Option<PolicyRule>,
    #[serde(default)]
    pub fallback: FallbackConfig,
    /// Budget for the whole store operation, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Idle-eviction TTL for bucket entries; absent means buckets persist.
    #[serde(default)]
    pub bucket_ttl_secs: Option<u64>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            api_key_header: default_api_key_header(),
            resolver: ResolverMode::default(),
            tiers: HashMap::new(),
            bypass: Vec::new(),
            policies: HashMap::new(),
            default_policy: None,
            fallback: FallbackConfig::default(),
            store_timeout_ms: default_store_timeout_ms(),
            bucket_ttl_secs: None,
        }
    }
}

impl AdmissionConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates policy math and that at least one policy path exists, so
    /// misconfiguration surfaces at startup rather than per request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policies.is_empty() && self.default_policy.is_none() {
            return Err(ConfigError::NoPolicies);
        }
        for (endpoint, tiers) in &self.policies {
            for (tier, rule) in tiers {
                rule.to_spec().map_err(|source| ConfigError::InvalidPolicy {
                    endpoint: endpoint.clone(),
                    tier: *tier,
                    source,
                })?;
            }
        }
        if let Some(rule) = self.default_policy {
            rule.to_spec().map_err(ConfigError::InvalidDefault)?;
        }
        Ok(())
    }

    /// Builds the resolver described by this configuration.
    pub fn build_resolver(&self) -> KeyResolver {
        KeyResolver::new(self.resolver)
            .with_api_key_header(self.api_key_header.clone())
            .with_tiers(self.tiers.clone())
            .with_bypass_list(self.bypass.iter().cloned())
    }

    /// Builds the policy registry described by this configuration.
    pub fn build_registry(&self) -> Result<PolicyRegistry, ConfigError> {
        let mut registry = PolicyRegistry::new();
        for (endpoint, tiers) in &self.policies {
            for (tier, rule) in tiers {
                let spec = rule.to_spec().map_err(|source| ConfigError::InvalidPolicy {
                    endpoint: endpoint.clone(),
                    tier: *tier,
                    source,
                })?;
                registry = registry.with_policy(endpoint.clone(), *tier, spec);
            }
        }
        if let Some(rule) = self.default_policy {
            registry = registry.with_default(rule.to_spec().map_err(ConfigError::InvalidDefault)?);
        }
        Ok(registry)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn bucket_ttl(&self) -> Option<Duration> {
        self.bucket_ttl_secs.map(Duration::from_secs)
    }

    pub fn fallback_mode(&self) -> FallbackMode {
        match self.fallback.mode {
            FallbackKind::FailOpen => FallbackMode::FailOpen,
            FallbackKind::FailClosed => FallbackMode::FailClosed {
                retry_after: Duration::from_secs(self.fallback.retry_after_secs),
            },
        }
    }
}
