#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Turnstile 🎟️
//!
//! Distributed token-bucket request admission for async Rust: consistent
//! per-client rate limits across any number of stateless instances sharing
//! one store.
//!
//! ## Features
//!
//! - **Token buckets in a shared store** with atomic per-key compare-and-swap
//!   consume and lazy refill from elapsed wall time (no background timers)
//! - **Tiered policies** per (endpoint class, tier) with a global default
//! - **Identity resolution** from API key, source address, or both, with an
//!   admin bypass allow-list
//! - **Fail-open / fail-closed fallback** behind a bounded store timeout
//! - **Fire-and-forget telemetry** through `tower` sinks that never block the
//!   request path
//! - **Tower middleware** guarding any service with the 429 / `Retry-After`
//!   contract
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use turnstile::{
//!     AdmissionGate, KeyResolver, MemoryStore, NullSink, PolicyRegistry, PolicySpec,
//!     RequestMeta, Tier, TokenBucketEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = PolicyRegistry::new()
//!         .with_policy("search", Tier::Free, PolicySpec::new(5, 1.0)?)
//!         .with_default(PolicySpec::new(100, 50.0)?);
//!     let engine = TokenBucketEngine::new(Arc::new(MemoryStore::new()));
//!     let gate = AdmissionGate::new(KeyResolver::default(), registry, engine, NullSink);
//!
//!     let decision = gate
//!         .check(&RequestMeta::new().with_api_key("client-7"), "search")
//!         .await?;
//!     assert!(decision.is_admitted());
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod clock;
pub mod config;
pub mod engine;
pub mod identity;
pub mod middleware;
pub mod policy;
pub mod store;
pub mod telemetry;

// Re-exports
pub use admission::{AdmissionDecision, AdmissionGate, FallbackMode, Outcome};
pub use clock::{Clock, SystemClock};
pub use config::{AdmissionConfig, ConfigError, FallbackConfig, FallbackKind, PolicyRule};
pub use engine::{ConsumeError, Consumed, TokenBucketEngine};
pub use identity::{
    Identity, IdentityKind, InvalidIdentity, KeyResolver, RequestMeta, ResolverMode, Tier,
};
pub use middleware::{
    AdmissionLayer, AdmissionRequest, AdmissionService, GateRejection, REASON_RATE_LIMITED,
    RETRY_AFTER_HEADER, STATUS_TOO_MANY_REQUESTS,
};
pub use policy::{InvalidPolicy, PolicyRegistry, PolicySpec, UnknownEndpoint};
pub use store::{BucketKey, BucketState, BucketStore, MemoryStore, Versioned};
pub use telemetry::{
    AdmissionEvent, BoundedSink, EventSink, LogSink, MemorySink, NullSink, StreamingSink,
};
