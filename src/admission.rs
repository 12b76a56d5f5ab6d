//! The admission gate: identity resolution, policy lookup, and the token
//! bucket engine composed into a single admit/refuse decision.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::{AdmissionConfig, ConfigError};
use crate::engine::TokenBucketEngine;
use crate::identity::{Identity, InvalidIdentity, KeyResolver, RequestMeta};
use crate::policy::PolicyRegistry;
use crate::store::{BucketKey, BucketStore};
use crate::telemetry::{emit_best_effort, AdmissionEvent, EventSink};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A token was consumed; the request proceeds.
    Admitted,
    /// No token was available; the request should be rejected with the
    /// retry hint.
    Refused,
    /// The identity is exempt; the request proceeds without touching any
    /// bucket.
    Bypassed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Admitted => "admitted",
            Outcome::Refused => "refused",
            Outcome::Bypassed => "bypassed",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the gate hands back to the routing layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionDecision {
    pub outcome: Outcome,
    /// How long the client should wait before retrying; present only on
    /// refusal.
    pub retry_after: Option<Duration>,
    /// Tokens left after the decision, best-effort for observability.
    pub tokens_remaining: Option<f64>,
}

impl AdmissionDecision {
    pub fn admitted(tokens_remaining: Option<f64>) -> Self {
        Self { outcome: Outcome::Admitted, retry_after: None, tokens_remaining }
    }

    pub fn refused(retry_after: Duration, tokens_remaining: Option<f64>) -> Self {
        Self { outcome: Outcome::Refused, retry_after: Some(retry_after), tokens_remaining }
    }

    pub fn bypassed() -> Self {
        Self { outcome: Outcome::Bypassed, retry_after: None, tokens_remaining: None }
    }

    /// True when the request may proceed (admitted or bypassed).
    pub fn is_admitted(&self) -> bool {
        self.outcome != Outcome::Refused
    }

    /// Retry hint for a `Retry-After` header: whole seconds, rounded up so a
    /// subsecond hint never renders as zero.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
    }
}

/// Posture when the store is slow, contested beyond reason, or down.
///
/// The right default is domain-dependent: failing open protects user
/// experience, failing closed protects the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackMode {
    /// Admit and log the degradation.
    #[default]
    FailOpen,
    /// Refuse with a short fixed retry hint.
    FailClosed { retry_after: Duration },
}

impl FallbackMode {
    /// Fail closed with the conventional one-second retry hint.
    pub fn fail_closed() -> Self {
        FallbackMode::FailClosed { retry_after: Duration::from_secs(1) }
    }
}

/// Ceiling of the time until one whole token is available.
fn retry_after(tokens: f64, refill_per_sec: f64) -> Duration {
    let deficit = (1.0 - tokens).max(0.0);
    Duration::from_secs((deficit / refill_per_sec).ceil() as u64)
}

/// The admission check entry point.
///
/// One gate serves every endpoint and identity; all shared state lives in the
/// store, so any number of gate instances across any number of processes give
/// identical decisions. Emits exactly one event per completed decision,
/// fallback paths included.
///
/// # Quick start
///
/// ```
/// use std::sync::Arc;
/// use turnstile::{
///     AdmissionGate, KeyResolver, MemoryStore, NullSink, PolicyRegistry, PolicySpec,
///     RequestMeta, Tier, TokenBucketEngine,
/// };
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = PolicyRegistry::new()
///     .with_policy("search", Tier::Free, PolicySpec::new(5, 1.0)?)
///     .with_default(PolicySpec::new(100, 50.0)?);
/// let engine = TokenBucketEngine::new(Arc::new(MemoryStore::new()));
/// let gate = AdmissionGate::new(KeyResolver::default(), registry, engine, NullSink);
///
/// let meta = RequestMeta::new().with_api_key("client-7");
/// let decision = gate.check(&meta, "search").await?;
/// assert!(decision.is_admitted());
/// # Ok(())
/// # }
/// ```
pub struct AdmissionGate<S, E> {
    resolver: KeyResolver,
    registry: PolicyRegistry,
    engine: TokenBucketEngine<S>,
    sink: E,
    fallback: FallbackMode,
    clock: Arc<dyn Clock>,
}

impl<S, E> AdmissionGate<S, E>
where
    S: BucketStore,
    E: EventSink,
    E::Future: Send + 'static,
{
    pub fn new(
        resolver: KeyResolver,
        registry: PolicyRegistry,
        engine: TokenBucketEngine<S>,
        sink: E,
    ) -> Self {
        Self {
            resolver,
            registry,
            engine,
            sink,
            fallback: FallbackMode::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Assembles a gate from configuration. The store and sink stay
    /// caller-supplied so backends can be swapped freely.
    pub fn from_config(
        config: &AdmissionConfig,
        store: Arc<S>,
        sink: E,
    ) -> Result<Self, ConfigError> {
        let resolver = config.build_resolver();
        let registry = config.build_registry()?;
        let mut engine =
            TokenBucketEngine::new(store).with_store_timeout(config.store_timeout());
        if let Some(ttl) = config.bucket_ttl() {
            engine = engine.with_bucket_ttl(ttl);
        }
        Ok(Self::new(resolver, registry, engine, sink).with_fallback(config.fallback_mode()))
    }

    /// Replaces the wall clock, for deterministic tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackMode) -> Self {
        self.fallback = fallback;
        self
    }

    /// The resolver in use; the routing layer reads
    /// [`KeyResolver::api_key_header`] from it.
    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    /// Runs the admission check at the gate clock's current time.
    pub async fn check(
        &self,
        meta: &RequestMeta,
        endpoint: &str,
    ) -> Result<AdmissionDecision, InvalidIdentity> {
        self.check_at(meta, endpoint, self.clock.now_nanos()).await
    }

    /// Runs the admission check at an explicit timestamp.
    ///
    /// Resolution order: identity, bypass short-circuit, policy, atomic
    /// consume. Bypassed identities never touch the store. A missing policy
    /// (no entry, no default) admits unchecked with a warning; store errors,
    /// contention, and timeouts take the configured [`FallbackMode`]. Both
    /// paths mark their event degraded.
    pub async fn check_at(
        &self,
        meta: &RequestMeta,
        endpoint: &str,
        now_nanos: u64,
    ) -> Result<AdmissionDecision, InvalidIdentity> {
        let identity = self.resolver.resolve(meta)?;

        if identity.bypass {
            let decision = AdmissionDecision::bypassed();
            self.emit(&identity, endpoint, &decision, false).await;
            return Ok(decision);
        }

        let spec = match self.registry.lookup(endpoint, identity.tier) {
            Ok(spec) => *spec,
            Err(e) => {
                tracing::warn!(error = %e, "admitting unchecked: no policy for endpoint");
                let decision = AdmissionDecision::admitted(None);
                self.emit(&identity, endpoint, &decision, true).await;
                return Ok(decision);
            }
        };

        let key = BucketKey::new(identity.value.clone(), endpoint, identity.tier);
        let decision = match self.engine.try_consume(&key, &spec, now_nanos).await {
            Ok(out) if out.admitted => AdmissionDecision::admitted(Some(out.state.tokens)),
            Ok(out) => AdmissionDecision::refused(
                retry_after(out.state.tokens, spec.refill_per_sec()),
                Some(out.state.tokens),
            ),
            Err(err) => {
                tracing::warn!(
                    key = %key,
                    error = %err,
                    fallback = ?self.fallback,
                    "store degraded, applying fallback"
                );
                let decision = match self.fallback {
                    FallbackMode::FailOpen => AdmissionDecision::admitted(None),
                    FallbackMode::FailClosed { retry_after } => {
                        AdmissionDecision::refused(retry_after, None)
                    }
                };
                self.emit(&identity, endpoint, &decision, true).await;
                return Ok(decision);
            }
        };

        self.emit(&identity, endpoint, &decision, false).await;
        Ok(decision)
    }

    async fn emit(
        &self,
        identity: &Identity,
        endpoint: &str,
        decision: &AdmissionDecision,
        degraded: bool,
    ) {
        let event = AdmissionEvent {
            identity_kind: identity.kind,
            endpoint: endpoint.to_owned(),
            tier: identity.tier,
            outcome: decision.outcome,
            tokens_remaining: decision.tokens_remaining,
            degraded,
        };
        emit_best_effort(self.sink.clone(), event).await;
    }
}
