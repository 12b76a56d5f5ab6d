//! Tower middleware that runs the admission gate in front of any service.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower_layer::Layer;
use tower_service::Service;

use crate::admission::AdmissionGate;
use crate::identity::{InvalidIdentity, RequestMeta};
use crate::store::BucketStore;
use crate::telemetry::EventSink;

/// Status code a refusal maps to.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
/// Response header carrying the retry hint, integer seconds rounded up.
pub const RETRY_AFTER_HEADER: &str = "Retry-After";
/// Stable machine-readable reason code for refusal response bodies.
pub const REASON_RATE_LIMITED: &str = "RATE_LIMITED";

/// How a request type exposes its admission inputs to the middleware.
pub trait AdmissionRequest {
    /// Identity-extraction inputs for the resolver.
    fn request_meta(&self) -> RequestMeta;
    /// Endpoint class label used for policy lookup.
    fn endpoint_class(&self) -> &str;
}

/// Error surface of [`AdmissionService`].
///
/// The HTTP collaborator turns `RateLimited` into a
/// [`STATUS_TOO_MANY_REQUESTS`] response with [`RETRY_AFTER_HEADER`] and a
/// [`REASON_RATE_LIMITED`] body; `InvalidIdentity` is a protocol-level
/// rejection, not a 429.
#[derive(Debug)]
pub enum GateRejection<E> {
    /// Refused by rate limiting.
    RateLimited { retry_after_secs: u64 },
    /// Identity could not be resolved from the request.
    InvalidIdentity(InvalidIdentity),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GateRejection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {}s", retry_after_secs)
            }
            Self::InvalidIdentity(e) => write!(f, "{}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateRejection<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::InvalidIdentity(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}

impl<E> GateRejection<E> {
    /// Check if this rejection is a rate-limit refusal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// The retry hint, if rate limited.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Get the inner error if this wraps one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// A layer that guards services with an [`AdmissionGate`].
pub struct AdmissionLayer<S, E> {
    gate: Arc<AdmissionGate<S, E>>,
}

impl<S, E> AdmissionLayer<S, E> {
    /// Create a new admission layer owning its gate.
    pub fn new(gate: AdmissionGate<S, E>) -> Self {
        Self { gate: Arc::new(gate) }
    }

    /// Create a layer sharing an existing gate.
    pub fn from_arc(gate: Arc<AdmissionGate<S, E>>) -> Self {
        Self { gate }
    }
}

impl<S, E> Clone for AdmissionLayer<S, E> {
    fn clone(&self) -> Self {
        Self { gate: self.gate.clone() }
    }
}

impl<Svc, S, E> Layer<Svc> for AdmissionLayer<S, E> {
    type Service = AdmissionService<Svc, S, E>;

    fn layer(&self, service: Svc) -> Self::Service {
        AdmissionService { inner: service, gate: self.gate.clone() }
    }
}

/// Middleware service that checks admission before forwarding.
pub struct AdmissionService<Svc, S, E> {
    inner: Svc,
    gate: Arc<AdmissionGate<S, E>>,
}

impl<Svc: Clone, S, E> Clone for AdmissionService<Svc, S, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), gate: self.gate.clone() }
    }
}

impl<Svc, S, E, Req> Service<Req> for AdmissionService<Svc, S, E>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    Svc::Error: Send + 'static,
    S: BucketStore + 'static,
    E: EventSink + Sync,
    E::Future: Send + 'static,
    Req: AdmissionRequest + Send + 'static,
{
    type Response = Svc::Response;
    type Error = GateRejection<Svc::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateRejection::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let gate = self.gate.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let meta = req.request_meta();
            let endpoint = req.endpoint_class().to_owned();

            match gate.check(&meta, &endpoint).await {
                Ok(decision) if decision.is_admitted() => {
                    inner.call(req).await.map_err(GateRejection::Inner)
                }
                Ok(decision) => Err(GateRejection::RateLimited {
                    retry_after_secs: decision.retry_after_secs().unwrap_or(1),
                }),
                Err(e) => Err(GateRejection::InvalidIdentity(e)),
            }
        })
    }
}
