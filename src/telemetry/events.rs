use std::fmt;

use serde_json::json;

use crate::admission::Outcome;
use crate::identity::{IdentityKind, Tier};

/// One admission decision, as published to sinks.
///
/// Carries the identity class rather than the identity value: metrics
/// consumers have no business seeing raw API keys or addresses.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionEvent {
    /// How the client was identified.
    pub identity_kind: IdentityKind,
    /// Endpoint class the decision was made for.
    pub endpoint: String,
    /// Resolved tier.
    pub tier: Tier,
    /// The decision.
    pub outcome: Outcome,
    /// Tokens left in the bucket after the decision, when known.
    pub tokens_remaining: Option<f64>,
    /// True when the decision came from a fallback path (store slow,
    /// unavailable, or the endpoint had no policy).
    pub degraded: bool,
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Admission({}, endpoint={}, kind={}, tier={}",
            self.outcome, self.endpoint, self.identity_kind, self.tier
        )?;
        if let Some(tokens) = self.tokens_remaining {
            write!(f, ", tokens={:.3}", tokens)?;
        }
        if self.degraded {
            write!(f, ", degraded")?;
        }
        write!(f, ")")
    }
}

/// Convert an AdmissionEvent into a JSON value for sinks.
pub fn event_to_json(event: &AdmissionEvent) -> serde_json::Value {
    json!({
        "kind": "admission",
        "outcome": event.outcome.as_str(),
        "endpoint": event.endpoint,
        "identity_kind": event.identity_kind.to_string(),
        "tier": event.tier.to_string(),
        "tokens_remaining": event.tokens_remaining,
        "degraded": event.degraded,
    })
}
