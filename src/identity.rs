//! Client identity resolution: who is asking, what tier are they on, and are
//! they exempt from rate limiting.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// Rate-limit tier a client belongs to. Unknown API keys resolve to [`Tier::Free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
    Admin,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Premium => write!(f, "premium"),
            Tier::Admin => write!(f, "admin"),
        }
    }
}

/// How an [`Identity`] was derived from request metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    ApiKey,
    Ip,
    Composite,
}

impl std::fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityKind::ApiKey => write!(f, "api-key"),
            IdentityKind::Ip => write!(f, "ip"),
            IdentityKind::Composite => write!(f, "composite"),
        }
    }
}

/// Resolved client reference. Immutable once resolved for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub kind: IdentityKind,
    pub value: String,
    pub tier: Tier,
    pub bypass: bool,
}

/// Identity-extraction inputs pulled from a request by the routing layer.
///
/// The API-key value comes from the header named by
/// [`KeyResolver::api_key_header`]; the peer address from the connection.
/// Either may be absent.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub api_key: Option<String>,
    pub peer_addr: Option<IpAddr>,
}

impl RequestMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_peer_addr(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }
}

/// Which request attribute identifies a client for bucketing.
///
/// A small closed set selected by configuration; [`ResolverMode::ApiKey`] is
/// the default and falls back to the source address when no key is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverMode {
    #[default]
    ApiKey,
    Ip,
    Composite,
}

/// Neither an API key nor a usable source address was present.
///
/// A protocol-level rejection, distinct from a rate-limit refusal; the gate
/// surfaces it to the caller instead of producing an admission decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identity: neither api key nor source address resolvable")]
pub struct InvalidIdentity;

/// Extracts an [`Identity`] from request metadata: identity value per the
/// configured [`ResolverMode`], tier from a static API-key table, bypass from
/// an admin/internal allow-list.
#[derive(Debug, Clone, Default)]
pub struct KeyResolver {
    mode: ResolverMode,
    api_key_header: Option<String>,
    tiers: HashMap<String, Tier>,
    bypass: HashSet<String>,
}

pub(crate) const DEFAULT_API_KEY_HEADER: &str = "x-api-key";

impl KeyResolver {
    pub fn new(mode: ResolverMode) -> Self {
        Self { mode, ..Self::default() }
    }

    /// Name of the header the routing layer should read the API key from.
    pub fn api_key_header(&self) -> &str {
        self.api_key_header.as_deref().unwrap_or(DEFAULT_API_KEY_HEADER)
    }

    pub fn with_api_key_header(mut self, header: impl Into<String>) -> Self {
        self.api_key_header = Some(header.into());
        self
    }

    /// Registers an API key's tier. Keys not registered resolve to [`Tier::Free`].
    pub fn with_tier(mut self, api_key: impl Into<String>, tier: Tier) -> Self {
        self.tiers.insert(api_key.into(), tier);
        self
    }

    pub fn with_tiers<I, K>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Tier)>,
        K: Into<String>,
    {
        self.tiers.extend(entries.into_iter().map(|(k, t)| (k.into(), t)));
        self
    }

    /// Adds an identity to the bypass allow-list. Matches the raw API key, the
    /// source address string, or the resolved identity value.
    pub fn with_bypass(mut self, identity: impl Into<String>) -> Self {
        self.bypass.insert(identity.into());
        self
    }

    pub fn with_bypass_list<I, K>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.bypass.extend(entries.into_iter().map(Into::into));
        self
    }

    /// Resolves request metadata into an [`Identity`].
    ///
    /// Whitespace-only API keys are treated as absent. Fails only when neither
    /// a key nor a source address is available.
    pub fn resolve(&self, meta: &RequestMeta) -> Result<Identity, InvalidIdentity> {
        let api_key = meta
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());
        let ip = meta.peer_addr.map(|a| a.to_string());

        let tier = api_key
            .and_then(|k| self.tiers.get(k).copied())
            .unwrap_or(Tier::Free);

        let (kind, value) = match self.mode {
            ResolverMode::ApiKey => match (api_key, ip.as_deref()) {
                (Some(key), _) => (IdentityKind::ApiKey, key.to_owned()),
                (None, Some(ip)) => (IdentityKind::Ip, ip.to_owned()),
                (None, None) => return Err(InvalidIdentity),
            },
            ResolverMode::Ip => match (ip.as_deref(), api_key) {
                (Some(ip), _) => (IdentityKind::Ip, ip.to_owned()),
                (None, Some(key)) => (IdentityKind::ApiKey, key.to_owned()),
                (None, None) => return Err(InvalidIdentity),
            },
            ResolverMode::Composite => match (api_key, ip.as_deref()) {
                (Some(key), Some(ip)) => (IdentityKind::Composite, format!("{key}@{ip}")),
                (Some(key), None) => (IdentityKind::ApiKey, key.to_owned()),
                (None, Some(ip)) => (IdentityKind::Ip, ip.to_owned()),
                (None, None) => return Err(InvalidIdentity),
            },
        };

        let bypass = self.bypass.contains(&value)
            || api_key.is_some_and(|k| self.bypass.contains(k))
            || ip.as_deref().is_some_and(|i| self.bypass.contains(i));

        Ok(Identity { kind, value, tier, bypass })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))
    }

    #[test]
    fn api_key_mode_prefers_key() {
        let resolver = KeyResolver::new(ResolverMode::ApiKey).with_tier("k-prem", Tier::Premium);
        let meta = RequestMeta::new().with_api_key("k-prem").with_peer_addr(addr());
        let id = resolver.resolve(&meta).unwrap();
        assert_eq!(id.kind, IdentityKind::ApiKey);
        assert_eq!(id.value, "k-prem");
        assert_eq!(id.tier, Tier::Premium);
        assert!(!id.bypass);
    }

    #[test]
    fn api_key_mode_falls_back_to_ip() {
        let resolver = KeyResolver::default();
        let meta = RequestMeta::new().with_peer_addr(addr());
        let id = resolver.resolve(&meta).unwrap();
        assert_eq!(id.kind, IdentityKind::Ip);
        assert_eq!(id.value, "10.0.0.7");
        assert_eq!(id.tier, Tier::Free);
    }

    #[test]
    fn unknown_key_defaults_to_free() {
        let resolver = KeyResolver::default();
        let meta = RequestMeta::new().with_api_key("nobody");
        let id = resolver.resolve(&meta).unwrap();
        assert_eq!(id.tier, Tier::Free);
    }

    #[test]
    fn blank_key_is_absent() {
        let resolver = KeyResolver::default();
        let meta = RequestMeta::new().with_api_key("   ").with_peer_addr(addr());
        let id = resolver.resolve(&meta).unwrap();
        assert_eq!(id.kind, IdentityKind::Ip);
    }

    #[test]
    fn key_is_trimmed() {
        let resolver = KeyResolver::default().with_tier("k1", Tier::Premium);
        let meta = RequestMeta::new().with_api_key("  k1 ");
        let id = resolver.resolve(&meta).unwrap();
        assert_eq!(id.value, "k1");
        assert_eq!(id.tier, Tier::Premium);
    }

    #[test]
    fn composite_mode_joins_key_and_ip() {
        let resolver = KeyResolver::new(ResolverMode::Composite);
        let meta = RequestMeta::new().with_api_key("k1").with_peer_addr(addr());
        let id = resolver.resolve(&meta).unwrap();
        assert_eq!(id.kind, IdentityKind::Composite);
        assert_eq!(id.value, "k1@10.0.0.7");
    }

    #[test]
    fn composite_mode_degrades_to_single_component() {
        let resolver = KeyResolver::new(ResolverMode::Composite);
        let id = resolver
            .resolve(&RequestMeta::new().with_api_key("k1"))
            .unwrap();
        assert_eq!(id.kind, IdentityKind::ApiKey);
        let id = resolver
            .resolve(&RequestMeta::new().with_peer_addr(addr()))
            .unwrap();
        assert_eq!(id.kind, IdentityKind::Ip);
    }

    #[test]
    fn ip_mode_identifies_by_address_but_keeps_key_tier() {
        let resolver = KeyResolver::new(ResolverMode::Ip).with_tier("k-prem", Tier::Premium);
        let meta = RequestMeta::new().with_api_key("k-prem").with_peer_addr(addr());
        let id = resolver.resolve(&meta).unwrap();
        assert_eq!(id.kind, IdentityKind::Ip);
        assert_eq!(id.value, "10.0.0.7");
        assert_eq!(id.tier, Tier::Premium);
    }

    #[test]
    fn empty_meta_is_invalid() {
        let resolver = KeyResolver::default();
        assert_eq!(resolver.resolve(&RequestMeta::new()), Err(InvalidIdentity));
    }

    #[test]
    fn bypass_matches_raw_key_or_address() {
        let resolver = KeyResolver::default()
            .with_bypass("admin-key")
            .with_bypass("10.0.0.7");
        let id = resolver
            .resolve(&RequestMeta::new().with_api_key("admin-key"))
            .unwrap();
        assert!(id.bypass);
        let id = resolver
            .resolve(&RequestMeta::new().with_peer_addr(addr()))
            .unwrap();
        assert!(id.bypass);
    }

    #[test]
    fn bypass_matches_composite_value() {
        let resolver = KeyResolver::new(ResolverMode::Composite).with_bypass("k1@10.0.0.7");
        let meta = RequestMeta::new().with_api_key("k1").with_peer_addr(addr());
        assert!(resolver.resolve(&meta).unwrap().bypass);
    }

    #[test]
    fn header_name_defaults_and_overrides() {
        assert_eq!(KeyResolver::default().api_key_header(), "x-api-key");
        let resolver = KeyResolver::default().with_api_key_header("x-acme-key");
        assert_eq!(resolver.api_key_header(), "x-acme-key");
    }
}
