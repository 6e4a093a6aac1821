//! Per-connection session state: stream identifiers, the table of
//! authenticated domain pairs, JID validation and the component handshake
//! digest.

use std::collections::HashMap;
use std::fmt;

use rand::distr::Alphanumeric;
use rand::Rng;
use ring::digest;

use crate::error::{NegotiationError, StreamErrorKind};

/// One (local domain, remote domain) direction of trust. A single server
/// connection may carry several pairs, each authenticated separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainPair {
    pub local: String,
    pub remote: String,
}

impl DomainPair {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: into_lower(local),
            remote: into_lower(remote),
        }
    }
}

fn into_lower(s: impl Into<String>) -> String {
    let s = s.into();
    if s.chars().all(|c| !c.is_ascii_uppercase()) {
        s
    } else {
        s.to_lowercase()
    }
}

impl fmt::Display for DomainPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote, self.local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMethod {
    /// SASL EXTERNAL, certificate-backed (server sessions).
    SaslExternal,
    /// Any other SASL mechanism (client sessions).
    Sasl,
    Dialback,
    ComponentHandshake,
}

/// Which domain pairs a connection is authorized to route stanzas for.
#[derive(Debug, Default)]
pub struct AuthorizationTable {
    entries: HashMap<DomainPair, AuthenticationMethod>,
}

impl AuthorizationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authorize(&mut self, pair: DomainPair, method: AuthenticationMethod) {
        self.entries.insert(pair, method);
    }

    pub fn is_authorized(&self, pair: &DomainPair) -> bool {
        self.entries.contains_key(pair)
    }

    pub fn method_for(&self, pair: &DomainPair) -> Option<AuthenticationMethod> {
        self.entries.get(pair).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// TLS renegotiation discards everything established before it.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Check that a stanza's addressing matches an authorized pair.
    pub fn route_pair(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<DomainPair, NegotiationError> {
        let from_domain = from
            .and_then(jid_domain)
            .ok_or(NegotiationError::StreamError(StreamErrorKind::BadFormat))?;
        let to_domain = to
            .and_then(jid_domain)
            .ok_or(NegotiationError::StreamError(StreamErrorKind::BadFormat))?;
        let pair = DomainPair::new(to_domain, from_domain);
        if self.is_authorized(&pair) {
            Ok(pair)
        } else {
            Err(NegotiationError::HostUnknown(pair.remote))
        }
    }
}

/// Extract the domain part of a JID: strip an optional `node@` prefix and an
/// optional `/resource` suffix.
pub fn jid_domain(jid: &str) -> Option<&str> {
    let after_node = match jid.find('@') {
        Some(pos) => &jid[pos + 1..],
        None => jid,
    };
    let domain = match after_node.find('/') {
        Some(pos) => &after_node[..pos],
        None => after_node,
    };
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

// RFC 7622 localpart exclusions.
const LOCALPART_FORBIDDEN: &[char] = &['"', '&', '\'', '/', ':', '<', '>', '@', ' '];
const MAX_PART_BYTES: usize = 1023;

/// Validate a JID's shape: nonempty domain, byte limits per part, and the
/// localpart exclusion set. Full stringprep profiles are out of scope; this
/// matches what is enforced at the federation boundary.
pub fn validate_jid(jid: &str) -> Result<(), NegotiationError> {
    if jid.is_empty() || jid.len() > 3 * MAX_PART_BYTES + 2 {
        return Err(NegotiationError::StreamError(StreamErrorKind::BadFormat));
    }

    let (localpart, rest) = match jid.find('@') {
        Some(pos) => (Some(&jid[..pos]), &jid[pos + 1..]),
        None => (None, jid),
    };
    let (domain, resource) = match rest.find('/') {
        Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
        None => (rest, None),
    };

    if let Some(local) = localpart {
        if local.is_empty()
            || local.len() > MAX_PART_BYTES
            || local.chars().any(|c| LOCALPART_FORBIDDEN.contains(&c))
        {
            return Err(NegotiationError::StreamError(StreamErrorKind::BadFormat));
        }
    }
    if domain.is_empty() || domain.len() > MAX_PART_BYTES {
        return Err(NegotiationError::StreamError(StreamErrorKind::BadFormat));
    }
    if let Some(resource) = resource {
        if resource.is_empty() || resource.len() > MAX_PART_BYTES {
            return Err(NegotiationError::StreamError(StreamErrorKind::BadFormat));
        }
    }
    Ok(())
}

/// Generate a fresh stream identifier.
pub fn generate_stream_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// The component handshake digest: lowercase hex SHA-1 over the
/// concatenation of the stream ID and the shared secret (XEP-0114).
pub fn component_handshake_digest(stream_id: &str, secret: &str) -> String {
    let mut input = Vec::with_capacity(stream_id.len() + secret.len());
    input.extend_from_slice(stream_id.as_bytes());
    input.extend_from_slice(secret.as_bytes());
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &input);
    hex::encode(hash.as_ref())
}

pub fn verify_component_handshake(stream_id: &str, secret: &str, presented: &str) -> bool {
    let expected = component_handshake_digest(stream_id, secret);
    // Hex digests are fixed-length, a simple comparison leaks nothing useful.
    expected.eq_ignore_ascii_case(presented)
}
