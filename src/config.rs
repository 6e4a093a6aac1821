//! Server configuration.
//!
//! Loaded once at startup from a JSON file; every field has a default so a
//! minimal deployment only needs `served_domains`. The connection core reads
//! this surface and nothing else: TLS policy, certificate verification,
//! dialback toggles, the static DNS override table, enabled SASL mechanisms
//! and the validation flags.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// When TLS may or must be negotiated on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    /// STARTTLS is refused; `<starttls/>` receives `<failure/>`.
    Disabled,
    /// STARTTLS is offered and accepted but not required.
    Optional,
    /// The stream must be TLS-secured before authentication may proceed.
    Required,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        TlsPolicy::Optional
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub policy: TlsPolicy,
    /// PEM file with the server certificate chain.
    pub certificate_chain: Option<PathBuf>,
    /// PEM file with the matching private key.
    pub private_key: Option<PathBuf>,
    /// Verify peer certificates against the trust store. Disabling this is
    /// the configuration-level equivalent of the `--dangerous-insecure-tls`
    /// flag.
    pub verify_certificates: bool,
    /// Treat any peer that completed the TLS handshake as trusted when
    /// deciding whether to offer SASL EXTERNAL, skipping re-validation.
    pub trust_on_establishment: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            policy: TlsPolicy::default(),
            certificate_chain: None,
            private_key: None,
            verify_certificates: true,
            trust_on_establishment: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialbackConfig {
    /// Master switch for the server dialback protocol.
    pub enabled: bool,
    /// Accept dialback from peers presenting self-signed certificates.
    pub enabled_for_self_signed: bool,
}

impl Default for DialbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enabled_for_self_signed: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SaslConfig {
    /// Mechanisms that may be advertised, in preference order. Gating rules
    /// (TLS for EXTERNAL, store capabilities for the digest families) are
    /// applied on top of this list at advertisement time.
    pub mechanisms: Vec<String>,
    /// Failed attempts allowed on one connection before it is closed.
    pub retry_ceiling: u32,
    pub allow_anonymous: bool,
    pub allow_gssapi: bool,
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            mechanisms: vec![
                "SCRAM-SHA-1".to_string(),
                "DIGEST-MD5".to_string(),
                "CRAM-MD5".to_string(),
                "PLAIN".to_string(),
                "EXTERNAL".to_string(),
            ],
            retry_ceiling: 3,
            allow_anonymous: false,
            allow_gssapi: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Static host overrides: domain → "host:port". A present entry skips
    /// DNS entirely and is used verbatim.
    pub overrides: HashMap<String, String>,
    /// Racer wait for the preferred candidate/family before falling back.
    pub resolution_delay_ms: u64,
    pub prefer_ipv4: bool,
    /// Allow `_xmpps-server._tcp` (direct TLS) SRV lookups.
    pub allow_direct_tls: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            resolution_delay_ms: 50,
            prefer_ipv4: false,
            allow_direct_tls: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    pub client: String,
    pub server: String,
    pub component: String,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            client: "0.0.0.0:5222".to_string(),
            server: "0.0.0.0:5269".to_string(),
            component: "127.0.0.1:5275".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Skip JID well-formedness checks on stanza addresses.
    pub skip_jid_validation: bool,
    /// Enforce addressing rules post-authentication (`id` on IQ, resolvable
    /// `to`). Violations are protocol-fatal.
    pub strict_stanza_validation: bool,
    /// Require the stream header `to` to name a locally served domain
    /// (applied per role through the role profile).
    pub validate_host: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            skip_jid_validation: false,
            strict_stanza_validation: false,
            validate_host: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Domains this server is authoritative for. The first entry is the
    /// default local domain used for outgoing S2S.
    pub served_domains: Vec<String>,
    pub tls: TlsConfig,
    pub dialback: DialbackConfig,
    pub sasl: SaslConfig,
    pub dns: DnsConfig,
    pub bind: BindConfig,
    pub validation: ValidationConfig,
    /// Shared secrets for external components, keyed by component subdomain.
    pub component_secrets: HashMap<String, String>,
    /// Local accounts, username to password.
    pub users: HashMap<String, String>,
    /// Outbound TCP connect timeout, per address.
    pub connect_timeout_secs: u64,
    /// Default S2S port when SRV yields nothing.
    pub default_server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            served_domains: vec!["localhost".to_string()],
            tls: TlsConfig::default(),
            dialback: DialbackConfig::default(),
            sasl: SaslConfig::default(),
            dns: DnsConfig::default(),
            bind: BindConfig::default(),
            validation: ValidationConfig::default(),
            component_secrets: HashMap::new(),
            users: HashMap::new(),
            connect_timeout_secs: 15,
            default_server_port: 5269,
        }
    }
}

impl Config {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &std::path::Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        serde_json::from_str(&raw)
            .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn resolution_delay(&self) -> Duration {
        Duration::from_millis(self.dns.resolution_delay_ms)
    }

    /// The default local domain for outgoing connections.
    pub fn local_domain(&self) -> &str {
        self.served_domains
            .first()
            .map(String::as_str)
            .unwrap_or("localhost")
    }

    pub fn serves_domain(&self, domain: &str) -> bool {
        self.served_domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
            || self
                .component_secrets
                .keys()
                .any(|d| d.eq_ignore_ascii_case(domain))
    }
}
