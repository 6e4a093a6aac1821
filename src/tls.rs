//! TLS plumbing: connector/acceptor construction and peer-certificate
//! identity extraction.
//!
//! All record-layer cryptography is delegated to rustls; this module only
//! decides how the handshake is configured (trust anchors, client-cert
//! requests, the dangerous no-verification escape hatch) and how the
//! results are interpreted (trusted-or-not, certificate identities).

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

/// Global flag to disable TLS certificate verification.
/// Set once at startup from the `--dangerous-insecure-tls` CLI flag.
static DANGEROUS_INSECURE_TLS: std::sync::OnceLock<bool> = std::sync::OnceLock::new();

pub fn set_dangerous_insecure_tls(enabled: bool) {
    let _ = DANGEROUS_INSECURE_TLS.set(enabled);
}

pub fn is_insecure_tls() -> bool {
    DANGEROUS_INSECURE_TLS.get().copied().unwrap_or(false)
}

/// Initialize the rustls crypto provider (must be called once at startup).
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS certificate verifier that accepts all certificates without validation.
///
/// **DANGEROUS**: Only used when `--dangerous-insecure-tls` is set, or when
/// certificate verification is disabled in the configuration. Intended for
/// development against servers with self-signed certificates.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client-certificate verifier that admits any presented chain.
///
/// Signatures are still checked, but chain building is deferred: dialback
/// peers with self-signed certificates must be able to complete the
/// handshake so the negotiation layer can apply policy afterwards. Whether
/// the chain actually ties to a trust anchor is decided post-handshake by
/// [`client_chain_is_trusted`].
#[derive(Debug)]
struct LenientClientVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::server::danger::ClientCertVerifier for LenientClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Strict WebPKI verifier against the system roots, built lazily and shared.
/// `None` when no roots are available; every chain is untrusted then.
fn strict_client_verifier() -> Option<&'static Arc<dyn rustls::server::danger::ClientCertVerifier>> {
    static VERIFIER: std::sync::OnceLock<
        Option<Arc<dyn rustls::server::danger::ClientCertVerifier>>,
    > = std::sync::OnceLock::new();
    VERIFIER
        .get_or_init(|| {
            let roots = Arc::new(native_root_store().ok()?);
            rustls::server::WebPkiClientVerifier::builder(roots)
                .build()
                .map_err(|e| warn!(error = %e, "No strict client-cert verifier"))
                .ok()
        })
        .as_ref()
}

/// Does the chain a peer presented during the handshake tie to the system
/// trust anchors? Called after the lenient acceptor has already admitted the
/// peer; the verdict becomes [`PeerCertificate::trusted`].
pub fn client_chain_is_trusted(chain: &[CertificateDer<'_>]) -> bool {
    let Some(verifier) = strict_client_verifier() else {
        return false;
    };
    let Some((end_entity, intermediates)) = chain.split_first() else {
        return false;
    };
    verifier
        .verify_client_cert(end_entity, intermediates, rustls::pki_types::UnixTime::now())
        .is_ok()
}

/// System trust anchors, loaded once per construction.
fn native_root_store() -> Result<RootCertStore, String> {
    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(
            "No system root certificates found. TLS connections will fail. \
            Ensure CA certificates are installed (e.g., ca-certificates package on Linux)."
                .to_string(),
        );
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| format!("Failed to add cert: {}", e))?;
    }
    Ok(root_store)
}

/// Create an outbound TLS connector using the system's native roots, with a
/// client certificate when the server has identity material configured (so
/// the remote side can offer SASL EXTERNAL).
pub fn create_tls_connector(identity: Option<&ServerIdentity>) -> Result<TlsConnector, String> {
    if is_insecure_tls() {
        warn!("TLS certificate verification DISABLED (--dangerous-insecure-tls)");
        let provider = rustls::crypto::ring::default_provider();
        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))));
        let config = match identity {
            Some(id) => builder
                .with_client_auth_cert(id.chain.clone(), id.key.clone_key())
                .map_err(|e| format!("Invalid client identity: {}", e))?,
            None => builder.with_no_client_auth(),
        };
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let root_store = native_root_store()?;
    let builder = ClientConfig::builder().with_root_certificates(root_store);
    let config = match identity {
        Some(id) => builder
            .with_client_auth_cert(id.chain.clone(), id.key.clone_key())
            .map_err(|e| format!("Invalid client identity: {}", e))?,
        None => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// The server's own certificate chain and key, loaded from PEM files.
pub struct ServerIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    pub fn load(chain_path: &Path, key_path: &Path) -> Result<Self, String> {
        let chain_file = std::fs::File::open(chain_path)
            .map_err(|e| format!("Failed to open {}: {}", chain_path.display(), e))?;
        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(chain_file))
            .collect::<Result<_, _>>()
            .map_err(|e| format!("Failed to parse {}: {}", chain_path.display(), e))?;
        if chain.is_empty() {
            return Err(format!("No certificates in {}", chain_path.display()));
        }

        let key_file = std::fs::File::open(key_path)
            .map_err(|e| format!("Failed to open {}: {}", key_path.display(), e))?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| format!("Failed to parse {}: {}", key_path.display(), e))?
            .ok_or_else(|| format!("No private key in {}", key_path.display()))?;

        Ok(Self { chain, key })
    }
}

/// Create an inbound TLS acceptor. Peer certificates are requested but
/// neither required nor chain-checked at the handshake layer; the transport
/// records the trust verdict afterwards, and whether an absent, untrusted or
/// self-signed peer certificate matters is a negotiation-level decision
/// (SASL EXTERNAL gating, dialback self-signed policy).
pub fn create_tls_acceptor(identity: &ServerIdentity) -> Result<TlsAcceptor, String> {
    let provider = rustls::crypto::ring::default_provider();
    let config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(LenientClientVerifier(Arc::new(provider))))
        .with_single_cert(identity.chain.clone(), identity.key.clone_key())
        .map_err(|e| format!("Invalid server identity: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// What the transport layer learned about the peer during the handshake.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificate {
    /// Identities (SAN dNSName entries, subject CN fallback) asserted by the
    /// peer's end-entity certificate.
    pub identities: Vec<String>,
    /// Whether the certificate chained to a configured trust anchor.
    pub trusted: bool,
    /// Self-issued certificate (issuer == subject).
    pub self_signed: bool,
}

impl PeerCertificate {
    /// Does any asserted identity cover `domain`? Wildcards match one label.
    pub fn covers(&self, domain: &str) -> bool {
        self.identities.iter().any(|identity| {
            if identity.eq_ignore_ascii_case(domain) {
                return true;
            }
            if let Some(suffix) = identity.strip_prefix("*.") {
                if let Some((_, rest)) = domain.split_once('.') {
                    return rest.eq_ignore_ascii_case(suffix);
                }
            }
            false
        })
    }
}

/// Extract identities from a DER-encoded end-entity certificate.
///
/// `trusted` must be decided by the handshake (or the trust-on-establishment
/// shortcut); this only reads what the certificate claims.
pub fn parse_peer_certificate(der: &[u8], trusted: bool) -> PeerCertificate {
    let mut identities = Vec::new();
    let mut self_signed = false;

    match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => {
            self_signed = cert.subject() == cert.issuer();
            if let Ok(Some(san)) = cert.subject_alternative_name() {
                for name in &san.value.general_names {
                    if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                        identities.push(dns.to_string());
                    }
                }
            }
            if identities.is_empty() {
                for cn in cert.subject().iter_common_name() {
                    if let Ok(value) = cn.as_str() {
                        identities.push(value.to_string());
                    }
                }
            }
        }
        Err(e) => {
            debug!(error = %e, "Failed to parse peer certificate");
        }
    }

    PeerCertificate {
        identities,
        trusted,
        self_signed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_certificate_exact_match() {
        let cert = PeerCertificate {
            identities: vec!["example.org".to_string()],
            trusted: true,
            self_signed: false,
        };
        assert!(cert.covers("example.org"));
        assert!(cert.covers("EXAMPLE.ORG"));
        assert!(!cert.covers("other.example.org"));
    }

    #[test]
    fn test_peer_certificate_wildcard_match() {
        let cert = PeerCertificate {
            identities: vec!["*.example.org".to_string()],
            trusted: true,
            self_signed: false,
        };
        assert!(cert.covers("xmpp.example.org"));
        assert!(!cert.covers("example.org"), "wildcard does not cover the apex");
        assert!(!cert.covers("a.b.example.org"), "wildcard matches one label only");
    }

    #[test]
    fn test_peer_certificate_empty_covers_nothing() {
        let cert = PeerCertificate::default();
        assert!(!cert.covers("example.org"));
    }

    #[test]
    fn test_parse_garbage_certificate_yields_no_identities() {
        let cert = parse_peer_certificate(b"not a certificate", false);
        assert!(cert.identities.is_empty());
        assert!(!cert.trusted);
    }

    #[test]
    fn test_unverifiable_client_chain_is_untrusted() {
        init_crypto_provider();
        assert!(!client_chain_is_trusted(&[]));
        let garbage = CertificateDer::from(b"not a certificate".to_vec());
        assert!(!client_chain_is_trusted(&[garbage]));
    }

    #[test]
    fn test_create_connector_without_identity() {
        init_crypto_provider();
        let result = create_tls_connector(None);
        assert!(result.is_ok(), "Should create TLS connector with system certs");
    }
}
