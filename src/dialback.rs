//! Server dialback (XEP-0220): legacy trust-based domain verification, used
//! when SASL EXTERNAL is unavailable or fails.
//!
//! The receiving server forwards the presented key to the remote domain's
//! authoritative server over a separate connection; the authoritative server
//! recomputes the key from the stream ID and its own secret. A `valid`
//! verdict counts as authentication.

use std::time::Duration;

use futures_util::future::BoxFuture;
use ring::digest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::connect::ConnectionEstablisher;
use crate::config::DialbackConfig;
use crate::framing::{self, DialbackPayload, NegotiationElement};
use crate::tls::PeerCertificate;
use crate::transport::Transport;

/// The dialback key: lowercase hex SHA-256 over stream ID then secret.
pub fn dialback_key(stream_id: &str, secret: &str) -> String {
    let mut input = Vec::with_capacity(stream_id.len() + secret.len());
    input.extend_from_slice(stream_id.as_bytes());
    input.extend_from_slice(secret.as_bytes());
    hex::encode(digest::digest(&digest::SHA256, &input).as_ref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialbackVerdict {
    Valid,
    Invalid,
    /// The authoritative server could not be reached or misbehaved.
    Error,
}

impl DialbackVerdict {
    pub fn type_attr(&self) -> &'static str {
        match self {
            DialbackVerdict::Valid => "valid",
            DialbackVerdict::Invalid => "invalid",
            DialbackVerdict::Error => "error",
        }
    }
}

/// Whether dialback may be used with this peer at all.
pub fn dialback_allowed(config: &DialbackConfig, peer: Option<&PeerCertificate>) -> bool {
    if !config.enabled {
        return false;
    }
    match peer {
        Some(cert) if cert.self_signed => config.enabled_for_self_signed,
        _ => true,
    }
}

/// Key verification as performed by the receiving server.
pub trait KeyVerifier: Send + Sync {
    /// Check `key`, presented for `remote -> local` on stream `stream_id`,
    /// with the authoritative server for `remote`.
    fn verify<'a>(
        &'a self,
        local: &'a str,
        remote: &'a str,
        stream_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, DialbackVerdict>;
}

/// Verifier for streams we are ourselves authoritative for: recompute the
/// key from our own secret. Used when the claimed domain is served locally,
/// and as the authoritative side of `<db:verify/>` handling.
pub struct LocalKeyVerifier {
    secret: String,
}

impl LocalKeyVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn check(&self, stream_id: &str, key: &str) -> DialbackVerdict {
        if dialback_key(stream_id, &self.secret) == key {
            DialbackVerdict::Valid
        } else {
            DialbackVerdict::Invalid
        }
    }
}

impl KeyVerifier for LocalKeyVerifier {
    fn verify<'a>(
        &'a self,
        _local: &'a str,
        _remote: &'a str,
        stream_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, DialbackVerdict> {
        let verdict = self.check(stream_id, key);
        Box::pin(async move { verdict })
    }
}

const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// The real receiving-server verifier: dial the remote domain's
/// authoritative server and exchange `<db:verify/>`.
pub struct RemoteKeyVerifier {
    establisher: ConnectionEstablisher,
    default_port: u16,
}

impl RemoteKeyVerifier {
    pub fn new(establisher: ConnectionEstablisher, default_port: u16) -> Self {
        Self {
            establisher,
            default_port,
        }
    }

    async fn run_verification(
        &self,
        local: &str,
        remote: &str,
        stream_id: &str,
        key: &str,
    ) -> DialbackVerdict {
        let conn = match self.establisher.connect(remote, self.default_port).await {
            Some(conn) => conn,
            None => {
                warn!(remote, "Could not reach authoritative server for dialback");
                return DialbackVerdict::Error;
            }
        };
        let mut transport = Transport::plain(conn.stream);

        let header = format!(
            "<stream:stream xmlns:stream='{}' xmlns='{}' xmlns:db='{}' from='{}' to='{}' version='1.0'>",
            framing::NS_STREAM,
            framing::NS_SERVER,
            framing::NS_DIALBACK,
            local,
            remote
        );
        if let Err(e) = transport.write_all(header.as_bytes()).await {
            warn!(remote, error = %e, "Failed to open verification stream");
            return DialbackVerdict::Error;
        }

        let verify = format!(
            "<db:verify from='{}' to='{}' id='{}'>{}</db:verify>",
            local, remote, stream_id, key
        );
        if let Err(e) = transport.write_all(verify.as_bytes()).await {
            warn!(remote, error = %e, "Failed to send verification request");
            return DialbackVerdict::Error;
        }

        // Read until the matching <db:verify/> verdict arrives.
        let mut buffer = Vec::with_capacity(4096);
        loop {
            while let Some((element, consumed)) = framing::extract_element(&buffer) {
                buffer.drain(..consumed);
                match framing::classify(&element) {
                    NegotiationElement::DialbackVerify { id, payload, .. } => {
                        if id != stream_id {
                            debug!(remote, id = %id, "Verification for unrelated stream");
                            continue;
                        }
                        let verdict = match payload {
                            DialbackPayload::Verdict(true) => DialbackVerdict::Valid,
                            DialbackPayload::Verdict(false) => DialbackVerdict::Invalid,
                            DialbackPayload::Key(_) => DialbackVerdict::Error,
                        };
                        info!(remote, verdict = verdict.type_attr(), "Dialback verification complete");
                        let _ = transport.write_all(b"</stream:stream>").await;
                        return verdict;
                    }
                    NegotiationElement::StreamHeader(_) | NegotiationElement::Features(_) => {}
                    NegotiationElement::StreamClose | NegotiationElement::StreamError(_) => {
                        return DialbackVerdict::Error;
                    }
                    other => {
                        debug!(remote, element = ?other, "Ignoring element during verification");
                    }
                }
            }

            let mut chunk = [0u8; 4096];
            match transport.read(&mut chunk).await {
                Ok(0) => {
                    warn!(remote, "Authoritative server closed during verification");
                    return DialbackVerdict::Error;
                }
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    warn!(remote, error = %e, "Read error during verification");
                    return DialbackVerdict::Error;
                }
            }
        }
    }
}

impl KeyVerifier for RemoteKeyVerifier {
    fn verify<'a>(
        &'a self,
        local: &'a str,
        remote: &'a str,
        stream_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, DialbackVerdict> {
        Box::pin(async move {
            match tokio::time::timeout(
                VERIFY_TIMEOUT,
                self.run_verification(local, remote, stream_id, key),
            )
            .await
            {
                Ok(verdict) => verdict,
                Err(_) => {
                    warn!(remote, "Dialback verification timed out");
                    DialbackVerdict::Error
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_hex_sha256_of_id_and_secret() {
        // SHA-256("stream1" + "s3cret") computed independently.
        let key = dialback_key("stream1", "s3cret");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(key, dialback_key("stream1", "s3cret"));
        assert_ne!(key, dialback_key("stream2", "s3cret"));
        assert_ne!(key, dialback_key("stream1", "other"));
    }

    #[test]
    fn test_local_verifier_accepts_own_key() {
        let verifier = LocalKeyVerifier::new("secret");
        let key = dialback_key("abc123", "secret");
        assert_eq!(verifier.check("abc123", &key), DialbackVerdict::Valid);
        assert_eq!(verifier.check("abc123", "wrong"), DialbackVerdict::Invalid);
        assert_eq!(verifier.check("other", &key), DialbackVerdict::Invalid);
    }

    #[test]
    fn test_dialback_gating() {
        let mut config = DialbackConfig::default();
        config.enabled = true;
        config.enabled_for_self_signed = false;

        assert!(dialback_allowed(&config, None));

        let trusted = PeerCertificate {
            identities: vec!["remote.example".to_string()],
            trusted: true,
            self_signed: false,
        };
        assert!(dialback_allowed(&config, Some(&trusted)));

        let self_signed = PeerCertificate {
            identities: vec!["remote.example".to_string()],
            trusted: false,
            self_signed: true,
        };
        assert!(!dialback_allowed(&config, Some(&self_signed)));

        config.enabled_for_self_signed = true;
        assert!(dialback_allowed(&config, Some(&self_signed)));

        config.enabled = false;
        assert!(!dialback_allowed(&config, None));
    }

    #[tokio::test]
    async fn test_local_verifier_through_trait_object() {
        let verifier: Box<dyn KeyVerifier> = Box::new(LocalKeyVerifier::new("secret"));
        let key = dialback_key("id9", "secret");
        let verdict = verifier
            .verify("example.org", "remote.example", "id9", &key)
            .await;
        assert_eq!(verdict, DialbackVerdict::Valid);
    }
}
