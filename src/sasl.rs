//! SASL engine: mechanism advertisement, challenge/response driving and
//! credential verification delegation.
//!
//! Mechanism gating follows the store's capabilities: EXTERNAL needs an
//! established TLS layer with a trusted peer certificate, SCRAM needs SCRAM
//! verifiers in the store, DIGEST-MD5 and CRAM-MD5 need retrievable
//! passwords. Retry bookkeeping is per connection; exhausting the ceiling is
//! fatal for the stream.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::distr::Alphanumeric;
use rand::Rng;
use ring::{digest, hmac};
use tracing::{debug, info, warn};

use crate::config::SaslConfig;
use crate::tls::PeerCertificate;

/// SCRAM verifier material stored per account.
#[derive(Debug, Clone)]
pub struct ScramCredentials {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl ScramCredentials {
    /// Derive verifier material from a plaintext password.
    pub fn derive(password: &str, salt: &[u8], iterations: u32) -> Self {
        let mut salted = [0u8; 20];
        ring::pbkdf2::derive(
            ring::pbkdf2::PBKDF2_HMAC_SHA1,
            std::num::NonZeroU32::new(iterations.max(1)).unwrap_or(std::num::NonZeroU32::MIN),
            salt,
            password.as_bytes(),
            &mut salted,
        );
        let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &salted);
        let client_key = hmac::sign(&key, b"Client Key");
        let server_key = hmac::sign(&key, b"Server Key");
        let stored_key = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, client_key.as_ref());
        Self {
            salt: salt.to_vec(),
            iterations: iterations.max(1),
            stored_key: stored_key.as_ref().to_vec(),
            server_key: server_key.as_ref().to_vec(),
        }
    }
}

/// Credential backend the engine delegates verification to.
pub trait CredentialStore: Send + Sync {
    /// Whether plaintext passwords can be read back, not just verified.
    fn supports_password_retrieval(&self) -> bool;
    fn supports_scram(&self) -> bool;
    fn verify(&self, username: &str, password: &str) -> bool;
    fn scram_credentials(&self, username: &str) -> Option<ScramCredentials>;
    fn is_disabled(&self, username: &str) -> bool;
}

/// Facts about the connection the engine needs for gating and EXTERNAL.
pub struct SaslContext<'a> {
    pub tls: bool,
    pub peer_certificate: Option<&'a PeerCertificate>,
    /// The `from` attribute of the peer's stream header, if any.
    pub stream_from: Option<&'a str>,
    /// True for server-to-server sessions; EXTERNAL then authenticates a
    /// domain rather than a user account.
    pub server_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslFailure {
    Aborted,
    AccountDisabled,
    IncorrectEncoding,
    InvalidAuthzid,
    InvalidMechanism,
    MalformedRequest,
    NotAuthorized,
}

impl SaslFailure {
    pub fn condition(&self) -> &'static str {
        match self {
            SaslFailure::Aborted => "aborted",
            SaslFailure::AccountDisabled => "account-disabled",
            SaslFailure::IncorrectEncoding => "incorrect-encoding",
            SaslFailure::InvalidAuthzid => "invalid-authzid",
            SaslFailure::InvalidMechanism => "invalid-mechanism",
            SaslFailure::MalformedRequest => "malformed-request",
            SaslFailure::NotAuthorized => "not-authorized",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SaslStep {
    /// Emit a `<challenge/>` with this base64 payload and await a response.
    Challenge(String),
    /// Authentication complete for `identity` (a username or, for server
    /// sessions, a domain). `payload` is additional success data.
    Success {
        identity: String,
        payload: Option<String>,
    },
    /// Authentication failed. When `fatal` the retry ceiling is exhausted
    /// and the connection must close.
    Failure { condition: SaslFailure, fatal: bool },
}

enum ActiveMechanism {
    Scram(ScramPending),
}

struct ScramPending {
    username: String,
    client_first_bare: String,
    server_first: String,
    combined_nonce: String,
    credentials: ScramCredentials,
}

pub struct SaslEngine {
    config: SaslConfig,
    store: Arc<dyn CredentialStore>,
    failures: u32,
    active: Option<ActiveMechanism>,
}

impl SaslEngine {
    pub fn new(config: SaslConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            config,
            store,
            failures: 0,
            active: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The mechanisms to advertise on this connection, in configured order.
    pub fn advertise(&self, ctx: &SaslContext<'_>) -> Vec<String> {
        self.config
            .mechanisms
            .iter()
            .filter(|name| self.mechanism_available(name, ctx))
            .cloned()
            .collect()
    }

    fn mechanism_available(&self, name: &str, ctx: &SaslContext<'_>) -> bool {
        match name {
            "EXTERNAL" => {
                ctx.tls
                    && ctx
                        .peer_certificate
                        .map(|cert| cert.trusted)
                        .unwrap_or(false)
            }
            "SCRAM-SHA-1" => self.store.supports_scram(),
            "DIGEST-MD5" | "CRAM-MD5" => self.store.supports_password_retrieval(),
            "PLAIN" => true,
            "ANONYMOUS" => self.config.allow_anonymous,
            "GSSAPI" => self.config.allow_gssapi,
            _ => false,
        }
    }

    /// Handle an `<auth mechanism='...'/>` element.
    pub fn handle_auth(
        &mut self,
        mechanism: &str,
        payload: Option<&str>,
        ctx: &SaslContext<'_>,
    ) -> SaslStep {
        self.active = None;
        if !self.mechanism_available(mechanism, ctx) {
            info!(mechanism, "Rejected unavailable SASL mechanism");
            return self.failure(SaslFailure::InvalidMechanism);
        }

        match mechanism {
            "PLAIN" => self.handle_plain(payload),
            "EXTERNAL" => self.handle_external(payload, ctx),
            "SCRAM-SHA-1" => self.handle_scram_first(payload),
            "ANONYMOUS" => {
                let identity = format!("anon-{}", random_nonce(12));
                SaslStep::Success {
                    identity,
                    payload: None,
                }
            }
            other => {
                // Gated in by configuration but no evaluator is wired up.
                warn!(mechanism = other, "No evaluator for configured mechanism");
                self.failure(SaslFailure::InvalidMechanism)
            }
        }
    }

    /// Handle a `<response/>` element for the in-flight mechanism.
    pub fn handle_response(&mut self, payload: Option<&str>) -> SaslStep {
        match self.active.take() {
            Some(ActiveMechanism::Scram(pending)) => self.handle_scram_final(pending, payload),
            None => self.failure(SaslFailure::MalformedRequest),
        }
    }

    /// Handle an `<abort/>` element.
    pub fn handle_abort(&mut self) -> SaslStep {
        self.active = None;
        self.failure(SaslFailure::Aborted)
    }

    fn failure(&mut self, condition: SaslFailure) -> SaslStep {
        self.failures += 1;
        let fatal = self.failures >= self.config.retry_ceiling;
        if fatal {
            warn!(
                failures = self.failures,
                ceiling = self.config.retry_ceiling,
                "SASL retry ceiling reached"
            );
        }
        SaslStep::Failure { condition, fatal }
    }

    /// Declare success for a user account, unless it is locked out.
    fn success_for(&mut self, username: String, payload: Option<String>) -> SaslStep {
        if self.store.is_disabled(&username) {
            // Credentials were correct but the account is locked out.
            info!(username = %username, "Authentication for disabled account");
            return self.failure(SaslFailure::AccountDisabled);
        }
        self.active = None;
        SaslStep::Success {
            identity: username,
            payload,
        }
    }

    fn handle_plain(&mut self, payload: Option<&str>) -> SaslStep {
        let decoded = match decode_payload(payload) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return self.failure(SaslFailure::MalformedRequest),
            Err(()) => return self.failure(SaslFailure::IncorrectEncoding),
        };
        let text = match String::from_utf8(decoded) {
            Ok(t) => t,
            Err(_) => return self.failure(SaslFailure::IncorrectEncoding),
        };
        let mut parts = text.split('\0');
        let authzid = parts.next().unwrap_or_default();
        let authcid = match parts.next() {
            Some(a) if !a.is_empty() => a,
            _ => return self.failure(SaslFailure::MalformedRequest),
        };
        let password = match parts.next() {
            Some(p) => p,
            None => return self.failure(SaslFailure::MalformedRequest),
        };
        if !authzid.is_empty() && authzid != authcid {
            return self.failure(SaslFailure::InvalidAuthzid);
        }
        if self.store.verify(authcid, password) {
            if self.store.is_disabled(authcid) {
                info!(username = %authcid, "Authentication for disabled account");
                return self.failure(SaslFailure::AccountDisabled);
            }
            self.active = None;
            SaslStep::Success {
                identity: authcid.to_string(),
                payload: None,
            }
        } else {
            debug!(username = %authcid, "PLAIN verification failed");
            self.failure(SaslFailure::NotAuthorized)
        }
    }

    fn handle_external(&mut self, payload: Option<&str>, ctx: &SaslContext<'_>) -> SaslStep {
        let cert = match ctx.peer_certificate {
            Some(cert) => cert,
            None => return self.failure(SaslFailure::NotAuthorized),
        };

        // The requested identity comes from the payload; an empty payload
        // falls back to the stream header, then to the certificate itself.
        let requested = match decode_payload(payload) {
            Ok(Some(bytes)) => match String::from_utf8(bytes) {
                Ok(s) if !s.is_empty() => Some(s),
                Ok(_) => None,
                Err(_) => return self.failure(SaslFailure::IncorrectEncoding),
            },
            Ok(None) => None,
            Err(_) => return self.failure(SaslFailure::IncorrectEncoding),
        };
        let identity = requested
            .or_else(|| ctx.stream_from.map(str::to_string))
            .or_else(|| cert.identities.first().cloned());

        let identity = match identity {
            Some(id) => id,
            None => return self.failure(SaslFailure::InvalidAuthzid),
        };

        if ctx.server_session {
            // The asserted domain must be consistent with the certificate.
            if cert.covers(&identity) {
                info!(domain = %identity, "SASL EXTERNAL succeeded");
                self.active = None;
                SaslStep::Success {
                    identity,
                    payload: None,
                }
            } else {
                warn!(domain = %identity, identities = ?cert.identities,
                      "Certificate does not cover asserted domain");
                self.failure(SaslFailure::NotAuthorized)
            }
        } else {
            // Client sessions map the certificate identity to an account.
            let username = identity
                .split('@')
                .next()
                .unwrap_or(identity.as_str())
                .to_string();
            self.success_for(username, None)
        }
    }

    fn handle_scram_first(&mut self, payload: Option<&str>) -> SaslStep {
        let decoded = match decode_payload(payload) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return self.failure(SaslFailure::MalformedRequest),
            Err(_) => return self.failure(SaslFailure::IncorrectEncoding),
        };
        let text = match String::from_utf8(decoded) {
            Ok(t) => t,
            Err(_) => return self.failure(SaslFailure::IncorrectEncoding),
        };

        // gs2 header: channel binding is not supported on this listener.
        let bare = match text.strip_prefix("n,,").or_else(|| text.strip_prefix("y,,")) {
            Some(rest) => rest.to_string(),
            None => return self.failure(SaslFailure::MalformedRequest),
        };

        let mut username = None;
        let mut client_nonce = None;
        for field in bare.split(',') {
            match field.split_once('=') {
                Some(("n", value)) => username = Some(value.to_string()),
                Some(("r", value)) => client_nonce = Some(value.to_string()),
                _ => {}
            }
        }
        let (username, client_nonce) = match (username, client_nonce) {
            (Some(u), Some(r)) if !u.is_empty() && !r.is_empty() => (u, r),
            _ => return self.failure(SaslFailure::MalformedRequest),
        };

        let credentials = match self.store.scram_credentials(&username) {
            Some(c) => c,
            None => {
                debug!(username = %username, "No SCRAM credentials for account");
                return self.failure(SaslFailure::NotAuthorized);
            }
        };

        let combined_nonce = format!("{}{}", client_nonce, random_nonce(24));
        let server_first = format!(
            "r={},s={},i={}",
            combined_nonce,
            BASE64.encode(&credentials.salt),
            credentials.iterations
        );
        let challenge = BASE64.encode(server_first.as_bytes());
        self.active = Some(ActiveMechanism::Scram(ScramPending {
            username,
            client_first_bare: bare,
            server_first,
            combined_nonce,
            credentials,
        }));
        SaslStep::Challenge(challenge)
    }

    fn handle_scram_final(&mut self, pending: ScramPending, payload: Option<&str>) -> SaslStep {
        let decoded = match decode_payload(payload) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return self.failure(SaslFailure::MalformedRequest),
            Err(_) => return self.failure(SaslFailure::IncorrectEncoding),
        };
        let text = match String::from_utf8(decoded) {
            Ok(t) => t,
            Err(_) => return self.failure(SaslFailure::IncorrectEncoding),
        };

        let mut channel_binding = None;
        let mut nonce = None;
        let mut proof = None;
        let mut without_proof_len = text.len();
        for field in text.split(',') {
            match field.split_once('=') {
                Some(("c", value)) => channel_binding = Some(value.to_string()),
                Some(("r", value)) => nonce = Some(value.to_string()),
                Some(("p", value)) => {
                    proof = Some(value.to_string());
                    // AuthMessage excludes ",p=..." from client-final.
                    without_proof_len = text.len() - field.len() - 1;
                }
                _ => {}
            }
        }

        if channel_binding.as_deref() != Some("biws") {
            return self.failure(SaslFailure::MalformedRequest);
        }
        if nonce.as_deref() != Some(pending.combined_nonce.as_str()) {
            return self.failure(SaslFailure::NotAuthorized);
        }
        let proof = match proof.and_then(|p| BASE64.decode(p).ok()) {
            Some(p) if p.len() == 20 => p,
            Some(_) => return self.failure(SaslFailure::NotAuthorized),
            None => return self.failure(SaslFailure::IncorrectEncoding),
        };

        let auth_message = format!(
            "{},{},{}",
            pending.client_first_bare,
            pending.server_first,
            &text[..without_proof_len]
        );

        let stored = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            &pending.credentials.stored_key,
        );
        let client_signature = hmac::sign(&stored, auth_message.as_bytes());
        let client_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.as_ref())
            .map(|(a, b)| a ^ b)
            .collect();
        let recovered =
            digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &client_key);

        if recovered.as_ref() != pending.credentials.stored_key.as_slice() {
            debug!(username = %pending.username, "SCRAM proof verification failed");
            return self.failure(SaslFailure::NotAuthorized);
        }

        let server = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            &pending.credentials.server_key,
        );
        let server_signature = hmac::sign(&server, auth_message.as_bytes());
        let verifier = format!("v={}", BASE64.encode(server_signature.as_ref()));
        self.success_for(
            pending.username,
            Some(BASE64.encode(verifier.as_bytes())),
        )
    }
}

fn random_nonce(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Decode an optional base64 payload. `Ok(None)` means no payload at all;
/// the "=" placeholder decodes to an empty payload.
fn decode_payload(payload: Option<&str>) -> Result<Option<Vec<u8>>, ()> {
    match payload {
        None => Ok(None),
        Some("=") => Ok(Some(Vec::new())),
        Some(text) => match BASE64.decode(text) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(_) => Err(()),
        },
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Account {
        password: String,
        disabled: bool,
    }

    /// In-memory store for tests.
    pub struct MemoryStore {
        accounts: Mutex<HashMap<String, Account>>,
        pub retrievable: bool,
        pub scram: bool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self {
                accounts: Mutex::new(HashMap::new()),
                retrievable: true,
                scram: true,
            }
        }

        pub fn add_user(&self, username: &str, password: &str) {
            self.accounts.lock().unwrap().insert(
                username.to_string(),
                Account {
                    password: password.to_string(),
                    disabled: false,
                },
            );
        }

        pub fn disable_user(&self, username: &str) {
            if let Some(account) = self.accounts.lock().unwrap().get_mut(username) {
                account.disabled = true;
            }
        }
    }

    impl CredentialStore for MemoryStore {
        fn supports_password_retrieval(&self) -> bool {
            self.retrievable
        }

        fn supports_scram(&self) -> bool {
            self.scram
        }

        fn verify(&self, username: &str, password: &str) -> bool {
            self.accounts
                .lock()
                .unwrap()
                .get(username)
                .map(|a| a.password == password)
                .unwrap_or(false)
        }

        fn scram_credentials(&self, username: &str) -> Option<ScramCredentials> {
            let accounts = self.accounts.lock().unwrap();
            let account = accounts.get(username)?;
            Some(ScramCredentials::derive(
                &account.password,
                format!("salt-{}", username).as_bytes(),
                4096,
            ))
        }

        fn is_disabled(&self, username: &str) -> bool {
            self.accounts
                .lock()
                .unwrap()
                .get(username)
                .map(|a| a.disabled)
                .unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;

    fn plain_ctx() -> SaslContext<'static> {
        SaslContext {
            tls: false,
            peer_certificate: None,
            stream_from: None,
            server_session: false,
        }
    }

    fn engine_with(store: MemoryStore) -> SaslEngine {
        SaslEngine::new(SaslConfig::default(), Arc::new(store))
    }

    fn plain_payload(authzid: &str, authcid: &str, password: &str) -> String {
        BASE64.encode(format!("{}\0{}\0{}", authzid, authcid, password))
    }

    #[test]
    fn test_advertise_gates_external_on_tls_and_trust() {
        let engine = engine_with(MemoryStore::new());
        assert!(!engine.advertise(&plain_ctx()).contains(&"EXTERNAL".to_string()));

        let cert = PeerCertificate {
            identities: vec!["remote.example".to_string()],
            trusted: true,
            self_signed: false,
        };
        let ctx = SaslContext {
            tls: true,
            peer_certificate: Some(&cert),
            stream_from: None,
            server_session: true,
        };
        assert!(engine.advertise(&ctx).contains(&"EXTERNAL".to_string()));

        let untrusted = PeerCertificate {
            trusted: false,
            ..cert.clone()
        };
        let ctx = SaslContext {
            peer_certificate: Some(&untrusted),
            ..ctx
        };
        assert!(!engine.advertise(&ctx).contains(&"EXTERNAL".to_string()));
    }

    #[test]
    fn test_advertise_gates_on_store_capabilities() {
        let mut store = MemoryStore::new();
        store.retrievable = false;
        store.scram = false;
        let mut config = SaslConfig::default();
        config.mechanisms = vec![
            "SCRAM-SHA-1".to_string(),
            "DIGEST-MD5".to_string(),
            "CRAM-MD5".to_string(),
            "PLAIN".to_string(),
        ];
        let engine = SaslEngine::new(config, Arc::new(store));
        assert_eq!(engine.advertise(&plain_ctx()), vec!["PLAIN".to_string()]);
    }

    #[test]
    fn test_anonymous_requires_configuration() {
        let mut config = SaslConfig::default();
        config.mechanisms.push("ANONYMOUS".to_string());
        let engine = SaslEngine::new(config.clone(), Arc::new(MemoryStore::new()));
        assert!(!engine.advertise(&plain_ctx()).contains(&"ANONYMOUS".to_string()));

        config.allow_anonymous = true;
        let engine = SaslEngine::new(config, Arc::new(MemoryStore::new()));
        assert!(engine.advertise(&plain_ctx()).contains(&"ANONYMOUS".to_string()));
    }

    #[test]
    fn test_plain_success() {
        let store = MemoryStore::new();
        store.add_user("jane", "secret");
        let mut engine = engine_with(store);

        let step = engine.handle_auth("PLAIN", Some(&plain_payload("", "jane", "secret")), &plain_ctx());
        assert_eq!(
            step,
            SaslStep::Success {
                identity: "jane".to_string(),
                payload: None
            }
        );
    }

    #[test]
    fn test_plain_wrong_password() {
        let store = MemoryStore::new();
        store.add_user("jane", "secret");
        let mut engine = engine_with(store);

        let step = engine.handle_auth("PLAIN", Some(&plain_payload("", "jane", "wrong")), &plain_ctx());
        assert_eq!(
            step,
            SaslStep::Failure {
                condition: SaslFailure::NotAuthorized,
                fatal: false
            }
        );
    }

    #[test]
    fn test_plain_bad_base64_is_incorrect_encoding() {
        let mut engine = engine_with(MemoryStore::new());
        let step = engine.handle_auth("PLAIN", Some("!!!not-base64!!!"), &plain_ctx());
        assert_eq!(
            step,
            SaslStep::Failure {
                condition: SaslFailure::IncorrectEncoding,
                fatal: false
            }
        );
    }

    #[test]
    fn test_disabled_account_after_correct_password() {
        let store = MemoryStore::new();
        store.add_user("jane", "secret");
        store.disable_user("jane");
        let mut engine = engine_with(store);

        let step = engine.handle_auth("PLAIN", Some(&plain_payload("", "jane", "secret")), &plain_ctx());
        assert_eq!(
            step,
            SaslStep::Failure {
                condition: SaslFailure::AccountDisabled,
                fatal: false
            }
        );
    }

    #[test]
    fn test_retry_ceiling_is_per_connection() {
        let store = MemoryStore::new();
        store.add_user("jane", "secret");
        let mut engine = engine_with(store);

        // Default ceiling is 3: two non-fatal failures, third is fatal.
        for expected_fatal in [false, false, true] {
            let step =
                engine.handle_auth("PLAIN", Some(&plain_payload("", "jane", "bad")), &plain_ctx());
            match step {
                SaslStep::Failure { fatal, .. } => assert_eq!(fatal, expected_fatal),
                other => panic!("expected failure, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_external_server_session_requires_certificate_coverage() {
        let cert = PeerCertificate {
            identities: vec!["remote.example".to_string(), "*.wild.example".to_string()],
            trusted: true,
            self_signed: false,
        };
        let ctx = SaslContext {
            tls: true,
            peer_certificate: Some(&cert),
            stream_from: None,
            server_session: true,
        };
        let mut engine = engine_with(MemoryStore::new());

        let payload = BASE64.encode("remote.example");
        let step = engine.handle_auth("EXTERNAL", Some(&payload), &ctx);
        assert_eq!(
            step,
            SaslStep::Success {
                identity: "remote.example".to_string(),
                payload: None
            }
        );

        let payload = BASE64.encode("uncovered.example");
        let step = engine.handle_auth("EXTERNAL", Some(&payload), &ctx);
        assert!(matches!(
            step,
            SaslStep::Failure {
                condition: SaslFailure::NotAuthorized,
                ..
            }
        ));
    }

    #[test]
    fn test_external_empty_payload_falls_back_to_stream_from() {
        let cert = PeerCertificate {
            identities: vec!["remote.example".to_string()],
            trusted: true,
            self_signed: false,
        };
        let ctx = SaslContext {
            tls: true,
            peer_certificate: Some(&cert),
            stream_from: Some("remote.example"),
            server_session: true,
        };
        let mut engine = engine_with(MemoryStore::new());
        let step = engine.handle_auth("EXTERNAL", Some("="), &ctx);
        assert_eq!(
            step,
            SaslStep::Success {
                identity: "remote.example".to_string(),
                payload: None
            }
        );
    }

    #[test]
    fn test_scram_full_exchange() {
        let store = MemoryStore::new();
        store.add_user("jane", "pencil");
        let credentials = store.scram_credentials("jane").unwrap();
        let mut engine = engine_with(store);

        // Client first message.
        let client_nonce = "clientnonce0001";
        let client_first_bare = format!("n=jane,r={}", client_nonce);
        let payload = BASE64.encode(format!("n,,{}", client_first_bare));
        let challenge = match engine.handle_auth("SCRAM-SHA-1", Some(&payload), &plain_ctx()) {
            SaslStep::Challenge(c) => c,
            other => panic!("expected challenge, got {:?}", other),
        };

        // Parse server first, compute the proof like a client would.
        let server_first = String::from_utf8(BASE64.decode(&challenge).unwrap()).unwrap();
        let mut combined_nonce = None;
        for field in server_first.split(',') {
            if let Some(("r", value)) = field.split_once('=') {
                combined_nonce = Some(value.to_string());
            }
        }
        let combined_nonce = combined_nonce.unwrap();
        assert!(combined_nonce.starts_with(client_nonce));

        let client_final_without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            client_first_bare, server_first, client_final_without_proof
        );

        // Recompute ClientKey from the password the same way the store does.
        let mut salted = [0u8; 20];
        ring::pbkdf2::derive(
            ring::pbkdf2::PBKDF2_HMAC_SHA1,
            std::num::NonZeroU32::new(credentials.iterations).unwrap(),
            &credentials.salt,
            b"pencil",
            &mut salted,
        );
        let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &salted);
        let client_key = hmac::sign(&key, b"Client Key");
        let stored = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            &credentials.stored_key,
        );
        let client_signature = hmac::sign(&stored, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .as_ref()
            .iter()
            .zip(client_signature.as_ref())
            .map(|(a, b)| a ^ b)
            .collect();

        let client_final = format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(&proof)
        );
        let step = engine.handle_response(Some(&BASE64.encode(client_final)));
        match step {
            SaslStep::Success { identity, payload } => {
                assert_eq!(identity, "jane");
                // Verify the server signature ourselves.
                let verifier =
                    String::from_utf8(BASE64.decode(payload.unwrap()).unwrap()).unwrap();
                let server = hmac::Key::new(
                    hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
                    &credentials.server_key,
                );
                let expected = hmac::sign(&server, auth_message.as_bytes());
                assert_eq!(verifier, format!("v={}", BASE64.encode(expected.as_ref())));
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_scram_wrong_password_fails() {
        let store = MemoryStore::new();
        store.add_user("jane", "pencil");
        let mut engine = engine_with(store);

        let payload = BASE64.encode("n,,n=jane,r=clientnonce0002");
        let challenge = match engine.handle_auth("SCRAM-SHA-1", Some(&payload), &plain_ctx()) {
            SaslStep::Challenge(c) => c,
            other => panic!("expected challenge, got {:?}", other),
        };
        let server_first = String::from_utf8(BASE64.decode(&challenge).unwrap()).unwrap();
        let combined = server_first
            .split(',')
            .find_map(|f| f.strip_prefix("r="))
            .unwrap();

        // A garbage proof of the right length.
        let client_final = format!("c=biws,r={},p={}", combined, BASE64.encode([0u8; 20]));
        let step = engine.handle_response(Some(&BASE64.encode(client_final)));
        assert!(matches!(
            step,
            SaslStep::Failure {
                condition: SaslFailure::NotAuthorized,
                ..
            }
        ));
    }

    #[test]
    fn test_response_without_auth_is_malformed() {
        let mut engine = engine_with(MemoryStore::new());
        let step = engine.handle_response(Some("AAAA"));
        assert!(matches!(
            step,
            SaslStep::Failure {
                condition: SaslFailure::MalformedRequest,
                ..
            }
        ));
    }

    #[test]
    fn test_abort_counts_toward_ceiling() {
        let mut engine = engine_with(MemoryStore::new());
        let step = engine.handle_abort();
        assert_eq!(
            step,
            SaslStep::Failure {
                condition: SaslFailure::Aborted,
                fatal: false
            }
        );
        assert_eq!(engine.failures(), 1);
    }
}
