//! The stream negotiation state machine.
//!
//! Sans-IO: classified elements go in, actions come out. The driver owns the
//! socket, performs the actions (writes, TLS accept, compression wrap,
//! dialback verification) and feeds completion events back in. Exactly one
//! state machine exists per connection; a stream restart after STARTTLS
//! discards everything learned on the pre-TLS stream.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{Config, TlsPolicy};
use crate::dialback::{self, DialbackVerdict};
use crate::error::{NegotiationError, StreamErrorKind};
use crate::framing::{
    self, DialbackPayload, NegotiationElement, StanzaInfo, StreamHeader,
};
use crate::sasl::{SaslContext, SaslEngine, SaslStep};
use crate::session::{
    generate_stream_id, validate_jid, verify_component_handshake, AuthenticationMethod,
    AuthorizationTable, DomainPair,
};
use crate::tls::PeerCertificate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    AwaitingStreamHeader,
    StreamHeaderReceived,
    TlsRequested,
    /// TLS is up; the peer must open a brand-new stream.
    TlsEstablished,
    SaslInProgress,
    DialbackInProgress,
    CompressionRequested,
    Authenticated,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Client,
    Server,
    Component,
}

/// What varies between connection roles.
#[derive(Debug, Clone, Copy)]
pub struct RoleProfile {
    pub role: ConnectionRole,
    pub namespace: &'static str,
    pub validate_host: bool,
    pub validate_jids: bool,
    pub offer_sasl: bool,
    pub offer_dialback: bool,
    pub offer_compression: bool,
}

impl RoleProfile {
    pub fn client() -> Self {
        Self {
            role: ConnectionRole::Client,
            namespace: framing::NS_CLIENT,
            validate_host: true,
            validate_jids: true,
            offer_sasl: true,
            offer_dialback: false,
            offer_compression: true,
        }
    }

    pub fn server() -> Self {
        Self {
            role: ConnectionRole::Server,
            namespace: framing::NS_SERVER,
            validate_host: true,
            validate_jids: true,
            offer_sasl: true,
            offer_dialback: true,
            offer_compression: true,
        }
    }

    pub fn component() -> Self {
        Self {
            role: ConnectionRole::Component,
            namespace: framing::NS_COMPONENT,
            validate_host: true,
            validate_jids: false,
            offer_sasl: false,
            offer_dialback: false,
            offer_compression: false,
        }
    }
}

/// What the driver must do after feeding an element in, in order.
#[derive(Debug, PartialEq)]
pub enum NegotiationAction {
    /// Write this XML to the transport.
    Send(String),
    /// Perform the server-side TLS handshake, then call `tls_established`.
    StartTls,
    /// Wrap the transport in zlib, then call `compression_enabled`.
    EnableCompression,
    /// Run dialback verification, then call `dialback_verdict`.
    VerifyDialbackKey {
        local: String,
        remote: String,
        stream_id: String,
        key: String,
    },
    /// Hand a stanza to the external router.
    RouteStanza(StanzaInfo),
    /// The connection is now authenticated for `identity`.
    Authenticated {
        identity: String,
        method: AuthenticationMethod,
    },
    /// Close the connection after performing the preceding actions.
    Close,
}

pub struct StreamNegotiator {
    profile: RoleProfile,
    config: Arc<Config>,
    sasl: SaslEngine,
    dialback_secret: String,
    state: NegotiationState,
    stream_id: String,
    tls: bool,
    compressed: bool,
    peer_certificate: Option<PeerCertificate>,
    header: Option<StreamHeader>,
    authorizations: AuthorizationTable,
    auth_method: Option<AuthenticationMethod>,
    authenticated_identity: Option<String>,
    pending_dialback: Option<DomainPair>,
}

impl StreamNegotiator {
    pub fn new(
        profile: RoleProfile,
        config: Arc<Config>,
        sasl: SaslEngine,
        dialback_secret: impl Into<String>,
    ) -> Self {
        Self {
            profile,
            config,
            sasl,
            dialback_secret: dialback_secret.into(),
            state: NegotiationState::AwaitingStreamHeader,
            stream_id: String::new(),
            tls: false,
            compressed: false,
            peer_certificate: None,
            header: None,
            authorizations: AuthorizationTable::new(),
            auth_method: None,
            authenticated_identity: None,
            pending_dialback: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_method.is_some()
    }

    pub fn authorizations(&self) -> &AuthorizationTable {
        &self.authorizations
    }

    pub fn authenticated_identity(&self) -> Option<&str> {
        self.authenticated_identity.as_deref()
    }

    /// The TLS handshake the driver ran for us has completed. Everything
    /// learned on the pre-TLS stream is discarded (RFC 6120 §5.4.3.3).
    pub fn tls_established(&mut self, peer_certificate: Option<PeerCertificate>) {
        self.tls = true;
        self.peer_certificate = peer_certificate.map(|mut cert| {
            // Any certificate that survived the handshake counts as trusted
            // when chain verification is switched off, or when the
            // trust-on-establishment shortcut skips re-validation.
            if !self.config.tls.verify_certificates || self.config.tls.trust_on_establishment {
                cert.trusted = true;
            }
            cert
        });
        self.header = None;
        self.stream_id.clear();
        self.authorizations.clear();
        self.auth_method = None;
        self.authenticated_identity = None;
        self.pending_dialback = None;
        self.state = NegotiationState::TlsEstablished;
        debug!("TLS established, awaiting stream restart");
    }

    /// The compression wrap completed. Authentication carries forward; the
    /// stream itself restarts.
    pub fn compression_enabled(&mut self) {
        self.compressed = true;
        self.header = None;
        self.state = NegotiationState::AwaitingStreamHeader;
        debug!("Compression enabled, awaiting stream restart");
    }

    /// Verdict from the dialback verification the driver ran.
    pub fn dialback_verdict(
        &mut self,
        verdict: DialbackVerdict,
    ) -> Result<Vec<NegotiationAction>, NegotiationError> {
        if self.state != NegotiationState::DialbackInProgress {
            return Err(NegotiationError::IllegalTransition {
                element: "dialback verdict".to_string(),
                state: self.state,
            });
        }
        let pair = match self.pending_dialback.take() {
            Some(pair) => pair,
            None => {
                return Err(NegotiationError::IllegalTransition {
                    element: "dialback verdict".to_string(),
                    state: self.state,
                })
            }
        };

        let reply = format!(
            "<db:result from='{}' to='{}' type='{}'/>",
            pair.local,
            pair.remote,
            verdict.type_attr()
        );
        match verdict {
            DialbackVerdict::Valid => {
                info!(pair = %pair, "Dialback authentication succeeded");
                let identity = pair.remote.clone();
                self.authorizations
                    .authorize(pair, AuthenticationMethod::Dialback);
                self.auth_method = Some(AuthenticationMethod::Dialback);
                self.authenticated_identity = Some(identity.clone());
                self.state = NegotiationState::Authenticated;
                Ok(vec![
                    NegotiationAction::Send(reply),
                    NegotiationAction::Authenticated {
                        identity,
                        method: AuthenticationMethod::Dialback,
                    },
                ])
            }
            DialbackVerdict::Invalid | DialbackVerdict::Error => {
                warn!(pair = %pair, verdict = verdict.type_attr(), "Dialback authentication failed");
                // The peer may try another pair or close.
                self.state = NegotiationState::StreamHeaderReceived;
                Ok(vec![NegotiationAction::Send(reply)])
            }
        }
    }

    /// Drive the machine with one received element.
    pub fn handle(
        &mut self,
        element: NegotiationElement,
    ) -> Result<Vec<NegotiationAction>, NegotiationError> {
        match element {
            NegotiationElement::StreamHeader(header) => self.on_stream_header(header),
            NegotiationElement::StreamClose => {
                self.state = NegotiationState::Closed;
                Ok(vec![
                    NegotiationAction::Send("</stream:stream>".to_string()),
                    NegotiationAction::Close,
                ])
            }
            NegotiationElement::StreamError(raw) => {
                warn!(error = %raw, "Peer sent stream error");
                self.state = NegotiationState::Closed;
                Ok(vec![NegotiationAction::Close])
            }
            NegotiationElement::Starttls => self.on_starttls(),
            NegotiationElement::Auth { mechanism, payload } => {
                self.on_auth(&mechanism, payload.as_deref())
            }
            NegotiationElement::Response { payload } => self.on_sasl_response(payload.as_deref()),
            NegotiationElement::Abort => self.on_sasl_abort(),
            NegotiationElement::Compress { methods } => self.on_compress(&methods),
            NegotiationElement::DialbackResult { from, to, payload } => {
                self.on_dialback_result(from, to, payload)
            }
            NegotiationElement::DialbackVerify {
                from,
                to,
                id,
                payload,
            } => self.on_dialback_verify(from, to, id, payload),
            NegotiationElement::Handshake { digest } => self.on_handshake(&digest),
            NegotiationElement::Stanza(info) => self.on_stanza(info),
            NegotiationElement::Unknown { name, .. } => {
                if self.config.validation.strict_stanza_validation {
                    Err(NegotiationError::IllegalTransition {
                        element: name,
                        state: self.state,
                    })
                } else {
                    debug!(element = %name, "Ignoring unknown element");
                    Ok(Vec::new())
                }
            }
            // Initiator-side elements have no place on an inbound stream.
            NegotiationElement::Features(_)
            | NegotiationElement::Proceed
            | NegotiationElement::TlsFailure
            | NegotiationElement::Challenge { .. }
            | NegotiationElement::SaslSuccess { .. }
            | NegotiationElement::SaslFailure { .. }
            | NegotiationElement::Compressed
            | NegotiationElement::CompressFailure { .. } => {
                Err(NegotiationError::IllegalTransition {
                    element: "negotiation response".to_string(),
                    state: self.state,
                })
            }
        }
    }

    fn on_stream_header(
        &mut self,
        header: StreamHeader,
    ) -> Result<Vec<NegotiationAction>, NegotiationError> {
        match self.state {
            NegotiationState::AwaitingStreamHeader
            | NegotiationState::TlsEstablished => {}
            other => {
                return Err(NegotiationError::IllegalTransition {
                    element: "stream header".to_string(),
                    state: other,
                })
            }
        }

        let namespace = header.namespace.as_deref().unwrap_or_default();
        if namespace != self.profile.namespace {
            return Err(NegotiationError::InvalidNamespace {
                expected: self.profile.namespace,
                found: namespace.to_string(),
            });
        }

        if let Some(version) = &header.version {
            let major = version
                .split('.')
                .next()
                .and_then(|m| m.parse::<u32>().ok())
                .unwrap_or(0);
            if major > 1 {
                return Err(NegotiationError::StreamError(
                    StreamErrorKind::UnsupportedVersion,
                ));
            }
        }

        let to_domain = header.to.clone().unwrap_or_default();
        if self.profile.validate_host && self.config.validation.validate_host {
            if to_domain.is_empty() || !self.config.serves_domain(&to_domain) {
                return Err(NegotiationError::HostUnknown(to_domain));
            }
        }

        self.stream_id = generate_stream_id();
        let supports_features = header.version_supports_features();
        let response = self.build_header_response(&header);
        self.header = Some(header);
        self.state = if self.auth_method.is_some() {
            NegotiationState::Authenticated
        } else {
            NegotiationState::StreamHeaderReceived
        };

        let mut actions = vec![NegotiationAction::Send(response)];
        if supports_features && self.profile.role != ConnectionRole::Component {
            actions.push(NegotiationAction::Send(self.build_features()));
        }
        Ok(actions)
    }

    fn build_header_response(&self, header: &StreamHeader) -> String {
        let local = header
            .to
            .as_deref()
            .filter(|to| !to.is_empty())
            .unwrap_or_else(|| self.config.local_domain());
        let mut response = format!(
            "<?xml version='1.0'?><stream:stream xmlns:stream='{}' xmlns='{}'",
            framing::NS_STREAM,
            self.profile.namespace
        );
        if self.profile.role == ConnectionRole::Server {
            response.push_str(&format!(" xmlns:db='{}'", framing::NS_DIALBACK));
        }
        response.push_str(&format!(" from='{}' id='{}'", local, self.stream_id));
        if let Some(from) = &header.from {
            response.push_str(&format!(" to='{}'", from));
        }
        if self.profile.role != ConnectionRole::Component && header.version_supports_features() {
            response.push_str(" version='1.0'");
        }
        response.push('>');
        response
    }

    fn build_features(&self) -> String {
        let mut features = String::from("<stream:features>");
        let policy = self.config.tls.policy;
        let offer_starttls = !self.tls && policy != TlsPolicy::Disabled;
        if offer_starttls {
            if policy == TlsPolicy::Required {
                features.push_str(&format!(
                    "<starttls xmlns='{}'><required/></starttls>",
                    framing::NS_TLS
                ));
            } else {
                features.push_str(&format!("<starttls xmlns='{}'/>", framing::NS_TLS));
            }
        }

        // Before mandatory TLS is up, nothing but STARTTLS is on the table.
        let auth_allowed = self.tls || policy != TlsPolicy::Required;
        if auth_allowed && self.auth_method.is_none() {
            if self.profile.offer_sasl {
                let mechanisms = self.sasl.advertise(&self.sasl_context());
                if !mechanisms.is_empty() {
                    features.push_str(&format!("<mechanisms xmlns='{}'>", framing::NS_SASL));
                    for mechanism in &mechanisms {
                        features.push_str(&format!("<mechanism>{}</mechanism>", mechanism));
                    }
                    features.push_str("</mechanisms>");
                }
            }
            if self.profile.offer_dialback
                && dialback::dialback_allowed(&self.config.dialback, self.peer_certificate.as_ref())
            {
                features.push_str("<dialback xmlns='urn:xmpp:features:dialback'/>");
            }
        }

        if auth_allowed && self.profile.offer_compression && !self.compressed {
            features.push_str(
                "<compression xmlns='http://jabber.org/features/compress'><method>zlib</method></compression>",
            );
        }
        features.push_str("</stream:features>");
        features
    }

    fn sasl_context(&self) -> SaslContext<'_> {
        SaslContext {
            tls: self.tls,
            peer_certificate: self.peer_certificate.as_ref(),
            stream_from: self.header.as_ref().and_then(|h| h.from.as_deref()),
            server_session: self.profile.role == ConnectionRole::Server,
        }
    }

    fn on_starttls(&mut self) -> Result<Vec<NegotiationAction>, NegotiationError> {
        if self.state != NegotiationState::StreamHeaderReceived {
            return Err(NegotiationError::IllegalTransition {
                element: "starttls".to_string(),
                state: self.state,
            });
        }
        if self.tls {
            return Err(NegotiationError::IllegalTransition {
                element: "starttls".to_string(),
                state: self.state,
            });
        }
        if self.config.tls.policy == TlsPolicy::Disabled {
            // Refusal closes the stream per RFC 6120 §5.4.2.2.
            self.state = NegotiationState::Failed;
            return Ok(vec![
                NegotiationAction::Send(format!("<failure xmlns='{}'/>", framing::NS_TLS)),
                NegotiationAction::Close,
            ]);
        }
        self.state = NegotiationState::TlsRequested;
        Ok(vec![
            NegotiationAction::Send(format!("<proceed xmlns='{}'/>", framing::NS_TLS)),
            NegotiationAction::StartTls,
        ])
    }

    fn require_tls_satisfied(&self) -> Result<(), NegotiationError> {
        if self.config.tls.policy == TlsPolicy::Required && !self.tls {
            Err(NegotiationError::TlsRequired)
        } else {
            Ok(())
        }
    }

    fn on_auth(
        &mut self,
        mechanism: &str,
        payload: Option<&str>,
    ) -> Result<Vec<NegotiationAction>, NegotiationError> {
        if self.state != NegotiationState::StreamHeaderReceived || !self.profile.offer_sasl {
            return Err(NegotiationError::IllegalTransition {
                element: "auth".to_string(),
                state: self.state,
            });
        }
        self.require_tls_satisfied()?;
        // Field-disjoint borrows: the engine is borrowed mutably while the
        // context borrows the certificate and header.
        let ctx = SaslContext {
            tls: self.tls,
            peer_certificate: self.peer_certificate.as_ref(),
            stream_from: self.header.as_ref().and_then(|h| h.from.as_deref()),
            server_session: self.profile.role == ConnectionRole::Server,
        };
        let step = self.sasl.handle_auth(mechanism, payload, &ctx);
        self.apply_sasl_step(step)
    }

    fn on_sasl_response(
        &mut self,
        payload: Option<&str>,
    ) -> Result<Vec<NegotiationAction>, NegotiationError> {
        if self.state != NegotiationState::SaslInProgress {
            return Err(NegotiationError::IllegalTransition {
                element: "response".to_string(),
                state: self.state,
            });
        }
        let step = self.sasl.handle_response(payload);
        self.apply_sasl_step(step)
    }

    fn on_sasl_abort(&mut self) -> Result<Vec<NegotiationAction>, NegotiationError> {
        if self.state != NegotiationState::SaslInProgress {
            return Err(NegotiationError::IllegalTransition {
                element: "abort".to_string(),
                state: self.state,
            });
        }
        let step = self.sasl.handle_abort();
        self.apply_sasl_step(step)
    }

    fn apply_sasl_step(
        &mut self,
        step: SaslStep,
    ) -> Result<Vec<NegotiationAction>, NegotiationError> {
        match step {
            SaslStep::Challenge(payload) => {
                self.state = NegotiationState::SaslInProgress;
                Ok(vec![NegotiationAction::Send(format!(
                    "<challenge xmlns='{}'>{}</challenge>",
                    framing::NS_SASL,
                    payload
                ))])
            }
            SaslStep::Success { identity, payload } => {
                let success = match payload {
                    Some(data) => format!(
                        "<success xmlns='{}'>{}</success>",
                        framing::NS_SASL,
                        data
                    ),
                    None => format!("<success xmlns='{}'/>", framing::NS_SASL),
                };
                let method = if self.profile.role == ConnectionRole::Server {
                    let local = self
                        .header
                        .as_ref()
                        .and_then(|h| h.to.clone())
                        .unwrap_or_else(|| self.config.local_domain().to_string());
                    self.authorizations.authorize(
                        DomainPair::new(local, identity.clone()),
                        AuthenticationMethod::SaslExternal,
                    );
                    AuthenticationMethod::SaslExternal
                } else {
                    AuthenticationMethod::Sasl
                };
                self.auth_method = Some(method);
                self.authenticated_identity = Some(identity.clone());
                // The stream restarts after success; authentication carries
                // over to the new stream.
                self.header = None;
                self.state = NegotiationState::AwaitingStreamHeader;
                info!(identity = %identity, "SASL authentication succeeded");
                Ok(vec![
                    NegotiationAction::Send(success),
                    NegotiationAction::Authenticated { identity, method },
                ])
            }
            SaslStep::Failure { condition, fatal } => {
                let failure = format!(
                    "<failure xmlns='{}'><{}/></failure>",
                    framing::NS_SASL,
                    condition.condition()
                );
                if fatal {
                    self.state = NegotiationState::Failed;
                    Ok(vec![NegotiationAction::Send(failure), NegotiationAction::Close])
                } else {
                    self.state = NegotiationState::StreamHeaderReceived;
                    Ok(vec![NegotiationAction::Send(failure)])
                }
            }
        }
    }

    fn on_compress(
        &mut self,
        methods: &[String],
    ) -> Result<Vec<NegotiationAction>, NegotiationError> {
        let compress_allowed = matches!(
            self.state,
            NegotiationState::StreamHeaderReceived | NegotiationState::Authenticated
        );
        if !compress_allowed || !self.profile.offer_compression {
            return Err(NegotiationError::IllegalTransition {
                element: "compress".to_string(),
                state: self.state,
            });
        }
        if self.compressed {
            return Ok(vec![NegotiationAction::Send(format!(
                "<failure xmlns='{}'><setup-failed/></failure>",
                framing::NS_COMPRESS
            ))]);
        }
        if !methods.iter().any(|m| m == "zlib") {
            return Ok(vec![NegotiationAction::Send(format!(
                "<failure xmlns='{}'><unsupported-method/></failure>",
                framing::NS_COMPRESS
            ))]);
        }
        self.state = NegotiationState::CompressionRequested;
        Ok(vec![
            NegotiationAction::Send(format!("<compressed xmlns='{}'/>", framing::NS_COMPRESS)),
            NegotiationAction::EnableCompression,
        ])
    }

    fn on_dialback_result(
        &mut self,
        from: String,
        to: String,
        payload: DialbackPayload,
    ) -> Result<Vec<NegotiationAction>, NegotiationError> {
        if self.profile.role != ConnectionRole::Server {
            return Err(NegotiationError::IllegalTransition {
                element: "db:result".to_string(),
                state: self.state,
            });
        }
        if self.state != NegotiationState::StreamHeaderReceived
            && self.state != NegotiationState::Authenticated
        {
            return Err(NegotiationError::IllegalTransition {
                element: "db:result".to_string(),
                state: self.state,
            });
        }
        let key = match payload {
            DialbackPayload::Key(key) => key,
            // A verdict only makes sense on a stream where we initiated
            // dialback, which is the outgoing bootstrap's job.
            DialbackPayload::Verdict(_) => {
                return Err(NegotiationError::IllegalTransition {
                    element: "db:result verdict".to_string(),
                    state: self.state,
                })
            }
        };

        // Mandatory TLS gates dialback just as it gates SASL.
        self.require_tls_satisfied()?;
        if !dialback::dialback_allowed(&self.config.dialback, self.peer_certificate.as_ref()) {
            info!(remote = %from, "Dialback request but dialback is not allowed here");
            return Err(NegotiationError::StreamError(
                StreamErrorKind::UnsupportedStanzaType,
            ));
        }
        if from.is_empty() || to.is_empty() || key.is_empty() {
            return Err(NegotiationError::Malformed(
                "db:result missing addressing or key".to_string(),
            ));
        }
        if !self.config.serves_domain(&to) {
            // Addressed to a domain this server is not responsible for.
            return Ok(vec![NegotiationAction::Send(format!(
                "<db:result from='{}' to='{}' type='error'/>",
                to, from
            ))]);
        }

        let pair = DomainPair::new(to, from);
        info!(pair = %pair, "Dialback key received, verifying");
        self.pending_dialback = Some(pair.clone());
        self.state = NegotiationState::DialbackInProgress;
        Ok(vec![NegotiationAction::VerifyDialbackKey {
            local: pair.local,
            remote: pair.remote,
            stream_id: self.stream_id.clone(),
            key,
        }])
    }

    /// We are being asked, as the authoritative server, whether a key one of
    /// our outgoing streams generated is genuine.
    fn on_dialback_verify(
        &mut self,
        from: String,
        to: String,
        id: String,
        payload: DialbackPayload,
    ) -> Result<Vec<NegotiationAction>, NegotiationError> {
        if self.profile.role != ConnectionRole::Server {
            return Err(NegotiationError::IllegalTransition {
                element: "db:verify".to_string(),
                state: self.state,
            });
        }
        if self.state == NegotiationState::AwaitingStreamHeader
            || self.state == NegotiationState::TlsEstablished
        {
            return Err(NegotiationError::IllegalTransition {
                element: "db:verify".to_string(),
                state: self.state,
            });
        }
        let key = match payload {
            DialbackPayload::Key(key) => key,
            DialbackPayload::Verdict(_) => {
                return Err(NegotiationError::IllegalTransition {
                    element: "db:verify verdict".to_string(),
                    state: self.state,
                })
            }
        };

        let verdict = if !self.config.serves_domain(&to) {
            "error"
        } else if dialback::dialback_key(&id, &self.dialback_secret) == key {
            "valid"
        } else {
            "invalid"
        };
        info!(remote = %from, stream = %id, verdict, "Answered dialback verification");
        Ok(vec![NegotiationAction::Send(format!(
            "<db:verify from='{}' to='{}' id='{}' type='{}'/>",
            to, from, id, verdict
        ))])
    }

    fn on_handshake(&mut self, digest: &str) -> Result<Vec<NegotiationAction>, NegotiationError> {
        if self.profile.role != ConnectionRole::Component
            || self.state != NegotiationState::StreamHeaderReceived
        {
            return Err(NegotiationError::IllegalTransition {
                element: "handshake".to_string(),
                state: self.state,
            });
        }
        let domain = self
            .header
            .as_ref()
            .and_then(|h| h.to.clone())
            .unwrap_or_default();
        let secret = match self.config.component_secrets.get(&domain) {
            Some(secret) => secret,
            None => {
                warn!(domain = %domain, "No shared secret configured for component");
                return Err(NegotiationError::StreamError(StreamErrorKind::HostUnknown));
            }
        };
        if !verify_component_handshake(&self.stream_id, secret, digest) {
            warn!(domain = %domain, "Component handshake digest mismatch");
            return Err(NegotiationError::StreamError(StreamErrorKind::NotAuthorized));
        }

        let pair = DomainPair::new(self.config.local_domain(), domain.clone());
        self.authorizations
            .authorize(pair, AuthenticationMethod::ComponentHandshake);
        self.auth_method = Some(AuthenticationMethod::ComponentHandshake);
        self.authenticated_identity = Some(domain.clone());
        self.state = NegotiationState::Authenticated;
        info!(domain = %domain, "Component handshake accepted");
        Ok(vec![
            NegotiationAction::Send("<handshake/>".to_string()),
            NegotiationAction::Authenticated {
                identity: domain,
                method: AuthenticationMethod::ComponentHandshake,
            },
        ])
    }

    fn on_stanza(&mut self, info: StanzaInfo) -> Result<Vec<NegotiationAction>, NegotiationError> {
        if self.state != NegotiationState::Authenticated {
            return Err(NegotiationError::StreamError(StreamErrorKind::NotAuthorized));
        }

        if self.config.validation.strict_stanza_validation {
            if info.name == "iq" && info.id.is_none() {
                return Err(NegotiationError::Malformed("iq without id".to_string()));
            }
            if self.profile.role == ConnectionRole::Server
                && (info.to.is_none() || info.from.is_none())
            {
                return Err(NegotiationError::StreamError(StreamErrorKind::BadFormat));
            }
        }

        if self.profile.validate_jids && !self.config.validation.skip_jid_validation {
            for jid in [info.to.as_deref(), info.from.as_deref()].into_iter().flatten() {
                validate_jid(jid)?;
            }
        }

        if self.profile.role == ConnectionRole::Server {
            self.authorizations
                .route_pair(info.from.as_deref(), info.to.as_deref())?;
        }

        Ok(vec![NegotiationAction::RouteStanza(info)])
    }
}
