//! Outgoing server-to-server session bootstrap.
//!
//! As the initiating server: connect, open a stream, negotiate STARTTLS when
//! offered, then authenticate with SASL EXTERNAL if our certificate is
//! usable, falling back to dialback when EXTERNAL is unavailable or fails.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connect::ConnectionEstablisher;
use crate::dialback;
use crate::error::NegotiationError;
use crate::framing::{self, DialbackPayload, NegotiationElement, StreamFeatures};
use crate::session::{AuthenticationMethod, DomainPair};
use crate::transport::Transport;

const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(60);

/// A fully authenticated outbound session, ready for the router.
pub struct OutgoingSession {
    pub transport: Transport,
    pub pair: DomainPair,
    pub method: AuthenticationMethod,
    /// The stream ID assigned by the remote receiving server.
    pub stream_id: String,
}

impl std::fmt::Debug for OutgoingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingSession")
            .field("pair", &self.pair)
            .field("method", &self.method)
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

pub struct OutgoingConnector {
    config: Arc<Config>,
    establisher: ConnectionEstablisher,
    tls_connector: Option<TlsConnector>,
    dialback_secret: String,
}

impl OutgoingConnector {
    pub fn new(
        config: Arc<Config>,
        establisher: ConnectionEstablisher,
        tls_connector: Option<TlsConnector>,
        dialback_secret: impl Into<String>,
    ) -> Self {
        Self {
            config,
            establisher,
            tls_connector,
            dialback_secret: dialback_secret.into(),
        }
    }

    /// Establish and authenticate a session from `local` to `remote`.
    pub async fn establish(
        &self,
        local: &str,
        remote: &str,
    ) -> Result<OutgoingSession, NegotiationError> {
        match tokio::time::timeout(NEGOTIATE_TIMEOUT, self.run(local, remote)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(remote, "Outgoing session negotiation timed out");
                Err(NegotiationError::Timeout)
            }
        }
    }

    async fn run(&self, local: &str, remote: &str) -> Result<OutgoingSession, NegotiationError> {
        let conn = self
            .establisher
            .connect(remote, self.config.default_server_port)
            .await
            .ok_or_else(|| {
                NegotiationError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no reachable address for {}", remote),
                ))
            })?;

        let mut transport = Transport::plain(conn.stream);
        if conn.direct_tls {
            let connector = self.tls_connector.as_ref().ok_or_else(|| {
                NegotiationError::TlsHandshake("no TLS connector configured".to_string())
            })?;
            transport = transport.connect_tls(connector, remote).await?;
            debug!(remote, "Direct TLS connection established");
        }

        let mut buffer = Vec::with_capacity(4096);
        let (mut stream_id, mut features) =
            open_stream(&mut transport, &mut buffer, local, remote).await?;

        // STARTTLS when offered and we are able. Required means the remote
        // will not authenticate us without it.
        if !transport.is_tls() && features.starttls {
            match self.tls_connector.as_ref() {
                Some(connector) => {
                    transport
                        .write_all(
                            format!("<starttls xmlns='{}'/>", framing::NS_TLS).as_bytes(),
                        )
                        .await?;
                    match next_element(&mut transport, &mut buffer).await? {
                        NegotiationElement::Proceed => {}
                        NegotiationElement::TlsFailure => {
                            return Err(NegotiationError::TlsHandshake(
                                "remote refused STARTTLS".to_string(),
                            ))
                        }
                        other => return Err(unexpected(other)),
                    }
                    buffer.clear();
                    transport = transport.connect_tls(connector, remote).await?;
                    info!(remote, "STARTTLS complete, restarting stream");
                    let restarted =
                        open_stream(&mut transport, &mut buffer, local, remote).await?;
                    stream_id = restarted.0;
                    features = restarted.1;
                }
                None if features.starttls_required => {
                    return Err(NegotiationError::TlsRequired);
                }
                None => {
                    debug!(remote, "Remote offers STARTTLS but no connector is configured");
                }
            }
        }

        // Prefer SASL EXTERNAL; on unavailability or failure fall back to
        // dialback if the remote offers it.
        let external_offered = features.mechanisms.iter().any(|m| m == "EXTERNAL");
        if transport.is_tls() && external_offered {
            match self
                .try_external(&mut transport, &mut buffer, local, remote)
                .await?
            {
                ExternalOutcome::Authenticated => {
                    // Stream restart after SASL success.
                    let restarted =
                        open_stream(&mut transport, &mut buffer, local, remote).await?;
                    info!(remote, "Outbound session authenticated via SASL EXTERNAL");
                    return Ok(OutgoingSession {
                        transport,
                        pair: DomainPair::new(local, remote),
                        method: AuthenticationMethod::SaslExternal,
                        stream_id: restarted.0,
                    });
                }
                ExternalOutcome::Rejected => {
                    debug!(remote, "SASL EXTERNAL rejected, considering dialback");
                }
            }
        }

        if !self.config.dialback.enabled || !features.dialback {
            warn!(
                remote,
                external_offered, dialback = features.dialback, "No usable authentication method"
            );
            return Err(NegotiationError::StreamError(
                crate::error::StreamErrorKind::NotAuthorized,
            ));
        }

        self.try_dialback(&mut transport, &mut buffer, local, remote, &stream_id)
            .await?;
        info!(remote, "Outbound session authenticated via dialback");
        Ok(OutgoingSession {
            transport,
            pair: DomainPair::new(local, remote),
            method: AuthenticationMethod::Dialback,
            stream_id,
        })
    }

    async fn try_external(
        &self,
        transport: &mut Transport,
        buffer: &mut Vec<u8>,
        local: &str,
        remote: &str,
    ) -> Result<ExternalOutcome, NegotiationError> {
        let auth = format!(
            "<auth xmlns='{}' mechanism='EXTERNAL'>{}</auth>",
            framing::NS_SASL,
            BASE64.encode(local)
        );
        transport.write_all(auth.as_bytes()).await?;

        loop {
            match next_element(transport, buffer).await? {
                NegotiationElement::Challenge { .. } => {
                    // The identity went in the initial response already.
                    transport
                        .write_all(format!("<response xmlns='{}'/>", framing::NS_SASL).as_bytes())
                        .await?;
                }
                NegotiationElement::SaslSuccess { .. } => {
                    return Ok(ExternalOutcome::Authenticated)
                }
                NegotiationElement::SaslFailure { condition } => {
                    debug!(remote, condition = %condition, "SASL EXTERNAL failed");
                    return Ok(ExternalOutcome::Rejected);
                }
                other => return Err(unexpected(other)),
            }
        }
    }

    async fn try_dialback(
        &self,
        transport: &mut Transport,
        buffer: &mut Vec<u8>,
        local: &str,
        remote: &str,
        stream_id: &str,
    ) -> Result<(), NegotiationError> {
        let key = dialback::dialback_key(stream_id, &self.dialback_secret);
        let result = format!(
            "<db:result from='{}' to='{}'>{}</db:result>",
            local, remote, key
        );
        transport.write_all(result.as_bytes()).await?;

        loop {
            match next_element(transport, buffer).await? {
                NegotiationElement::DialbackResult { payload, .. } => match payload {
                    DialbackPayload::Verdict(true) => return Ok(()),
                    DialbackPayload::Verdict(false) => {
                        return Err(NegotiationError::DialbackInvalid(remote.to_string()))
                    }
                    DialbackPayload::Key(_) => {
                        return Err(NegotiationError::Malformed(
                            "expected dialback verdict, got key".to_string(),
                        ))
                    }
                },
                // The remote may ask us to verify keys for its own outbound
                // streams while ours is pending.
                NegotiationElement::DialbackVerify {
                    from,
                    to,
                    id,
                    payload: DialbackPayload::Key(key),
                } => {
                    let verdict = if dialback::dialback_key(&id, &self.dialback_secret) == key {
                        "valid"
                    } else {
                        "invalid"
                    };
                    let reply = format!(
                        "<db:verify from='{}' to='{}' id='{}' type='{}'/>",
                        to, from, id, verdict
                    );
                    transport.write_all(reply.as_bytes()).await?;
                }
                other => return Err(unexpected(other)),
            }
        }
    }
}

enum ExternalOutcome {
    Authenticated,
    Rejected,
}

fn unexpected(element: NegotiationElement) -> NegotiationError {
    NegotiationError::Malformed(format!("unexpected element: {:?}", element))
}

/// Send our stream header and read the remote's header plus features.
async fn open_stream(
    transport: &mut Transport,
    buffer: &mut Vec<u8>,
    local: &str,
    remote: &str,
) -> Result<(String, StreamFeatures), NegotiationError> {
    let header = format!(
        "<stream:stream xmlns:stream='{}' xmlns='{}' xmlns:db='{}' from='{}' to='{}' version='1.0'>",
        framing::NS_STREAM,
        framing::NS_SERVER,
        framing::NS_DIALBACK,
        local,
        remote
    );
    transport.write_all(header.as_bytes()).await?;

    let stream_id = loop {
        match next_element(transport, buffer).await? {
            NegotiationElement::StreamHeader(header) => {
                break header.id.unwrap_or_default();
            }
            other => return Err(unexpected(other)),
        }
    };

    // Legacy peers (no version) send no features element; peek only after a
    // versioned header would be cleaner, but every modern server sends them
    // immediately, and the dialback path needs them anyway.
    let features = match next_element(transport, buffer).await? {
        NegotiationElement::Features(features) => features,
        other => return Err(unexpected(other)),
    };
    debug!(remote, stream = %stream_id, ?features, "Remote stream open");
    Ok((stream_id, features))
}

async fn next_element(
    transport: &mut Transport,
    buffer: &mut Vec<u8>,
) -> Result<NegotiationElement, NegotiationError> {
    loop {
        if let Some((element, consumed)) = framing::extract_element(buffer) {
            buffer.drain(..consumed);
            return Ok(framing::classify(&element));
        }
        let mut chunk = [0u8; 4096];
        match transport.read(&mut chunk).await? {
            0 => return Err(NegotiationError::StreamClosed),
            n => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}
