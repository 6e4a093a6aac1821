//! Error taxonomy for the connection and negotiation core.
//!
//! Resolution- and connect-level failures are absorbed by their callers
//! (logged, drive fallback to the next candidate). Negotiation-level
//! failures propagate as typed errors so the final outcome of an attempt
//! is always observable.

use thiserror::Error;

/// A stream-level error condition, sent as `<stream:error/>` to the peer
/// before the connection is closed (when the transport still permits it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    BadFormat,
    HostUnknown,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    PolicyViolation,
    UnsupportedStanzaType,
    UnsupportedVersion,
    InternalServerError,
}

impl StreamErrorKind {
    /// Defined condition element name, per RFC 6120 §4.9.3.
    pub fn condition(&self) -> &'static str {
        match self {
            StreamErrorKind::BadFormat => "bad-format",
            StreamErrorKind::HostUnknown => "host-unknown",
            StreamErrorKind::InvalidNamespace => "invalid-namespace",
            StreamErrorKind::InvalidXml => "invalid-xml",
            StreamErrorKind::NotAuthorized => "not-authorized",
            StreamErrorKind::PolicyViolation => "policy-violation",
            StreamErrorKind::UnsupportedStanzaType => "unsupported-stanza-type",
            StreamErrorKind::UnsupportedVersion => "unsupported-version",
            StreamErrorKind::InternalServerError => "internal-server-error",
        }
    }

    /// Serialized `<stream:error/>` element.
    pub fn to_xml(&self) -> String {
        format!(
            "<stream:error><{} xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
            self.condition()
        )
    }
}

/// Failure of a single connection-negotiation attempt.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The peer addressed a domain this server does not serve.
    #[error("stream addressed to unserved domain '{0}'")]
    HostUnknown(String),

    /// The stream header carried a namespace that does not match the
    /// connection's role.
    #[error("invalid stream namespace '{found}' (expected '{expected}')")]
    InvalidNamespace { expected: &'static str, found: String },

    /// An element arrived that has no valid transition from the current state.
    #[error("element '{element}' not valid in state {state:?}")]
    IllegalTransition { element: String, state: crate::negotiator::NegotiationState },

    /// The peer sent XML this core could not parse into an element.
    #[error("malformed element: {0}")]
    Malformed(String),

    /// TLS is required by local policy but the peer tried to proceed without it.
    #[error("TLS required by policy but not negotiated")]
    TlsRequired,

    /// The TLS handshake itself failed. Closed without protocol chatter:
    /// the transport cannot safely carry plaintext afterwards.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// SASL failed more times than the configured ceiling allows.
    #[error("SASL retry ceiling ({0}) exceeded")]
    SaslRetriesExceeded(u32),

    /// The remote dialback authority answered `invalid`.
    #[error("dialback verification returned invalid for '{0}'")]
    DialbackInvalid(String),

    /// The peer closed the stream or sent a stream error.
    #[error("stream closed by peer")]
    StreamClosed,

    /// A stream error we decided to send before closing.
    #[error("stream error: {}", .0.condition())]
    StreamError(StreamErrorKind),

    #[error("negotiation timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NegotiationError {
    /// The stream error to emit toward the peer for this failure, if any.
    /// Security-fatal conditions return `None`: they close silently.
    pub fn stream_error(&self) -> Option<StreamErrorKind> {
        match self {
            NegotiationError::HostUnknown(_) => Some(StreamErrorKind::HostUnknown),
            NegotiationError::InvalidNamespace { .. } => Some(StreamErrorKind::InvalidNamespace),
            NegotiationError::IllegalTransition { .. } => Some(StreamErrorKind::UnsupportedStanzaType),
            NegotiationError::Malformed(_) => Some(StreamErrorKind::BadFormat),
            NegotiationError::TlsRequired => Some(StreamErrorKind::PolicyViolation),
            NegotiationError::StreamError(kind) => Some(*kind),
            NegotiationError::SaslRetriesExceeded(_) => Some(StreamErrorKind::PolicyViolation),
            NegotiationError::TlsHandshake(_)
            | NegotiationError::DialbackInvalid(_)
            | NegotiationError::StreamClosed
            | NegotiationError::Timeout
            | NegotiationError::Io(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_xml_contains_condition_and_namespace() {
        let xml = StreamErrorKind::HostUnknown.to_xml();
        assert!(xml.contains("<host-unknown"));
        assert!(xml.contains("urn:ietf:params:xml:ns:xmpp-streams"));
        assert!(xml.starts_with("<stream:error>"));
        assert!(xml.ends_with("</stream:error>"));
    }

    #[test]
    fn test_tls_handshake_failure_is_silent() {
        // Security-fatal: no <stream:error/> may be written after a failed handshake.
        let err = NegotiationError::TlsHandshake("bad cert".into());
        assert!(err.stream_error().is_none());
    }

    #[test]
    fn test_host_unknown_maps_to_host_unknown_condition() {
        let err = NegotiationError::HostUnknown("evil.example".into());
        assert_eq!(err.stream_error(), Some(StreamErrorKind::HostUnknown));
    }
}
