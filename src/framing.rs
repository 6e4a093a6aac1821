//! XMPP XML framing: element boundary extraction and classification.
//!
//! A TCP read buffer is cut into complete top-level elements (stanzas and
//! negotiation elements) with `extract_element`; each element is then parsed
//! into the `NegotiationElement` vocabulary the stream negotiator consumes:
//! stream headers, STARTTLS, SASL, dialback, compression and plain stanzas.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::error;

pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";
pub const NS_CLIENT: &str = "jabber:client";
pub const NS_SERVER: &str = "jabber:server";
pub const NS_COMPONENT: &str = "jabber:component:accept";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_DIALBACK: &str = "jabber:server:dialback";
pub const NS_COMPRESS: &str = "http://jabber.org/protocol/compress";

/// Convert a byte slice to a String, trying zero-copy UTF-8 first.
fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Extract a single complete top-level element from the buffer.
///
/// Returns `Some((element_string, bytes_consumed))` if a complete element was
/// found, or `None` if the buffer does not yet contain one. A stream opening
/// tag (`<stream:stream ...>`) is returned as soon as its start tag is
/// complete, since it only closes when the stream ends.
pub fn extract_element(buffer: &[u8]) -> Option<(String, usize)> {
    // Stream closing tag appears alone, without a matching opening tag in
    // the buffer.
    let start = buffer
        .iter()
        .position(|&b| b != b' ' && b != b'\t' && b != b'\n' && b != b'\r');
    if let Some(start) = start {
        if buffer[start..].starts_with(b"</stream:stream>") {
            let tag_end = start + b"</stream:stream>".len();
            return Some(("</stream:stream>".to_string(), tag_end));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut in_element = false;
    let mut element_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                let name = e.name();
                if !in_element
                    && (name.as_ref() == b"stream:stream" || name.local_name().as_ref() == b"stream")
                {
                    // Stream header: complete as soon as the start tag is.
                    let tag_end = reader.buffer_position() as usize;
                    return Some((bytes_to_string(&buffer[0..tag_end]), tag_end));
                }

                depth += 1;
                if !in_element && depth == 1 {
                    in_element = true;
                    element_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                let name = e.name();
                if !in_element
                    && (name.as_ref() == b"stream:stream" || name.local_name().as_ref() == b"stream")
                {
                    let tag_end = reader.buffer_position() as usize;
                    return Some((bytes_to_string(&buffer[0..tag_end]), tag_end));
                }

                // Self-closing top-level element, e.g. <starttls/> or <presence/>.
                if !in_element && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Some((bytes_to_string(&buffer[pos..tag_end]), tag_end));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                let name = e.name();
                if (name.as_ref() == b"stream:stream" || name.local_name().as_ref() == b"stream")
                    && depth == 0
                {
                    let tag_end = reader.buffer_position() as usize;
                    return Some(("</stream:stream>".to_string(), tag_end));
                }

                depth = depth.saturating_sub(1);
                if in_element && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Some((bytes_to_string(&buffer[element_start..tag_end]), tag_end));
                }
            }
            Ok(Event::Eof) => {
                // Incomplete element, more data needed.
                return None;
            }
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => {
                // Expected during TCP streaming: partial element in buffer.
                return None;
            }
            Err(e) => {
                error!(error = ?e, "XML parsing error");
                return None;
            }
        }
    }
}

/// Attributes of a received `<stream:stream>` opening tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
    /// The default (content) namespace declared on the header.
    pub namespace: Option<String>,
    /// Whether `xmlns:db` declared dialback support.
    pub dialback: bool,
}

impl StreamHeader {
    pub fn version_supports_features(&self) -> bool {
        match &self.version {
            Some(v) => v
                .split('.')
                .next()
                .and_then(|major| major.parse::<u32>().ok())
                .map(|major| major >= 1)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Parse the attributes of a stream opening tag.
pub fn parse_stream_header(text: &str) -> Option<StreamHeader> {
    let trimmed = text.trim();
    let body = if trimmed.starts_with("<?xml") {
        match trimmed.find("?>") {
            Some(pos) => trimmed[pos + 2..].trim(),
            None => trimmed,
        }
    } else {
        trimmed
    };

    let mut reader = Reader::from_str(body);
    reader.config_mut().check_end_names = false;

    let event = reader.read_event();
    let element = match &event {
        Ok(Event::Start(e)) | Ok(Event::Empty(e)) => e,
        _ => return None,
    };
    let name = element.name();
    if name.as_ref() != b"stream:stream" && name.local_name().as_ref() != b"stream" {
        return None;
    }

    let mut header = StreamHeader::default();
    for attr in element.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match key.as_str() {
            "to" => header.to = Some(value),
            "from" => header.from = Some(value),
            "id" => header.id = Some(value),
            "version" => header.version = Some(value),
            "xml:lang" => header.lang = Some(value),
            "xmlns" => header.namespace = Some(value),
            "xmlns:db" => header.dialback = value == NS_DIALBACK,
            _ => {}
        }
    }
    Some(header)
}

/// A dialback element carries either a key (a request) or a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialbackPayload {
    Key(String),
    Verdict(bool),
}

/// Addressing and type attributes of a routable stanza.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StanzaInfo {
    pub name: String,
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub raw: String,
}

/// Stream features advertised by a remote server, as seen by the initiator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFeatures {
    pub starttls: bool,
    pub starttls_required: bool,
    pub mechanisms: Vec<String>,
    pub dialback: bool,
    pub compression_methods: Vec<String>,
}

/// Everything a negotiator can receive over one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationElement {
    StreamHeader(StreamHeader),
    StreamClose,
    /// A `<stream:error/>` from the peer; raw XML retained for logging.
    StreamError(String),
    Features(StreamFeatures),
    Starttls,
    Proceed,
    TlsFailure,
    Auth { mechanism: String, payload: Option<String> },
    Response { payload: Option<String> },
    Challenge { payload: Option<String> },
    SaslSuccess { payload: Option<String> },
    SaslFailure { condition: String },
    Abort,
    Compress { methods: Vec<String> },
    Compressed,
    CompressFailure { condition: String },
    DialbackResult { from: String, to: String, payload: DialbackPayload },
    DialbackVerify { from: String, to: String, id: String, payload: DialbackPayload },
    Handshake { digest: String },
    Stanza(StanzaInfo),
    /// Parsed but not part of the negotiation vocabulary.
    Unknown { name: String, raw: String },
}

struct RawElement {
    prefix: Option<String>,
    local: String,
    namespace: Option<String>,
    attrs: Vec<(String, String)>,
    text: String,
    /// Direct children: (local name, text content).
    children: Vec<(String, String)>,
}

impl RawElement {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn text_payload(&self) -> Option<String> {
        let trimmed = self.text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Parse one complete element into a shallow tree: root attributes, root
/// text, and direct children with their text. Self-closing children are
/// tracked explicitly since quick-xml emits no `End` event for them.
fn parse_element(xml: &str) -> Option<RawElement> {
    let mut reader = Reader::from_str(xml.trim());
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut element: Option<RawElement> = None;
    let mut depth: u32 = 0;
    let mut current_child: Option<(String, String)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {}
            Ok(ev @ Event::Start(_)) | Ok(ev @ Event::Empty(_)) => {
                let (e, self_closing) = match &ev {
                    Event::Start(e) => (e, false),
                    Event::Empty(e) => (e, true),
                    _ => unreachable!(),
                };
                let full = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let (prefix, local) = match full.split_once(':') {
                    Some((p, l)) => (Some(p.to_string()), l.to_string()),
                    None => (None, full.clone()),
                };

                if element.is_none() {
                    let mut attrs = Vec::new();
                    let mut namespace = None;
                    let xmlns_key = prefix
                        .as_ref()
                        .map(|p| format!("xmlns:{}", p))
                        .unwrap_or_else(|| "xmlns".to_string());
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                        let value = String::from_utf8_lossy(&attr.value).to_string();
                        if key == xmlns_key {
                            namespace = Some(value.clone());
                        }
                        attrs.push((key, value));
                    }
                    let root = RawElement {
                        prefix,
                        local,
                        namespace,
                        attrs,
                        text: String::new(),
                        children: Vec::new(),
                    };
                    if self_closing {
                        return Some(root);
                    }
                    element = Some(root);
                    depth = 1;
                } else if depth == 1 {
                    if self_closing {
                        if let Some(el) = element.as_mut() {
                            el.children.push((local, String::new()));
                        }
                    } else {
                        current_child = Some((local, String::new()));
                        depth += 1;
                    }
                } else if !self_closing {
                    depth += 1;
                }
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                if depth == 1 {
                    if let (Some(child), Some(el)) = (current_child.take(), element.as_mut()) {
                        el.children.push(child);
                    }
                }
                if depth == 0 {
                    break;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().to_string();
                if depth == 1 {
                    if let Some(el) = element.as_mut() {
                        el.text.push_str(&text);
                    }
                } else if let Some((_, body)) = current_child.as_mut() {
                    body.push_str(&text);
                }
            }
            Ok(Event::CData(t)) => {
                let text = String::from_utf8_lossy(&t).to_string();
                if depth == 1 {
                    if let Some(el) = element.as_mut() {
                        el.text.push_str(&text);
                    }
                } else if let Some((_, body)) = current_child.as_mut() {
                    body.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
        }
    }
    element
}

/// Classify one extracted element into the negotiation vocabulary.
pub fn classify(xml: &str) -> NegotiationElement {
    let trimmed = xml.trim();
    if trimmed == "</stream:stream>" {
        return NegotiationElement::StreamClose;
    }
    if trimmed.contains("<stream:stream") || trimmed.starts_with("<?xml") {
        if let Some(header) = parse_stream_header(trimmed) {
            return NegotiationElement::StreamHeader(header);
        }
    }

    let element = match parse_element(trimmed) {
        Some(el) => el,
        None => {
            return NegotiationElement::Unknown {
                name: String::new(),
                raw: trimmed.to_string(),
            }
        }
    };

    // Dialback elements rely on the db prefix declared on the stream header,
    // so namespace resolution goes by prefix here.
    if element.prefix.as_deref() == Some("db") {
        let from = element.attr("from").unwrap_or_default().to_string();
        let to = element.attr("to").unwrap_or_default().to_string();
        let payload = match element.attr("type") {
            Some(kind) => DialbackPayload::Verdict(kind == "valid"),
            None => DialbackPayload::Key(element.text.trim().to_string()),
        };
        return match element.local.as_str() {
            "result" => NegotiationElement::DialbackResult { from, to, payload },
            "verify" => NegotiationElement::DialbackVerify {
                from,
                to,
                id: element.attr("id").unwrap_or_default().to_string(),
                payload,
            },
            _ => NegotiationElement::Unknown {
                name: format!("db:{}", element.local),
                raw: trimmed.to_string(),
            },
        };
    }

    if element.prefix.as_deref() == Some("stream") {
        return match element.local.as_str() {
            "error" => NegotiationElement::StreamError(trimmed.to_string()),
            "features" => NegotiationElement::Features(parse_features(trimmed)),
            _ => NegotiationElement::Unknown {
                name: format!("stream:{}", element.local),
                raw: trimmed.to_string(),
            },
        };
    }

    match (element.local.as_str(), element.namespace.as_deref()) {
        ("starttls", Some(NS_TLS)) => NegotiationElement::Starttls,
        ("proceed", Some(NS_TLS)) => NegotiationElement::Proceed,
        ("failure", Some(NS_TLS)) => NegotiationElement::TlsFailure,
        ("auth", Some(NS_SASL)) => NegotiationElement::Auth {
            mechanism: element.attr("mechanism").unwrap_or_default().to_string(),
            payload: element.text_payload(),
        },
        ("response", Some(NS_SASL)) => NegotiationElement::Response {
            payload: element.text_payload(),
        },
        ("challenge", Some(NS_SASL)) => NegotiationElement::Challenge {
            payload: element.text_payload(),
        },
        ("success", Some(NS_SASL)) => NegotiationElement::SaslSuccess {
            payload: element.text_payload(),
        },
        ("failure", Some(NS_SASL)) => NegotiationElement::SaslFailure {
            condition: element
                .children
                .first()
                .map(|(name, _)| name.clone())
                .unwrap_or_else(|| "not-authorized".to_string()),
        },
        ("abort", Some(NS_SASL)) => NegotiationElement::Abort,
        ("compress", Some(NS_COMPRESS)) => NegotiationElement::Compress {
            methods: element
                .children
                .iter()
                .filter(|(name, _)| name == "method")
                .map(|(_, text)| text.trim().to_string())
                .collect(),
        },
        ("compressed", Some(NS_COMPRESS)) => NegotiationElement::Compressed,
        ("failure", Some(NS_COMPRESS)) => NegotiationElement::CompressFailure {
            condition: element
                .children
                .first()
                .map(|(name, _)| name.clone())
                .unwrap_or_else(|| "setup-failed".to_string()),
        },
        ("handshake", _) => NegotiationElement::Handshake {
            digest: element.text.trim().to_string(),
        },
        ("message", _) | ("presence", _) | ("iq", _) => {
            NegotiationElement::Stanza(StanzaInfo {
                name: element.local.clone(),
                to: element.attr("to").map(str::to_string),
                from: element.attr("from").map(str::to_string),
                id: element.attr("id").map(str::to_string),
                raw: trimmed.to_string(),
            })
        }
        _ => NegotiationElement::Unknown {
            name: element.local.clone(),
            raw: trimmed.to_string(),
        },
    }
}

/// Parse a `<stream:features/>` element from the initiator's perspective.
pub fn parse_features(xml: &str) -> StreamFeatures {
    let mut reader = Reader::from_str(xml.trim());
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    let mut features = StreamFeatures::default();
    let mut path: Vec<String> = Vec::new();
    let mut pending_text_target: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(ev @ Event::Start(_)) | Ok(ev @ Event::Empty(_)) => {
                let (e, self_closing) = match &ev {
                    Event::Start(e) => (e, false),
                    Event::Empty(e) => (e, true),
                    _ => unreachable!(),
                };
                let local =
                    String::from_utf8_lossy(e.name().local_name().as_ref()).to_string();
                let mut xmlns = None;
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"xmlns" {
                        xmlns = Some(String::from_utf8_lossy(&attr.value).to_string());
                    }
                }

                match (path.len(), local.as_str(), xmlns.as_deref()) {
                    (1, "starttls", Some(NS_TLS)) => features.starttls = true,
                    (2, "required", _) if path.last().map(String::as_str) == Some("starttls") => {
                        features.starttls_required = true;
                    }
                    (2, "mechanism", _) => pending_text_target = Some("mechanism"),
                    (2, "method", _) => pending_text_target = Some("method"),
                    (1, "dialback", _) => features.dialback = true,
                    _ => {}
                }

                if !self_closing {
                    path.push(local);
                }
            }
            Ok(Event::End(_)) => {
                path.pop();
                pending_text_target = None;
                if path.is_empty() {
                    break;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().trim().to_string();
                if text.is_empty() {
                    continue;
                }
                match pending_text_target {
                    Some("mechanism") => features.mechanisms.push(text),
                    Some("method") => features.compression_methods.push(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    features
}
