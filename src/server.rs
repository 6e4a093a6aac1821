//! Listener frontend: accept loops for client, server and component ports,
//! and the per-connection driver that feeds received elements to the stream
//! negotiator and carries out its actions.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connect::ConnectionEstablisher;
use crate::dialback::{KeyVerifier, RemoteKeyVerifier};
use crate::dns::ServiceResolver;
use crate::error::NegotiationError;
use crate::framing::{self, StanzaInfo};
use crate::negotiator::{NegotiationAction, RoleProfile, StreamNegotiator};
use crate::sasl::{CredentialStore, SaslEngine, ScramCredentials};
use crate::session::{generate_stream_id, AuthenticationMethod};
use crate::tls::{create_tls_acceptor, ServerIdentity};
use crate::transport::Transport;

/// Inactivity timeout before the watchdog closes a connection.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the watchdog checks for inactivity.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Where authenticated sessions and their stanzas are handed off to.
pub trait StanzaRouter: Send + Sync {
    fn session_authenticated(&self, identity: &str, method: AuthenticationMethod);
    fn route(&self, origin: &str, stanza: StanzaInfo);
}

/// Default router: logs and drops. Real routing lives outside this core.
pub struct LoggingRouter;

impl StanzaRouter for LoggingRouter {
    fn session_authenticated(&self, identity: &str, method: AuthenticationMethod) {
        info!(identity, ?method, "Session handed to router");
    }

    fn route(&self, origin: &str, stanza: StanzaInfo) {
        debug!(origin, stanza = %stanza.name, to = ?stanza.to, "Stanza routed");
    }
}

/// Credential store backed by the configuration's account map.
pub struct ConfigCredentialStore {
    users: HashMap<String, String>,
    salt_seed: String,
}

impl ConfigCredentialStore {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self {
            users,
            // Per-process salt seed: SCRAM verifiers stay stable within a
            // run, which is all a config-backed store can promise.
            salt_seed: generate_stream_id(),
        }
    }
}

impl CredentialStore for ConfigCredentialStore {
    fn supports_password_retrieval(&self) -> bool {
        true
    }

    fn supports_scram(&self) -> bool {
        true
    }

    fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .map(|p| p == password)
            .unwrap_or(false)
    }

    fn scram_credentials(&self, username: &str) -> Option<ScramCredentials> {
        let password = self.users.get(username)?;
        let salt = format!("{}:{}", self.salt_seed, username);
        Some(ScramCredentials::derive(password, salt.as_bytes(), 4096))
    }

    fn is_disabled(&self, _username: &str) -> bool {
        false
    }
}

/// RAII guard that decrements the connection counter when dropped.
/// Ensures cleanup even if the connection handler panics or returns early.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        info!(active = prev - 1, "Connection closed");
    }
}

/// Shared state every connection handler needs.
pub struct ServerContext {
    pub config: Arc<Config>,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub store: Arc<dyn CredentialStore>,
    pub key_verifier: Arc<dyn KeyVerifier>,
    pub router: Arc<dyn StanzaRouter>,
    pub dialback_secret: String,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundAddrs {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub component: SocketAddr,
}

pub struct XmppServer {
    context: Arc<ServerContext>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
    active_connections: Arc<AtomicUsize>,
    bound: Option<BoundAddrs>,
}

impl XmppServer {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn CredentialStore>,
        router: Arc<dyn StanzaRouter>,
    ) -> Result<Self, String> {
        let tls_acceptor = match (&config.tls.certificate_chain, &config.tls.private_key) {
            (Some(chain), Some(key)) => {
                let identity = ServerIdentity::load(chain, key)?;
                Some(create_tls_acceptor(&identity)?)
            }
            _ => {
                warn!("No server certificate configured, STARTTLS unavailable");
                None
            }
        };

        let resolver = ServiceResolver::from_system(&config.dns.overrides, config.dns.allow_direct_tls);
        let establisher = ConnectionEstablisher::new(
            resolver,
            config.dns.prefer_ipv4,
            config.resolution_delay(),
            config.connect_timeout(),
        );
        let key_verifier: Arc<dyn KeyVerifier> = Arc::new(RemoteKeyVerifier::new(
            establisher,
            config.default_server_port,
        ));

        // Fresh per process: dialback keys do not survive restarts.
        let dialback_secret = format!("{}{}", generate_stream_id(), generate_stream_id());

        Ok(Self {
            context: Arc::new(ServerContext {
                config,
                tls_acceptor,
                store,
                key_verifier,
                router,
                dialback_secret,
            }),
            shutdown_tx: None,
            tasks: Vec::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
            bound: None,
        })
    }

    /// Swap the dialback key verifier. Only effective before `start`, while
    /// no accept loop holds a reference to the context.
    pub fn set_key_verifier(&mut self, verifier: Arc<dyn KeyVerifier>) {
        match Arc::get_mut(&mut self.context) {
            Some(context) => context.key_verifier = verifier,
            None => warn!("Key verifier not replaced, server already started"),
        }
    }

    pub fn bound_addrs(&self) -> Option<BoundAddrs> {
        self.bound
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub async fn start(&mut self) -> Result<BoundAddrs, String> {
        let config = &self.context.config;
        let client_listener = TcpListener::bind(&config.bind.client)
            .await
            .map_err(|e| format!("Failed to bind client port {}: {}", config.bind.client, e))?;
        let server_listener = TcpListener::bind(&config.bind.server)
            .await
            .map_err(|e| format!("Failed to bind server port {}: {}", config.bind.server, e))?;
        let component_listener = TcpListener::bind(&config.bind.component)
            .await
            .map_err(|e| format!("Failed to bind component port {}: {}", config.bind.component, e))?;

        let bound = BoundAddrs {
            client: client_listener
                .local_addr()
                .map_err(|e| format!("Failed to get local address: {}", e))?,
            server: server_listener
                .local_addr()
                .map_err(|e| format!("Failed to get local address: {}", e))?,
            component: component_listener
                .local_addr()
                .map_err(|e| format!("Failed to get local address: {}", e))?,
        };
        self.bound = Some(bound);
        info!(client = %bound.client, server = %bound.server, component = %bound.component,
              "Listeners bound");

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        for (listener, profile, kind) in [
            (client_listener, RoleProfile::client(), "client"),
            (server_listener, RoleProfile::server(), "server"),
            (component_listener, RoleProfile::component(), "component"),
        ] {
            let context = self.context.clone();
            let shutdown_tx = shutdown_tx.clone();
            let active = self.active_connections.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut shutdown_rx = shutdown_tx.subscribe();
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            let (stream, addr) = match accepted {
                                Ok(pair) => pair,
                                Err(e) => {
                                    error!(error = %e, kind, "Accept failed");
                                    continue;
                                }
                            };
                            let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                            let prev = active.fetch_add(1, Ordering::SeqCst);
                            info!(conn_id, addr = %addr, kind, active = prev + 1, "New connection");

                            let context = context.clone();
                            let shutdown = shutdown_tx.subscribe();
                            let counter = active.clone();
                            tokio::spawn(async move {
                                let _guard = ConnectionGuard::new(counter);
                                if let Err(e) =
                                    handle_connection(stream, profile, context, shutdown, conn_id).await
                                {
                                    info!(conn_id, error = %e, "Connection ended with error");
                                }
                            });
                        }
                        _ = shutdown_rx.recv() => {
                            info!(kind, "Listener shutting down");
                            break;
                        }
                    }
                }
            }));
        }
        Ok(bound)
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.bound = None;
    }
}

enum Flow {
    Continue,
    Close,
}

/// Drive one connection: read, frame, classify, feed the negotiator, carry
/// out its actions. Exactly one reader per socket.
async fn handle_connection(
    stream: TcpStream,
    profile: RoleProfile,
    ctx: Arc<ServerContext>,
    mut shutdown: broadcast::Receiver<()>,
    conn_id: u64,
) -> Result<(), NegotiationError> {
    let mut transport = Transport::plain(stream);
    let sasl = SaslEngine::new(ctx.config.sasl.clone(), ctx.store.clone());
    let mut negotiator = StreamNegotiator::new(
        profile,
        ctx.config.clone(),
        sasl,
        ctx.dialback_secret.clone(),
    );

    let mut buffer: Vec<u8> = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    let mut last_activity = tokio::time::Instant::now();

    loop {
        // Drain every complete element before reading more.
        while let Some((raw, consumed)) = framing::extract_element(&buffer) {
            buffer.drain(..consumed);
            let element = framing::classify(&raw);
            let result = match negotiator.handle(element) {
                Ok(actions) => {
                    apply_actions(actions, &mut transport, &mut negotiator, &mut buffer, &ctx)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => {
                    let _ = transport.flush().await;
                    return Ok(());
                }
                Err(e) => {
                    if let Some(kind) = e.stream_error() {
                        let _ = transport.write_all(kind.to_xml().as_bytes()).await;
                        let _ = transport.write_all(b"</stream:stream>").await;
                        let _ = transport.flush().await;
                    }
                    return Err(e);
                }
            }
        }

        tokio::select! {
            read = transport.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!(conn_id, "Peer closed connection");
                    return Ok(());
                }
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    last_activity = tokio::time::Instant::now();
                }
                Err(e) => return Err(e.into()),
            },
            _ = shutdown.recv() => {
                debug!(conn_id, "Closing connection for shutdown");
                let _ = transport.write_all(b"</stream:stream>").await;
                let _ = transport.flush().await;
                return Ok(());
            }
            _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {
                if last_activity.elapsed() > INACTIVITY_TIMEOUT {
                    warn!(conn_id, idle_secs = last_activity.elapsed().as_secs(),
                          "Inactivity watchdog triggered, closing connection");
                    let _ = transport.write_all(b"</stream:stream>").await;
                    let _ = transport.flush().await;
                    return Ok(());
                }
            }
        }
    }
}

async fn apply_actions(
    actions: Vec<NegotiationAction>,
    transport: &mut Transport,
    negotiator: &mut StreamNegotiator,
    buffer: &mut Vec<u8>,
    ctx: &ServerContext,
) -> Result<Flow, NegotiationError> {
    let mut queue: VecDeque<NegotiationAction> = actions.into();
    while let Some(action) = queue.pop_front() {
        match action {
            NegotiationAction::Send(xml) => {
                transport.write_all(xml.as_bytes()).await?;
                transport.flush().await?;
            }
            NegotiationAction::StartTls => {
                let acceptor = ctx.tls_acceptor.as_ref().ok_or_else(|| {
                    NegotiationError::TlsHandshake("no server certificate configured".to_string())
                })?;
                transport.flush().await?;
                // Anything the peer pipelined before the handshake is void.
                buffer.clear();
                transport.accept_tls_in_place(acceptor).await?;
                negotiator.tls_established(transport.peer_certificate().cloned());
            }
            NegotiationAction::EnableCompression => {
                transport.flush().await?;
                buffer.clear();
                transport.enable_compression_in_place()?;
                negotiator.compression_enabled();
            }
            NegotiationAction::VerifyDialbackKey {
                local,
                remote,
                stream_id,
                key,
            } => {
                let verdict = ctx
                    .key_verifier
                    .verify(&local, &remote, &stream_id, &key)
                    .await;
                let followups = negotiator.dialback_verdict(verdict)?;
                for followup in followups.into_iter().rev() {
                    queue.push_front(followup);
                }
            }
            NegotiationAction::Authenticated { identity, method } => {
                ctx.router.session_authenticated(&identity, method);
            }
            NegotiationAction::RouteStanza(stanza) => {
                let origin = negotiator.authenticated_identity().unwrap_or_default();
                ctx.router.route(origin, stanza);
            }
            NegotiationAction::Close => {
                transport.flush().await?;
                return Ok(Flow::Close);
            }
        }
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::dialback::{self, DialbackVerdict, LocalKeyVerifier};
    use crate::session::component_handshake_digest;

    struct RecordingRouter {
        authenticated: Mutex<Vec<(String, AuthenticationMethod)>>,
        stanzas: Mutex<Vec<(String, StanzaInfo)>>,
    }

    impl RecordingRouter {
        fn new() -> Self {
            Self {
                authenticated: Mutex::new(Vec::new()),
                stanzas: Mutex::new(Vec::new()),
            }
        }
    }

    impl StanzaRouter for RecordingRouter {
        fn session_authenticated(&self, identity: &str, method: AuthenticationMethod) {
            self.authenticated
                .lock()
                .unwrap()
                .push((identity.to_string(), method));
        }

        fn route(&self, origin: &str, stanza: StanzaInfo) {
            self.stanzas
                .lock()
                .unwrap()
                .push((origin.to_string(), stanza));
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.served_domains = vec!["example.org".to_string()];
        config
            .component_secrets
            .insert("comp.example.org".to_string(), "s3cret".to_string());
        config
            .users
            .insert("jane".to_string(), "secret".to_string());
        config.dialback.enabled = true;
        config.bind.client = "127.0.0.1:0".to_string();
        config.bind.server = "127.0.0.1:0".to_string();
        config.bind.component = "127.0.0.1:0".to_string();
        config
    }

    async fn start_server(config: Config) -> (XmppServer, BoundAddrs, Arc<RecordingRouter>) {
        let router = Arc::new(RecordingRouter::new());
        let store = Arc::new(ConfigCredentialStore::new(config.users.clone()));
        let mut server = XmppServer::new(Arc::new(config), store, router.clone()).unwrap();
        let bound = server.start().await.unwrap();
        (server, bound, router)
    }

    async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
        let mut collected = String::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .expect("read timed out")
                .unwrap();
            assert!(n > 0, "peer closed while waiting for {:?}, got {:?}", needle, collected);
            collected.push_str(&String::from_utf8_lossy(&chunk[..n]));
            if collected.contains(needle) {
                return collected;
            }
        }
    }

    #[tokio::test]
    async fn test_component_session_end_to_end() {
        let (mut server, bound, router) = start_server(test_config()).await;

        let mut stream = TcpStream::connect(bound.component).await.unwrap();
        stream
            .write_all(
                b"<stream:stream xmlns='jabber:component:accept' \
                  xmlns:stream='http://etherx.jabber.org/streams' to='comp.example.org'>",
            )
            .await
            .unwrap();
        let header = read_until(&mut stream, "id='").await;
        let id_start = header.find("id='").unwrap() + 4;
        let id_end = header[id_start..].find('\'').unwrap() + id_start;
        let stream_id = &header[id_start..id_end];

        let digest = component_handshake_digest(stream_id, "s3cret");
        stream
            .write_all(format!("<handshake>{}</handshake>", digest).as_bytes())
            .await
            .unwrap();
        read_until(&mut stream, "<handshake/>").await;

        stream
            .write_all(b"<message from='comp.example.org' to='user@example.org' id='m1'><body>hi</body></message>")
            .await
            .unwrap();

        // Routing is asynchronous from the client's perspective.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !router.stanzas.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stanza never routed");

        {
            let authenticated = router.authenticated.lock().unwrap();
            assert_eq!(
                authenticated[0],
                (
                    "comp.example.org".to_string(),
                    AuthenticationMethod::ComponentHandshake
                )
            );
            let stanzas = router.stanzas.lock().unwrap();
            assert_eq!(stanzas[0].0, "comp.example.org");
            assert_eq!(stanzas[0].1.name, "message");
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_component_bad_digest_gets_stream_error() {
        let (mut server, bound, _router) = start_server(test_config()).await;

        let mut stream = TcpStream::connect(bound.component).await.unwrap();
        stream
            .write_all(
                b"<stream:stream xmlns='jabber:component:accept' \
                  xmlns:stream='http://etherx.jabber.org/streams' to='comp.example.org'>",
            )
            .await
            .unwrap();
        read_until(&mut stream, "id='").await;

        stream
            .write_all(b"<handshake>wrongdigest</handshake>")
            .await
            .unwrap();
        let reply = read_until(&mut stream, "</stream:stream>").await;
        assert!(reply.contains("not-authorized"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_client_plain_login_and_message() {
        let (mut server, bound, router) = start_server(test_config()).await;

        let mut stream = TcpStream::connect(bound.client).await.unwrap();
        let header = "<stream:stream xmlns='jabber:client' \
                      xmlns:stream='http://etherx.jabber.org/streams' to='example.org' version='1.0'>";
        stream.write_all(header.as_bytes()).await.unwrap();
        let features = read_until(&mut stream, "</stream:features>").await;
        assert!(features.contains("PLAIN"));

        // \0jane\0secret
        stream
            .write_all(b"<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGphbmUAc2VjcmV0</auth>")
            .await
            .unwrap();
        read_until(&mut stream, "<success").await;

        // Stream restart after SASL.
        stream.write_all(header.as_bytes()).await.unwrap();
        let features = read_until(&mut stream, "</stream:features>").await;
        assert!(!features.contains("<mechanisms"));

        stream
            .write_all(b"<message from='jane@example.org' to='john@example.org' id='m1'><body>hello</body></message>")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !router.stanzas.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stanza never routed");

        assert_eq!(router.stanzas.lock().unwrap()[0].0, "jane");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_host_gets_host_unknown() {
        let (mut server, bound, _router) = start_server(test_config()).await;

        let mut stream = TcpStream::connect(bound.client).await.unwrap();
        stream
            .write_all(
                b"<stream:stream xmlns='jabber:client' \
                  xmlns:stream='http://etherx.jabber.org/streams' to='nowhere.example' version='1.0'>",
            )
            .await
            .unwrap();
        let reply = read_until(&mut stream, "</stream:stream>").await;
        assert!(reply.contains("host-unknown"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_s2s_dialback_session() {
        let config = test_config();
        let router = Arc::new(RecordingRouter::new());
        let store = Arc::new(ConfigCredentialStore::new(config.users.clone()));
        let mut server = XmppServer::new(Arc::new(config), store, router.clone()).unwrap();
        // Stand in for the remote's authoritative server.
        server.set_key_verifier(Arc::new(LocalKeyVerifier::new("originator-secret")));
        let bound = server.start().await.unwrap();

        let mut stream = TcpStream::connect(bound.server).await.unwrap();
        stream
            .write_all(
                b"<stream:stream xmlns='jabber:server' \
                  xmlns:stream='http://etherx.jabber.org/streams' \
                  xmlns:db='jabber:server:dialback' from='remote.example' \
                  to='example.org' version='1.0'>",
            )
            .await
            .unwrap();
        let header = read_until(&mut stream, "</stream:features>").await;
        assert!(header.contains("urn:xmpp:features:dialback"));
        let id_start = header.find("id='").unwrap() + 4;
        let id_end = header[id_start..].find('\'').unwrap() + id_start;
        let stream_id = header[id_start..id_end].to_string();

        let key = dialback::dialback_key(&stream_id, "originator-secret");
        stream
            .write_all(
                format!(
                    "<db:result from='remote.example' to='example.org'>{}</db:result>",
                    key
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let verdict = read_until(&mut stream, "type=").await;
        assert!(verdict.contains("type='valid'"));

        stream
            .write_all(b"<message from='user@remote.example' to='user@example.org' id='m1'/>")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !router.stanzas.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stanza never routed");

        assert_eq!(
            router.authenticated.lock().unwrap()[0],
            ("remote.example".to_string(), AuthenticationMethod::Dialback)
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_dialback_key_is_invalid() {
        let config = test_config();
        let router = Arc::new(RecordingRouter::new());
        let store = Arc::new(ConfigCredentialStore::new(config.users.clone()));
        let mut server = XmppServer::new(Arc::new(config), store, router).unwrap();
        server.set_key_verifier(Arc::new(LocalKeyVerifier::new("originator-secret")));
        let bound = server.start().await.unwrap();

        let mut stream = TcpStream::connect(bound.server).await.unwrap();
        stream
            .write_all(
                b"<stream:stream xmlns='jabber:server' \
                  xmlns:stream='http://etherx.jabber.org/streams' \
                  xmlns:db='jabber:server:dialback' from='remote.example' \
                  to='example.org' version='1.0'>",
            )
            .await
            .unwrap();
        read_until(&mut stream, "</stream:features>").await;

        stream
            .write_all(b"<db:result from='remote.example' to='example.org'>bogus</db:result>")
            .await
            .unwrap();
        let verdict = read_until(&mut stream, "type=").await;
        assert!(verdict.contains("type='invalid'"));
        server.stop().await;
    }

    #[test]
    fn test_local_verifier_verdicts_align_with_reply_attrs() {
        assert_eq!(DialbackVerdict::Valid.type_attr(), "valid");
        assert_eq!(DialbackVerdict::Invalid.type_attr(), "invalid");
        assert_eq!(DialbackVerdict::Error.type_attr(), "error");
    }
}
