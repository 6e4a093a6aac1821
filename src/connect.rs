//! Outbound TCP connection establishment.
//!
//! Combines SRV resolution with the address racer: candidates are resolved
//! concurrently, and connection attempts walk the racer's address order one
//! at a time until a socket is established or every address is exhausted.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dns::ServiceResolver;
use crate::happy_eyeballs::{HappyEyeballsResolver, ResolvedServiceAddress};

/// An established outbound socket, with the mode it must be wrapped in.
pub struct EstablishedConnection {
    pub stream: TcpStream,
    /// TLS-on-connect (from an xmpps SRV record) rather than STARTTLS.
    pub direct_tls: bool,
    pub address: ResolvedServiceAddress,
}

pub struct ConnectionEstablisher {
    resolver: ServiceResolver,
    prefer_ipv4: bool,
    resolution_delay: Duration,
    connect_timeout: Duration,
}

impl ConnectionEstablisher {
    pub fn new(
        resolver: ServiceResolver,
        prefer_ipv4: bool,
        resolution_delay: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            prefer_ipv4,
            resolution_delay,
            connect_timeout,
        }
    }

    /// Connect to the given domain, trying addresses in racer order.
    ///
    /// Returns `None` when every resolved address has been tried without
    /// success. Failed attempts are logged and skipped, not surfaced.
    pub async fn connect(&self, domain: &str, default_port: u16) -> Option<EstablishedConnection> {
        let candidates = self.resolver.resolve(domain, default_port).await;
        if candidates.is_empty() {
            // SRV "." target: the domain has declared the service unavailable.
            info!(domain, "Service explicitly unavailable, not connecting");
            return None;
        }
        debug!(domain, count = candidates.len(), "Resolved connection candidates");

        let racer = HappyEyeballsResolver::for_candidates(
            self.resolver.ip_resolver(),
            &candidates,
            self.prefer_ipv4,
            self.resolution_delay,
        );

        loop {
            match racer.next().await {
                Some(address) => {
                    debug!(domain, addr = %address.addr, "Attempting connection");
                    match timeout(self.connect_timeout, TcpStream::connect(address.addr)).await {
                        Ok(Ok(stream)) => {
                            info!(domain, addr = %address.addr, direct_tls = address.direct_tls,
                                  "Connection established");
                            racer.shutdown();
                            return Some(EstablishedConnection {
                                stream,
                                direct_tls: address.direct_tls,
                                address,
                            });
                        }
                        Ok(Err(e)) => {
                            warn!(domain, addr = %address.addr, error = %e, "Connection failed");
                        }
                        Err(_) => {
                            warn!(domain, addr = %address.addr,
                                  timeout_secs = self.connect_timeout.as_secs(),
                                  "Connection attempt timed out");
                        }
                    }
                }
                None => {
                    // A bounded round returned nothing. Stop only once the
                    // racer can never produce another address.
                    if racer.is_done() && racer.is_exhausted() {
                        warn!(domain, "All connection candidates exhausted");
                        racer.shutdown();
                        return None;
                    }
                }
            }
        }
    }
}
