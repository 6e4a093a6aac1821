//! XMPP server connection core: service discovery over DNS SRV, dual-stack
//! connection racing, and stream negotiation (STARTTLS, SASL, server
//! dialback, stream compression) for client, server and component streams.

pub mod compression;
pub mod config;
pub mod connect;
pub mod dialback;
pub mod dns;
pub mod error;
pub mod framing;
pub mod happy_eyeballs;
pub mod negotiator;
pub mod outgoing;
pub mod sasl;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;
