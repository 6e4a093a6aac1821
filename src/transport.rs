//! The connection transport: a plain TCP stream that can be upgraded in
//! place, first to TLS and then to zlib compression. Each upgrade consumes
//! the transport and returns a new one wrapping the previous layer.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::compression::ZlibStream;
use crate::error::NegotiationError;
use crate::tls::{client_chain_is_trusted, is_insecure_tls, parse_peer_certificate, PeerCertificate};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

pub struct Transport {
    stream: BoxedStream,
    tls: bool,
    compressed: bool,
    peer_certificate: Option<PeerCertificate>,
}

impl Transport {
    pub fn plain(stream: TcpStream) -> Self {
        Self {
            stream: Box::new(stream),
            tls: false,
            compressed: false,
            peer_certificate: None,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn peer_certificate(&self) -> Option<&PeerCertificate> {
        self.peer_certificate.as_ref()
    }

    /// Server-side TLS upgrade. The acceptor admits any presented client
    /// certificate; the trust verdict against the system roots is recorded
    /// here for the negotiation layer to act on.
    pub async fn accept_tls(self, acceptor: &TlsAcceptor) -> Result<Self, NegotiationError> {
        if self.tls {
            return Err(NegotiationError::TlsHandshake(
                "TLS already established".to_string(),
            ));
        }
        let tls_stream = acceptor
            .accept(self.stream)
            .await
            .map_err(|e| NegotiationError::TlsHandshake(e.to_string()))?;

        let peer_certificate = tls_stream.get_ref().1.peer_certificates().and_then(|chain| {
            let end_entity = chain.first()?;
            let trusted = client_chain_is_trusted(chain);
            Some(parse_peer_certificate(end_entity.as_ref(), trusted))
        });
        if let Some(cert) = &peer_certificate {
            debug!(
                identities = ?cert.identities,
                trusted = cert.trusted,
                self_signed = cert.self_signed,
                "Peer presented client certificate"
            );
        }

        Ok(Self {
            stream: Box::new(tls_stream),
            tls: true,
            compressed: false,
            peer_certificate,
        })
    }

    /// Client-side TLS upgrade, used when this server initiates outbound.
    pub async fn connect_tls(
        self,
        connector: &TlsConnector,
        hostname: &str,
    ) -> Result<Self, NegotiationError> {
        if self.tls {
            return Err(NegotiationError::TlsHandshake(
                "TLS already established".to_string(),
            ));
        }
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|e| NegotiationError::TlsHandshake(format!("invalid SNI name: {}", e)))?;
        let tls_stream = connector
            .connect(server_name, self.stream)
            .await
            .map_err(|e| NegotiationError::TlsHandshake(e.to_string()))?;

        let peer_certificate = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|der| parse_peer_certificate(der.as_ref(), !is_insecure_tls()));

        Ok(Self {
            stream: Box::new(tls_stream),
            tls: true,
            compressed: false,
            peer_certificate,
        })
    }

    /// In-place variant of `accept_tls` for drivers that hold the transport
    /// behind a mutable reference. On handshake failure the transport is
    /// left unusable, which is fine: the connection closes anyway.
    pub async fn accept_tls_in_place(
        &mut self,
        acceptor: &TlsAcceptor,
    ) -> Result<(), NegotiationError> {
        if self.tls {
            return Err(NegotiationError::TlsHandshake(
                "TLS already established".to_string(),
            ));
        }
        let stream = std::mem::replace(&mut self.stream, Box::new(tokio::io::empty()));
        let tls_stream = acceptor
            .accept(stream)
            .await
            .map_err(|e| NegotiationError::TlsHandshake(e.to_string()))?;

        let peer_certificate = tls_stream.get_ref().1.peer_certificates().and_then(|chain| {
            let end_entity = chain.first()?;
            let trusted = client_chain_is_trusted(chain);
            Some(parse_peer_certificate(end_entity.as_ref(), trusted))
        });
        if let Some(cert) = &peer_certificate {
            debug!(
                identities = ?cert.identities,
                trusted = cert.trusted,
                self_signed = cert.self_signed,
                "Peer presented client certificate"
            );
        }

        self.stream = Box::new(tls_stream);
        self.tls = true;
        self.peer_certificate = peer_certificate;
        Ok(())
    }

    /// In-place variant of `enable_compression`.
    pub fn enable_compression_in_place(&mut self) -> Result<(), NegotiationError> {
        if self.compressed {
            return Err(NegotiationError::Malformed(
                "compression already enabled".to_string(),
            ));
        }
        let stream = std::mem::replace(&mut self.stream, Box::new(tokio::io::empty()));
        self.stream = Box::new(ZlibStream::new(stream));
        self.compressed = true;
        Ok(())
    }

    /// Wrap the current layer in zlib compression.
    pub fn enable_compression(self) -> Result<Self, NegotiationError> {
        if self.compressed {
            return Err(NegotiationError::Malformed(
                "compression already enabled".to_string(),
            ));
        }
        Ok(Self {
            stream: Box::new(ZlibStream::new(self.stream)),
            tls: self.tls,
            compressed: true,
            peer_certificate: self.peer_certificate,
        })
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
