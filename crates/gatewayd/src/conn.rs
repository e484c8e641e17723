//! Inbound connection wrapper
//!
//! Abstracts the accepted socket behind a single type so the proxy and
//! server never care whether the peer arrived over TCP, a unix socket, or
//! was upgraded to TLS. The upgrade is a one-shot capability: TLS enters
//! the gateway only through a caller-supplied [`TlsUpgrader`].

use async_trait::async_trait;
use gatewayd_common::error::{ErrorKind, GatewayError, Result};
use gatewayd_common::tls::TlsMaterial;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Apply NODELAY and keepalive to a proxied TCP socket. Dead peers on
/// either side of the gateway must surface in seconds, not after the
/// kernel's default two hours. A zero period disables keepalive.
pub(crate) fn tune_tcp_socket(stream: &TcpStream, keepalive_secs: u64) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!(error = %err, "could not set TCP_NODELAY");
    }
    if keepalive_secs == 0 {
        return;
    }

    let period = Duration::from_secs(keepalive_secs);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(period)
        .with_interval(period / 2 + Duration::from_secs(1));

    let sock = socket2::SockRef::from(stream);
    match sock
        .set_keepalive(true)
        .and_then(|()| sock.set_tcp_keepalive(&keepalive))
    {
        Ok(()) => debug!(keepalive_secs, "tcp socket tuned"),
        Err(err) => warn!(error = %err, "could not configure TCP keepalive"),
    }
}

/// Object-safe async stream, used for upgraded connections
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for T {}

/// Capability that layers TLS over a raw accepted socket
#[async_trait]
pub trait TlsUpgrader: Send + Sync {
    async fn upgrade(&self, stream: TcpStream) -> io::Result<Box<dyn AsyncStream>>;
}

/// rustls-backed upgrader for the inbound listener
pub struct RustlsUpgrader {
    acceptor: TlsAcceptor,
}

impl RustlsUpgrader {
    pub fn new(material: &TlsMaterial) -> Result<Self> {
        let config = material.server_config()?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl TlsUpgrader for RustlsUpgrader {
    async fn upgrade(&self, stream: TcpStream) -> io::Result<Box<dyn AsyncStream>> {
        let tls = self.acceptor.accept(stream).await?;
        Ok(Box::new(tls))
    }
}

/// The stream behind an inbound connection
///
/// The TLS variant is boxed: a TLS stream is much larger than a TcpStream.
enum InboundStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<dyn AsyncStream>),
    /// Transient state while the socket is being handed to an upgrader
    Detached,
}

/// An accepted inbound connection
pub struct Conn {
    stream: InboundStream,
    local_addr: String,
    remote_addr: String,
    tls_enabled: bool,
}

impl Conn {
    /// Wrap an accepted TCP stream, tuning the socket on the way in
    pub fn tcp(stream: TcpStream, keepalive_secs: u64) -> Self {
        tune_tcp_socket(&stream, keepalive_secs);
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let remote_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Self {
            stream: InboundStream::Tcp(stream),
            local_addr,
            remote_addr,
            tls_enabled: false,
        }
    }

    /// Wrap an accepted unix stream.
    ///
    /// Unix peers are usually unnamed, so the caller supplies a unique key
    /// that stands in for the remote address.
    pub fn unix(stream: UnixStream, key: String) -> Self {
        let local_addr = stream
            .local_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "unix".to_string());
        Self {
            stream: InboundStream::Unix(stream),
            local_addr,
            remote_addr: key,
            tls_enabled: false,
        }
    }

    /// The listener-side address
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// The peer address; doubles as the lease key in the busy pool
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Whether reads and writes pass through a TLS layer
    pub fn is_tls_enabled(&self) -> bool {
        self.tls_enabled
    }

    /// Read into `buf`, returning the number of bytes read (0 on EOF)
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            InboundStream::Tcp(s) => s.read(buf).await,
            InboundStream::Unix(s) => s.read(buf).await,
            InboundStream::Tls(s) => s.read(buf).await,
            InboundStream::Detached => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Write all of `buf` and flush
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        match &mut self.stream {
            InboundStream::Tcp(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            InboundStream::Unix(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            InboundStream::Tls(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            InboundStream::Detached => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Shut the stream down
    pub async fn close(&mut self) -> io::Result<()> {
        match &mut self.stream {
            InboundStream::Tcp(s) => s.shutdown().await,
            InboundStream::Unix(s) => s.shutdown().await,
            InboundStream::Tls(s) => s.shutdown().await,
            InboundStream::Detached => Ok(()),
        }
    }

    /// Layer TLS over the raw socket. One-shot: a second call fails with
    /// `AlreadyUpgraded`. All subsequent reads and writes pass through the
    /// TLS layer for the lifetime of the connection.
    pub async fn upgrade_to_tls(&mut self, upgrader: &dyn TlsUpgrader) -> Result<()> {
        if self.tls_enabled {
            return Err(GatewayError::new(ErrorKind::AlreadyUpgraded));
        }
        match std::mem::replace(&mut self.stream, InboundStream::Detached) {
            InboundStream::Tcp(raw) => match upgrader.upgrade(raw).await {
                Ok(upgraded) => {
                    self.stream = InboundStream::Tls(upgraded);
                    self.tls_enabled = true;
                    debug!(remote = %self.remote_addr, "connection upgraded to TLS");
                    Ok(())
                }
                Err(err) => Err(GatewayError::new(ErrorKind::ClientConnectionFailed)
                    .with_message("TLS upgrade failed")
                    .wrap(err)),
            },
            other => {
                self.stream = other;
                Err(GatewayError::new(ErrorKind::ClientConnectionFailed)
                    .with_message("TLS upgrade requires a raw TCP stream"))
            }
        }
    }
}
