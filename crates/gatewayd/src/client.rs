//! Upstream client connections
//!
//! A `Client` is one pre-connected socket to the backend with framed
//! send/receive under deadlines. Any I/O failure transitions the client to
//! disconnected and surfaces as a typed error; a closed client can never be
//! reused.

use crate::conn::tune_tcp_socket;
use gatewayd_common::config::{ClientSettings, Network};
use gatewayd_common::error::{ErrorKind, GatewayError, Result};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, UnixStream};
use tokio::time::timeout;
use tracing::debug;

/// Identity source for sockets without a usable local address (udp, unix)
static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Protocol-specific health probe frame and its expected echo
///
/// The gateway core is protocol-opaque; what a "safe" probe looks like
/// depends on the backend, so the frame lives behind this capability.
pub trait HealthProbe: Send + Sync {
    /// The probe frame to write to an idle upstream
    fn request(&self) -> Vec<u8>;
    /// Whether the bytes read back are the expected echo
    fn validate(&self, response: &[u8]) -> bool;
}

/// PostgreSQL-shaped probe: an SSLRequest frame, answered by a single
/// `S` or `N` byte. Session-neutral on an idle PostgreSQL connection.
pub struct PostgresSslProbe;

impl HealthProbe for PostgresSslProbe {
    fn request(&self) -> Vec<u8> {
        // Length 8, then the SSLRequest code 80877103.
        vec![0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f]
    }

    fn validate(&self, response: &[u8]) -> bool {
        matches!(response.first(), Some(b'S') | Some(b'N'))
    }
}

/// The connected socket behind a client
enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Unix(UnixStream),
}

impl Transport {
    fn identity(&self) -> String {
        let named = match self {
            Transport::Tcp(s) => s.local_addr().ok().map(|a| a.to_string()),
            Transport::Udp(s) => s.local_addr().ok().map(|a| a.to_string()),
            Transport::Unix(s) => s
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string())),
        };
        named.unwrap_or_else(|| format!("client-{}", CLIENT_SEQ.fetch_add(1, Ordering::Relaxed)))
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.write_all(data).await,
            Transport::Unix(s) => s.write_all(data).await,
            Transport::Udp(s) => {
                let n = s.send(data).await?;
                if n != data.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "datagram was truncated",
                    ));
                }
                Ok(())
            }
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf).await,
            Transport::Unix(s) => s.read(buf).await,
            Transport::Udp(s) => s.recv(buf).await,
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.try_read(buf),
            Transport::Unix(s) => s.try_read(buf),
            Transport::Udp(s) => s.try_recv(buf),
        }
    }
}

/// One upstream connection with framed send/receive under deadlines
pub struct Client {
    network: Network,
    address: String,
    receive_buffer_size: usize,
    dial_timeout: Duration,
    send_deadline: Duration,
    receive_deadline: Duration,
    tcp_keepalive_secs: u64,
    transport: Option<Transport>,
    id: String,
    closed: bool,
}

impl Client {
    /// Create a disconnected client from settings
    pub fn new(settings: &ClientSettings) -> Self {
        Self {
            network: settings.network,
            address: settings.address.clone(),
            receive_buffer_size: settings.receive_buffer_size,
            dial_timeout: settings.dial_timeout(),
            send_deadline: settings.send_deadline(),
            receive_deadline: settings.receive_deadline(),
            tcp_keepalive_secs: settings.tcp_keepalive_secs,
            transport: None,
            id: String::new(),
            closed: false,
        }
    }

    /// Establish the socket. A closed client refuses to reconnect.
    pub async fn connect(&mut self) -> Result<()> {
        if self.closed {
            return Err(GatewayError::new(ErrorKind::ClientConnectionFailed)
                .with_message("a closed client cannot be reconnected"));
        }
        if self.transport.is_some() {
            return Ok(());
        }

        let transport = match self.network {
            Network::Tcp => {
                let stream = timeout(self.dial_timeout, TcpStream::connect(&self.address))
                    .await
                    .map_err(|e| self.dial_error("dial timed out", e))?
                    .map_err(|e| self.dial_error("dial failed", e))?;
                tune_tcp_socket(&stream, self.tcp_keepalive_secs);
                Transport::Tcp(stream)
            }
            Network::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .map_err(|e| self.dial_error("bind failed", e))?;
                socket
                    .connect(&self.address)
                    .await
                    .map_err(|e| self.dial_error("dial failed", e))?;
                Transport::Udp(socket)
            }
            Network::Unix => {
                let stream = timeout(self.dial_timeout, UnixStream::connect(&self.address))
                    .await
                    .map_err(|e| self.dial_error("dial timed out", e))?
                    .map_err(|e| self.dial_error("dial failed", e))?;
                Transport::Unix(stream)
            }
        };

        self.id = transport.identity();
        self.transport = Some(transport);
        debug!(id = %self.id, address = %self.address, "upstream connected");
        Ok(())
    }

    fn dial_error(
        &self,
        what: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> GatewayError {
        GatewayError::new(ErrorKind::ClientConnectionFailed)
            .with_message(format!("{what}: {} {}", self.network, self.address))
            .wrap(source)
    }

    /// Write all bytes under the write deadline
    pub async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(GatewayError::new(ErrorKind::ClientNotConnected));
        };
        match timeout(self.send_deadline, transport.write_all(data)).await {
            Ok(Ok(())) => Ok(data.len()),
            Ok(Err(err)) => {
                self.transport = None;
                Err(GatewayError::new(ErrorKind::ClientSendFailed).wrap(err))
            }
            Err(elapsed) => {
                self.transport = None;
                Err(GatewayError::new(ErrorKind::ClientSendFailed)
                    .with_message("send deadline exceeded")
                    .wrap(elapsed))
            }
        }
    }

    /// Read up to the receive buffer size under the read deadline.
    /// EOF counts as a receive failure: the upstream is gone.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(GatewayError::new(ErrorKind::ClientNotConnected));
        };
        let mut buf = vec![0u8; self.receive_buffer_size];
        match timeout(self.receive_deadline, transport.read(&mut buf)).await {
            Ok(Ok(0)) => {
                self.transport = None;
                Err(GatewayError::new(ErrorKind::ClientReceiveFailed)
                    .with_message("upstream closed the connection")
                    .wrap(io::Error::from(io::ErrorKind::UnexpectedEof)))
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(err)) => {
                self.transport = None;
                Err(GatewayError::new(ErrorKind::ClientReceiveFailed).wrap(err))
            }
            Err(elapsed) => {
                self.transport = None;
                Err(GatewayError::new(ErrorKind::ClientReceiveFailed)
                    .with_message("receive deadline exceeded")
                    .wrap(elapsed))
            }
        }
    }

    /// Discard any bytes already buffered on the socket
    pub fn drain(&mut self) {
        let mut scratch = [0u8; 4096];
        loop {
            let result = match self.transport.as_ref() {
                Some(transport) => transport.try_read(&mut scratch),
                None => return,
            };
            match result {
                Ok(0) => {
                    self.transport = None;
                    return;
                }
                Ok(n) => debug!(id = %self.id, n, "drained stale upstream bytes"),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(_) => {
                    self.transport = None;
                    return;
                }
            }
        }
    }

    /// Probe the upstream: write the probe frame and check the echo
    pub async fn is_healthy(&mut self, probe: &dyn HealthProbe) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.send(&probe.request()).await.is_err() {
            return false;
        }
        match self.receive().await {
            Ok(response) => probe.validate(&response),
            Err(_) => false,
        }
    }

    /// True while a live socket is held
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Release the socket. The client can never be reused afterwards.
    pub fn close(&mut self) {
        self.transport = None;
        self.closed = true;
    }

    /// Identity string: the socket's own local address
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The configured upstream address
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn settings(address: String) -> ClientSettings {
        ClientSettings {
            address,
            receive_deadline_secs: 1,
            send_deadline_secs: 1,
            dial_timeout_secs: 1,
            ..ClientSettings::default()
        }
    }

    async fn echo_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        (listener, address)
    }

    #[tokio::test]
    async fn test_connect_send_receive() {
        let (listener, address) = echo_listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut client = Client::new(&settings(address));
        assert!(!client.is_connected());
        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert!(!client.id().is_empty());

        client.send(b"ping").await.unwrap();
        let reply = client.receive().await.unwrap();
        assert_eq!(reply, b"ping");
    }

    #[tokio::test]
    async fn test_send_without_connect() {
        let mut client = Client::new(&settings("127.0.0.1:1".into()));
        let err = client.send(b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientNotConnected);
    }

    #[tokio::test]
    async fn test_receive_deadline() {
        let (listener, address) = echo_listener().await;
        tokio::spawn(async move {
            // Accept but never respond.
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client = Client::new(&settings(address));
        client.connect().await.unwrap();
        let err = client.receive().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientReceiveFailed);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_upstream_eof_is_receive_failure() {
        let (listener, address) = echo_listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut client = Client::new(&settings(address));
        client.connect().await.unwrap();
        let err = client.receive().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientReceiveFailed);
        let original = err.original().expect("EOF cause");
        assert!(original.to_string().to_lowercase().contains("eof"));
    }

    #[tokio::test]
    async fn test_closed_client_is_never_reused() {
        let (listener, address) = echo_listener().await;
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut client = Client::new(&settings(address));
        client.connect().await.unwrap();
        client.close();
        assert!(!client.is_connected());

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientConnectionFailed);
    }

    #[tokio::test]
    async fn test_health_probe() {
        let (listener, address) = echo_listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(b"N").await.unwrap();
        });

        let mut client = Client::new(&settings(address));
        client.connect().await.unwrap();
        assert!(client.is_healthy(&PostgresSslProbe).await);
    }

    #[tokio::test]
    async fn test_health_probe_disconnected() {
        let mut client = Client::new(&settings("127.0.0.1:1".into()));
        assert!(!client.is_healthy(&PostgresSslProbe).await);
    }
}
