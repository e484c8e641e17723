//! The dataplane: couples inbound connections to leased upstreams
//!
//! The proxy owns two instances of the bounded pool: *available* holds idle
//! upstreams under their own identity keys, *busy* holds leased upstreams
//! under the inbound remote-address key. A lease moves a client from one to
//! the other; disconnect moves it back (recycled under a fresh identity) or
//! closes it.

use crate::client::{Client, HealthProbe};
use crate::conn::Conn;
use crate::hook::{self, hookname, HookRegistry};
use crate::metrics;
use crate::payload;
use crate::pool::Pool;
use gatewayd_common::config::ClientSettings;
use gatewayd_common::error::{ErrorKind, GatewayError, Result};
use serde_json::json;
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An upstream held by the pools; the inner mutex is only locked across
/// upstream I/O, never while hooks run or while a pool lock is held.
pub type PooledClient = Arc<Mutex<Client>>;

/// Pre-connect one upstream per pool slot, keyed by the socket's identity
pub async fn populate_pool(pool: &Pool<PooledClient>, settings: &ClientSettings) -> Result<()> {
    for _ in 0..pool.capacity() {
        let mut client = Client::new(settings);
        client.connect().await?;
        metrics::SERVER_CONNECTIONS.inc();
        let key = client.id().to_string();
        pool.put(key, Arc::new(Mutex::new(client)))?;
    }
    info!(size = pool.size(), "upstream pool initialized");
    Ok(())
}

/// Couples inbound connections to upstream leases
pub struct Proxy {
    available: Arc<Pool<PooledClient>>,
    busy: Pool<PooledClient>,
    elastic: bool,
    reuse_elastic_clients: bool,
    client_settings: ClientSettings,
    registry: Arc<HookRegistry>,
    probe: Arc<dyn HealthProbe>,
}

impl Proxy {
    pub fn new(
        available: Arc<Pool<PooledClient>>,
        elastic: bool,
        reuse_elastic_clients: bool,
        client_settings: ClientSettings,
        registry: Arc<HookRegistry>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        // An elastic proxy can lease more upstreams than the pool's initial
        // size, so the busy side is effectively unbounded.
        let busy_capacity = if elastic {
            usize::MAX
        } else {
            available.capacity()
        };
        Self {
            available,
            busy: Pool::new(busy_capacity),
            elastic,
            reuse_elastic_clients,
            client_settings,
            registry,
            probe,
        }
    }

    /// Lease an upstream for the inbound connection, rebinding it under the
    /// inbound remote-address key. Dead upstreams found on the way are
    /// dropped. With an empty pool: elastic proxies dial a fresh upstream,
    /// non-elastic ones fail with `PoolExhausted`.
    pub async fn connect(&self, conn: &Conn) -> Result<()> {
        let client = loop {
            match self.available.pop_any() {
                Some((key, client)) => {
                    if self.is_healthy(&client).await.is_ok() {
                        break client;
                    }
                    warn!(upstream = %key, "dropping unhealthy upstream");
                    client.lock().await.close();
                    metrics::SERVER_CONNECTIONS.dec();
                }
                None if self.elastic => {
                    let mut fresh = Client::new(&self.client_settings);
                    fresh.connect().await?;
                    metrics::SERVER_CONNECTIONS.inc();
                    debug!(id = %fresh.id(), "created elastic upstream");
                    break Arc::new(Mutex::new(fresh));
                }
                None => return Err(GatewayError::new(ErrorKind::PoolExhausted)),
            }
        };

        if let Err(err) = self.busy.put(conn.remote_addr(), client.clone()) {
            client.lock().await.close();
            metrics::SERVER_CONNECTIONS.dec();
            return Err(err);
        }
        metrics::PROXIED_CONNECTIONS.inc();
        debug!(client = %conn.remote_addr(), "upstream leased");
        Ok(())
    }

    /// Release the lease held by the inbound connection: drop the upstream
    /// (elastic non-reuse, or unhealthy after reset) or recycle it into the
    /// available pool under a fresh identity key.
    pub async fn disconnect(&self, conn: &Conn) -> Result<()> {
        let Some(client) = self.busy.pop(conn.remote_addr()) else {
            return Err(GatewayError::new(ErrorKind::ClientNotFound));
        };
        metrics::PROXIED_CONNECTIONS.dec();

        if self.elastic && !self.reuse_elastic_clients {
            client.lock().await.close();
            metrics::SERVER_CONNECTIONS.dec();
            debug!(client = %conn.remote_addr(), "elastic upstream closed");
            return Ok(());
        }

        // Reset before recycling: discard stale bytes, then re-probe.
        let key = {
            let mut guard = client.lock().await;
            guard.drain();
            guard.id().to_string()
        };
        if self.is_healthy(&client).await.is_err() {
            client.lock().await.close();
            metrics::SERVER_CONNECTIONS.dec();
            info!(client = %conn.remote_addr(), "upstream no longer healthy, closed");
            return Ok(());
        }

        if let Err(err) = self.available.put(key, client.clone()) {
            warn!(error = %err, "pool rejected recycled upstream, closing");
            client.lock().await.close();
            metrics::SERVER_CONNECTIONS.dec();
        }
        Ok(())
    }

    /// One request/response round: read from the inbound connection, run the
    /// traffic hooks, forward to the leased upstream, and relay the reply.
    pub async fn pass_through(&self, ctx: &CancellationToken, conn: &mut Conn) -> Result<()> {
        let mut request = vec![0u8; self.client_settings.receive_buffer_size];
        let n = conn.read(&mut request).await.map_err(|e| {
            GatewayError::new(ErrorKind::ClientReceiveFailed)
                .with_message("failed to read from the inbound connection")
                .wrap(e)
        })?;
        if n == 0 {
            return Err(GatewayError::new(ErrorKind::ClientReceiveFailed)
                .with_message("inbound connection closed")
                .wrap(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        request.truncate(n);
        metrics::record_bytes_from_client(n);

        let client_info = payload::client_value(conn.local_addr(), conn.remote_addr());

        // A plugin may terminate the connection before anything is forwarded.
        let result = self
            .registry
            .run(
                ctx,
                hookname::ON_TRAFFIC,
                json!({
                    "client": client_info.clone(),
                    "request": payload::encode_bytes(&request),
                }),
            )
            .await?;
        if hook::terminates(&result) {
            metrics::PASSTHROUGH_TERMINATIONS.inc();
            return Err(GatewayError::new(ErrorKind::HookTerminatedConnection));
        }

        let Some(upstream) = self.busy.get(conn.remote_addr()) else {
            return Err(GatewayError::new(ErrorKind::ClientNotFound));
        };

        let result = self
            .registry
            .run(
                ctx,
                hookname::ON_INGRESS_TRAFFIC,
                json!({
                    "client": client_info.clone(),
                    "request": payload::encode_bytes(&request),
                }),
            )
            .await?;
        let request = payload::rewritten_bytes(&result, "request", request);

        let response = {
            let mut upstream = upstream.lock().await;
            upstream.send(&request).await?;
            metrics::record_passthrough_to_server(request.len());
            upstream.receive().await?
        };
        metrics::record_bytes_from_server(response.len());

        let result = self
            .registry
            .run(
                ctx,
                hookname::ON_EGRESS_TRAFFIC,
                json!({
                    "client": client_info,
                    "response": payload::encode_bytes(&response),
                }),
            )
            .await?;
        let response = payload::rewritten_bytes(&result, "response", response);

        conn.write(&response).await.map_err(|e| {
            GatewayError::new(ErrorKind::ClientSendFailed)
                .with_message("failed to write to the inbound connection")
                .wrap(e)
        })?;
        metrics::record_passthrough_to_client(response.len());
        Ok(())
    }

    /// Probe an upstream; `ClientNotHealthy` tells the caller to drop it
    pub async fn is_healthy(&self, client: &PooledClient) -> Result<()> {
        metrics::record_health_check();
        if client.lock().await.is_healthy(self.probe.as_ref()).await {
            Ok(())
        } else {
            Err(GatewayError::new(ErrorKind::ClientNotHealthy))
        }
    }

    /// True when a non-elastic proxy has no idle upstream left
    pub fn is_exhausted(&self) -> bool {
        !self.elastic && self.available.is_empty()
    }

    /// Idle upstreams currently in the pool
    pub fn available_count(&self) -> usize {
        self.available.size()
    }

    /// Upstreams currently leased to inbound connections
    pub fn leased_count(&self) -> usize {
        self.busy.size()
    }

    /// Close every upstream, leased or idle, and empty both pools
    pub fn shutdown(&self) {
        self.available.clear(|key, client| {
            if let Ok(mut guard) = client.try_lock() {
                guard.close();
            }
            metrics::SERVER_CONNECTIONS.dec();
            debug!(upstream = %key, "idle upstream closed");
        });
        self.busy.clear(|key, client| {
            if let Ok(mut guard) = client.try_lock() {
                guard.close();
            }
            metrics::SERVER_CONNECTIONS.dec();
            metrics::PROXIED_CONNECTIONS.dec();
            debug!(client = %key, "leased upstream closed");
        });
        info!("proxy shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PostgresSslProbe;
    use async_trait::async_trait;
    use gatewayd_common::config::VerificationPolicy;
    use prost_types::Struct;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];

    /// Upstream that answers SSLRequest probes with `N` and echoes
    /// everything else, like an idle PostgreSQL would for the probe.
    async fn spawn_echo_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        let Ok(n) = socket.read(&mut buf).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        let reply: &[u8] = if buf[..n] == SSL_REQUEST { b"N" } else { &buf[..n] };
                        if socket.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        address
    }

    fn client_settings(address: String) -> ClientSettings {
        ClientSettings {
            address,
            receive_deadline_secs: 2,
            send_deadline_secs: 2,
            dial_timeout_secs: 2,
            ..ClientSettings::default()
        }
    }

    fn registry() -> Arc<HookRegistry> {
        Arc::new(HookRegistry::new(
            VerificationPolicy::PassDown,
            Duration::from_secs(1),
        ))
    }

    async fn build_proxy(pool_size: usize, elastic: bool, reuse: bool) -> (Proxy, String) {
        let upstream = spawn_echo_upstream().await;
        let settings = client_settings(upstream.clone());
        let pool = Arc::new(Pool::new(pool_size));
        populate_pool(&pool, &settings).await.unwrap();
        let proxy = Proxy::new(
            pool,
            elastic,
            reuse,
            settings,
            registry(),
            Arc::new(PostgresSslProbe),
        );
        (proxy, upstream)
    }

    async fn inbound_pair() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (Conn::tcp(accepted, 0), peer)
    }

    #[tokio::test]
    async fn test_pool_exhausted_when_not_elastic() {
        let (proxy, _) = build_proxy(1, false, false).await;
        let (conn_a, _peer_a) = inbound_pair().await;
        let (conn_b, _peer_b) = inbound_pair().await;

        proxy.connect(&conn_a).await.unwrap();
        assert!(proxy.is_exhausted());

        let err = proxy.connect(&conn_b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        assert_eq!(proxy.leased_count(), 1);
    }

    #[tokio::test]
    async fn test_pass_through_echoes_bytes() {
        let (proxy, _) = build_proxy(1, false, false).await;
        let (mut conn, mut peer) = inbound_pair().await;
        proxy.connect(&conn).await.unwrap();

        peer.write_all(&[0x01, 0x02, 0x03, 0x04]).await.unwrap();
        proxy
            .pass_through(&CancellationToken::new(), &mut conn)
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[tokio::test]
    async fn test_pass_through_without_lease() {
        let (proxy, _) = build_proxy(1, false, false).await;
        let (mut conn, mut peer) = inbound_pair().await;

        peer.write_all(b"orphan").await.unwrap();
        let err = proxy
            .pass_through(&CancellationToken::new(), &mut conn)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientNotFound);
    }

    struct TerminateHook;

    #[async_trait]
    impl crate::hook::HookMethod for TerminateHook {
        async fn call(&self, params: Struct) -> Result<Struct> {
            let mut fields = payload::from_struct(&params);
            fields.insert("terminate".to_string(), json!(true));
            Ok(payload::to_struct(&fields))
        }
    }

    #[tokio::test]
    async fn test_hook_termination_skips_forwarding() {
        let upstream = spawn_echo_upstream().await;
        let settings = client_settings(upstream);
        let pool = Arc::new(Pool::new(1));
        populate_pool(&pool, &settings).await.unwrap();
        let registry = registry();
        registry.add(hookname::ON_TRAFFIC, 10, Arc::new(TerminateHook));
        let proxy = Proxy::new(
            pool,
            false,
            false,
            settings,
            registry,
            Arc::new(PostgresSslProbe),
        );

        let (mut conn, mut peer) = inbound_pair().await;
        proxy.connect(&conn).await.unwrap();

        let before = metrics::PASSTHROUGH_TERMINATIONS.get();
        peer.write_all(b"blocked").await.unwrap();
        let err = proxy
            .pass_through(&CancellationToken::new(), &mut conn)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HookTerminatedConnection);
        assert_eq!(metrics::PASSTHROUGH_TERMINATIONS.get() - before, 1.0);
    }

    #[tokio::test]
    async fn test_disconnect_recycles_upstream() {
        let (proxy, _) = build_proxy(1, false, false).await;
        let (conn, _peer) = inbound_pair().await;

        proxy.connect(&conn).await.unwrap();
        assert_eq!(proxy.available_count(), 0);
        assert_eq!(proxy.leased_count(), 1);

        proxy.disconnect(&conn).await.unwrap();
        assert_eq!(proxy.available_count(), 1);
        assert_eq!(proxy.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_without_lease() {
        let (proxy, _) = build_proxy(1, false, false).await;
        let (conn, _peer) = inbound_pair().await;
        let err = proxy.disconnect(&conn).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientNotFound);
    }

    #[tokio::test]
    async fn test_elastic_overflow_and_drop() {
        let upstream = spawn_echo_upstream().await;
        let settings = client_settings(upstream);
        let pool = Arc::new(Pool::new(0));
        let proxy = Proxy::new(
            pool,
            true,
            false,
            settings,
            registry(),
            Arc::new(PostgresSslProbe),
        );

        let (mut conn, mut peer) = inbound_pair().await;
        proxy.connect(&conn).await.unwrap();
        assert_eq!(proxy.leased_count(), 1);

        peer.write_all(b"elastic").await.unwrap();
        proxy
            .pass_through(&CancellationToken::new(), &mut conn)
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"elastic");

        // reuse_elastic_clients is off: the overflow upstream is dropped.
        proxy.disconnect(&conn).await.unwrap();
        assert_eq!(proxy.available_count(), 0);
        assert_eq!(proxy.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (proxy, _) = build_proxy(2, false, false).await;
        let (conn, _peer) = inbound_pair().await;
        proxy.connect(&conn).await.unwrap();

        proxy.shutdown();
        assert_eq!(proxy.available_count(), 0);
        assert_eq!(proxy.leased_count(), 0);
    }
}
