//! Server shell: accept loop, lifecycle hooks, graceful drain
//!
//! The server is a state machine (Booting → Running → Stopping → Stopped)
//! driven by connection events. Every accepted connection gets exactly one
//! tokio task, which gives each connection the sequential
//! open → traffic → close ordering the proxy relies on; different
//! connections run concurrently across the runtime's workers.

use crate::conn::{Conn, TlsUpgrader};
use crate::hook::{hookname, HookRegistry};
use crate::metrics;
use crate::payload;
use crate::proxy::Proxy;
use gatewayd_common::config::{Network, ServerSettings};
use gatewayd_common::error::{ErrorKind, GatewayError, Result};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Booting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Booting => write!(f, "booting"),
            Status::Running => write!(f, "running"),
            Status::Stopping => write!(f, "stopping"),
            Status::Stopped => write!(f, "stopped"),
        }
    }
}

/// Errors that close the inbound connection when pass-through fails
fn is_fatal(err: &GatewayError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::PoolExhausted
            | ErrorKind::CastFailed
            | ErrorKind::ClientNotFound
            | ErrorKind::ClientNotConnected
            | ErrorKind::ClientSendFailed
            | ErrorKind::ClientReceiveFailed
            | ErrorKind::HookTerminatedConnection
    )
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self, unix_seq: &AtomicU64, keepalive_secs: u64) -> io::Result<Conn> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Conn::tcp(stream, keepalive_secs))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let key = format!("unix:{}", unix_seq.fetch_add(1, Ordering::Relaxed));
                Ok(Conn::unix(stream, key))
            }
        }
    }
}

/// The event-loop glue between inbound connections, the proxy, and the
/// hook registry
pub struct Server {
    settings: ServerSettings,
    proxy: Arc<Proxy>,
    registry: Arc<HookRegistry>,
    tls: Option<Arc<dyn TlsUpgrader>>,
    status: RwLock<Status>,
    connections: AtomicU64,
    soft_limit_hit: AtomicBool,
    shutdown: CancellationToken,
    drained: Notify,
    listen_addr: OnceLock<SocketAddr>,
    unix_seq: AtomicU64,
}

impl Server {
    pub fn new(
        settings: ServerSettings,
        proxy: Arc<Proxy>,
        registry: Arc<HookRegistry>,
        tls: Option<Arc<dyn TlsUpgrader>>,
    ) -> Self {
        Self {
            settings,
            proxy,
            registry,
            tls,
            status: RwLock::new(Status::Booting),
            connections: AtomicU64::new(0),
            soft_limit_hit: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            drained: Notify::new(),
            listen_addr: OnceLock::new(),
            unix_seq: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state
    pub fn status(&self) -> Status {
        *self.status.read()
    }

    /// True while the server accepts connections
    pub fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    /// Open inbound connections
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    /// Bound TCP address, available once the listener is up
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.get().copied()
    }

    /// Token cancelled when the server begins shutting down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Begin graceful shutdown: stop accepting, let open connections drain
    pub fn stop(&self) {
        {
            let mut status = self.status.write();
            if matches!(*status, Status::Stopping | Status::Stopped) {
                return;
            }
            *status = Status::Stopping;
        }
        info!("gatewayd is shutting down");
        self.shutdown.cancel();
    }

    /// Run until stopped. Binds the listener, serves connections, then
    /// drains, fires the shutdown hooks, and closes the proxy.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let boot_ctx = self.shutdown.child_token();

        // OnRun fires before the bind and may override the address.
        let mut address = self.settings.address.clone();
        if let Some(result) = self
            .run_hooks(&boot_ctx, hookname::ON_RUN, json!({ "address": address }))
            .await
        {
            if let Some(overridden) = result.get("address").and_then(Value::as_str) {
                if overridden != address {
                    info!(address = overridden, "bind address overridden by hook");
                    address = overridden.to_string();
                }
            }
            if let Some(message) = result.get("error").and_then(Value::as_str) {
                if !message.is_empty() {
                    error!(error = message, "error reported by OnRun hook");
                }
            }
        }

        let listener = self.bind(&address).await?;
        if let Listener::Tcp(l) = &listener {
            if let Ok(addr) = l.local_addr() {
                let _ = self.listen_addr.set(addr);
            }
        }
        info!(
            network = %self.settings.network,
            address = %address,
            "gatewayd is listening"
        );

        self.run_hooks(
            &boot_ctx,
            hookname::ON_BOOTING,
            json!({ "status": self.status().to_string() }),
        )
        .await;
        *self.status.write() = Status::Running;
        self.run_hooks(
            &boot_ctx,
            hookname::ON_BOOTED,
            json!({ "status": self.status().to_string() }),
        )
        .await;

        let ticker = if self.settings.tick_interval_secs > 0 {
            Some(tokio::spawn(self.clone().tick_loop()))
        } else {
            None
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept(&self.unix_seq, self.settings.tcp_keepalive_secs) => {
                    match accepted {
                        Ok(conn) => {
                            let server = self.clone();
                            tokio::spawn(async move { server.handle_connection(conn).await });
                        }
                        Err(err) => error!(error = %err, "failed to accept connection"),
                    }
                }
            }
        }

        // Drain: existing connections keep their pass-through loops until
        // the peer goes away; the last one out wakes us up. The waiter must
        // be registered before the count check: notify_waiters only wakes
        // waiters that are already in the list.
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.connections() == 0 {
                break;
            }
            info!(connections = self.connections(), "waiting for connections to drain");
            drained.await;
        }
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }

        // Shutdown hooks run on a fresh context; the server token is
        // already cancelled.
        let shutdown_ctx = CancellationToken::new();
        self.run_hooks(
            &shutdown_ctx,
            hookname::ON_SHUTDOWN,
            json!({ "connections": self.connections() }),
        )
        .await;
        self.proxy.shutdown();
        *self.status.write() = Status::Stopped;
        info!("gatewayd stopped");
        Ok(())
    }

    async fn bind(&self, address: &str) -> Result<Listener> {
        match self.settings.network {
            Network::Tcp => TcpListener::bind(address)
                .await
                .map(Listener::Tcp)
                .map_err(|e| {
                    GatewayError::new(ErrorKind::FailedToStartServer)
                        .with_message(format!("failed to bind tcp listener on {address}"))
                        .wrap(e)
                }),
            Network::Unix => {
                let _ = std::fs::remove_file(address);
                UnixListener::bind(address).map(Listener::Unix).map_err(|e| {
                    GatewayError::new(ErrorKind::FailedToStartServer)
                        .with_message(format!("failed to bind unix listener on {address}"))
                        .wrap(e)
                })
            }
            Network::Udp => Err(GatewayError::new(ErrorKind::FailedToStartServer)
                .with_message("udp listeners are not supported; use tcp or unix")),
        }
    }

    async fn handle_connection(self: Arc<Self>, mut conn: Conn) {
        let count = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
        let ctx = self.shutdown.child_token();

        if let Some(upgrader) = &self.tls {
            if let Err(err) = conn.upgrade_to_tls(upgrader.as_ref()).await {
                error!(client = %conn.remote_addr(), error = %err, "TLS upgrade failed");
                let _ = conn.close().await;
                self.finish_connection();
                return;
            }
        }

        debug!(client = %conn.remote_addr(), "connection opened");
        let client_info = payload::client_value(conn.local_addr(), conn.remote_addr());
        self.run_hooks(
            &ctx,
            hookname::ON_OPENING,
            json!({ "client": client_info.clone() }),
        )
        .await;

        let soft = self.settings.soft_limit;
        let hard = self.settings.hard_limit;
        if soft > 0 && count >= soft && !self.soft_limit_hit.swap(true, Ordering::AcqRel) {
            warn!(connections = count, "soft limit reached");
        }
        if hard > 0 && count >= hard {
            error!(connections = count, "hard limit reached");
            let _ = conn.write(b"Hard limit reached\n").await;
            let _ = conn.close().await;
            self.finish_connection();
            return;
        }

        if let Err(err) = self.proxy.connect(&conn).await {
            if err.kind() == ErrorKind::PoolExhausted {
                debug!(client = %conn.remote_addr(), "pool exhausted, closing inbound");
            } else {
                error!(client = %conn.remote_addr(), error = %err, "failed to lease an upstream");
            }
            let _ = conn.close().await;
            self.finish_connection();
            return;
        }

        self.run_hooks(
            &ctx,
            hookname::ON_OPENED,
            json!({ "client": client_info.clone() }),
        )
        .await;
        metrics::CLIENT_CONNECTIONS.inc();

        // The OnTraffic hooks fire inside pass-through, where the request
        // bytes and the terminate check live; firing them here as well
        // would invoke every handler twice per round.
        let mut close_error = String::new();
        loop {
            match self.proxy.pass_through(&ctx, &mut conn).await {
                Ok(()) => {}
                Err(err) if is_fatal(&err) => {
                    debug!(client = %conn.remote_addr(), error = %err, "closing connection");
                    close_error = err.to_string();
                    break;
                }
                Err(err) => {
                    warn!(client = %conn.remote_addr(), error = %err, "pass-through error");
                }
            }
        }

        metrics::CLIENT_CONNECTIONS.dec();
        let close_payload = json!({ "client": client_info, "error": close_error });
        self.run_hooks(&ctx, hookname::ON_CLOSING, close_payload.clone())
            .await;
        if let Err(err) = self.proxy.disconnect(&conn).await {
            error!(client = %conn.remote_addr(), error = %err, "failed to release the upstream lease");
        }
        let _ = conn.close().await;
        self.run_hooks(&ctx, hookname::ON_CLOSED, close_payload).await;
        debug!(client = %conn.remote_addr(), "connection closed");
        self.finish_connection();
    }

    fn finish_connection(&self) {
        let remaining = self.connections.fetch_sub(1, Ordering::AcqRel) - 1;
        if self.settings.soft_limit > 0 && remaining < self.settings.soft_limit {
            self.soft_limit_hit.store(false, Ordering::Release);
        }
        if remaining == 0 && self.status() == Status::Stopping {
            self.drained.notify_waiters();
        }
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {
                    info!(connections = self.connections(), "active client connections");
                    let ctx = self.shutdown.child_token();
                    self.run_hooks(
                        &ctx,
                        hookname::ON_TICK,
                        json!({ "connections": self.connections() }),
                    )
                    .await;
                    metrics::SERVER_TICKS_FIRED.inc();
                }
            }
        }
    }

    async fn run_hooks(
        &self,
        ctx: &CancellationToken,
        hook_name: &str,
        args: Value,
    ) -> Option<Value> {
        match self.registry.run(ctx, hook_name, args).await {
            Ok(result) => Some(result),
            Err(err) => {
                error!(hook = hook_name, error = %err, "hook chain failed");
                None
            }
        }
    }
}
