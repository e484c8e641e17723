//! GatewayD service entry point
//!
//! Loads configuration, wires the pool, proxy, hook registry and server
//! together, fires the boot-time hooks, and runs until a signal triggers a
//! graceful shutdown.

use anyhow::Context;
use clap::Parser;
use gatewayd::client::PostgresSslProbe;
use gatewayd::conn::{RustlsUpgrader, TlsUpgrader};
use gatewayd::hook::{hookname, HookRegistry};
use gatewayd::plugin::PluginRegistry;
use gatewayd::pool::Pool;
use gatewayd::proxy::{self, Proxy};
use gatewayd::server::Server;
use gatewayd::{http_api, metrics, telemetry};
use gatewayd_common::config::GatewaydConfig;
use gatewayd_common::tls::TlsMaterial;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gatewayd")]
#[command(about = "GatewayD - pluggable database gateway")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "GATEWAYD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        GatewaydConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }
    telemetry::init(&config.telemetry)?;

    info!("starting gatewayd");
    info!("  listener: {} {}", config.server.network, config.server.address);
    info!("  upstream: {} {}", config.client.network, config.client.address);
    info!("  pool size: {}", config.pool.size);
    info!("  elastic: {}", config.proxy.elastic);

    metrics::init_metrics();

    let registry = Arc::new(HookRegistry::new(
        config.hooks.verification,
        config.hooks.plugin_timeout(),
    ));
    let boot_ctx = CancellationToken::new();

    run_boot_hook(
        &registry,
        &boot_ctx,
        hookname::ON_CONFIG_LOADED,
        json!({ "config": serde_json::to_value(&config)? }),
    )
    .await;

    let plugins =
        PluginRegistry::load(&config.plugins, &registry, config.hooks.plugin_timeout()).await;
    info!(count = plugins.len(), "plugins loaded");

    // Pre-establish the upstream pool; an unreachable backend is fatal.
    let pool = Arc::new(Pool::new(config.pool.size));
    proxy::populate_pool(&pool, &config.client)
        .await
        .context("failed to initialize the upstream pool")?;
    run_boot_hook(
        &registry,
        &boot_ctx,
        hookname::ON_NEW_POOL,
        json!({ "size": pool.size(), "cap": pool.capacity() }),
    )
    .await;

    let proxy = Arc::new(Proxy::new(
        pool,
        config.proxy.elastic,
        config.proxy.reuse_elastic_clients,
        config.client.clone(),
        registry.clone(),
        Arc::new(PostgresSslProbe),
    ));
    run_boot_hook(
        &registry,
        &boot_ctx,
        hookname::ON_NEW_PROXY,
        json!({
            "elastic": config.proxy.elastic,
            "reuseElasticClients": config.proxy.reuse_elastic_clients,
        }),
    )
    .await;

    let tls: Option<Arc<dyn TlsUpgrader>> = if config.tls.enabled {
        let material =
            TlsMaterial::from_settings(&config.tls).context("failed to load TLS material")?;
        info!("TLS termination enabled for inbound connections");
        Some(Arc::new(RustlsUpgrader::new(&material)?))
    } else {
        None
    };

    let server = Arc::new(Server::new(
        config.server.clone(),
        proxy,
        registry.clone(),
        tls,
    ));
    run_boot_hook(
        &registry,
        &boot_ctx,
        hookname::ON_NEW_SERVER,
        json!({
            "network": config.server.network.to_string(),
            "address": config.server.address,
        }),
    )
    .await;

    let http_address = config.http.address.clone();
    let http_server = server.clone();
    let http_shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if let Err(err) = http_api::serve(&http_address, http_server, http_shutdown).await {
            error!(error = %err, "http api error");
        }
    });

    let mut run_task = tokio::spawn(server.clone().run());
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            run_boot_hook(&registry, &boot_ctx, hookname::ON_SIGNAL, json!({ "signal": "SIGINT" }))
                .await;
            server.stop();
        }
        _ = sigterm.recv() => {
            run_boot_hook(&registry, &boot_ctx, hookname::ON_SIGNAL, json!({ "signal": "SIGTERM" }))
                .await;
            server.stop();
        }
        result = &mut run_task => {
            // The server exited on its own, e.g. a failed bind.
            result.context("server task panicked")??;
            return Ok(());
        }
    }

    run_task.await.context("server task panicked")??;
    info!("shutdown complete");
    Ok(())
}

async fn run_boot_hook(
    registry: &HookRegistry,
    ctx: &CancellationToken,
    hook_name: &str,
    args: Value,
) {
    if let Err(err) = registry.run(ctx, hook_name, args).await {
        error!(hook = hook_name, error = %err, "hook chain failed");
    }
}
