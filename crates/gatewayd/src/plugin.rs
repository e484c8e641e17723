//! Plugin discovery and gRPC dispatch
//!
//! A plugin is an out-of-process gRPC server exposing one unary method:
//!
//! ```text
//! /gatewayd.plugin.v1.HookService/OnHookRequest
//!     (google.protobuf.Struct) -> google.protobuf.Struct
//! ```
//!
//! The hook being fired travels in request metadata so the method signature
//! stays exactly Struct → Struct. Each manifest subscription becomes one
//! [`GrpcHook`] registered with the [`HookRegistry`] at its priority.

use crate::hook::{HookMethod, HookRegistry};
use crate::metrics;
use crate::payload;
use async_trait::async_trait;
use gatewayd_common::config::PluginManifest;
use gatewayd_common::error::{ErrorKind, GatewayError, Result};
use prost_types::Struct;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tracing::{error, info};

/// Metadata key carrying the hook name on each plugin call
pub const HOOK_METADATA_KEY: &str = "x-gatewayd-hook";

/// Pseudo-hook fired once per plugin at load time
pub const HANDSHAKE_HOOK: &str = "Handshake";

const ON_HOOK_REQUEST_PATH: &str = "/gatewayd.plugin.v1.HookService/OnHookRequest";

/// Thin client for the plugin hook service
pub struct HookServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl HookServiceClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Invoke the plugin's single hook method
    pub async fn on_hook_request(
        &mut self,
        hook: &str,
        params: Struct,
    ) -> std::result::Result<Struct, tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("service was not ready: {e}")))?;
        let codec: tonic::codec::ProstCodec<Struct, Struct> = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(ON_HOOK_REQUEST_PATH);

        let mut request = tonic::Request::new(params);
        let hook_value = MetadataValue::try_from(hook)
            .map_err(|_| tonic::Status::invalid_argument("hook name is not valid metadata"))?;
        request.metadata_mut().insert(HOOK_METADATA_KEY, hook_value);

        self.inner
            .unary(request, path, codec)
            .await
            .map(tonic::Response::into_inner)
    }
}

/// Hook handler that dispatches over a plugin's gRPC channel
struct GrpcHook {
    plugin: String,
    hook: String,
    channel: Channel,
}

#[async_trait]
impl HookMethod for GrpcHook {
    async fn call(&self, params: Struct) -> Result<Struct> {
        let mut client = HookServiceClient::new(self.channel.clone());
        client
            .on_hook_request(&self.hook, params)
            .await
            .map_err(|status| {
                GatewayError::new(ErrorKind::ClientConnectionFailed)
                    .with_message(format!(
                        "plugin {} failed on {}: {}",
                        self.plugin,
                        self.hook,
                        status.message()
                    ))
                    .wrap(status)
            })
    }
}

/// A plugin that completed its handshake
pub struct LoadedPlugin {
    pub name: String,
    pub endpoint: String,
    pub hooks: usize,
}

/// Loads plugin manifests and wires their subscriptions into the registry
pub struct PluginRegistry {
    plugins: Vec<LoadedPlugin>,
}

impl PluginRegistry {
    /// Connect every manifest's endpoint, perform the one-time handshake,
    /// and register a [`GrpcHook`] per subscription. Plugins that fail the
    /// handshake are skipped with an error log; they never join the chain.
    pub async fn load(
        manifests: &[PluginManifest],
        registry: &HookRegistry,
        handshake_timeout: Duration,
    ) -> Self {
        let mut plugins = Vec::new();

        for manifest in manifests {
            let channel = match Endpoint::from_shared(manifest.endpoint.clone()) {
                Ok(endpoint) => endpoint.connect_lazy(),
                Err(err) => {
                    error!(
                        plugin = %manifest.name,
                        endpoint = %manifest.endpoint,
                        error = %err,
                        "invalid plugin endpoint"
                    );
                    continue;
                }
            };

            if !handshake(manifest, channel.clone(), handshake_timeout).await {
                continue;
            }

            for subscription in &manifest.hooks {
                registry.add(
                    &subscription.name,
                    subscription.priority,
                    Arc::new(GrpcHook {
                        plugin: manifest.name.clone(),
                        hook: subscription.name.clone(),
                        channel: channel.clone(),
                    }),
                );
            }

            metrics::PLUGINS_LOADED.inc();
            info!(
                plugin = %manifest.name,
                endpoint = %manifest.endpoint,
                hooks = manifest.hooks.len(),
                "plugin loaded"
            );
            plugins.push(LoadedPlugin {
                name: manifest.name.clone(),
                endpoint: manifest.endpoint.clone(),
                hooks: manifest.hooks.len(),
            });
        }

        Self { plugins }
    }

    /// Number of plugins that loaded successfully
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// The loaded plugins
    pub fn plugins(&self) -> &[LoadedPlugin] {
        &self.plugins
    }
}

/// One-time handshake: a `Handshake` pseudo-hook carrying the gateway
/// identity; the plugin may answer with its own name and version.
async fn handshake(manifest: &PluginManifest, channel: Channel, deadline: Duration) -> bool {
    let params = payload::to_struct(
        json!({
            "gateway": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        })
        .as_object()
        .expect("handshake payload is an object"),
    );

    let mut client = HookServiceClient::new(channel);
    match tokio::time::timeout(deadline, client.on_hook_request(HANDSHAKE_HOOK, params)).await {
        Ok(Ok(reply)) => {
            let fields = payload::from_struct(&reply);
            info!(
                plugin = %manifest.name,
                reported_name = fields.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                reported_version = fields.get("version").and_then(|v| v.as_str()).unwrap_or(""),
                "plugin handshake complete"
            );
            true
        }
        Ok(Err(status)) => {
            error!(
                plugin = %manifest.name,
                endpoint = %manifest.endpoint,
                error = %status,
                "plugin handshake failed"
            );
            false
        }
        Err(_) => {
            error!(
                plugin = %manifest.name,
                endpoint = %manifest.endpoint,
                "plugin handshake timed out"
            );
            false
        }
    }
}
