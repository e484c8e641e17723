//! Prometheus metrics for GatewayD
//!
//! Exports metrics for:
//! - Connection gauges (inbound, upstream, proxied)
//! - Traffic byte distributions per edge
//! - Hook registration/execution and plugin load counters
//! - Pass-through, health check, and tick counters

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Encoder, Gauge, Histogram,
    TextEncoder,
};

/// Byte-size buckets shared by all traffic histograms
fn byte_buckets() -> Vec<f64> {
    vec![
        64.0,
        256.0,
        1024.0,
        4096.0,
        16384.0,
        65536.0,
        262_144.0,
        1_048_576.0,
    ]
}

/// Inbound client connections currently open
pub static CLIENT_CONNECTIONS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "gatewayd_client_connections",
        "Inbound client connections currently open"
    )
    .unwrap()
});

/// Upstream server connections currently held (idle or leased)
pub static SERVER_CONNECTIONS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "gatewayd_server_connections",
        "Upstream server connections currently held"
    )
    .unwrap()
});

/// Inbound connections currently bound to a leased upstream
pub static PROXIED_CONNECTIONS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "gatewayd_proxied_connections",
        "Inbound connections currently bound to a leased upstream"
    )
    .unwrap()
});

/// Bytes read from inbound clients
pub static BYTES_RECEIVED_FROM_CLIENT: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "gatewayd_bytes_received_from_client",
        "Bytes read from inbound clients per pass-through",
        byte_buckets()
    )
    .unwrap()
});

/// Bytes written to the upstream server
pub static BYTES_SENT_TO_SERVER: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "gatewayd_bytes_sent_to_server",
        "Bytes written to the upstream server per pass-through",
        byte_buckets()
    )
    .unwrap()
});

/// Bytes read from the upstream server
pub static BYTES_RECEIVED_FROM_SERVER: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "gatewayd_bytes_received_from_server",
        "Bytes read from the upstream server per pass-through",
        byte_buckets()
    )
    .unwrap()
});

/// Bytes written back to inbound clients
pub static BYTES_SENT_TO_CLIENT: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "gatewayd_bytes_sent_to_client",
        "Bytes written back to inbound clients per pass-through",
        byte_buckets()
    )
    .unwrap()
});

/// All proxied bytes, every edge combined
pub static TRAFFIC_BYTES: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "gatewayd_traffic_bytes",
        "Bytes proxied across all edges",
        byte_buckets()
    )
    .unwrap()
});

/// Hook handlers registered since start
pub static PLUGIN_HOOKS_REGISTERED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gatewayd_plugin_hooks_registered_total",
        "Hook handlers registered since start"
    )
    .unwrap()
});

/// Hook handler invocations since start
pub static PLUGIN_HOOKS_EXECUTED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gatewayd_plugin_hooks_executed_total",
        "Hook handler invocations since start"
    )
    .unwrap()
});

/// Plugins loaded since start
pub static PLUGINS_LOADED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gatewayd_plugins_loaded_total",
        "Plugins loaded since start"
    )
    .unwrap()
});

/// Pass-through legs forwarded to the upstream server
pub static PASSTHROUGHS_TO_SERVER: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gatewayd_proxy_passthroughs_to_server_total",
        "Pass-through legs forwarded to the upstream server"
    )
    .unwrap()
});

/// Pass-through legs forwarded back to the client
pub static PASSTHROUGHS_TO_CLIENT: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gatewayd_proxy_passthroughs_to_client_total",
        "Pass-through legs forwarded back to the client"
    )
    .unwrap()
});

/// Connections terminated by a plugin during pass-through
pub static PASSTHROUGH_TERMINATIONS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gatewayd_proxy_passthrough_terminations_total",
        "Connections terminated by a plugin during pass-through"
    )
    .unwrap()
});

/// Upstream health probes performed
pub static HEALTH_CHECKS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gatewayd_proxy_health_checks_total",
        "Upstream health probes performed"
    )
    .unwrap()
});

/// Server tick rounds fired
pub static SERVER_TICKS_FIRED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gatewayd_server_ticks_fired_total",
        "Server tick rounds fired"
    )
    .unwrap()
});

/// Initialize all metrics (call at startup)
pub fn init_metrics() {
    // Touch all lazy statics to register them
    let _ = &*CLIENT_CONNECTIONS;
    let _ = &*SERVER_CONNECTIONS;
    let _ = &*PROXIED_CONNECTIONS;
    let _ = &*BYTES_RECEIVED_FROM_CLIENT;
    let _ = &*BYTES_SENT_TO_SERVER;
    let _ = &*BYTES_RECEIVED_FROM_SERVER;
    let _ = &*BYTES_SENT_TO_CLIENT;
    let _ = &*TRAFFIC_BYTES;
    let _ = &*PLUGIN_HOOKS_REGISTERED;
    let _ = &*PLUGIN_HOOKS_EXECUTED;
    let _ = &*PLUGINS_LOADED;
    let _ = &*PASSTHROUGHS_TO_SERVER;
    let _ = &*PASSTHROUGHS_TO_CLIENT;
    let _ = &*PASSTHROUGH_TERMINATIONS;
    let _ = &*HEALTH_CHECKS;
    let _ = &*SERVER_TICKS_FIRED;
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record one inbound read
pub fn record_bytes_from_client(n: usize) {
    BYTES_RECEIVED_FROM_CLIENT.observe(n as f64);
    TRAFFIC_BYTES.observe(n as f64);
}

/// Record one forwarded request leg
pub fn record_passthrough_to_server(n: usize) {
    PASSTHROUGHS_TO_SERVER.inc();
    BYTES_SENT_TO_SERVER.observe(n as f64);
    TRAFFIC_BYTES.observe(n as f64);
}

/// Record one upstream read
pub fn record_bytes_from_server(n: usize) {
    BYTES_RECEIVED_FROM_SERVER.observe(n as f64);
    TRAFFIC_BYTES.observe(n as f64);
}

/// Record one forwarded response leg
pub fn record_passthrough_to_client(n: usize) {
    PASSTHROUGHS_TO_CLIENT.inc();
    BYTES_SENT_TO_CLIENT.observe(n as f64);
    TRAFFIC_BYTES.observe(n as f64);
}

/// Record one upstream health probe
pub fn record_health_check() {
    HEALTH_CHECKS.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_exported() {
        init_metrics();
        record_passthrough_to_server(4);
        let text = encode_metrics();
        assert!(text.contains("gatewayd_client_connections"));
        assert!(text.contains("gatewayd_bytes_sent_to_server_sum"));
        assert!(text.contains("gatewayd_proxy_passthroughs_to_server_total"));
        assert!(text.contains("gatewayd_server_ticks_fired_total"));
    }
}
