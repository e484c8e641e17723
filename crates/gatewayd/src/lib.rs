//! GatewayD core
//!
//! A pluggable L7 gateway that sits in front of a backend database and
//! brokers client connections through a managed pool of pre-established
//! upstream connections, while exposing lifecycle events to out-of-process
//! plugins over gRPC.
//!
//! The moving parts:
//! - [`pool`]: bounded key→resource pool with lease/recycle semantics
//! - [`client`]: pre-connected upstream sockets with deadlines and probes
//! - [`conn`]: inbound connection wrapper with a one-shot TLS upgrade
//! - [`hook`]: priority-ordered plugin pipeline with verification policies
//! - [`plugin`]: manifest loading and gRPC hook dispatch
//! - [`proxy`]: the dataplane coupling inbound connections to leases
//! - [`server`]: accept loop, lifecycle state machine, graceful drain

pub mod client;
pub mod conn;
pub mod hook;
pub mod http_api;
pub mod metrics;
pub mod payload;
pub mod plugin;
pub mod pool;
pub mod proxy;
pub mod server;
pub mod telemetry;

pub use gatewayd_common::{ErrorKind, GatewayError, Result};
