//! Error types for GatewayD
//!
//! Every failure in the gateway core carries an [`ErrorKind`] so callers can
//! branch on what happened without parsing messages, plus an optional wrapped
//! cause so the original error survives the trip up the stack.

use std::fmt;

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Classification of gateway failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The pool is at capacity, the key is already taken, or no idle upstream is left
    PoolExhausted,
    /// No upstream is leased under the given inbound key
    ClientNotFound,
    /// The upstream client has no live socket
    ClientNotConnected,
    /// Dialing the upstream failed
    ClientConnectionFailed,
    /// Writing to the upstream failed or timed out
    ClientSendFailed,
    /// Reading from the upstream failed, timed out, or hit EOF
    ClientReceiveFailed,
    /// The upstream failed its health probe
    ClientNotHealthy,
    /// A plugin requested that the connection be closed
    HookTerminatedConnection,
    /// A hook chain was invoked without a context
    NilContext,
    /// A payload could not be cast to the structured-value form
    CastFailed,
    /// The listener could not be started
    FailedToStartServer,
    /// The connection has already been upgraded to TLS
    AlreadyUpgraded,
}

impl ErrorKind {
    /// Stable machine-readable code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::PoolExhausted => "POOL_EXHAUSTED",
            ErrorKind::ClientNotFound => "CLIENT_NOT_FOUND",
            ErrorKind::ClientNotConnected => "CLIENT_NOT_CONNECTED",
            ErrorKind::ClientConnectionFailed => "CLIENT_CONNECTION_FAILED",
            ErrorKind::ClientSendFailed => "CLIENT_SEND_FAILED",
            ErrorKind::ClientReceiveFailed => "CLIENT_RECEIVE_FAILED",
            ErrorKind::ClientNotHealthy => "CLIENT_NOT_HEALTHY",
            ErrorKind::HookTerminatedConnection => "HOOK_TERMINATED_CONNECTION",
            ErrorKind::NilContext => "NIL_CONTEXT",
            ErrorKind::CastFailed => "CAST_FAILED",
            ErrorKind::FailedToStartServer => "FAILED_TO_START_SERVER",
            ErrorKind::AlreadyUpgraded => "ALREADY_UPGRADED",
        }
    }

    /// Default human-readable message for this kind
    fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::PoolExhausted => "the pool is exhausted",
            ErrorKind::ClientNotFound => "no client found for the connection",
            ErrorKind::ClientNotConnected => "the client is not connected",
            ErrorKind::ClientConnectionFailed => "failed to connect to the upstream",
            ErrorKind::ClientSendFailed => "failed to send data to the upstream",
            ErrorKind::ClientReceiveFailed => "failed to receive data from the upstream",
            ErrorKind::ClientNotHealthy => "the upstream failed its health check",
            ErrorKind::HookTerminatedConnection => "a hook terminated the connection",
            ErrorKind::NilContext => "the context is missing",
            ErrorKind::CastFailed => "failed to cast the payload",
            ErrorKind::FailedToStartServer => "failed to start the server",
            ErrorKind::AlreadyUpgraded => "the connection is already upgraded to TLS",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Main error type for the gateway core
///
/// Wraps a kind, a message, and optionally the original error that caused it.
/// The cause is reachable through [`std::error::Error::source`], so chains
/// built with `wrap` keep the underlying I/O or RPC error intact.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl GatewayError {
    /// Create an error of the given kind with its default message
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: kind.default_message().to_string(),
            source: None,
        }
    }

    /// Replace the default message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach the original error that caused this one
    pub fn wrap(mut self, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The kind of this error
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The wrapped original error, if any
    pub fn original(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
        self.source.as_deref()
    }

    /// True if this error is of the given kind
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<ErrorKind> for GatewayError {
    fn from(kind: ErrorKind) -> Self {
        GatewayError::new(kind)
    }
}
