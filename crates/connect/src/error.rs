//! Connection-layer error types.
//!
//! Errors are `Clone` so that a single failed creation can be delivered to every
//! caller waiting on it.

use snafu::{Location, Snafu};
use tonic::Code;

/// Result type alias for connection-layer operations.
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Errors raised while discovering, selecting, or connecting to cluster nodes.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum ConnectError {
    /// Failed to build a channel to a node.
    #[snafu(display("Connection error at {location}: {message}"))]
    Connection {
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// The endpoint could not be turned into a transport URI.
    #[snafu(display("Invalid URL '{url}': {message}"))]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Parse error description.
        message: String,
    },

    /// RPC issued by a collaborator (gossip, capability negotiation) failed.
    #[snafu(display("RPC error (code={code:?}): {message}"))]
    Rpc {
        /// gRPC status code.
        code: Code,
        /// Error message from server.
        message: String,
    },

    /// A bounded call did not complete in time.
    #[snafu(display("Operation timed out after {duration_ms}ms"))]
    Timeout {
        /// Timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// Every discovery round failed to produce an eligible node.
    #[snafu(display("Failed to discover a cluster node after {attempts} attempts"))]
    Discovery {
        /// Number of discovery rounds attempted.
        attempts: u32,
    },

    /// Configuration validation error.
    #[snafu(display("Configuration error: {message}"))]
    Config {
        /// Error description.
        message: String,
    },

    /// The caller's cancellation token fired before a result was available.
    #[snafu(display("Operation cancelled"))]
    Cancelled,

    /// The provider or connection cache has been disposed.
    #[snafu(display("Client shutting down"))]
    Shutdown,
}

impl ConnectError {
    /// Returns true if the error is transient and a later attempt may succeed.
    ///
    /// Discovery exhaustion is retryable: the provider lazily starts a fresh
    /// discovery on the next access.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Discovery { .. } => true,
            Self::Rpc { code, .. } => matches!(
                code,
                Code::Unavailable
                    | Code::DeadlineExceeded
                    | Code::ResourceExhausted
                    | Code::Aborted
            ),
            Self::InvalidUrl { .. } => false,
            Self::Config { .. } => false,
            Self::Cancelled => false,
            Self::Shutdown => false,
        }
    }

    /// Returns the gRPC status code if this is an RPC error.
    #[must_use]
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true when the server reported the RPC as unimplemented.
    #[must_use]
    pub fn is_unimplemented(&self) -> bool {
        self.code() == Some(Code::Unimplemented)
    }
}

impl From<tonic::Status> for ConnectError {
    fn from(status: tonic::Status) -> Self {
        Self::Rpc { code: status.code(), message: status.message().to_owned() }
    }
}
