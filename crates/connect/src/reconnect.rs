//! Reasons a connection must be re-resolved.

use std::fmt;

use crate::endpoint::Endpoint;

/// Why the connector is (re)selecting a node.
///
/// Consumed by the gossip selector: `NewLeader` skips gossip entirely, the
/// other variants run a full discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ReconnectionRequired {
    /// Initial connection; no prior knowledge.
    #[default]
    None,
    /// Topology may have changed; ask the seeds again.
    Rediscover,
    /// A server redirected us to the leader at this endpoint.
    NewLeader(Endpoint),
}

impl ReconnectionRequired {
    /// Creates a `NewLeader` cause.
    ///
    /// Infallible: every [`Endpoint`] already has a non-empty host and a
    /// non-zero port.
    #[must_use]
    pub fn new_leader(endpoint: Endpoint) -> Self {
        Self::NewLeader(endpoint)
    }

    /// Returns the leader endpoint carried by a `NewLeader` cause.
    #[must_use]
    pub fn leader(&self) -> Option<&Endpoint> {
        match self {
            Self::NewLeader(endpoint) => Some(endpoint),
            Self::None | Self::Rediscover => None,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Rediscover => "rediscover",
            Self::NewLeader(_) => "new_leader",
        }
    }
}

impl fmt::Display for ReconnectionRequired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewLeader(endpoint) => write!(f, "new_leader({endpoint})"),
            other => f.write_str(other.label()),
        }
    }
}
