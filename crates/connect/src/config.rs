//! Connection configuration with builder pattern.
//!
//! Provides type-safe configuration for the cluster connector including:
//! - Seed endpoints and single-node vs cluster mode
//! - Node preference for gossip-based selection
//! - Discovery round limits and intervals
//! - Channel timeouts

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use snafu::ensure;

use crate::{
    endpoint::Endpoint,
    error::{ConfigSnafu, ConnectError, Result},
    metrics::{ConnectMetrics, NoopConnectMetrics},
};

/// Default request timeout applied to every channel (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connection establishment timeout (5 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of discovery rounds before giving up.
const DEFAULT_MAX_DISCOVER_ATTEMPTS: u32 = 10;

/// Default pause between failed discovery rounds.
const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on a single gossip call.
const DEFAULT_GOSSIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Which member role the gossip selector routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodePreference {
    /// The cluster leader. Fails the round when no leader is alive.
    #[default]
    Leader,
    /// A random follower, falling back to the leader.
    Follower,
    /// Any alive member, chosen uniformly.
    Random,
    /// A random read-only replica, falling back to a follower, then the leader.
    ReadOnlyReplica,
}

impl fmt::Display for NodePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
            Self::Random => write!(f, "random"),
            Self::ReadOnlyReplica => write!(f, "read_only_replica"),
        }
    }
}

impl FromStr for NodePreference {
    type Err = ConnectError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "leader" => Ok(Self::Leader),
            "follower" => Ok(Self::Follower),
            "random" => Ok(Self::Random),
            "readonlyreplica" => Ok(Self::ReadOnlyReplica),
            _ => ConfigSnafu { message: format!("unknown node preference '{value}'") }.fail(),
        }
    }
}

/// How the connector finds the node to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Always connect to the single configured endpoint; no gossip.
    SingleNode,
    /// Treat the endpoints as gossip seeds and select by [`NodePreference`].
    Cluster,
}

/// Configuration for the cluster connector.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seed endpoints, tried in this order during every discovery round.
    pub(crate) endpoints: Vec<Endpoint>,

    /// Single-node or gossip-based selection.
    pub(crate) mode: ConnectionMode,

    /// Member role preferred by the gossip selector.
    pub(crate) node_preference: NodePreference,

    /// Discovery rounds attempted before failing with a discovery error.
    pub(crate) max_discover_attempts: u32,

    /// Pause between failed discovery rounds.
    pub(crate) discovery_interval: Duration,

    /// Bound on a single gossip call.
    pub(crate) gossip_timeout: Duration,

    /// Period of the background topology refresh.
    pub(crate) refresh_interval: Duration,

    /// Request timeout applied to channels.
    pub(crate) timeout: Duration,

    /// Connection establishment timeout applied to channels.
    pub(crate) connect_timeout: Duration,

    /// Metrics sink.
    pub(crate) metrics: Arc<dyn ConnectMetrics>,
}

impl ClientConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Returns the configured seed endpoints.
    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Returns the connection mode.
    #[must_use]
    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// Returns the node preference.
    #[must_use]
    pub fn node_preference(&self) -> NodePreference {
        self.node_preference
    }

    /// Returns the maximum number of discovery rounds.
    #[must_use]
    pub fn max_discover_attempts(&self) -> u32 {
        self.max_discover_attempts
    }

    /// Returns the pause between failed discovery rounds.
    #[must_use]
    pub fn discovery_interval(&self) -> Duration {
        self.discovery_interval
    }

    /// Returns the per-call gossip timeout.
    #[must_use]
    pub fn gossip_timeout(&self) -> Duration {
        self.gossip_timeout
    }

    /// Returns the background refresh period.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Returns the request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the connection timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the metrics sink.
    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn ConnectMetrics> {
        &self.metrics
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    endpoints: Vec<Endpoint>,
    mode: Option<ConnectionMode>,
    node_preference: NodePreference,
    max_discover_attempts: Option<u32>,
    discovery_interval: Option<Duration>,
    gossip_timeout: Option<Duration>,
    refresh_interval: Option<Duration>,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    metrics: Option<Arc<dyn ConnectMetrics>>,
}

impl ClientConfigBuilder {
    /// Sets the seed endpoints, replacing any added so far.
    #[must_use]
    pub fn with_endpoints<I>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = Endpoint>,
    {
        self.endpoints = endpoints.into_iter().collect();
        self
    }

    /// Adds a single seed endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Sets the connection mode.
    ///
    /// Default: [`ConnectionMode::SingleNode`] for one endpoint,
    /// [`ConnectionMode::Cluster`] otherwise.
    #[must_use]
    pub fn with_mode(mut self, mode: ConnectionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Sets the node preference used in cluster mode.
    ///
    /// Default: [`NodePreference::Leader`].
    #[must_use]
    pub fn with_node_preference(mut self, preference: NodePreference) -> Self {
        self.node_preference = preference;
        self
    }

    /// Sets the number of discovery rounds attempted before failing.
    ///
    /// Default: 10.
    #[must_use]
    pub fn with_max_discover_attempts(mut self, attempts: u32) -> Self {
        self.max_discover_attempts = Some(attempts);
        self
    }

    /// Sets the pause between failed discovery rounds.
    ///
    /// Default: 100 milliseconds.
    #[must_use]
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = Some(interval);
        self
    }

    /// Sets the bound on a single gossip call.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub fn with_gossip_timeout(mut self, timeout: Duration) -> Self {
        self.gossip_timeout = Some(timeout);
        self
    }

    /// Sets the background topology refresh period.
    ///
    /// Default: the discovery interval.
    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Sets the request timeout applied to channels.
    ///
    /// Default: 30 seconds.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the connection establishment timeout.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the metrics sink.
    ///
    /// Default: [`NoopConnectMetrics`].
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn ConnectMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No endpoints provided
    /// - Single-node mode with more than one endpoint
    /// - `max_discover_attempts` is zero
    /// - Any interval or timeout is zero
    pub fn build(self) -> Result<ClientConfig> {
        ensure!(
            !self.endpoints.is_empty(),
            ConfigSnafu { message: "at least one endpoint is required" }
        );

        let mode = self.mode.unwrap_or(if self.endpoints.len() == 1 {
            ConnectionMode::SingleNode
        } else {
            ConnectionMode::Cluster
        });

        ensure!(
            mode == ConnectionMode::Cluster || self.endpoints.len() == 1,
            ConfigSnafu { message: "single-node mode requires exactly one endpoint" }
        );

        let max_discover_attempts =
            self.max_discover_attempts.unwrap_or(DEFAULT_MAX_DISCOVER_ATTEMPTS);
        ensure!(
            max_discover_attempts > 0,
            ConfigSnafu { message: "max_discover_attempts must be at least 1" }
        );

        let discovery_interval = self.discovery_interval.unwrap_or(DEFAULT_DISCOVERY_INTERVAL);
        ensure!(
            !discovery_interval.is_zero(),
            ConfigSnafu { message: "discovery_interval cannot be zero" }
        );

        let gossip_timeout = self.gossip_timeout.unwrap_or(DEFAULT_GOSSIP_TIMEOUT);
        ensure!(!gossip_timeout.is_zero(), ConfigSnafu { message: "gossip_timeout cannot be zero" });

        let refresh_interval = self.refresh_interval.unwrap_or(discovery_interval);
        ensure!(
            !refresh_interval.is_zero(),
            ConfigSnafu { message: "refresh_interval cannot be zero" }
        );

        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        ensure!(!timeout.is_zero(), ConfigSnafu { message: "timeout cannot be zero" });

        let connect_timeout = self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        ensure!(
            !connect_timeout.is_zero(),
            ConfigSnafu { message: "connect_timeout cannot be zero" }
        );

        Ok(ClientConfig {
            endpoints: self.endpoints,
            mode,
            node_preference: self.node_preference,
            max_discover_attempts,
            discovery_interval,
            gossip_timeout,
            refresh_interval,
            timeout,
            connect_timeout,
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopConnectMetrics)),
        })
    }
}
