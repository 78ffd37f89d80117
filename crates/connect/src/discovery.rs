//! Gossip-based cluster discovery.
//!
//! The [`GossipSelector`] asks seed nodes for the cluster member list and
//! routes to the member matching the configured [`NodePreference`].
//!
//! # Discovery Rounds
//!
//! ```text
//! round 1..=max_discover_attempts:
//!   for seed in seeds (configured order):
//!     gossip(seed) ── timeout / error ──► next seed
//!        │
//!        └─ snapshot ──► pick_member(preference) ──► Some(member) ──► done
//!                                                 └► None ──► round failed
//!   round failed ──► sleep(discovery_interval)
//! all rounds failed ──► ConnectError::Discovery { attempts }
//! ```
//!
//! A `NewLeader` cause short-circuits all of this and connects to the
//! redirected endpoint directly.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    config::{ClientConfig, NodePreference},
    connection::{ChannelCache, ChannelHandle},
    endpoint::Endpoint,
    error::{ConnectError, DiscoverySnafu, Result, TimeoutSnafu},
    metrics::ConnectMetrics,
    reconnect::ReconnectionRequired,
    selector::{NodeSelector, pick_member},
};

/// Role and liveness of a cluster member as reported by gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberState {
    /// Accepts writes.
    Leader,
    /// Replicates from the leader; may become leader.
    Follower,
    /// Replicates from the leader; never votes or leads.
    ReadOnlyReplica,
    /// Any state the client does not route on specifically.
    Unknown,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
            Self::ReadOnlyReplica => write!(f, "read_only_replica"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Information about one member in a gossip response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Member identifier.
    pub node_id: String,

    /// Role reported for this member.
    pub state: MemberState,

    /// Whether the responding node considers this member alive.
    pub is_alive: bool,

    /// Client-facing endpoint of the member.
    pub endpoint: Endpoint,
}

/// Point-in-time view of cluster membership from one gossip query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    members: Vec<MemberInfo>,
}

impl ClusterTopology {
    /// Creates a snapshot, preserving member order.
    #[must_use]
    pub fn new(members: Vec<MemberInfo>) -> Self {
        Self { members }
    }

    /// Returns the members in the order the server reported them.
    #[must_use]
    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }

    /// Iterates alive members.
    pub fn alive(&self) -> impl Iterator<Item = &MemberInfo> {
        self.members.iter().filter(|m| m.is_alive)
    }

    /// Returns the first alive leader, if any.
    #[must_use]
    pub fn leader(&self) -> Option<&MemberInfo> {
        self.alive().find(|m| m.state == MemberState::Leader)
    }
}

/// Queries a node for the current cluster member list.
#[async_trait]
pub trait GossipClient: Send + Sync {
    /// Reads gossip through `handle`.
    ///
    /// `timeout` is the deadline the selector enforces; implementations may
    /// forward it as the RPC deadline.
    async fn read_gossip(&self, handle: &ChannelHandle, timeout: Duration)
    -> Result<ClusterTopology>;
}

/// Selector that discovers the target node through gossip.
pub struct GossipSelector {
    seeds: Vec<Endpoint>,
    preference: NodePreference,
    max_discover_attempts: u32,
    discovery_interval: Duration,
    gossip_timeout: Duration,
    cache: Arc<ChannelCache>,
    gossip: Arc<dyn GossipClient>,
    metrics: Arc<dyn ConnectMetrics>,
}

impl GossipSelector {
    /// Creates a selector using the seeds and discovery settings in `config`.
    #[must_use]
    pub fn new(
        config: &ClientConfig,
        cache: Arc<ChannelCache>,
        gossip: Arc<dyn GossipClient>,
    ) -> Self {
        Self {
            seeds: config.endpoints().to_vec(),
            preference: config.node_preference(),
            max_discover_attempts: config.max_discover_attempts(),
            discovery_interval: config.discovery_interval(),
            gossip_timeout: config.gossip_timeout(),
            cache,
            gossip,
            metrics: Arc::clone(config.metrics()),
        }
    }

    /// Returns the seeds in the order they are tried.
    #[must_use]
    pub fn seeds(&self) -> &[Endpoint] {
        &self.seeds
    }

    /// Returns the node preference.
    #[must_use]
    pub fn preference(&self) -> NodePreference {
        self.preference
    }

    /// Runs discovery rounds until a member is selected or attempts run out.
    async fn discover(&self) -> Result<ChannelHandle> {
        for attempt in 1..=self.max_discover_attempts {
            if let Some(member) = self.discover_once().await? {
                self.metrics.record_discovery_round(attempt, true);
                info!(
                    attempt,
                    node_id = %member.node_id,
                    state = %member.state,
                    endpoint = %member.endpoint,
                    preference = %self.preference,
                    "Discovered cluster node"
                );
                return self.cache.get_or_create(&member.endpoint);
            }

            self.metrics.record_discovery_round(attempt, false);
            warn!(
                attempt,
                max_attempts = self.max_discover_attempts,
                "Discovery round found no eligible node"
            );

            if attempt < self.max_discover_attempts {
                tokio::time::sleep(self.discovery_interval).await;
            }
        }

        DiscoverySnafu { attempts: self.max_discover_attempts }.fail()
    }

    /// One pass over the seeds.
    ///
    /// Per-seed failures are skipped. The first snapshot obtained ends the
    /// pass whether or not it contains an eligible member. Only shutdown is
    /// returned as an error.
    async fn discover_once(&self) -> Result<Option<MemberInfo>> {
        for seed in &self.seeds {
            let handle = match self.cache.get_or_create(seed) {
                Ok(handle) => handle,
                Err(ConnectError::Shutdown) => return Err(ConnectError::Shutdown),
                Err(e) => {
                    debug!(seed = %seed, error = %e, "Skipping seed without a usable channel");
                    continue;
                },
            };

            let query = self.gossip.read_gossip(&handle, self.gossip_timeout);
            match tokio::time::timeout(self.gossip_timeout, query).await {
                Ok(Ok(topology)) => {
                    debug!(seed = %seed, members = topology.members().len(), "Received gossip");
                    return Ok(self.choose(&topology));
                },
                Ok(Err(e)) => {
                    debug!(seed = %seed, error = %e, "Gossip query failed");
                },
                Err(_) => {
                    let e = TimeoutSnafu { duration_ms: self.gossip_timeout.as_millis() as u64 }
                        .build();
                    debug!(seed = %seed, error = %e, "Gossip query timed out");
                },
            }
        }

        Ok(None)
    }

    fn choose(&self, topology: &ClusterTopology) -> Option<MemberInfo> {
        pick_member(topology.members(), self.preference, &mut rand::rng()).cloned()
    }
}

#[async_trait]
impl NodeSelector for GossipSelector {
    async fn select(&self, cause: &ReconnectionRequired) -> Result<ChannelHandle> {
        match cause {
            ReconnectionRequired::NewLeader(endpoint) => {
                debug!(endpoint = %endpoint, "Connecting to redirected leader without gossip");
                self.cache.get_or_create(endpoint)
            },
            ReconnectionRequired::None | ReconnectionRequired::Rediscover => self.discover().await,
        }
    }
}

impl fmt::Debug for GossipSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GossipSelector")
            .field("seeds", &self.seeds)
            .field("preference", &self.preference)
            .field("max_discover_attempts", &self.max_discover_attempts)
            .field("discovery_interval", &self.discovery_interval)
            .field("gossip_timeout", &self.gossip_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::mock::{MockCluster, SeedBehavior};

    fn endpoint(s: &str) -> Endpoint {
        s.parse().expect("valid endpoint")
    }

    fn member(id: &str, state: MemberState, addr: &str) -> MemberInfo {
        MemberInfo { node_id: id.to_owned(), state, is_alive: true, endpoint: endpoint(addr) }
    }

    fn three_node_topology() -> ClusterTopology {
        ClusterTopology::new(vec![
            member("n1", MemberState::Follower, "10.0.0.1:2113"),
            member("n2", MemberState::Leader, "10.0.0.2:2113"),
            member("n3", MemberState::Follower, "10.0.0.3:2113"),
        ])
    }

    fn cluster_config(seeds: &[&str], preference: NodePreference, attempts: u32) -> ClientConfig {
        ClientConfig::builder()
            .with_endpoints(seeds.iter().map(|s| endpoint(s)))
            .with_mode(crate::config::ConnectionMode::Cluster)
            .with_node_preference(preference)
            .with_max_discover_attempts(attempts)
            .with_discovery_interval(Duration::from_millis(100))
            .with_gossip_timeout(Duration::from_millis(500))
            .build()
            .expect("valid config")
    }

    fn selector(config: &ClientConfig, cluster: &Arc<MockCluster>) -> GossipSelector {
        let cache = Arc::new(ChannelCache::new(config));
        GossipSelector::new(config, cache, cluster.clone())
    }

    #[test]
    fn topology_leader_ignores_dead_members() {
        let mut dead_leader = member("n0", MemberState::Leader, "10.0.0.9:2113");
        dead_leader.is_alive = false;
        let mut members = vec![dead_leader];
        members.extend(three_node_topology().members().iter().cloned());
        let topology = ClusterTopology::new(members);

        assert_eq!(topology.leader().map(|m| m.node_id.as_str()), Some("n2"));
        assert_eq!(topology.alive().count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn leader_preference_connects_to_leader() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_topology(three_node_topology());
        let config = cluster_config(&["seed-a:2113"], NodePreference::Leader, 3);
        let selector = selector(&config, &cluster);

        let handle = selector.select(&ReconnectionRequired::None).await.unwrap();

        assert_eq!(handle.endpoint(), &endpoint("10.0.0.2:2113"));
        assert_eq!(cluster.gossip_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_leader_skips_gossip() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_topology(three_node_topology());
        let config = cluster_config(&["seed-a:2113"], NodePreference::Leader, 3);
        let selector = selector(&config, &cluster);

        let target = endpoint("10.0.0.3:2113");
        let handle =
            selector.select(&ReconnectionRequired::NewLeader(target.clone())).await.unwrap();

        assert_eq!(handle.endpoint(), &target);
        assert_eq!(cluster.gossip_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn follower_preference_falls_back_to_leader() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_topology(ClusterTopology::new(vec![member(
            "n1",
            MemberState::Leader,
            "10.0.0.1:2113",
        )]));
        let config = cluster_config(&["seed-a:2113"], NodePreference::Follower, 3);
        let selector = selector(&config, &cluster);

        let handle = selector.select(&ReconnectionRequired::Rediscover).await.unwrap();

        assert_eq!(handle.endpoint(), &endpoint("10.0.0.1:2113"));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_seed_is_skipped() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_topology(three_node_topology());
        cluster.set_seed_behavior(endpoint("seed-a:2113"), SeedBehavior::Hang);
        let config = cluster_config(&["seed-a:2113", "seed-b:2113"], NodePreference::Leader, 1);
        let selector = selector(&config, &cluster);

        let handle = selector.select(&ReconnectionRequired::None).await.unwrap();

        assert_eq!(handle.endpoint(), &endpoint("10.0.0.2:2113"));
        assert_eq!(
            cluster.gossip_targets(),
            vec![endpoint("seed-a:2113"), endpoint("seed-b:2113")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn seeds_are_tried_in_configured_order_and_stop_at_first_success() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_topology(three_node_topology());
        let config = cluster_config(
            &["seed-a:2113", "seed-b:2113", "seed-c:2113"],
            NodePreference::Leader,
            1,
        );
        let selector = selector(&config, &cluster);

        selector.select(&ReconnectionRequired::None).await.unwrap();

        assert_eq!(cluster.gossip_targets(), vec![endpoint("seed-a:2113")]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_rounds_reports_attempt_count() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_topology(three_node_topology());
        cluster.set_seed_behavior(endpoint("seed-a:2113"), SeedBehavior::Fail);
        cluster.set_seed_behavior(endpoint("seed-b:2113"), SeedBehavior::Fail);
        let config = cluster_config(&["seed-a:2113", "seed-b:2113"], NodePreference::Leader, 3);
        let selector = selector(&config, &cluster);

        let err = selector.select(&ReconnectionRequired::None).await.unwrap_err();

        assert!(matches!(err, ConnectError::Discovery { attempts: 3 }));
        assert_eq!(cluster.gossip_calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_without_eligible_member_fails_the_round() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_topology(ClusterTopology::new(vec![member(
            "n1",
            MemberState::Follower,
            "10.0.0.1:2113",
        )]));
        let config = cluster_config(&["seed-a:2113", "seed-b:2113"], NodePreference::Leader, 2);
        let selector = selector(&config, &cluster);

        let err = selector.select(&ReconnectionRequired::None).await.unwrap_err();

        assert!(matches!(err, ConnectError::Discovery { attempts: 2 }));
        // First seed answers each round, so the second is never asked.
        assert_eq!(cluster.gossip_targets(), vec![endpoint("seed-a:2113"); 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn later_round_succeeds_after_topology_recovers() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_topology(ClusterTopology::default());
        let config = cluster_config(&["seed-a:2113"], NodePreference::Leader, 5);
        let selector = Arc::new(selector(&config, &cluster));

        let task = {
            let selector = Arc::clone(&selector);
            tokio::spawn(async move { selector.select(&ReconnectionRequired::None).await })
        };

        // Let the first round fail, then publish a leader before the next round.
        while cluster.gossip_calls() == 0 {
            tokio::task::yield_now().await;
        }
        cluster.set_topology(three_node_topology());

        let handle = task.await.unwrap().unwrap();
        assert_eq!(handle.endpoint(), &endpoint("10.0.0.2:2113"));
        assert_eq!(cluster.gossip_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_cache_aborts_discovery() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_topology(three_node_topology());
        let config = cluster_config(&["seed-a:2113"], NodePreference::Leader, 3);
        let cache = Arc::new(ChannelCache::new(&config));
        let selector = GossipSelector::new(&config, Arc::clone(&cache), cluster.clone());

        cache.close();
        let err = selector.select(&ReconnectionRequired::None).await.unwrap_err();

        assert!(matches!(err, ConnectError::Shutdown));
        assert_eq!(cluster.gossip_calls(), 0);
    }
}
