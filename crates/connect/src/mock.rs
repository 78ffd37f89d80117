//! In-memory cluster for testing connection management.
//!
//! [`MockCluster`] implements both collaborator traits the connector depends
//! on, [`GossipClient`] and [`CapabilityNegotiator`], so a
//! [`ClusterConnector`](crate::ClusterConnector) can be exercised without
//! any server running. Channels are created lazily and never dialed, so the
//! seed and member endpoints need not exist.
//!
//! # Features
//!
//! - **Scripted topology**: every gossip query answers with the current snapshot
//! - **Per-seed behavior**: make individual seeds hang or fail
//! - **Failure injection**: inject UNAVAILABLE errors or delays into gossip
//! - **Per-node capabilities**: negotiation answers depend on the target node
//! - **Request tracking**: count and record every gossip and negotiation call
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use inferadb_ledger_connect::{
//!     ClientConfig, ClusterConnector, ClusterTopology, Endpoint, MemberInfo, MemberState,
//!     mock::MockCluster,
//! };
//!
//! # async fn example() -> inferadb_ledger_connect::Result<()> {
//! let cluster = Arc::new(MockCluster::new());
//! cluster.set_topology(ClusterTopology::new(vec![MemberInfo {
//!     node_id: "n1".to_owned(),
//!     state: MemberState::Leader,
//!     is_alive: true,
//!     endpoint: "10.0.0.1:2113".parse::<Endpoint>()?,
//! }]));
//!
//! let config = ClientConfig::builder()
//!     .with_endpoints(["seed-a:2113".parse::<Endpoint>()?, "seed-b:2113".parse::<Endpoint>()?])
//!     .build()?;
//! let connector = ClusterConnector::new(config, cluster.clone(), cluster.clone());
//!
//! let context = connector.connect().await?;
//! assert_eq!(context.endpoint().to_string(), "10.0.0.1:2113");
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tonic::Code;

use crate::{
    capabilities::{CapabilityNegotiator, ServerCapabilities},
    connection::ChannelHandle,
    discovery::{ClusterTopology, GossipClient},
    endpoint::Endpoint,
    error::{ConnectError, Result},
};

/// How a seed answers gossip queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedBehavior {
    /// Answers with the current topology.
    #[default]
    Respond,
    /// Never answers; the caller's timeout decides.
    Hang,
    /// Fails with UNAVAILABLE.
    Fail,
}

/// How capability negotiation answers.
#[derive(Debug, Clone, Default)]
enum NegotiationBehavior {
    /// Per-node capabilities, falling back to the empty set.
    #[default]
    Respond,
    /// Fails with UNIMPLEMENTED, as servers without the endpoint do.
    Unimplemented,
    /// Fails with the given status code.
    Fail(Code),
}

/// Shared state for the mock cluster.
#[derive(Debug, Default)]
struct MockState {
    /// Snapshot returned by every responding seed.
    topology: RwLock<ClusterTopology>,

    /// Per-seed behavior overrides.
    seed_behaviors: RwLock<HashMap<Endpoint, SeedBehavior>>,

    /// Capabilities returned by each node.
    capabilities: RwLock<HashMap<Endpoint, ServerCapabilities>>,

    /// Negotiation behavior for every node.
    negotiation: RwLock<NegotiationBehavior>,

    /// Number of UNAVAILABLE errors to inject for the next gossip queries.
    unavailable_count: AtomicUsize,

    /// Delay to inject before each gossip answer (milliseconds).
    delay_ms: AtomicU64,

    /// Total gossip queries received.
    gossip_count: AtomicUsize,

    /// Total negotiation requests received.
    negotiate_count: AtomicUsize,

    /// Endpoint of every gossip query, in arrival order.
    gossip_targets: Mutex<Vec<Endpoint>>,

    /// Endpoint of every negotiation request, in arrival order.
    negotiate_targets: Mutex<Vec<Endpoint>>,
}

impl MockState {
    /// Checks if an UNAVAILABLE error should be injected, consuming one if so.
    fn should_inject_unavailable(&self) -> bool {
        self.unavailable_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn delay(&self) -> Option<Duration> {
        match self.delay_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Scripted gossip cluster and capability negotiator.
#[derive(Debug, Default)]
pub struct MockCluster {
    state: MockState,
}

impl MockCluster {
    /// Creates a cluster with an empty topology where every seed responds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the topology returned by responding seeds.
    pub fn set_topology(&self, topology: ClusterTopology) {
        *self.state.topology.write() = topology;
    }

    /// Sets how `seed` answers gossip queries.
    pub fn set_seed_behavior(&self, seed: Endpoint, behavior: SeedBehavior) {
        self.state.seed_behaviors.write().insert(seed, behavior);
    }

    /// Sets the capabilities advertised by the node at `endpoint`.
    pub fn set_capabilities(&self, endpoint: Endpoint, capabilities: ServerCapabilities) {
        self.state.capabilities.write().insert(endpoint, capabilities);
    }

    /// Makes every negotiation fail with UNIMPLEMENTED.
    pub fn set_negotiation_unimplemented(&self) {
        *self.state.negotiation.write() = NegotiationBehavior::Unimplemented;
    }

    /// Makes every negotiation fail with `code`.
    pub fn fail_negotiation(&self, code: Code) {
        *self.state.negotiation.write() = NegotiationBehavior::Fail(code);
    }

    /// Injects UNAVAILABLE errors for the next `count` gossip queries.
    pub fn inject_unavailable(&self, count: usize) {
        self.state.unavailable_count.store(count, Ordering::SeqCst);
    }

    /// Delays every gossip answer by `delay`.
    pub fn inject_delay(&self, delay: Duration) {
        self.state.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Returns the number of gossip queries received.
    #[must_use]
    pub fn gossip_calls(&self) -> usize {
        self.state.gossip_count.load(Ordering::SeqCst)
    }

    /// Returns the endpoint of every gossip query in arrival order.
    #[must_use]
    pub fn gossip_targets(&self) -> Vec<Endpoint> {
        self.state.gossip_targets.lock().clone()
    }

    /// Returns the number of negotiation requests received.
    #[must_use]
    pub fn negotiate_calls(&self) -> usize {
        self.state.negotiate_count.load(Ordering::SeqCst)
    }

    /// Returns the endpoint of every negotiation request in arrival order.
    #[must_use]
    pub fn negotiate_targets(&self) -> Vec<Endpoint> {
        self.state.negotiate_targets.lock().clone()
    }

    /// Clears counters, recorded targets, and injected failures.
    ///
    /// Topology, seed behaviors, and capabilities are kept.
    pub fn reset_counters(&self) {
        self.state.gossip_count.store(0, Ordering::SeqCst);
        self.state.negotiate_count.store(0, Ordering::SeqCst);
        self.state.unavailable_count.store(0, Ordering::SeqCst);
        self.state.delay_ms.store(0, Ordering::SeqCst);
        self.state.gossip_targets.lock().clear();
        self.state.negotiate_targets.lock().clear();
    }
}

#[async_trait]
impl GossipClient for MockCluster {
    async fn read_gossip(
        &self,
        handle: &ChannelHandle,
        _timeout: Duration,
    ) -> Result<ClusterTopology> {
        let seed = handle.endpoint().clone();
        self.state.gossip_count.fetch_add(1, Ordering::SeqCst);
        self.state.gossip_targets.lock().push(seed.clone());

        let behavior = self.state.seed_behaviors.read().get(&seed).copied().unwrap_or_default();
        match behavior {
            SeedBehavior::Respond => {},
            SeedBehavior::Hang => return std::future::pending().await,
            SeedBehavior::Fail => {
                return Err(ConnectError::Rpc {
                    code: Code::Unavailable,
                    message: format!("seed {seed} unavailable"),
                });
            },
        }

        if self.state.should_inject_unavailable() {
            return Err(ConnectError::Rpc {
                code: Code::Unavailable,
                message: "injected unavailable".to_owned(),
            });
        }

        if let Some(delay) = self.state.delay() {
            tokio::time::sleep(delay).await;
        }

        Ok(self.state.topology.read().clone())
    }
}

#[async_trait]
impl CapabilityNegotiator for MockCluster {
    async fn negotiate(&self, handle: &ChannelHandle) -> Result<ServerCapabilities> {
        let node = handle.endpoint().clone();
        self.state.negotiate_count.fetch_add(1, Ordering::SeqCst);
        self.state.negotiate_targets.lock().push(node.clone());

        let behavior = self.state.negotiation.read().clone();
        match behavior {
            NegotiationBehavior::Respond => {
                Ok(self.state.capabilities.read().get(&node).cloned().unwrap_or_default())
            },
            NegotiationBehavior::Unimplemented => Err(ConnectError::Rpc {
                code: Code::Unimplemented,
                message: "capabilities endpoint not implemented".to_owned(),
            }),
            NegotiationBehavior::Fail(code) => Err(ConnectError::Rpc {
                code,
                message: format!("negotiation with {node} failed"),
            }),
        }
    }
}
