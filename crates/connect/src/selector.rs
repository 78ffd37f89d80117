//! Node selection.
//!
//! A [`NodeSelector`] answers "which node should the connector talk to now?"
//! for a given [`ReconnectionRequired`] cause. Two implementations exist and
//! one is chosen when the connector is built:
//!
//! - [`SingleNodeSelector`]: always the one configured endpoint
//! - [`GossipSelector`](crate::GossipSelector): asks seed nodes for the member list and ranks it
//!   by [`NodePreference`]

use std::sync::Arc;

use async_trait::async_trait;
use rand::{Rng, seq::IndexedRandom};
use tracing::debug;

use crate::{
    config::NodePreference,
    connection::{ChannelCache, ChannelHandle},
    discovery::{MemberInfo, MemberState},
    endpoint::Endpoint,
    error::Result,
    reconnect::ReconnectionRequired,
};

/// Resolves the channel to use for a reconnection cause.
#[async_trait]
pub trait NodeSelector: Send + Sync {
    /// Selects a node and returns its cached channel handle.
    async fn select(&self, cause: &ReconnectionRequired) -> Result<ChannelHandle>;
}

/// Selector for single-node deployments.
///
/// Ignores topology and the reconnection cause.
#[derive(Debug)]
pub struct SingleNodeSelector {
    endpoint: Endpoint,
    cache: Arc<ChannelCache>,
}

impl SingleNodeSelector {
    /// Creates a selector pinned to `endpoint`.
    #[must_use]
    pub fn new(endpoint: Endpoint, cache: Arc<ChannelCache>) -> Self {
        Self { endpoint, cache }
    }

    /// Returns the pinned endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl NodeSelector for SingleNodeSelector {
    async fn select(&self, cause: &ReconnectionRequired) -> Result<ChannelHandle> {
        debug!(endpoint = %self.endpoint, cause = %cause, "Single-node selection");
        self.cache.get_or_create(&self.endpoint)
    }
}

/// Picks the member to connect to from one topology snapshot.
///
/// Only alive members are eligible. Ranking by preference:
///
/// - `Leader`: the alive leader (the first one listed if the snapshot shows several)
/// - `Follower`: a random alive follower, else the leader
/// - `ReadOnlyReplica`: a random alive read-only replica, else a random follower, else the leader
/// - `Random`: any alive member
///
/// Returns `None` when nothing is eligible even after fallback.
pub fn pick_member<'a, R>(
    members: &'a [MemberInfo],
    preference: NodePreference,
    rng: &mut R,
) -> Option<&'a MemberInfo>
where
    R: Rng + ?Sized,
{
    let alive: Vec<&MemberInfo> = members.iter().filter(|m| m.is_alive).collect();

    match preference {
        NodePreference::Leader => leader(&alive),
        NodePreference::Follower => {
            random_in_state(&alive, MemberState::Follower, rng).or_else(|| leader(&alive))
        },
        NodePreference::ReadOnlyReplica => {
            random_in_state(&alive, MemberState::ReadOnlyReplica, rng)
                .or_else(|| random_in_state(&alive, MemberState::Follower, rng))
                .or_else(|| leader(&alive))
        },
        NodePreference::Random => alive.choose(rng).copied(),
    }
}

fn leader<'a>(alive: &[&'a MemberInfo]) -> Option<&'a MemberInfo> {
    alive.iter().copied().find(|m| m.state == MemberState::Leader)
}

fn random_in_state<'a, R>(
    alive: &[&'a MemberInfo],
    state: MemberState,
    rng: &mut R,
) -> Option<&'a MemberInfo>
where
    R: Rng + ?Sized,
{
    let candidates: Vec<&MemberInfo> = alive.iter().copied().filter(|m| m.state == state).collect();
    candidates.choose(rng).copied()
}
