//! Integration tests for `ClusterConnector` against the in-memory cluster.
//!
//! All tests run with a paused clock, so discovery intervals, gossip
//! timeouts, and refresh periods elapse instantly once every task is idle.
//!
//! ## Test Categories
//!
//! - **Single flight**: concurrent callers share one connection attempt
//! - **Reconnection**: leader redirects, rediscovery, last reset wins
//! - **Discovery**: preferences, seed failover, bounded rounds
//! - **Lifecycle**: background refresh, disposal, metrics

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use inferadb_ledger_connect::{
    ChannelCache, ClientConfig, ClusterConnector, ClusterTopology, ConnectError, ConnectMetrics,
    ConnectionMode, Endpoint, MemberInfo, MemberState, NodePreference, ProviderState,
    ReconnectionRequired,
    mock::{MockCluster, SeedBehavior},
};
use parking_lot::Mutex;

// ============================================================================
// Helpers
// ============================================================================

fn endpoint(s: &str) -> Endpoint {
    s.parse().expect("valid endpoint")
}

fn member(id: &str, state: MemberState, addr: &str) -> MemberInfo {
    MemberInfo { node_id: id.to_owned(), state, is_alive: true, endpoint: endpoint(addr) }
}

/// One leader at `10.0.0.1`, followers at `10.0.0.2` and `10.0.0.3`.
fn three_nodes() -> ClusterTopology {
    ClusterTopology::new(vec![
        member("n1", MemberState::Leader, "10.0.0.1:2113"),
        member("n2", MemberState::Follower, "10.0.0.2:2113"),
        member("n3", MemberState::Follower, "10.0.0.3:2113"),
    ])
}

fn config_with(seeds: &[&str], preference: NodePreference, attempts: u32) -> ClientConfig {
    ClientConfig::builder()
        .with_endpoints(seeds.iter().map(|s| endpoint(s)))
        .with_mode(ConnectionMode::Cluster)
        .with_node_preference(preference)
        .with_max_discover_attempts(attempts)
        .with_discovery_interval(Duration::from_millis(100))
        .with_gossip_timeout(Duration::from_secs(1))
        .with_refresh_interval(Duration::from_secs(60))
        .build()
        .expect("valid config")
}

fn connector(cluster: &Arc<MockCluster>, config: ClientConfig) -> ClusterConnector {
    ClusterConnector::new(config, cluster.clone(), cluster.clone())
}

async fn wait_for_gossip(cluster: &MockCluster, calls: usize) {
    while cluster.gossip_calls() < calls {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Single Flight
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_attempt() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    cluster.inject_delay(Duration::from_millis(200));
    let connector = connector(&cluster, config_with(&["seed-a:2113"], NodePreference::Leader, 3));

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let connector = connector.clone();
            tokio::spawn(async move { connector.connect().await })
        })
        .collect();

    let mut contexts = Vec::new();
    for task in tasks {
        contexts.push(task.await.unwrap().unwrap());
    }

    assert_eq!(connector.connection_attempts(), 1);
    assert_eq!(cluster.gossip_calls(), 1);
    assert_eq!(cluster.negotiate_calls(), 1);
    assert!(contexts.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
}

#[tokio::test(start_paused = true)]
async fn ready_context_is_reused_without_network() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    let connector = connector(&cluster, config_with(&["seed-a:2113"], NodePreference::Leader, 3));

    let first = connector.connect().await.unwrap();
    for _ in 0..10 {
        assert!(Arc::ptr_eq(&first, &connector.connect().await.unwrap()));
    }

    assert_eq!(cluster.gossip_calls(), 1);
    assert_eq!(cluster.negotiate_calls(), 1);
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn leader_redirect_connects_without_gossip() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    let connector = connector(&cluster, config_with(&["seed-a:2113"], NodePreference::Leader, 3));
    connector.connect().await.unwrap();
    cluster.reset_counters();

    let context = connector.force_reconnect(Some(endpoint("10.0.0.7:2113"))).await.unwrap();

    assert_eq!(context.endpoint(), &endpoint("10.0.0.7:2113"));
    assert_eq!(cluster.gossip_calls(), 0);
    assert_eq!(cluster.negotiate_targets(), vec![endpoint("10.0.0.7:2113")]);
}

#[tokio::test(start_paused = true)]
async fn rediscover_during_older_attempt_wins() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    cluster.inject_delay(Duration::from_secs(1));
    let connector = connector(&cluster, config_with(&["seed-a:2113"], NodePreference::Leader, 3));

    let early = {
        let connector = connector.clone();
        tokio::spawn(async move { connector.connect().await })
    };
    wait_for_gossip(&cluster, 1).await;

    // Leadership moves while the first gossip answer is still in flight.
    cluster.set_topology(ClusterTopology::new(vec![
        member("n1", MemberState::Follower, "10.0.0.1:2113"),
        member("n4", MemberState::Leader, "10.0.0.4:2113"),
    ]));
    let late = {
        let connector = connector.clone();
        tokio::spawn(async move { connector.force_reconnect(None).await })
    };

    let early = early.await.unwrap().unwrap();
    let late = late.await.unwrap().unwrap();

    assert_eq!(early.endpoint(), &endpoint("10.0.0.4:2113"));
    assert!(Arc::ptr_eq(&early, &late));
    assert_eq!(late.cause(), &ReconnectionRequired::Rediscover);
    assert_eq!(cluster.gossip_calls(), 2);
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn leader_preference_picks_leader() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    let connector = connector(&cluster, config_with(&["seed-a:2113"], NodePreference::Leader, 3));

    let context = connector.connect().await.unwrap();

    assert_eq!(context.endpoint(), &endpoint("10.0.0.1:2113"));
}

#[tokio::test(start_paused = true)]
async fn follower_preference_falls_back_to_leader() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(ClusterTopology::new(vec![member(
        "n1",
        MemberState::Leader,
        "10.0.0.1:2113",
    )]));
    let connector =
        connector(&cluster, config_with(&["seed-a:2113"], NodePreference::Follower, 3));

    let context = connector.connect().await.unwrap();

    assert_eq!(context.endpoint(), &endpoint("10.0.0.1:2113"));
}

#[tokio::test(start_paused = true)]
async fn follower_preference_picks_a_follower() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    let connector =
        connector(&cluster, config_with(&["seed-a:2113"], NodePreference::Follower, 3));

    let context = connector.connect().await.unwrap();

    assert!(
        [endpoint("10.0.0.2:2113"), endpoint("10.0.0.3:2113")].contains(context.endpoint()),
        "expected a follower, got {}",
        context.endpoint()
    );
}

#[tokio::test(start_paused = true)]
async fn failing_seeds_exhaust_discovery_rounds() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    cluster.set_seed_behavior(endpoint("seed-a:2113"), SeedBehavior::Fail);
    cluster.set_seed_behavior(endpoint("seed-b:2113"), SeedBehavior::Fail);
    let connector = connector(
        &cluster,
        config_with(&["seed-a:2113", "seed-b:2113"], NodePreference::Leader, 3),
    );

    let err = connector.connect().await.unwrap_err();

    assert!(matches!(err, ConnectError::Discovery { attempts: 3 }), "got {err}");
    assert!(err.is_retryable());
    assert_eq!(cluster.gossip_calls(), 6);
    assert_eq!(cluster.negotiate_calls(), 0);

    // The connector stays usable once a seed recovers.
    cluster.set_seed_behavior(endpoint("seed-b:2113"), SeedBehavior::Respond);
    let context = connector.connect().await.unwrap();
    assert_eq!(context.endpoint(), &endpoint("10.0.0.1:2113"));
    assert_eq!(context.cause(), &ReconnectionRequired::Rediscover);
}

#[tokio::test(start_paused = true)]
async fn timed_out_seed_fails_over_to_next() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    cluster.set_seed_behavior(endpoint("seed-a:2113"), SeedBehavior::Hang);
    let connector = connector(
        &cluster,
        config_with(&["seed-a:2113", "seed-b:2113"], NodePreference::Leader, 1),
    );

    let context = connector.connect().await.unwrap();

    assert_eq!(context.endpoint(), &endpoint("10.0.0.1:2113"));
    assert_eq!(cluster.gossip_targets(), vec![endpoint("seed-a:2113"), endpoint("seed-b:2113")]);
}

#[tokio::test(start_paused = true)]
async fn transient_gossip_errors_are_retried_next_round() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    cluster.inject_unavailable(2);
    let connector = connector(&cluster, config_with(&["seed-a:2113"], NodePreference::Leader, 3));

    let context = connector.connect().await.unwrap();

    assert_eq!(context.endpoint(), &endpoint("10.0.0.1:2113"));
    assert_eq!(cluster.gossip_calls(), 3);
}

#[tokio::test]
async fn channel_cache_returns_same_handle() {
    let config = config_with(&["seed-a:2113"], NodePreference::Leader, 1);
    let cache = ChannelCache::new(&config);
    let target = endpoint("10.0.0.1:2113");

    let first = cache.get_or_create(&target).unwrap();
    let second = cache.get_or_create(&target).unwrap();

    assert!(first.ptr_eq(&second));
    assert_eq!(cache.len(), 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn background_refresh_follows_topology() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    let refreshes = Arc::new(AtomicUsize::new(0));
    let config = ClientConfig::builder()
        .with_endpoints([endpoint("seed-a:2113")])
        .with_mode(ConnectionMode::Cluster)
        .with_refresh_interval(Duration::from_secs(10))
        .build()
        .unwrap();
    let connector = {
        let refreshes = Arc::clone(&refreshes);
        connector(&cluster, config).with_refresh_hook(move |_| {
            refreshes.fetch_add(1, Ordering::SeqCst);
        })
    };

    let before = connector.connect().await.unwrap();
    assert_eq!(before.endpoint(), &endpoint("10.0.0.1:2113"));

    cluster.set_topology(ClusterTopology::new(vec![member(
        "n2",
        MemberState::Leader,
        "10.0.0.2:2113",
    )]));
    tokio::time::sleep(Duration::from_secs(11)).await;

    let after = connector.connect().await.unwrap();
    assert_eq!(after.endpoint(), &endpoint("10.0.0.2:2113"));
    assert_eq!(after.cause(), &ReconnectionRequired::Rediscover);
    assert_eq!(refreshes.load(Ordering::SeqCst), 2);
    // The superseded context stays usable for callers still holding it.
    assert_eq!(before.endpoint(), &endpoint("10.0.0.1:2113"));
    connector.dispose();
}

#[tokio::test(start_paused = true)]
async fn default_refresh_runs_on_discovery_interval() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    let config = ClientConfig::builder()
        .with_endpoints([endpoint("seed-a:2113")])
        .with_mode(ConnectionMode::Cluster)
        .with_discovery_interval(Duration::from_millis(100))
        .build()
        .unwrap();
    assert_eq!(config.refresh_interval(), Duration::from_millis(100));
    let connector = connector(&cluster, config);

    let before = connector.connect().await.unwrap();
    assert_eq!(before.endpoint(), &endpoint("10.0.0.1:2113"));

    cluster.set_topology(ClusterTopology::new(vec![member(
        "n3",
        MemberState::Leader,
        "10.0.0.3:2113",
    )]));
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(connector.connection_attempts(), 3);
    let after = connector.connect().await.unwrap();
    assert_eq!(after.endpoint(), &endpoint("10.0.0.3:2113"));
    connector.dispose();
}

#[tokio::test(start_paused = true)]
async fn dispose_mid_attempt_releases_waiters() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    cluster.set_seed_behavior(endpoint("seed-a:2113"), SeedBehavior::Hang);
    let config = ClientConfig::builder()
        .with_endpoints([endpoint("seed-a:2113")])
        .with_mode(ConnectionMode::Cluster)
        .with_gossip_timeout(Duration::from_secs(3600))
        .build()
        .unwrap();
    let connector = connector(&cluster, config);

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let connector = connector.clone();
            tokio::spawn(async move { connector.connect().await })
        })
        .collect();
    wait_for_gossip(&cluster, 1).await;

    assert!(connector.dispose());

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectError::Shutdown)));
    }
    assert_eq!(connector.state(), ProviderState::Disposed);
}

#[derive(Debug, Default)]
struct RecordingMetrics {
    connects: Mutex<Vec<bool>>,
    rounds: Mutex<Vec<(u32, bool)>>,
    reconnects: Mutex<Vec<String>>,
}

impl ConnectMetrics for RecordingMetrics {
    fn record_connect(&self, _duration: Duration, success: bool) {
        self.connects.lock().push(success);
    }

    fn record_discovery_round(&self, attempt: u32, success: bool) {
        self.rounds.lock().push((attempt, success));
    }

    fn record_reconnect(&self, cause: &str) {
        self.reconnects.lock().push(cause.to_owned());
    }
}

#[tokio::test(start_paused = true)]
async fn metrics_observe_connects_rounds_and_reconnects() {
    let cluster = Arc::new(MockCluster::new());
    cluster.set_topology(three_nodes());
    cluster.inject_unavailable(1);
    let metrics = Arc::new(RecordingMetrics::default());
    let config = ClientConfig::builder()
        .with_endpoints([endpoint("seed-a:2113")])
        .with_mode(ConnectionMode::Cluster)
        .with_metrics(metrics.clone())
        .with_refresh_interval(Duration::from_secs(60))
        .build()
        .unwrap();
    let connector = connector(&cluster, config);

    connector.connect().await.unwrap();
    connector.force_reconnect(Some(endpoint("10.0.0.2:2113"))).await.unwrap();

    assert_eq!(*metrics.connects.lock(), vec![true, true]);
    assert_eq!(*metrics.rounds.lock(), vec![(1, false), (2, true)]);
    assert_eq!(*metrics.reconnects.lock(), vec!["new_leader".to_owned()]);
}
