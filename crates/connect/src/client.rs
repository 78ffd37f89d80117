//! Cluster connection orchestrator.
//!
//! [`ClusterConnector`] is what the RPC layer talks to. It combines node
//! selection, the channel cache, and capability negotiation into one shared
//! [`ConnectionContext`] kept by a [`SharingProvider`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ClusterConnector (Public API)               │
//! │      .connect() │ .force_reconnect() │ .dispose()           │
//! ├─────────────────────────────────────────────────────────────┤
//! │          SharingProvider<ReconnectionRequired, Context>     │
//! │   Single flight │ Last reset wins │ Background refresh      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  NodeSelector (chosen once)                 │
//! │      SingleNodeSelector │ GossipSelector + GossipClient     │
//! ├─────────────────────────────────────────────────────────────┤
//! │        ChannelCache          │     CapabilityNegotiator     │
//! │   one lazy Channel/endpoint  │  unimplemented ⇒ empty set   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callers invoke [`connect`](ClusterConnector::connect) per operation and
//! [`force_reconnect`](ClusterConnector::force_reconnect) when a server answers
//! "not leader", passing the redirect target if it named one.

use std::{fmt, sync::Arc, time::Instant};

use futures::{FutureExt, future::BoxFuture};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info};

use crate::{
    capabilities::{CapabilityNegotiator, ServerCapabilities, negotiate_capabilities},
    config::{ClientConfig, ConnectionMode},
    connection::{ChannelCache, ChannelHandle},
    discovery::{GossipClient, GossipSelector},
    endpoint::Endpoint,
    error::{ConnectError, Result},
    metrics::ConnectMetrics,
    provider::{ProviderState, RefreshHook, SharingProvider},
    reconnect::ReconnectionRequired,
    selector::{NodeSelector, SingleNodeSelector},
};

/// A negotiated connection to one node.
///
/// The capabilities always describe the node behind [`handle`](Self::handle)
/// at the time the context was created. Contexts are immutable; a
/// reconnection produces a new one and callers holding the old one may finish
/// their requests on it.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    handle: ChannelHandle,
    capabilities: ServerCapabilities,
    cause: ReconnectionRequired,
}

impl ConnectionContext {
    /// Returns the channel handle.
    #[must_use]
    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    /// Returns the endpoint this context targets.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        self.handle.endpoint()
    }

    /// Returns the capabilities negotiated with the node.
    #[must_use]
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    /// Returns the channel to issue requests on.
    #[must_use]
    pub fn invoker(&self) -> Channel {
        self.handle.invoker()
    }

    /// Returns the reconnection cause that produced this context.
    #[must_use]
    pub fn cause(&self) -> &ReconnectionRequired {
        &self.cause
    }
}

/// Shared, self-healing connection to a cluster.
///
/// Cloning is cheap; all clones share the same connection, cache, refresh
/// hook, and shutdown state.
#[derive(Clone)]
pub struct ClusterConnector {
    config: ClientConfig,
    cache: Arc<ChannelCache>,
    provider: SharingProvider<ReconnectionRequired, ConnectionContext>,
    /// Cancellation token for coordinated shutdown.
    cancellation: CancellationToken,
}

impl ClusterConnector {
    /// Creates a connector.
    ///
    /// The node selector is chosen from the configured mode:
    /// [`ConnectionMode::SingleNode`] pins the only endpoint, while
    /// [`ConnectionMode::Cluster`] discovers through `gossip`. Nothing is
    /// dialed until the first [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        config: ClientConfig,
        gossip: Arc<dyn GossipClient>,
        negotiator: Arc<dyn CapabilityNegotiator>,
    ) -> Self {
        let cache = Arc::new(ChannelCache::new(&config));
        let selector: Arc<dyn NodeSelector> = match (config.mode(), config.endpoints()) {
            (ConnectionMode::SingleNode, [endpoint]) => {
                Arc::new(SingleNodeSelector::new(endpoint.clone(), Arc::clone(&cache)))
            },
            _ => Arc::new(GossipSelector::new(&config, Arc::clone(&cache), gossip)),
        };
        debug!(mode = ?config.mode(), seeds = config.endpoints().len(), "Creating cluster connector");

        let provider = build_provider(selector, negotiator, Arc::clone(config.metrics()));

        Self { config, cache, provider, cancellation: CancellationToken::new() }
    }

    /// Registers a callback invoked with every freshly established context.
    ///
    /// The hook belongs to the shared connection, so it replaces any hook
    /// previously registered through this connector or any of its clones. It
    /// runs on the establishing task before waiting callers are released and
    /// should return quickly. A panicking hook is logged and otherwise ignored.
    #[must_use]
    pub fn with_refresh_hook<F>(self, hook: F) -> Self
    where
        F: Fn(&ConnectionContext) + Send + Sync + 'static,
    {
        let hook: RefreshHook<ConnectionContext> = Arc::new(hook);
        self.provider.set_refresh_hook(Some(hook));
        self
    }

    /// Returns the current connection context, establishing it if needed.
    ///
    /// The first call also starts the periodic topology refresh.
    ///
    /// # Errors
    ///
    /// Returns the selection or negotiation error of the establishing
    /// attempt, or [`ConnectError::Shutdown`] after [`dispose`](Self::dispose).
    pub async fn connect(&self) -> Result<Arc<ConnectionContext>> {
        self.check_shutdown(None)?;
        self.provider.start_background_refresh(self.config.refresh_interval());
        self.provider.current().await
    }

    /// Like [`connect`](Self::connect), but stops waiting when `token` fires.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Cancelled`] if `token` fires first.
    pub async fn connect_with_token(
        &self,
        token: CancellationToken,
    ) -> Result<Arc<ConnectionContext>> {
        self.check_shutdown(Some(&token))?;
        self.provider.start_background_refresh(self.config.refresh_interval());
        self.provider.current_cancellable(&token).await
    }

    /// Discards the current context and waits for a new one.
    ///
    /// With `leader`, the new context targets that endpoint directly without
    /// gossip. Without it, the cluster is rediscovered.
    ///
    /// # Errors
    ///
    /// Returns the error of the re-establishing attempt, or
    /// [`ConnectError::Shutdown`] after [`dispose`](Self::dispose).
    pub async fn force_reconnect(&self, leader: Option<Endpoint>) -> Result<Arc<ConnectionContext>> {
        self.check_shutdown(None)?;
        let cause = match leader {
            Some(endpoint) => ReconnectionRequired::new_leader(endpoint),
            None => ReconnectionRequired::Rediscover,
        };

        info!(cause = %cause, "Forcing reconnection");
        self.config.metrics().record_reconnect(cause.label());
        self.provider.reset_and_wait(cause).await
    }

    /// Shuts the connector down.
    ///
    /// Disposes the provider first, cancelling any establishing attempt and
    /// the refresh task, then closes every cached channel. Returns `true` for
    /// exactly one call across all clones, even when several race.
    pub fn dispose(&self) -> bool {
        if !self.provider.dispose() {
            return false;
        }
        self.cancellation.cancel();
        self.cache.close();
        info!("Cluster connector disposed");
        true
    }

    /// Returns `true` once [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Returns the connector's cancellation token.
    ///
    /// Child tokens passed to [`connect_with_token`](Self::connect_with_token)
    /// cancel only that wait.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the lifecycle state of the shared context.
    #[must_use]
    pub fn state(&self) -> ProviderState {
        self.provider.state()
    }

    /// Returns how many times a context has been established or attempted.
    #[must_use]
    pub fn connection_attempts(&self) -> u64 {
        self.provider.creations()
    }

    /// Returns the number of cached channels.
    #[must_use]
    pub fn cached_channels(&self) -> usize {
        self.cache.len()
    }

    fn check_shutdown(&self, token: Option<&CancellationToken>) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(ConnectError::Shutdown);
        }
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(ConnectError::Cancelled);
        }
        Ok(())
    }
}

fn build_provider(
    selector: Arc<dyn NodeSelector>,
    negotiator: Arc<dyn CapabilityNegotiator>,
    metrics: Arc<dyn ConnectMetrics>,
) -> SharingProvider<ReconnectionRequired, ConnectionContext> {
    let factory = move |cause: ReconnectionRequired| -> BoxFuture<'static, Result<ConnectionContext>> {
        let selector = Arc::clone(&selector);
        let negotiator = Arc::clone(&negotiator);
        let metrics = Arc::clone(&metrics);
        async move {
            let start = Instant::now();
            let result = establish(selector.as_ref(), negotiator.as_ref(), cause).await;
            metrics.record_connect(start.elapsed(), result.is_ok());
            result
        }
        .boxed()
    };

    SharingProvider::new(factory, ReconnectionRequired::None, ReconnectionRequired::Rediscover)
}

async fn establish(
    selector: &dyn NodeSelector,
    negotiator: &dyn CapabilityNegotiator,
    cause: ReconnectionRequired,
) -> Result<ConnectionContext> {
    let handle = selector.select(&cause).await?;
    let capabilities = negotiate_capabilities(negotiator, &handle).await?;

    info!(
        endpoint = %handle.endpoint(),
        cause = %cause,
        version = capabilities.version().unwrap_or("unknown"),
        "Established cluster connection"
    );
    Ok(ConnectionContext { handle, capabilities, cause })
}

impl fmt::Debug for ClusterConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConnector")
            .field("mode", &self.config.mode())
            .field("state", &self.provider.state())
            .field("cache", &self.cache)
            .field("shutdown", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}
