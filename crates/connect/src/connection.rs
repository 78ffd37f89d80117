//! Per-endpoint channel cache.
//!
//! Manages tonic gRPC channels with lazy connection establishment, keyed by
//! [`Endpoint`].
//!
//! # Architecture
//!
//! The [`ChannelCache`] owns at most one [`ChannelHandle`] per endpoint:
//! - **Lazy connection**: channels are built with `connect_lazy`, so no network I/O happens until
//!   the first request is issued
//! - **Stable identity**: equal endpoints always map to the same handle for the cache's lifetime,
//!   which keeps interceptors and HTTP/2 connections reusable
//! - **Single shutdown**: [`close`](ChannelCache::close) drops every channel; later lookups fail
//!   with [`ConnectError::Shutdown`]
//!
//! # Example
//!
//! ```ignore
//! let cache = ChannelCache::new(&config);
//! let handle = cache.get_or_create(&"10.0.0.1:2113".parse()?)?;
//! let channel = handle.invoker();
//! ```

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tonic::transport::Channel;
use tracing::{debug, info};

use crate::{
    config::ClientConfig,
    endpoint::Endpoint,
    error::{ConnectError, InvalidUrlSnafu, Result},
    metrics::{ChannelEvent, ConnectMetrics},
};

/// HTTP/2 keep-alive interval for idle connections.
const HTTP2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// HTTP/2 keep-alive timeout.
const HTTP2_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP keepalive interval.
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

struct HandleInner {
    endpoint: Endpoint,
    channel: Channel,
}

/// Shared reference to the channel for one endpoint.
///
/// Cloning is cheap; all clones refer to the same underlying channel. Use
/// [`ptr_eq`](Self::ptr_eq) to compare identity.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<HandleInner>,
}

impl ChannelHandle {
    /// Returns the endpoint this handle is bound to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Returns a request invoker for this endpoint.
    ///
    /// The returned channel shares the HTTP/2 connection of the handle and
    /// can be wrapped in generated service clients or interceptors.
    #[must_use]
    pub fn invoker(&self) -> Channel {
        self.inner.channel.clone()
    }

    /// Returns true if both handles are the same cached instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle").field("endpoint", &self.inner.endpoint).finish()
    }
}

/// Cache of lazily created channels, one per endpoint.
///
/// Safe to share between the node selector and the background refresh task.
pub struct ChannelCache {
    channels: DashMap<Endpoint, ChannelHandle>,
    closed: AtomicBool,
    connect_timeout: Duration,
    timeout: Duration,
    metrics: Arc<dyn ConnectMetrics>,
}

impl ChannelCache {
    /// Creates an empty cache using the channel settings from `config`.
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            channels: DashMap::new(),
            closed: AtomicBool::new(false),
            connect_timeout: config.connect_timeout(),
            timeout: config.timeout(),
            metrics: Arc::clone(config.metrics()),
        }
    }

    /// Returns the handle for `endpoint`, creating it on first use.
    ///
    /// No network handshake is performed; the channel connects when the first
    /// request is sent through it.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Shutdown`] after [`close`](Self::close), or
    /// [`ConnectError::InvalidUrl`] if the endpoint cannot form a transport URI.
    pub fn get_or_create(&self, endpoint: &Endpoint) -> Result<ChannelHandle> {
        if self.is_closed() {
            return Err(ConnectError::Shutdown);
        }

        // Fast path: existing handle, shared read lock on one shard only
        if let Some(handle) = self.channels.get(endpoint) {
            return Ok(handle.clone());
        }

        match self.channels.entry(endpoint.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                // Re-check under the shard lock so close() cannot race a late insert.
                if self.is_closed() {
                    return Err(ConnectError::Shutdown);
                }
                let handle = self.create_handle(endpoint)?;
                entry.insert(handle.clone());
                debug!(endpoint = %endpoint, "Created channel");
                self.metrics.record_channel(&endpoint.to_string(), ChannelEvent::Created);
                Ok(handle)
            },
        }
    }

    fn create_handle(&self, endpoint: &Endpoint) -> Result<ChannelHandle> {
        let url = endpoint.url();
        let transport = tonic::transport::Endpoint::from_shared(url.clone()).map_err(|e| {
            InvalidUrlSnafu { url: url.clone(), message: e.to_string() }.build()
        })?;

        let channel = self.configure_endpoint(transport).connect_lazy();

        Ok(ChannelHandle {
            inner: Arc::new(HandleInner { endpoint: endpoint.clone(), channel }),
        })
    }

    /// Applies configuration settings to a transport endpoint.
    fn configure_endpoint(
        &self,
        endpoint: tonic::transport::Endpoint,
    ) -> tonic::transport::Endpoint {
        endpoint
            .connect_timeout(self.connect_timeout)
            .timeout(self.timeout)
            .tcp_nodelay(true)
            .tcp_keepalive(Some(TCP_KEEPALIVE_INTERVAL))
            .http2_keep_alive_interval(HTTP2_KEEPALIVE_INTERVAL)
            .keep_alive_timeout(HTTP2_KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true)
    }

    /// Releases every channel.
    ///
    /// Returns `true` on the first call and `false` afterwards.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let endpoints: Vec<Endpoint> = self.channels.iter().map(|e| e.key().clone()).collect();
        for endpoint in endpoints {
            if self.channels.remove(&endpoint).is_some() {
                self.metrics.record_channel(&endpoint.to_string(), ChannelEvent::Closed);
            }
        }

        info!("Channel cache closed");
        true
    }

    /// Returns whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns whether a channel exists for `endpoint`.
    #[must_use]
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.channels.contains_key(endpoint)
    }

    /// Returns the number of cached channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if no channel has been created (or all were closed).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl fmt::Debug for ChannelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCache")
            .field("channels", &self.channels.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
