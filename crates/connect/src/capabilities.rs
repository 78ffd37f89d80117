//! Server capability negotiation.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::debug;

use crate::{connection::ChannelHandle, error::Result};

/// Features advertised by the node behind a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    version: Option<String>,
    features: BTreeSet<String>,
}

impl ServerCapabilities {
    /// Creates a capability set from a server version and feature names.
    pub fn new<I, S>(version: Option<String>, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { version, features: features.into_iter().map(Into::into).collect() }
    }

    /// Returns the server version, if the server reported one.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Returns whether the server advertised `feature`.
    #[must_use]
    pub fn supports(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Iterates advertised features in sorted order.
    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(String::as_str)
    }

    /// Returns true if nothing was advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.version.is_none() && self.features.is_empty()
    }
}

/// Asks a node which features it supports.
///
/// Implementations wrap the handle's invoker with whatever interceptors the
/// embedding client needs (authentication, error translation).
#[async_trait]
pub trait CapabilityNegotiator: Send + Sync {
    /// Queries the node behind `handle`.
    async fn negotiate(&self, handle: &ChannelHandle) -> Result<ServerCapabilities>;
}

/// Runs `negotiator`, mapping an unimplemented RPC to the empty capability set.
///
/// Older servers do not expose capability negotiation at all; that is not an
/// error, they simply support nothing optional.
pub async fn negotiate_capabilities(
    negotiator: &dyn CapabilityNegotiator,
    handle: &ChannelHandle,
) -> Result<ServerCapabilities> {
    match negotiator.negotiate(handle).await {
        Ok(capabilities) => Ok(capabilities),
        Err(err) if err.is_unimplemented() => {
            debug!(endpoint = %handle.endpoint(), "Capability negotiation unimplemented, assuming none");
            Ok(ServerCapabilities::default())
        },
        Err(err) => Err(err),
    }
}
