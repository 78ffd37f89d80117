//! Cluster discovery and shared connection management for InferaDB Ledger clients.
//!
//! This crate owns the part of a client that decides *which* node to talk to
//! and keeps one negotiated connection to it shared between every concurrent
//! caller. Request marshaling, authentication, and per-RPC retry live above
//! it; the gossip and capability RPCs are supplied by the embedder through
//! [`GossipClient`] and [`CapabilityNegotiator`].
//!
//! # Features
//!
//! - **Gossip discovery**: seed nodes are asked for the member list and the member matching the
//!   [`NodePreference`] is selected, with bounded retry across discovery rounds
//! - **Single flight**: any number of concurrent callers share one connection attempt
//! - **Leader redirects**: [`ClusterConnector::force_reconnect`] jumps straight to a named leader
//! - **Background refresh**: topology is re-read periodically without blocking callers
//! - **Lazy channels**: one tonic channel per endpoint, dialed on first request
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use inferadb_ledger_connect::{ClientConfig, ClusterConnector, NodePreference};
//!
//! #[tokio::main]
//! async fn main() -> inferadb_ledger_connect::Result<()> {
//!     let config = ClientConfig::builder()
//!         .with_endpoints(["10.0.0.1:2113".parse()?, "10.0.0.2:2113".parse()?])
//!         .with_node_preference(NodePreference::Leader)
//!         .build()?;
//!
//!     let connector = ClusterConnector::new(config, Arc::new(MyGossip), Arc::new(MyNegotiator));
//!
//!     let context = connector.connect().await?;
//!     let channel = context.invoker();
//!
//!     // On a "not leader" answer naming the new leader:
//!     let context = connector.force_reconnect(Some("10.0.0.3:2113".parse()?)).await?;
//!
//!     connector.dispose();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ClusterConnector (Public API)               │
//! │      .connect() │ .force_reconnect() │ .dispose()           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      SharingProvider                        │
//! │   Single flight │ Last reset wins │ Background refresh      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                        NodeSelector                         │
//! │      SingleNodeSelector │ GossipSelector + pick_member      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                        ChannelCache                         │
//! │   One lazy tonic Channel per Endpoint │ Keepalive tuning    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod capabilities;
mod client;
mod config;
mod connection;
mod discovery;
mod endpoint;
mod error;
mod metrics;
pub mod mock;
mod provider;
mod reconnect;
mod selector;

// Public API exports
pub use capabilities::{CapabilityNegotiator, ServerCapabilities, negotiate_capabilities};
pub use client::{ClusterConnector, ConnectionContext};
pub use config::{ClientConfig, ClientConfigBuilder, ConnectionMode, NodePreference};
pub use connection::{ChannelCache, ChannelHandle};
pub use discovery::{ClusterTopology, GossipClient, GossipSelector, MemberInfo, MemberState};
pub use endpoint::Endpoint;
pub use error::{ConnectError, Result};
pub use metrics::{ChannelEvent, ConnectMetrics, MetricsConnectMetrics, NoopConnectMetrics};
pub use provider::{ProviderState, RefreshHook, ResourceFactory, SharingProvider};
pub use reconnect::ReconnectionRequired;
pub use selector::{NodeSelector, SingleNodeSelector, pick_member};
