//! Connection-layer metrics for observability.
//!
//! This module provides a pluggable metrics trait (`ConnectMetrics`) that
//! embedders can implement to collect telemetry from the connector. Two
//! implementations are included:
//!
//! - [`NoopConnectMetrics`]: Zero-overhead default that discards all metrics.
//! - [`MetricsConnectMetrics`]: Integration with the [`metrics`](https://docs.rs/metrics) crate
//!   facade, forwarding to whatever recorder is installed.
//!
//! # Metric Names
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `ledger_connect_connects_total` | Counter | `status` | Connection contexts produced or failed |
//! | `ledger_connect_connect_duration_seconds` | Histogram | | Time to produce a context |
//! | `ledger_connect_discovery_rounds_total` | Counter | `status` | Gossip discovery rounds |
//! | `ledger_connect_reconnects_total` | Counter | `cause` | Resets by reconnection cause |
//! | `ledger_connect_channels_total` | Counter | `endpoint`, `event` | Channel cache lifecycle |

use std::{fmt, time::Duration};

/// Channel cache lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A channel was created for a new endpoint.
    Created,
    /// A channel was released at cache shutdown.
    Closed,
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Trait for connection-layer metrics collection.
///
/// All methods have default no-op implementations, so you only need to
/// override the metrics you care about.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` since a single instance is shared by
/// the connector, its selector, and the background refresh task.
pub trait ConnectMetrics: Send + Sync + fmt::Debug {
    /// Records the outcome of one connection context creation.
    fn record_connect(&self, duration: Duration, success: bool) {
        let _ = (duration, success);
    }

    /// Records the outcome of one gossip discovery round.
    ///
    /// - `attempt`: 1-based round number within the current selection.
    fn record_discovery_round(&self, attempt: u32, success: bool) {
        let _ = (attempt, success);
    }

    /// Records an explicit reconnection, labelled by cause.
    fn record_reconnect(&self, cause: &str) {
        let _ = cause;
    }

    /// Records a channel cache lifecycle event.
    fn record_channel(&self, endpoint: &str, event: ChannelEvent) {
        let _ = (endpoint, event);
    }
}

/// No-op metrics implementation.
#[derive(Debug, Clone, Copy)]
pub struct NoopConnectMetrics;

impl ConnectMetrics for NoopConnectMetrics {}

/// Metrics implementation using the [`metrics`](https://docs.rs/metrics) crate facade.
///
/// All metric names use the `ledger_connect_` prefix.
#[derive(Debug, Clone, Copy)]
pub struct MetricsConnectMetrics;

mod metric_names {
    pub const CONNECTS_TOTAL: &str = "ledger_connect_connects_total";
    pub const CONNECT_DURATION: &str = "ledger_connect_connect_duration_seconds";
    pub const DISCOVERY_ROUNDS_TOTAL: &str = "ledger_connect_discovery_rounds_total";
    pub const RECONNECTS_TOTAL: &str = "ledger_connect_reconnects_total";
    pub const CHANNELS_TOTAL: &str = "ledger_connect_channels_total";
}

fn status_label(success: bool) -> &'static str {
    if success { "success" } else { "error" }
}

impl ConnectMetrics for MetricsConnectMetrics {
    fn record_connect(&self, duration: Duration, success: bool) {
        metrics::counter!(metric_names::CONNECTS_TOTAL, "status" => status_label(success))
            .increment(1);
        metrics::histogram!(metric_names::CONNECT_DURATION).record(duration.as_secs_f64());
    }

    fn record_discovery_round(&self, _attempt: u32, success: bool) {
        metrics::counter!(metric_names::DISCOVERY_ROUNDS_TOTAL, "status" => status_label(success))
            .increment(1);
    }

    fn record_reconnect(&self, cause: &str) {
        metrics::counter!(metric_names::RECONNECTS_TOTAL, "cause" => cause.to_owned()).increment(1);
    }

    fn record_channel(&self, endpoint: &str, event: ChannelEvent) {
        metrics::counter!(
            metric_names::CHANNELS_TOTAL,
            "endpoint" => endpoint.to_owned(),
            "event" => event.to_string(),
        )
        .increment(1);
    }
}
