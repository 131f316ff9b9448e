//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tenvis_relay_core::{RouterHandle, RouterStats};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "relay_connections_rejected_total";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const SUBSCRIPTIONS_TOTAL: &str = "relay_subscriptions_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "relay_subscriptions_active";
    pub const INSTRUMENTS_ACTIVE: &str = "relay_instruments_active";
    pub const LINKS_ACTIVE: &str = "relay_upstream_links_active";
    pub const LINK_FAILURES: &str = "relay_upstream_link_failures";
    pub const FEED_FRAMES_DROPPED: &str = "relay_feed_frames_dropped";
    pub const FANOUT_DELIVERIES: &str = "relay_fanout_deliveries";
    pub const FANOUT_FAILURES: &str = "relay_fanout_failures";
    pub const LATENCY_SECONDS: &str = "relay_latency_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of sessions since server start"
    );
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Current number of sessions");
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused before upgrade, by reason"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of client frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of client frames processed");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of accepted subscribe requests"
    );
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current (session, instrument) subscriptions"
    );
    metrics::describe_gauge!(
        names::INSTRUMENTS_ACTIVE,
        "Instruments with at least one subscriber"
    );
    metrics::describe_gauge!(names::LINKS_ACTIVE, "Live upstream links");
    metrics::describe_gauge!(
        names::LINK_FAILURES,
        "Upstream links lost unexpectedly since server start"
    );
    metrics::describe_gauge!(
        names::FEED_FRAMES_DROPPED,
        "Upstream frames dropped since server start, by reason"
    );
    metrics::describe_gauge!(
        names::FANOUT_DELIVERIES,
        "Frames queued to sessions since server start"
    );
    metrics::describe_gauge!(
        names::FANOUT_FAILURES,
        "Frames dropped for closed or full session queues since server start"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Client frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused before upgrade.
pub fn record_rejection(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record message latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish a router statistics snapshot.
pub fn publish_router_stats(stats: &RouterStats) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(stats.total_subscriptions as f64);
    gauge!(names::INSTRUMENTS_ACTIVE).set(stats.instruments as f64);
    gauge!(names::LINKS_ACTIVE).set(stats.live_links as f64);
    gauge!(names::LINK_FAILURES).set(stats.link_failures as f64);
    gauge!(names::FANOUT_DELIVERIES).set(stats.deliveries as f64);
    gauge!(names::FANOUT_FAILURES).set(stats.delivery_failures as f64);
    gauge!(names::FEED_FRAMES_DROPPED, "reason" => "malformed").set(stats.malformed_frames as f64);
    gauge!(names::FEED_FRAMES_DROPPED, "reason" => "untagged").set(stats.untagged_frames as f64);
    gauge!(names::FEED_FRAMES_DROPPED, "reason" => "stale").set(stats.stale_messages as f64);
}

/// Periodically publish router statistics until the router stops.
pub fn spawn_stats_reporter(router: RouterHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match router.stats().await {
                Ok(stats) => publish_router_stats(&stats),
                Err(_) => {
                    debug!("Router stopped, stats reporter exiting");
                    break;
                }
            }
        }
    })
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
