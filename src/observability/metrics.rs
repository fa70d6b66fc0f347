//! Metrics collection and exposition.
//!
//! # Metrics
//! - `routepool_connections_opened_total` (counter): new connections by route, kind (`pooled`/`forced`)
//! - `routepool_connections_reused_total` (counter): idle connections handed out, by route
//! - `routepool_connections_removed_total` (counter): connections removed from the pool, by route
//! - `routepool_pool_exhausted_total` (counter): acquisitions failed with `Exhausted`, by route

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::pool::RouteKey;

/// Start the Prometheus scrape endpoint. Must run inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_opened(route: &RouteKey, forced: bool) {
    let kind = if forced { "forced" } else { "pooled" };
    metrics::counter!(
        "routepool_connections_opened_total",
        "route" => route.to_string(),
        "kind" => kind
    )
    .increment(1);
}

pub fn record_connection_reused(route: &RouteKey) {
    metrics::counter!("routepool_connections_reused_total", "route" => route.to_string()).increment(1);
}

pub fn record_connection_removed(route: &RouteKey) {
    metrics::counter!("routepool_connections_removed_total", "route" => route.to_string()).increment(1);
}

pub fn record_pool_exhausted(route: &RouteKey) {
    metrics::counter!("routepool_pool_exhausted_total", "route" => route.to_string()).increment(1);
}
