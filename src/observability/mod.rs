//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! pool / transport lifecycle events
//!     → tracing events (logging.rs installs the subscriber)
//!     → metrics counters (metrics.rs, optional Prometheus exporter)
//! ```
//!
//! # Design Decisions
//! - The library only emits; installing subscribers and exporters is the binary's job
//! - Metric updates are no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
