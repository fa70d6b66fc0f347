//! Per-route connection pooling subsystem.
//!
//! # Data Flow
//! ```text
//! ConnectionPool::send_request(route, request)
//!     → 1. idle queue, no wait              (reuse)
//!     → 2. creation permit, async connect   (new pooled connection)
//!     → 3. idle queue, wait connect_timeout (reuse after waiting)
//!     → 4. connect without permit           (force-connected, never pooled)
//!     → RequestFuture bound to the carrying connection
//!
//! Transport events (per connection)
//!     → correlator.rs (ResponseCorrelator)
//!     → RequestFuture completion
//!     → return_connection / remove_connection
//! ```
//!
//! # Design Decisions
//! - One `RouteState` per destination; no lock spans routes
//! - Creation permits are RAII semaphore permits held by the connection record
//! - Removal is idempotent: the permit is taken out of the record exactly once
//! - Only step 3 ever waits, and only there does the forbid/force policy apply

pub mod connection;
pub mod correlator;
pub mod manager;
pub mod route;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker, PooledConnection};
pub use correlator::ResponseCorrelator;
pub use manager::ConnectionPool;
pub use route::{RouteKey, RouteParseError, RouteState};
