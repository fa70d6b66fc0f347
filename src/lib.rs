//! Pooled asynchronous HTTP/1.1 client.
//!
//! Requests are routed by `host:port` onto keep-alive connections managed
//! per route: idle connections are reused first, new ones are opened under
//! a per-route limit, and callers wait a bounded time before the pool
//! either fails or forces a connection past the limit.

pub mod config;
pub mod error;
pub mod http;
pub mod observability;
pub mod pool;
pub mod transport;

pub use config::ClientConfig;
pub use error::{AwaitTimeout, ClientError, ClientResult, PoolError, TransportError};
pub use crate::http::{HttpClient, HttpRequest, RequestFuture, Response};
pub use pool::{ConnectionPool, RouteKey};
