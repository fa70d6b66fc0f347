//! HTTP facade and request completion.
//!
//! # Data Flow
//! ```text
//! HttpClient::get / post
//!     → request.rs (URL → RouteKey, HTTP/1.1 message with Host/Connection)
//!     → ConnectionPool::send_request
//!     → future.rs (RequestFuture, completed by the pool's correlator)
//!     → response.rs (PendingResponse accumulates, Response is immutable)
//! ```

pub mod client;
pub mod future;
pub mod request;
pub mod response;

pub use client::HttpClient;
pub use future::{FutureState, RequestFuture};
pub use request::HttpRequest;
pub use response::{PendingResponse, Response};
