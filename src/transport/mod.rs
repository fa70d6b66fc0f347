//! Transport subsystem: the seam between the pool and socket I/O.
//!
//! # Data Flow
//! ```text
//! ConnectionPool
//!     → Transport::connect(id, route, handler)   (sync Err = connect refused now)
//!     → ConnectFuture resolves on a runtime task
//!     → Channel::write(request)
//!
//! Per-connection driver (event loop):
//!     response head   → InboundHandler::on_head
//!     body frames     → InboundHandler::on_body
//!     end of body     → InboundHandler::on_complete
//!     idle too long   → InboundHandler::on_idle_timeout
//!     connection gone → InboundHandler::on_closed (exactly once)
//! ```
//!
//! # Design Decisions
//! - The pool never touches sockets; it reacts to events and issues write/close
//! - One request in flight per connection, no pipelining
//! - Write failures close the channel and surface through `on_closed`

pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::CONNECTION;
use http::{HeaderMap, StatusCode, Version};
use std::sync::Arc;

use crate::error::TransportError;
use crate::pool::{ConnectionId, RouteKey};

pub use tcp::{SetupHook, TcpTransport};

/// An encodable outgoing request.
pub type OutgoingRequest = http::Request<Bytes>;

/// Resolves to the connected channel, or the asynchronous connect failure.
pub type ConnectFuture = BoxFuture<'static, Result<Arc<dyn Channel>, TransportError>>;

/// Status line and headers of an inbound response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// True when the peer asked for the connection to be closed.
    pub fn requests_close(&self) -> bool {
        self.headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("close"))
    }
}

/// Receives the inbound events of one connection, in transport order.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_head(&self, head: ResponseHead);
    fn on_body(&self, chunk: Bytes);
    fn on_complete(&self);
    fn on_idle_timeout(&self);
    /// Delivered once when the connection is gone, for whatever reason.
    fn on_closed(&self, cause: Option<TransportError>);
}

/// A live connection owned by the transport.
pub trait Channel: Send + Sync + 'static {
    /// Queue a request for writing. Fails only if the channel is already gone.
    fn write(&self, request: OutgoingRequest) -> Result<(), TransportError>;
    fn close(&self);
    fn is_open(&self) -> bool;
}

/// Opens connections and tears all of them down on shutdown.
pub trait Transport: Send + Sync + 'static {
    /// Start connecting to `route`. `id` is the pool's connection id and
    /// tags the channel for its whole life.
    fn connect(
        &self,
        id: ConnectionId,
        route: &RouteKey,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<ConnectFuture, TransportError>;

    /// Close every live channel and resolve once they are all torn down.
    fn shutdown(&self) -> BoxFuture<'static, ()>;
}
