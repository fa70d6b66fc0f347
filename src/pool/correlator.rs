//! Binds a connection's inbound events to the request it carries.
//!
//! # Responsibilities
//! - Feed head and body events into the bound `RequestFuture`
//! - Complete the future and hand the connection back to the pool
//! - Turn idle timeouts, peer closes and connect failures into removal

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::TransportError;
use crate::pool::manager::{ConnectionPool, PoolInner};
use crate::pool::PooledConnection;
use crate::transport::{Channel, InboundHandler, OutgoingRequest, ResponseHead};

/// Inbound event handler for exactly one connection.
pub struct ResponseCorrelator {
    pool: Weak<PoolInner>,
    connection: Arc<PooledConnection>,
    close_requested: AtomicBool,
    idle_closed: AtomicBool,
}

impl ResponseCorrelator {
    pub(crate) fn new(pool: Weak<PoolInner>, connection: Arc<PooledConnection>) -> Self {
        Self {
            pool,
            connection,
            close_requested: AtomicBool::new(false),
            idle_closed: AtomicBool::new(false),
        }
    }

    fn pool(&self) -> Option<ConnectionPool> {
        self.pool.upgrade().map(ConnectionPool::from_inner)
    }

    /// The asynchronous connect succeeded: attach the channel and write.
    pub(crate) fn connected(&self, channel: Arc<dyn Channel>, request: OutgoingRequest) {
        let conn = &self.connection;
        conn.attach(channel.clone());

        let Some(pool) = self.pool().filter(|pool| !pool.is_closed()) else {
            tracing::debug!(connection_id = %conn.id(), route = %conn.route(), "Pool closed while connecting");
            channel.close();
            self.finish_removal(Some(TransportError::Shutdown));
            return;
        };

        tracing::debug!(
            connection_id = %conn.id(),
            route = %conn.route(),
            force_connected = conn.is_force_connected(),
            "Connection established"
        );
        crate::observability::metrics::record_connection_opened(conn.route(), conn.is_force_connected());
        pool.write_bound(conn, request);
    }

    /// The asynchronous connect failed.
    pub(crate) fn connect_failed(&self, cause: TransportError) {
        tracing::warn!(
            connection_id = %self.connection.id(),
            route = %self.connection.route(),
            error = %cause,
            "Connect failed"
        );
        self.finish_removal(Some(cause));
    }

    fn finish_removal(&self, cause: Option<TransportError>) {
        match self.pool() {
            Some(pool) => pool.remove_connection(&self.connection, cause),
            None => {
                if let Some(future) = self.connection.unbind() {
                    let _ = future.cancel(cause.unwrap_or(TransportError::Aborted));
                }
                self.connection.mark_removed();
                self.connection.release_permit();
            }
        }
    }
}

impl InboundHandler for ResponseCorrelator {
    fn on_head(&self, head: ResponseHead) {
        self.close_requested.store(head.requests_close(), Ordering::SeqCst);
        match self.connection.bound_future() {
            Some(future) => future.begin_response(head),
            None => tracing::warn!(
                connection_id = %self.connection.id(),
                status = %head.status,
                "Response head with no bound request"
            ),
        }
    }

    fn on_body(&self, chunk: Bytes) {
        let accepted = self
            .connection
            .bound_future()
            .is_some_and(|future| future.push_chunk(chunk));
        if !accepted {
            tracing::trace!(connection_id = %self.connection.id(), "Dropping body chunk");
        }
    }

    fn on_complete(&self) {
        let conn = &self.connection;
        let Some(future) = conn.bound_future() else {
            tracing::warn!(connection_id = %conn.id(), "Response completed with no bound request");
            return;
        };
        if future.mark_done().is_err() {
            tracing::debug!(connection_id = %conn.id(), "Request already completed");
            return;
        }

        if self.close_requested.load(Ordering::SeqCst) {
            tracing::debug!(connection_id = %conn.id(), route = %conn.route(), "Peer requested close");
            return;
        }
        match self.pool() {
            Some(pool) => pool.return_connection(conn),
            None => conn.close(),
        }
    }

    fn on_idle_timeout(&self) {
        tracing::debug!(
            connection_id = %self.connection.id(),
            route = %self.connection.route(),
            "Idle timeout, closing connection"
        );
        self.idle_closed.store(true, Ordering::SeqCst);
        self.connection.close();
    }

    fn on_closed(&self, cause: Option<TransportError>) {
        let cause = cause.or_else(|| {
            if self.idle_closed.load(Ordering::SeqCst) {
                Some(TransportError::IdleTimeout)
            } else if self.pool().is_some_and(|pool| pool.is_closed()) {
                Some(TransportError::Shutdown)
            } else {
                None
            }
        });
        tracing::debug!(
            connection_id = %self.connection.id(),
            route = %self.connection.route(),
            cause = ?cause,
            "Connection closed"
        );
        self.finish_removal(cause);
    }
}
