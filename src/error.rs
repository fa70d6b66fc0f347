//! Error definitions shared across the client.

use thiserror::Error;

/// Errors returned synchronously by `ConnectionPool::send_request`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Every acquisition step failed for the route.
    #[error("no connection available for {route} after waiting {waited_ms} ms")]
    Exhausted { route: String, waited_ms: u64 },

    /// The pool has been closed.
    #[error("connection pool is closed")]
    Closed,
}

/// Connection-level failures.
///
/// These never escape the event loop; they end up as the cancellation
/// cause carried by a `Response`, which is why the type is `Clone`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport could not establish a connection.
    #[error("connect to {route} failed: {reason}")]
    Connect { route: String, reason: String },

    /// Establishing the connection took longer than the connect timeout.
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// Reading from the connection failed.
    #[error("connection I/O error: {0}")]
    Io(String),

    /// Writing the request failed.
    #[error("write failed: {0}")]
    Write(String),

    /// The connection sat idle past the idle timeout and was closed.
    #[error("connection idle timeout")]
    IdleTimeout,

    /// The peer sent something the client cannot correlate.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was torn down without a specific cause.
    #[error("request aborted")]
    Aborted,

    /// The transport no longer accepts connections.
    #[error("transport is shut down")]
    Shutdown,
}

/// The caller-side wait deadline elapsed before the request completed.
///
/// The request itself is unaffected and may still be waited on.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("timed out waiting for response after {0:?}")]
pub struct AwaitTimeout(pub std::time::Duration);

/// A second completion attempt lost the race against the first.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("request already completed")]
pub struct AlreadyCompleted;

/// Errors returned by the `HttpClient` facade.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result type for facade operations.
pub type ClientResult<T> = Result<T, ClientError>;
