//! `HttpClient`: GET/POST over the connection pool.

use http::Method;
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::http::{HttpRequest, RequestFuture};
use crate::pool::ConnectionPool;
use crate::transport::{TcpTransport, Transport};

/// Pooled HTTP/1.1 client.
///
/// Cloning is cheap; clones share one pool.
#[derive(Clone)]
pub struct HttpClient {
    pool: ConnectionPool,
}

impl HttpClient {
    /// Client over the default TCP transport.
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_transport(config, Arc::new(TcpTransport::new(config)))
    }

    /// Client over a caller-supplied transport.
    pub fn with_transport(config: &ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            pool: ConnectionPool::new(&config.pool, transport),
        }
    }

    pub async fn get(&self, request: &HttpRequest) -> ClientResult<RequestFuture> {
        self.send(Method::GET, request).await
    }

    pub async fn post(&self, request: &HttpRequest) -> ClientResult<RequestFuture> {
        self.send(Method::POST, request).await
    }

    async fn send(&self, method: Method, request: &HttpRequest) -> ClientResult<RequestFuture> {
        let message = request.to_message(method)?;
        tracing::trace!(route = %request.route(), method = %message.method(), target = %message.uri(), "Sending request");
        Ok(self.pool.send_request(request.route(), message).await?)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Close every connection and shut the transport down.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
