//! Connection pool: admission and acquisition.
//!
//! # Responsibilities
//! - Own one `RouteState` per destination, created lazily
//! - Run the four-step acquisition for every request
//! - Re-queue cleanly completed connections, remove dead ones
//! - Close every connection and the transport on shutdown

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::PoolConfig;
use crate::error::{PoolError, TransportError};
use crate::http::RequestFuture;
use crate::observability::metrics;
use crate::pool::{PooledConnection, ResponseCorrelator, RouteKey, RouteState};
use crate::transport::{OutgoingRequest, Transport};

pub(crate) struct PoolInner {
    routes: DashMap<RouteKey, Arc<RouteState>>,
    limits: HashMap<RouteKey, usize>,
    default_max: usize,
    connect_timeout: Duration,
    forbid_force_connect: bool,
    transport: Arc<dyn Transport>,
    closed: AtomicBool,
}

/// Per-route pool of keep-alive connections over a `Transport`.
///
/// Cloning is cheap; all clones share the same routes.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool. Routes with a configured limit are set up eagerly.
    pub fn new(config: &PoolConfig, transport: Arc<dyn Transport>) -> Self {
        let mut limits = HashMap::new();
        for (route, max) in &config.max_per_route {
            match route.parse::<RouteKey>() {
                Ok(key) => {
                    limits.insert(key, *max);
                }
                Err(e) => tracing::warn!(route = %route, error = %e, "Ignoring invalid route limit"),
            }
        }

        let routes = DashMap::new();
        for (key, max) in &limits {
            routes.insert(key.clone(), Arc::new(RouteState::new(key.clone(), *max)));
        }

        tracing::debug!(
            configured_routes = limits.len(),
            default_max_per_route = config.default_max_per_route,
            connect_timeout_ms = config.connect_timeout_ms,
            forbid_force_connect = config.forbid_force_connect,
            "Connection pool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                routes,
                limits,
                default_max: config.default_max_per_route,
                connect_timeout: config.connect_timeout(),
                forbid_force_connect: config.forbid_force_connect,
                transport,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Configured connection limit for a route.
    pub fn max_connections(&self, route: &RouteKey) -> usize {
        self.inner.limits.get(route).copied().unwrap_or(self.inner.default_max)
    }

    /// Send `request` to `route` on a pooled, new or forced connection.
    ///
    /// Waits at most `connect_timeout` for an idle connection. Fails with
    /// `PoolError::Exhausted` only when that wait elapses and forced
    /// connections are forbidden. Connect failures surface as the returned
    /// future's cancellation cause.
    pub async fn send_request(
        &self,
        route: &RouteKey,
        request: OutgoingRequest,
    ) -> Result<RequestFuture, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let state = self.route_state(route);
        let future = RequestFuture::new();

        // 1. Reuse without waiting.
        if let Some(conn) = state.poll_idle() {
            tracing::debug!(route = %route, connection_id = %conn.id(), "Reusing idle connection");
            metrics::record_connection_reused(route);
            self.dispatch(&conn, &future, request);
            return Ok(future);
        }

        // 2. New connection under a creation permit.
        let request = match state.try_acquire_permit() {
            Some(permit) => {
                let conn = Arc::new(PooledConnection::new(route.clone(), Some(permit)));
                match self.open(conn, &future, request) {
                    Ok(()) => return Ok(future),
                    Err((conn, cause, request)) => {
                        conn.release_permit();
                        tracing::debug!(route = %route, error = %cause, "Connect refused, permit released");
                        request
                    }
                }
            }
            None => request,
        };

        // 3. Wait for a connection to come back.
        let waited = self.inner.connect_timeout;
        if let Some(conn) = state.poll_idle_timeout(waited).await {
            tracing::debug!(route = %route, connection_id = %conn.id(), "Reusing connection after wait");
            metrics::record_connection_reused(route);
            self.dispatch(&conn, &future, request);
            return Ok(future);
        }
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        if self.inner.forbid_force_connect {
            tracing::warn!(
                route = %route,
                waited_ms = waited.as_millis() as u64,
                max_connections = state.max_connections(),
                "Pool exhausted"
            );
            metrics::record_pool_exhausted(route);
            return Err(PoolError::Exhausted {
                route: route.to_string(),
                waited_ms: waited.as_millis() as u64,
            });
        }

        // 4. Forced connection outside the limit.
        tracing::info!(route = %route, max_connections = state.max_connections(), "Forcing connection past route limit");
        let conn = Arc::new(PooledConnection::new(route.clone(), None));
        if let Err((_, cause, _)) = self.open(conn, &future, request) {
            let _ = future.cancel(cause);
        }
        Ok(future)
    }

    /// Put a cleanly completed connection back into its route's idle queue.
    ///
    /// Force-connected connections are closed instead.
    pub fn return_connection(&self, conn: &Arc<PooledConnection>) {
        conn.unbind();

        if conn.is_force_connected() {
            tracing::debug!(connection_id = %conn.id(), route = %conn.route(), "Closing forced connection");
            conn.close();
            return;
        }
        if !conn.is_open() || self.is_closed() {
            conn.close();
            self.remove_connection(conn, None);
            return;
        }

        let Some(state) = self.existing_route(conn.route()) else {
            tracing::error!(
                connection_id = %conn.id(),
                route = %conn.route(),
                "Returned connection for unknown route"
            );
            conn.close();
            self.remove_connection(conn, None);
            return;
        };

        conn.mark_idle();
        state.offer(conn.clone());
        tracing::trace!(connection_id = %conn.id(), route = %conn.route(), idle = state.idle_len(), "Connection returned");

        // Lost a race with removal or shutdown after the checks above.
        if !conn.is_open() || self.is_closed() {
            state.remove(conn);
            conn.close();
            self.remove_connection(conn, None);
        }
    }

    /// Cancel the connection's bound request and release its pool resources.
    ///
    /// The bound request, if still pending, fails with `cause` (or
    /// `Aborted`). Safe to call repeatedly; the permit is released once.
    pub fn remove_connection(&self, conn: &PooledConnection, cause: Option<TransportError>) {
        if let Some(future) = conn.unbind() {
            let cause = cause.clone().unwrap_or(TransportError::Aborted);
            if future.cancel(cause).is_ok() {
                tracing::debug!(connection_id = %conn.id(), "Cancelled in-flight request");
            }
        }

        if !conn.mark_removed() {
            return;
        }
        if let Some(state) = self.existing_route(conn.route()) {
            state.remove(conn);
        }
        let released = conn.release_permit();
        metrics::record_connection_removed(conn.route());
        tracing::debug!(
            connection_id = %conn.id(),
            route = %conn.route(),
            permit_released = released,
            cause = ?cause,
            "Connection removed"
        );
    }

    /// Close every idle connection, shut the transport down and wait for it.
    ///
    /// Requests still in flight fail with `TransportError::Shutdown`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Connection pool already closed");
        }

        let states: Vec<Arc<RouteState>> = self
            .inner
            .routes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut closed = 0usize;
        for state in states {
            for conn in state.drain() {
                conn.close();
                self.remove_connection(&conn, Some(TransportError::Shutdown));
                closed += 1;
            }
        }

        self.inner.transport.shutdown().await;
        tracing::info!(idle_closed = closed, "Connection pool closed");
    }

    /// Idle connections currently queued for `route`.
    pub fn idle_connections(&self, route: &RouteKey) -> usize {
        self.existing_route(route).map_or(0, |state| state.idle_len())
    }

    /// Creation permits not held by a live connection, if the route is known.
    pub fn available_permits(&self, route: &RouteKey) -> Option<usize> {
        self.existing_route(route).map(|state| state.available_permits())
    }

    /// Bind `future` to an idle connection and write.
    fn dispatch(&self, conn: &Arc<PooledConnection>, future: &RequestFuture, request: OutgoingRequest) {
        conn.bind(future);
        self.write_bound(conn, request);
    }

    /// Write to a connection whose request is already bound. A failed
    /// write removes the connection, cancelling the request.
    pub(crate) fn write_bound(&self, conn: &Arc<PooledConnection>, request: OutgoingRequest) {
        let Some(channel) = conn.channel().cloned() else {
            self.remove_connection(conn, Some(TransportError::Closed));
            return;
        };
        if let Err(e) = channel.write(request) {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Write failed, closing connection");
            channel.close();
            self.remove_connection(conn, Some(e));
        }
    }

    fn open(
        &self,
        conn: Arc<PooledConnection>,
        future: &RequestFuture,
        request: OutgoingRequest,
    ) -> Result<(), (Arc<PooledConnection>, TransportError, OutgoingRequest)> {
        let correlator = Arc::new(ResponseCorrelator::new(Arc::downgrade(&self.inner), conn.clone()));
        let connecting = match self.inner.transport.connect(conn.id(), conn.route(), correlator.clone()) {
            Ok(connecting) => connecting,
            Err(e) => return Err((conn, e, request)),
        };

        conn.bind(future);
        tracing::debug!(
            connection_id = %conn.id(),
            route = %conn.route(),
            force_connected = conn.is_force_connected(),
            "Opening connection"
        );
        tokio::spawn(async move {
            match connecting.await {
                Ok(channel) => correlator.connected(channel, request),
                Err(e) => correlator.connect_failed(e),
            }
        });
        Ok(())
    }

    fn route_state(&self, route: &RouteKey) -> Arc<RouteState> {
        self.inner
            .routes
            .entry(route.clone())
            .or_insert_with(|| Arc::new(RouteState::new(route.clone(), self.max_connections(route))))
            .value()
            .clone()
    }

    fn existing_route(&self, route: &RouteKey) -> Option<Arc<RouteState>> {
        self.inner.routes.get(route).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::FutureState;
    use crate::transport::mock::{MockChannel, MockTransport};
    use crate::transport::{Channel, ResponseHead};
    use bytes::Bytes;
    use http::Request;

    fn config(limits: &[(&str, usize)], forbid: bool, connect_timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            max_per_route: limits.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            connect_timeout_ms,
            forbid_force_connect: forbid,
            ..PoolConfig::default()
        }
    }

    fn request(path: &str) -> OutgoingRequest {
        Request::get(path).body(Bytes::new()).unwrap()
    }

    fn route() -> RouteKey {
        RouteKey::new("backend", 80)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_when_limit_reached_and_force_forbidden() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&config(&[("backend:80", 1)], true, 50), transport.clone());

        let first = pool.send_request(&route(), request("/a")).await.unwrap();
        let start = tokio::time::Instant::now();
        let err = pool.send_request(&route(), request("/b")).await.unwrap_err();

        assert_eq!(
            err,
            PoolError::Exhausted { route: "backend:80".into(), waited_ms: 50 }
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(first.state(), FutureState::Pending);
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_clean_return_is_reused_without_connect() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&PoolConfig::default(), transport.clone());

        let first = pool.send_request(&route(), request("/one")).await.unwrap();
        settle().await;
        let conn = transport.connection(0);
        conn.respond(200, &[], "first");

        let response = first.wait().await;
        assert_eq!(response.text(), "first");
        assert_eq!(pool.idle_connections(&route()), 1);

        let second = pool.send_request(&route(), request("/two")).await.unwrap();
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(pool.idle_connections(&route()), 0);
        assert_eq!(second.connection_id(), first.connection_id());
        assert_eq!(conn.channel.written_paths(), vec!["/one", "/two"]);

        conn.respond(204, &[], "");
        assert_eq!(second.wait().await.status(), Some(http::StatusCode::NO_CONTENT));
    }

    #[tokio::test]
    async fn test_connection_close_is_never_requeued() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&PoolConfig::default(), transport.clone());

        let first = pool.send_request(&route(), request("/")).await.unwrap();
        settle().await;
        let conn = transport.connection(0);
        conn.respond(200, &[("connection", "close")], "bye");

        assert!(first.wait().await.is_success());
        assert_eq!(pool.idle_connections(&route()), 0);

        let second = pool.send_request(&route(), request("/")).await.unwrap();
        settle().await;
        assert_eq!(transport.connect_attempts(), 2);
        assert_ne!(second.connection_id(), first.connection_id());

        // The transport closing it afterwards does not disturb the finished request.
        conn.peer_close(TransportError::Closed);
        assert!(first.wait().await.is_success());
        assert_eq!(pool.available_permits(&route()), Some(PoolConfig::default().default_max_per_route - 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_connection_is_closed_after_response() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&config(&[("backend:80", 0)], false, 50), transport.clone());

        let future = pool.send_request(&route(), request("/")).await.unwrap();
        settle().await;
        assert_eq!(transport.connect_attempts(), 1);

        let conn = transport.connection(0);
        conn.respond(200, &[], "forced");

        let response = future.wait().await;
        assert_eq!(response.text(), "forced");
        assert!(!conn.channel.is_open());
        assert_eq!(pool.idle_connections(&route()), 0);
        assert_eq!(pool.available_permits(&route()), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_connect_failure_releases_permit_before_waiting() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&config(&[("backend:80", 2)], true, 1_000), transport.clone());

        let first = pool.send_request(&route(), request("/first")).await.unwrap();
        settle().await;
        assert_eq!(pool.available_permits(&route()), Some(1));

        transport.refuse_next_connect();
        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.send_request(&route(), request("/second")).await })
        };
        settle().await;
        assert_eq!(transport.connect_attempts(), 2);
        assert_eq!(pool.available_permits(&route()), Some(1));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let conn = transport.connection(0);
        conn.respond(200, &[], "first");
        assert!(first.wait().await.is_success());

        let second = waiting.await.unwrap().unwrap();
        assert_eq!(second.connection_id(), first.connection_id());
        assert_eq!(transport.connections().len(), 1);
        assert_eq!(conn.channel.written_paths(), vec!["/first", "/second"]);
    }

    #[tokio::test]
    async fn test_async_connect_failure_cancels_and_releases_permit() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&config(&[("backend:80", 1)], true, 50), transport.clone());

        let cause = TransportError::Connect { route: "backend:80".into(), reason: "refused".into() };
        transport.fail_next_connect(cause.clone());

        let future = pool.send_request(&route(), request("/")).await.unwrap();
        let response = future.wait().await;
        assert!(future.is_cancelled());
        assert_eq!(response.cause(), Some(&cause));
        assert_eq!(pool.available_permits(&route()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_async_connect_failure_leaves_permits_alone() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&config(&[("backend:80", 0)], false, 50), transport.clone());

        let cause = TransportError::ConnectTimeout("backend:80".into());
        transport.fail_next_connect(cause.clone());

        let future = pool.send_request(&route(), request("/")).await.unwrap();
        let response = future.wait().await;
        assert!(future.is_cancelled());
        assert_eq!(response.cause(), Some(&cause));
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(pool.idle_connections(&route()), 0);
        assert_eq!(pool.available_permits(&route()), Some(0));
    }

    #[tokio::test]
    async fn test_idle_connection_closed_by_peer_is_not_reused() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&config(&[("backend:80", 1)], true, 50), transport.clone());

        let first = pool.send_request(&route(), request("/one")).await.unwrap();
        settle().await;
        let conn = transport.connection(0);
        conn.respond(200, &[], "first");
        assert!(first.wait().await.is_success());
        assert_eq!(pool.idle_connections(&route()), 1);

        conn.peer_close(TransportError::Closed);
        assert_eq!(pool.idle_connections(&route()), 0);
        assert_eq!(pool.available_permits(&route()), Some(1));
        assert!(first.wait().await.is_success());

        let second = pool.send_request(&route(), request("/two")).await.unwrap();
        settle().await;
        assert_eq!(transport.connect_attempts(), 2);
        assert_ne!(second.connection_id(), first.connection_id());
        assert_eq!(conn.channel.written_paths(), vec!["/one"]);
        assert_eq!(transport.connection(1).channel.written_paths(), vec!["/two"]);
    }

    #[tokio::test]
    async fn test_transport_sees_pool_connection_id() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&PoolConfig::default(), transport.clone());

        let first = pool.send_request(&route(), request("/a")).await.unwrap();
        let second = pool.send_request(&RouteKey::new("other", 80), request("/b")).await.unwrap();
        settle().await;

        assert_eq!(Some(transport.connection(0).id), first.connection_id());
        assert_eq!(Some(transport.connection(1).id), second.connection_id());
    }

    #[tokio::test]
    async fn test_idle_timeout_removes_connection() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&config(&[("backend:80", 1)], true, 50), transport.clone());

        let future = pool.send_request(&route(), request("/")).await.unwrap();
        settle().await;
        let conn = transport.connection(0);
        conn.respond(200, &[], "ok");
        future.wait().await;
        assert_eq!(pool.idle_connections(&route()), 1);
        assert_eq!(pool.available_permits(&route()), Some(0));

        conn.idle_timeout();
        assert_eq!(pool.idle_connections(&route()), 0);
        assert_eq!(pool.available_permits(&route()), Some(1));
    }

    #[tokio::test]
    async fn test_peer_close_cancels_in_flight_request() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&PoolConfig::default(), transport.clone());

        let future = pool.send_request(&route(), request("/")).await.unwrap();
        settle().await;
        let conn = transport.connection(0);
        conn.handler.on_head(ResponseHead {
            status: http::StatusCode::OK,
            version: http::Version::HTTP_11,
            headers: http::HeaderMap::new(),
        });
        conn.handler.on_body(Bytes::from_static(b"partial"));
        conn.peer_close(TransportError::Io("connection reset".into()));

        let response = future.wait().await;
        assert!(!response.is_success());
        assert!(response.body().is_empty());
        assert_eq!(response.cause(), Some(&TransportError::Io("connection reset".into())));

        // A second close notification is harmless.
        conn.handler.on_closed(None);
        assert_eq!(
            pool.available_permits(&route()),
            Some(PoolConfig::default().default_max_per_route)
        );
    }

    #[tokio::test]
    async fn test_close_fails_in_flight_and_rejects_new_requests() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&PoolConfig::default(), transport.clone());

        let idle = pool.send_request(&route(), request("/idle")).await.unwrap();
        settle().await;
        transport.connection(0).respond(200, &[], "");
        idle.wait().await;

        let busy = pool.send_request(&RouteKey::new("other", 80), request("/busy")).await.unwrap();
        settle().await;

        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.idle_connections(&route()), 0);
        assert_eq!(busy.wait().await.cause(), Some(&TransportError::Shutdown));
        assert!(transport.connections().iter().all(|c| !c.channel.is_open()));

        let err = pool.send_request(&route(), request("/late")).await.unwrap_err();
        assert_eq!(err, PoolError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_connections_never_exceed_limit() {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(&config(&[("backend:80", 3)], true, 20), transport.clone());

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.send_request(&route(), request(&format!("/{i}"))).await })
            })
            .collect();

        let mut sent = 0;
        let mut exhausted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => sent += 1,
                Err(PoolError::Exhausted { .. }) => exhausted += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        settle().await;

        assert_eq!(sent, 3);
        assert_eq!(exhausted, 7);
        assert_eq!(transport.connections().len(), 3);
        assert_eq!(pool.available_permits(&route()), Some(0));
    }

    #[tokio::test]
    async fn test_unknown_route_return_is_rejected() {
        let pool = ConnectionPool::new(&PoolConfig::default(), MockTransport::new());

        let stray = Arc::new(PooledConnection::new(RouteKey::new("never-used", 1), None));
        stray.attach(MockChannel::detached());
        let stray_pooled = {
            let semaphore = Arc::new(tokio::sync::Semaphore::new(1));
            let permit = semaphore.try_acquire_owned().unwrap();
            let conn = Arc::new(PooledConnection::new(RouteKey::new("never-used", 1), Some(permit)));
            conn.attach(MockChannel::detached());
            conn
        };

        pool.return_connection(&stray);
        pool.return_connection(&stray_pooled);
        assert_eq!(pool.idle_connections(&RouteKey::new("never-used", 1)), 0);
        assert!(!stray.channel().unwrap().is_open());
        assert!(!stray_pooled.is_open());
    }
}
