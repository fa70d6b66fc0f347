//! TCP + HTTP/1.1 transport built on tokio and hyper.
//!
//! # Responsibilities
//! - Connect to a route with a bounded connect timeout
//! - Apply socket options and the optional per-connection setup hook
//! - Drive one hyper client connection per channel and translate its
//!   frames into `InboundHandler` events
//! - Close connections that stay idle past the idle timeout
//! - Track live channels so `shutdown` can wait for all of them
//!
//! # Design Decisions
//! - One driver task per connection owns the hyper `SendRequest`; writes are
//!   queued to it over an unbounded channel and run one at a time
//! - The idle timer only runs between exchanges

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::pool::{ConnectionGuard, ConnectionId, ConnectionTracker, RouteKey};
use crate::transport::{
    Channel, ConnectFuture, InboundHandler, OutgoingRequest, ResponseHead, Transport,
};

/// User hook invoked once on every new socket before the HTTP handshake.
pub type SetupHook = Arc<dyn Fn(&TcpStream) -> io::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Settings {
    connect_timeout: Duration,
    idle_timeout: Duration,
    tcp_nodelay: bool,
}

#[derive(Default)]
struct Registry {
    tracker: ConnectionTracker,
    live: DashMap<ConnectionId, Arc<TcpChannel>>,
    shut_down: AtomicBool,
}

/// Default transport: plain TCP, HTTP/1.1.
pub struct TcpTransport {
    settings: Settings,
    setup: Option<SetupHook>,
    registry: Arc<Registry>,
}

impl TcpTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            settings: Settings {
                connect_timeout: config.pool.connect_timeout(),
                idle_timeout: config.pool.idle_timeout(),
                tcp_nodelay: config.transport.tcp_nodelay,
            },
            setup: None,
            registry: Arc::new(Registry::default()),
        }
    }

    /// Install a hook run on every new socket, e.g. to set extra socket options.
    pub fn with_setup_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TcpStream) -> io::Result<()> + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(hook));
        self
    }

    /// Number of connections whose driver is still running.
    pub fn live_connections(&self) -> u64 {
        self.registry.tracker.active_count()
    }
}

impl Transport for TcpTransport {
    fn connect(
        &self,
        id: ConnectionId,
        route: &RouteKey,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<ConnectFuture, TransportError> {
        if self.registry.shut_down.load(Ordering::SeqCst) {
            return Err(TransportError::Shutdown);
        }
        // Connections are driven by runtime tasks; without a runtime there is nothing to connect on.
        tokio::runtime::Handle::try_current().map_err(|e| TransportError::Connect {
            route: route.to_string(),
            reason: e.to_string(),
        })?;

        let route = route.clone();
        let settings = self.settings;
        let setup = self.setup.clone();
        let registry = Arc::clone(&self.registry);

        Ok(Box::pin(async move {
            let stream = open_stream(&route, settings, setup.as_ref()).await?;
            let (sender, connection) = http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
                .await
                .map_err(|e| TransportError::Connect {
                    route: route.to_string(),
                    reason: e.to_string(),
                })?;

            let (requests_tx, requests_rx) = mpsc::unbounded_channel();
            let (close_tx, close_rx) = watch::channel(false);
            let open = Arc::new(AtomicBool::new(true));
            let channel = Arc::new(TcpChannel {
                requests: requests_tx,
                close: close_tx,
                open: Arc::clone(&open),
            });

            let guard = registry.tracker.track(id);
            registry.live.insert(id, Arc::clone(&channel));
            if registry.shut_down.load(Ordering::SeqCst) {
                channel.close();
            }

            tracing::debug!(route = %route, connection_id = %id, "Transport connection established");

            tokio::spawn(drive(Driver {
                id,
                route,
                sender,
                requests: requests_rx,
                close: close_rx,
                handler,
                idle_timeout: settings.idle_timeout,
                open,
                registry,
                _guard: guard,
            }, connection));

            Ok(channel as Arc<dyn Channel>)
        }))
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        self.registry.shut_down.store(true, Ordering::SeqCst);
        for entry in self.registry.live.iter() {
            entry.value().close();
        }
        let tracker = self.registry.tracker.clone();
        Box::pin(async move {
            tracker.wait_for_drain().await;
            tracing::debug!("Transport drained");
        })
    }
}

async fn open_stream(
    route: &RouteKey,
    settings: Settings,
    setup: Option<&SetupHook>,
) -> Result<TcpStream, TransportError> {
    let addr = route.socket_addr_string();
    let stream = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(addr.as_str()))
        .await
        .map_err(|_| TransportError::ConnectTimeout(route.to_string()))?
        .map_err(|e| TransportError::Connect {
            route: route.to_string(),
            reason: e.to_string(),
        })?;

    if settings.tcp_nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(route = %route, error = %e, "Failed to set TCP_NODELAY");
        }
    }

    if let Some(hook) = setup {
        hook(&stream).map_err(|e| TransportError::Connect {
            route: route.to_string(),
            reason: format!("setup hook: {e}"),
        })?;
    }

    Ok(stream)
}

struct TcpChannel {
    requests: mpsc::UnboundedSender<OutgoingRequest>,
    close: watch::Sender<bool>,
    open: Arc<AtomicBool>,
}

impl Channel for TcpChannel {
    fn write(&self, request: OutgoingRequest) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.requests.send(request).map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.close.send_replace(true);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !*self.close.borrow()
    }
}

struct Driver {
    id: ConnectionId,
    route: RouteKey,
    sender: http1::SendRequest<Full<Bytes>>,
    requests: mpsc::UnboundedReceiver<OutgoingRequest>,
    close: watch::Receiver<bool>,
    handler: Arc<dyn InboundHandler>,
    idle_timeout: Duration,
    open: Arc<AtomicBool>,
    registry: Arc<Registry>,
    _guard: ConnectionGuard,
}

async fn drive(
    mut driver: Driver,
    connection: http1::Connection<TokioIo<TcpStream>, Full<Bytes>>,
) {
    let mut connection = tokio::spawn(connection);
    let mut idle_fired = false;

    let cause = loop {
        tokio::select! {
            biased;
            _ = closed(&mut driver.close) => {
                break idle_fired.then_some(TransportError::IdleTimeout);
            }
            result = &mut connection => break connection_end_cause(result),
            next = driver.requests.recv() => match next {
                Some(request) => {
                    let outcome = tokio::select! {
                        biased;
                        _ = closed(&mut driver.close) => Err(None),
                        result = exchange(&mut driver.sender, request, driver.handler.as_ref()) => {
                            result.map_err(Some)
                        }
                    };
                    if let Err(cause) = outcome {
                        break cause;
                    }
                    idle_fired = false;
                }
                None => break None,
            },
            _ = tokio::time::sleep(driver.idle_timeout), if !idle_fired => {
                idle_fired = true;
                tracing::debug!(route = %driver.route, connection_id = %driver.id, "Connection idle timeout");
                driver.handler.on_idle_timeout();
            }
        }
    };

    driver.open.store(false, Ordering::Release);
    connection.abort();
    driver.registry.live.remove(&driver.id);
    tracing::debug!(route = %driver.route, connection_id = %driver.id, cause = ?cause, "Transport connection closed");
    driver.handler.on_closed(cause);
}

/// Resolves once the channel has been asked to close.
async fn closed(close: &mut watch::Receiver<bool>) {
    // The sender lives in the channel; if it is gone the connection is gone too.
    let _ = close.wait_for(|closed| *closed).await;
}

/// Write one request and stream its response into the handler.
async fn exchange(
    sender: &mut http1::SendRequest<Full<Bytes>>,
    request: OutgoingRequest,
    handler: &dyn InboundHandler,
) -> Result<(), TransportError> {
    sender
        .ready()
        .await
        .map_err(|e| TransportError::Write(e.to_string()))?;
    let response = sender
        .send_request(request.map(Full::new))
        .await
        .map_err(|e| TransportError::Write(e.to_string()))?;

    let (parts, mut body) = response.into_parts();
    handler.on_head(ResponseHead {
        status: parts.status,
        version: parts.version,
        headers: parts.headers,
    });

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| TransportError::Io(e.to_string()))?;
        if let Ok(chunk) = frame.into_data() {
            if !chunk.is_empty() {
                handler.on_body(chunk);
            }
        }
    }

    handler.on_complete();
    Ok(())
}

fn connection_end_cause(result: Result<hyper::Result<()>, JoinError>) -> Option<TransportError> {
    match result {
        Ok(Ok(())) => Some(TransportError::Closed),
        Ok(Err(e)) => Some(TransportError::Io(e.to_string())),
        Err(e) => Some(TransportError::Io(e.to_string())),
    }
}
