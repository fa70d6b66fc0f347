//! Connection correlation record and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Hold the state the pool attaches to a transport connection:
//!   route, force-connect flag, bound request, creation permit
//! - Track connection state (Connecting → Leased ⇄ Idle → Removed)
//! - Count live transport connections so shutdown can wait for them

use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{watch, OwnedSemaphorePermit};

use crate::http::RequestFuture;
use crate::pool::RouteKey;
use crate::transport::Channel;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport connect in progress.
    Connecting = 0,
    /// A request is in flight on the connection.
    Leased = 1,
    /// Parked in the route's idle queue.
    Idle = 2,
    /// Closed and released; never reused.
    Removed = 3,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            1 => ConnectionState::Leased,
            2 => ConnectionState::Idle,
            3 => ConnectionState::Removed,
            _ => ConnectionState::Connecting,
        }
    }
}

/// Pool-side record attached to one transport connection.
///
/// The transport owns the socket; the pool owns this record. A record
/// created without a permit is force-connected: it is never pooled and
/// never touches the route's semaphore.
pub struct PooledConnection {
    id: ConnectionId,
    route: RouteKey,
    force_connected: bool,
    state: AtomicU8,
    bound: ArcSwapOption<RequestFuture>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    channel: OnceLock<Arc<dyn Channel>>,
}

impl PooledConnection {
    /// Create a record for a connection about to be opened.
    ///
    /// `permit` is the route's creation permit; `None` marks the connection
    /// as force-connected.
    pub fn new(route: RouteKey, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            id: ConnectionId::new(),
            route,
            force_connected: permit.is_none(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            bound: ArcSwapOption::empty(),
            permit: Mutex::new(permit),
            channel: OnceLock::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn route(&self) -> &RouteKey {
        &self.route
    }

    pub fn is_force_connected(&self) -> bool {
        self.force_connected
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Attach the transport channel once the connect completes.
    /// Returns false if a channel was already attached.
    pub fn attach(&self, channel: Arc<dyn Channel>) -> bool {
        self.channel.set(channel).is_ok()
    }

    pub fn channel(&self) -> Option<&Arc<dyn Channel>> {
        self.channel.get()
    }

    /// True once connected and until the transport reports the channel gone.
    pub fn is_open(&self) -> bool {
        self.channel.get().is_some_and(|channel| channel.is_open())
            && self.state() != ConnectionState::Removed
    }

    /// Close the underlying channel, if one is attached.
    pub fn close(&self) {
        if let Some(channel) = self.channel.get() {
            channel.close();
        }
    }

    /// Bind the request whose response this connection will carry.
    ///
    /// The store is sequentially consistent and happens before the write
    /// that can trigger a response.
    pub fn bind(&self, future: &RequestFuture) {
        future.set_connection(self.id);
        self.bound.store(Some(Arc::new(future.clone())));
        self.transition(ConnectionState::Leased);
    }

    pub fn bound_future(&self) -> Option<Arc<RequestFuture>> {
        self.bound.load_full()
    }

    pub fn unbind(&self) -> Option<Arc<RequestFuture>> {
        self.bound.swap(None)
    }

    pub fn mark_idle(&self) {
        self.transition(ConnectionState::Idle);
    }

    /// Move to `Removed`. Returns true only for the first call.
    pub fn mark_removed(&self) -> bool {
        self.state.swap(ConnectionState::Removed as u8, Ordering::AcqRel) != ConnectionState::Removed as u8
    }

    /// Drop the creation permit back into the route semaphore.
    /// Returns true if a permit was held.
    pub fn release_permit(&self) -> bool {
        self.permit
            .lock()
            .expect("connection permit mutex poisoned")
            .take()
            .is_some()
    }

    fn transition(&self, next: ConnectionState) {
        let mut current = self.state.load(Ordering::Acquire);
        while current != ConnectionState::Removed as u8 {
            match self.state.compare_exchange_weak(current, next as u8, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("force_connected", &self.force_connected)
            .field("state", &self.state())
            .finish()
    }
}

/// Counts live transport connections so shutdown can wait for them.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }

    /// Record a new live connection. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.active.send_modify(|count| *count += 1);
        ConnectionGuard {
            active: Arc::clone(&self.active),
            id,
        }
    }

    /// Get current live connection count.
    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Wait until every tracked connection has been dropped.
    pub async fn wait_for_drain(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so the wait cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<u64>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|count| *count = count.saturating_sub(1));
        tracing::trace!(connection_id = %self.id, "Connection torn down");
    }
}
