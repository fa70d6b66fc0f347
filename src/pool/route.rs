//! Per-destination pool state.
//!
//! # Responsibilities
//! - Identify a destination (`RouteKey`)
//! - Hold the FIFO queue of idle connections for that destination
//! - Bound concurrently-open connections with a creation semaphore

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::pool::connection::PooledConnection;

/// A `(host, port)` destination; the unit of pooling and admission control.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    host: String,
    port: u16,
}

impl RouteKey {
    /// Create a route. The host is normalized to lowercase.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address suitable for `TcpStream::connect`.
    pub fn socket_addr_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error parsing a `host:port` route string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteParseError {
    #[error("expected host:port, got '{0}'")]
    MissingPort(String),
    #[error("invalid port in '{0}'")]
    InvalidPort(String),
    #[error("empty host in '{0}'")]
    EmptyHost(String),
}

impl FromStr for RouteKey {
    type Err = RouteParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RouteParseError::MissingPort(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| RouteParseError::InvalidPort(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(RouteParseError::EmptyHost(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

/// Idle queue and creation permits for one route.
///
/// Created lazily on first use and never removed from the pool.
#[derive(Debug)]
pub struct RouteState {
    key: RouteKey,
    max_connections: usize,
    idle: Mutex<VecDeque<Arc<PooledConnection>>>,
    available: Notify,
    permits: Arc<Semaphore>,
}

impl RouteState {
    pub fn new(key: RouteKey, max_connections: usize) -> Self {
        Self {
            key,
            max_connections,
            idle: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            permits: Arc::new(Semaphore::new(max_connections)),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Try to take one creation permit without waiting.
    pub fn try_acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    /// Creation permits not currently held by a live connection.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Pop the first open idle connection, discarding closed ones.
    pub fn poll_idle(&self) -> Option<Arc<PooledConnection>> {
        let mut idle = self.idle.lock().expect("route idle queue mutex poisoned");
        while let Some(conn) = idle.pop_front() {
            if conn.is_open() {
                return Some(conn);
            }
            tracing::debug!(route = %self.key, connection_id = %conn.id(), "Discarding closed idle connection");
        }
        None
    }

    /// Like `poll_idle`, but waits up to `timeout` for a connection to be offered.
    pub async fn poll_idle_timeout(&self, timeout: Duration) -> Option<Arc<PooledConnection>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so an offer between the check and the await is not lost.
            notified.as_mut().enable();

            if let Some(conn) = self.poll_idle() {
                return Some(conn);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.poll_idle();
            }
        }
    }

    /// Append a connection to the idle queue and wake one waiter.
    pub fn offer(&self, conn: Arc<PooledConnection>) {
        self.idle
            .lock()
            .expect("route idle queue mutex poisoned")
            .push_back(conn);
        self.available.notify_one();
    }

    /// Remove a specific connection from the idle queue. Returns true if it was queued.
    pub fn remove(&self, conn: &PooledConnection) -> bool {
        let mut idle = self.idle.lock().expect("route idle queue mutex poisoned");
        let before = idle.len();
        idle.retain(|queued| queued.id() != conn.id());
        idle.len() != before
    }

    /// Take every queued connection, leaving the queue empty.
    pub fn drain(&self) -> Vec<Arc<PooledConnection>> {
        self.idle
            .lock()
            .expect("route idle queue mutex poisoned")
            .drain(..)
            .collect()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().expect("route idle queue mutex poisoned").len()
    }
}
