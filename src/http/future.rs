//! Single-assignment completion handle for one request.
//!
//! # States
//! ```text
//! Pending → Cancelled   (connect failure, peer close, idle timeout)
//! Pending → Done        (last body chunk received)
//! ```
//! Both terminal states are entered at most once; the first of
//! `cancel` / `mark_done` wins and later calls report `AlreadyCompleted`.
//! Waiters are released together through a watch channel.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::watch;

use crate::error::{AlreadyCompleted, AwaitTimeout, TransportError};
use crate::http::response::{PendingResponse, Response};
use crate::pool::ConnectionId;
use crate::transport::ResponseHead;

/// Observable state of a `RequestFuture`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Pending = 0,
    Cancelled = 1,
    Done = 2,
}

impl From<u8> for FutureState {
    fn from(val: u8) -> Self {
        match val {
            1 => FutureState::Cancelled,
            2 => FutureState::Done,
            _ => FutureState::Pending,
        }
    }
}

struct Inner {
    state: AtomicU8,
    pending: Mutex<Option<PendingResponse>>,
    response: OnceLock<Arc<Response>>,
    completed: watch::Sender<bool>,
    connection: Mutex<Option<ConnectionId>>,
}

/// Completion handle returned to the caller of `send_request`.
///
/// Cloning is cheap; all clones observe the same completion.
#[derive(Clone)]
pub struct RequestFuture {
    inner: Arc<Inner>,
}

impl RequestFuture {
    pub(crate) fn new() -> Self {
        let (completed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(FutureState::Pending as u8),
                pending: Mutex::new(None),
                response: OnceLock::new(),
                completed,
                connection: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> FutureState {
        self.inner.state.load(Ordering::Acquire).into()
    }

    pub fn is_done(&self) -> bool {
        self.state() == FutureState::Done
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }

    /// The connection currently carrying this request, if any was bound.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        *self.inner.connection.lock().expect("future connection mutex poisoned")
    }

    pub(crate) fn set_connection(&self, id: ConnectionId) {
        *self.inner.connection.lock().expect("future connection mutex poisoned") = Some(id);
    }

    /// Start a fresh response from its head. Ignored once completed.
    pub(crate) fn begin_response(&self, head: ResponseHead) {
        let mut pending = self.inner.pending.lock().expect("future pending mutex poisoned");
        if self.state() == FutureState::Pending {
            *pending = Some(PendingResponse::from_head(head));
        }
    }

    /// Append a body chunk. Returns false when there is no response in progress.
    pub(crate) fn push_chunk(&self, chunk: Bytes) -> bool {
        let mut pending = self.inner.pending.lock().expect("future pending mutex poisoned");
        match pending.as_mut() {
            Some(response) if self.state() == FutureState::Pending => {
                response.push_chunk(chunk);
                true
            }
            _ => false,
        }
    }

    /// Complete successfully with whatever has been accumulated.
    pub(crate) fn mark_done(&self) -> Result<(), AlreadyCompleted> {
        self.complete(FutureState::Done)?;
        self.inner.completed.send_replace(true);
        Ok(())
    }

    /// Complete as failed with `cause`, discarding any partial response.
    pub(crate) fn cancel(&self, cause: TransportError) -> Result<(), AlreadyCompleted> {
        self.complete(FutureState::Cancelled)?;
        *self.inner.pending.lock().expect("future pending mutex poisoned") =
            Some(PendingResponse::failed(cause));
        self.inner.completed.send_replace(true);
        Ok(())
    }

    fn complete(&self, terminal: FutureState) -> Result<(), AlreadyCompleted> {
        self.inner
            .state
            .compare_exchange(
                FutureState::Pending as u8,
                terminal as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| AlreadyCompleted)
    }

    /// Wait until the request completes.
    pub async fn wait(&self) -> Arc<Response> {
        let mut completed = self.inner.completed.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = completed.wait_for(|done| *done).await;
        self.build()
    }

    /// Wait up to `timeout`. Elapsing leaves the request untouched, so the
    /// wait can be retried.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Arc<Response>, AwaitTimeout> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| AwaitTimeout(timeout))
    }

    /// The response if the request has already completed.
    pub fn try_response(&self) -> Option<Arc<Response>> {
        // The watch flips only after the terminal response is in place.
        let completed = *self.inner.completed.borrow();
        completed.then(|| self.build())
    }

    fn build(&self) -> Arc<Response> {
        self.inner
            .response
            .get_or_init(|| {
                let pending = self
                    .inner
                    .pending
                    .lock()
                    .expect("future pending mutex poisoned")
                    .take()
                    .unwrap_or_else(|| {
                        PendingResponse::failed(TransportError::Protocol(
                            "request completed without a response head".into(),
                        ))
                    });
                Arc::new(pending.build())
            })
            .clone()
    }
}

impl fmt::Debug for RequestFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFuture")
            .field("state", &self.state())
            .field("connection", &self.connection_id())
            .finish()
    }
}
