//! Scripted in-memory transport for unit tests.
//!
//! Connects resolve immediately; tests drive inbound events by hand.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::TransportError;
use crate::pool::{ConnectionId, RouteKey};
use crate::transport::{
    Channel, ConnectFuture, InboundHandler, OutgoingRequest, ResponseHead, Transport,
};

pub(crate) struct MockChannel {
    open: AtomicBool,
    written: Mutex<Vec<OutgoingRequest>>,
    handler: Option<Arc<dyn InboundHandler>>,
}

impl MockChannel {
    /// An open channel with nobody listening for its events.
    pub(crate) fn detached() -> Arc<Self> {
        Self::with_handler(None)
    }

    fn with_handler(handler: Option<Arc<dyn InboundHandler>>) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            written: Mutex::new(Vec::new()),
            handler,
        })
    }

    pub(crate) fn written_paths(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.uri().to_string())
            .collect()
    }

    fn shut(&self, cause: Option<TransportError>) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(handler) = &self.handler {
                handler.on_closed(cause);
            }
        }
    }
}

impl Channel for MockChannel {
    fn write(&self, request: OutgoingRequest) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.written.lock().unwrap().push(request);
        Ok(())
    }

    fn close(&self) {
        self.shut(None);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// One connection the mock handed out.
#[derive(Clone)]
pub(crate) struct MockConnection {
    pub(crate) id: ConnectionId,
    pub(crate) route: RouteKey,
    pub(crate) handler: Arc<dyn InboundHandler>,
    pub(crate) channel: Arc<MockChannel>,
}

impl MockConnection {
    /// Deliver a full response: head, one body chunk, completion.
    pub(crate) fn respond(&self, status: u16, headers: &[(&'static str, &'static str)], body: &'static str) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
        self.handler.on_head(ResponseHead {
            status: StatusCode::from_u16(status).unwrap(),
            version: Version::HTTP_11,
            headers: map,
        });
        if !body.is_empty() {
            self.handler.on_body(Bytes::from_static(body.as_bytes()));
        }
        self.handler.on_complete();
    }

    /// The peer went away.
    pub(crate) fn peer_close(&self, cause: TransportError) {
        self.channel.shut(Some(cause));
    }

    pub(crate) fn idle_timeout(&self) {
        self.handler.on_idle_timeout();
    }
}

#[derive(Default)]
struct MockState {
    attempts: usize,
    refuse_sync: usize,
    fail_async: VecDeque<TransportError>,
    connections: Vec<MockConnection>,
    shut_down: bool,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `connect` call fail synchronously.
    pub(crate) fn refuse_next_connect(&self) {
        self.state.lock().unwrap().refuse_sync += 1;
    }

    /// Make the next `connect` call fail once its future is polled.
    pub(crate) fn fail_next_connect(&self, cause: TransportError) {
        self.state.lock().unwrap().fail_async.push_back(cause);
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    pub(crate) fn connections(&self) -> Vec<MockConnection> {
        self.state.lock().unwrap().connections.clone()
    }

    pub(crate) fn connection(&self, index: usize) -> MockConnection {
        self.state.lock().unwrap().connections[index].clone()
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        id: ConnectionId,
        route: &RouteKey,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<ConnectFuture, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;

        if state.shut_down {
            return Err(TransportError::Shutdown);
        }
        if state.refuse_sync > 0 {
            state.refuse_sync -= 1;
            return Err(TransportError::Connect {
                route: route.to_string(),
                reason: "refused by script".into(),
            });
        }
        if let Some(cause) = state.fail_async.pop_front() {
            return Ok(Box::pin(async move { Err(cause) }));
        }

        let channel = MockChannel::with_handler(Some(handler.clone()));
        state.connections.push(MockConnection {
            id,
            route: route.clone(),
            handler,
            channel: channel.clone(),
        });
        Ok(Box::pin(async move { Ok(channel as Arc<dyn Channel>) }))
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        let channels: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.shut_down = true;
            state.connections.iter().map(|c| c.channel.clone()).collect()
        };
        for channel in channels {
            channel.close();
        }
        Box::pin(async {})
    }
}
