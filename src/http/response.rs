//! Response accumulation and the immutable response value.
//!
//! # Responsibilities
//! - Accumulate a response head and its body chunks as they arrive
//! - Carry the success/failure verdict of a request
//! - Convert, once, into an immutable `Response`

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};

use crate::error::TransportError;
use crate::transport::ResponseHead;

/// Mutable accumulator owned by a `RequestFuture` until it completes.
#[derive(Debug)]
pub struct PendingResponse {
    head: Option<ResponseHead>,
    chunks: Vec<Bytes>,
    success: bool,
    cause: Option<TransportError>,
}

impl PendingResponse {
    /// Start a response from its head; tentatively successful.
    pub fn from_head(head: ResponseHead) -> Self {
        Self {
            head: Some(head),
            chunks: Vec::new(),
            success: true,
            cause: None,
        }
    }

    /// A response that failed before (or while) arriving.
    pub fn failed(cause: TransportError) -> Self {
        Self {
            head: None,
            chunks: Vec::new(),
            success: false,
            cause: Some(cause),
        }
    }

    /// Append a body chunk, taking ownership of it.
    pub fn push_chunk(&mut self, chunk: Bytes) {
        self.chunks.push(chunk);
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Consume the accumulator into the immutable response value.
    pub fn build(self) -> Response {
        match (self.success, self.head) {
            (true, Some(head)) => Response {
                status: Some(head.status),
                version: Some(head.version),
                headers: head.headers,
                chunks: self.chunks,
                success: true,
                cause: None,
            },
            (_, _) => Response {
                status: None,
                version: None,
                headers: HeaderMap::new(),
                chunks: Vec::new(),
                success: false,
                cause: Some(self.cause.unwrap_or(TransportError::Aborted)),
            },
        }
    }
}

/// The immutable outcome of a request.
#[derive(Debug, Clone)]
pub struct Response {
    status: Option<StatusCode>,
    version: Option<Version>,
    headers: HeaderMap,
    chunks: Vec<Bytes>,
    success: bool,
    cause: Option<TransportError>,
}

impl Response {
    /// Status code; `None` when the request failed.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Protocol version; `None` when the request failed.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Every header, names may repeat.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// All values for one header name, in arrival order.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect()
    }

    /// Body chunks in the order they arrived.
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// The whole body as one buffer.
    pub fn body(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut body = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
                for chunk in chunks {
                    body.extend_from_slice(chunk);
                }
                body.freeze()
            }
        }
    }

    /// The body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Why the request failed, if it did.
    pub fn cause(&self) -> Option<&TransportError> {
        self.cause.as_ref()
    }
}
