//! Caller-side request value and its translation into a transport message.
//!
//! # Responsibilities
//! - Parse and validate the target URL (plain `http` only)
//! - Hold caller headers (set semantics, later wins) and an optional body
//! - Derive the `RouteKey` and build the outgoing HTTP/1.1 message

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::pool::RouteKey;
use crate::transport::OutgoingRequest;

/// A request to send through `HttpClient`.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    url: Url,
    route: RouteKey,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpRequest {
    /// Parse `uri` into a request with no headers and an empty body.
    pub fn new(uri: &str) -> ClientResult<Self> {
        let url = Url::parse(uri).map_err(|e| ClientError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_url(url)
    }

    pub fn from_url(url: Url) -> ClientResult<Self> {
        if url.scheme() != "http" {
            return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
        }
        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(addr)) => addr.to_string(),
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            None => {
                return Err(ClientError::InvalidUri {
                    uri: url.to_string(),
                    reason: "missing host".into(),
                })
            }
        };
        let port = url.port_or_known_default().unwrap_or(80);

        Ok(Self {
            route: RouteKey::new(host, port),
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
    }

    /// Set a header, replacing any earlier value for the same name.
    pub fn header(mut self, name: &str, value: &str) -> ClientResult<Self> {
        let invalid = |reason: String| ClientError::InvalidHeader {
            name: name.to_string(),
            reason,
        };
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Set the body. Only POST sends it.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn route(&self) -> &RouteKey {
        &self.route
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Request-line target: path plus query.
    pub fn target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    /// `Host` header value; the port is included only when it is not the default.
    fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or(self.route.host());
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Build the HTTP/1.1 message for `method`.
    ///
    /// `Host` and `Connection: keep-alive` are always set; POST also gets
    /// `Content-Length` from the body.
    pub fn to_message(&self, method: Method) -> ClientResult<OutgoingRequest> {
        let body = if method == Method::POST {
            self.body.clone()
        } else {
            Bytes::new()
        };

        let mut request = http::Request::builder()
            .method(method.clone())
            .uri(self.target())
            .version(Version::HTTP_11)
            .body(body)
            .map_err(|e| ClientError::InvalidUri {
                uri: self.url.to_string(),
                reason: e.to_string(),
            })?;

        let headers = request.headers_mut();
        headers.extend(self.headers.clone());
        let host = HeaderValue::from_str(&self.host_header()).map_err(|e| ClientError::InvalidHeader {
            name: HOST.to_string(),
            reason: e.to_string(),
        })?;
        headers.insert(HOST, host);
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        if method == Method::POST {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        }
        Ok(request)
    }
}
