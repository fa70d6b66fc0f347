//! Shared loopback backends for integration tests.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// How the backend answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendOptions {
    /// Send `Connection: close` and drop the connection after each response.
    pub close_after_response: bool,
    /// Delay before each response.
    pub delay: Duration,
}

/// A running keep-alive HTTP/1.1 backend on 127.0.0.1.
///
/// GET answers `"<METHOD> <target>"`; POST echoes the request body. Every
/// response carries `x-seen-host`, `x-seen-content-length` and two
/// `set-cookie` headers.
pub struct Backend {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl Backend {
    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn route(&self) -> String {
        self.addr.to_string()
    }
}

pub async fn start_backend(options: BackendOptions) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let service = service_fn(move |req| respond(req, options));
                let _ = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Backend { addr, accepted }
}

async fn respond(
    req: Request<Incoming>,
    options: BackendOptions,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if !options.delay.is_zero() {
        tokio::time::sleep(options.delay).await;
    }

    let method = req.method().clone();
    let target = req.uri().to_string();
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let seen_host = header("host");
    let seen_length = header("content-length");

    let body = req.into_body().collect().await?.to_bytes();
    let payload = if method == Method::POST {
        body
    } else {
        Bytes::from(format!("{method} {target}"))
    };

    let mut response = Response::builder()
        .status(200)
        .header("x-seen-host", seen_host)
        .header("x-seen-content-length", seen_length)
        .header("set-cookie", "a=1")
        .header("set-cookie", "b=2");
    if options.close_after_response {
        response = response.header("connection", "close");
    }
    Ok(response.body(Full::new(payload)).unwrap())
}

/// An address with nothing listening on it.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
