//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request};
use axum::response::Response;
use futures_util::{stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crauti::cache::MemoryStore;
use crauti::config::{Middlewares, UpstreamConfig};
use crauti::observability::MetricsRegistry;
use crauti::resilience::RetryPolicy;
use crauti::{Gateway, GatewaySettings, MountPoint, Server, ServerConfig, ServerHandle, Shutdown};

pub const GENERATOR_HEADER: &str = "X-Generator";

/// Start a raw TCP backend that answers every request with `200` and `body`.
pub async fn start_mock_backend(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request_head(&mut socket).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

async fn read_request_head(socket: &mut tokio::net::TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
}

/// A request as seen by a recording backend.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Backend that records every request and answers `200` with the request target as body.
pub async fn start_recording_backend() -> (SocketAddr, Arc<Mutex<Vec<Recorded>>>) {
    start_recording_backend_with_delay(Duration::ZERO).await
}

pub async fn start_recording_backend_with_delay(
    delay: Duration,
) -> (SocketAddr, Arc<Mutex<Vec<Recorded>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();

    let app = axum::Router::new().fallback(move |req: Request<Body>| {
        let recorder = recorder.clone();
        async move {
            let (parts, body) = req.into_parts();
            let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
            let uri = parts.uri.to_string();
            recorder.lock().unwrap().push(Recorded {
                method: parts.method,
                uri: uri.clone(),
                headers: parts.headers,
                body,
            });
            tokio::time::sleep(delay).await;
            Response::builder()
                .header("x-backend", "recording")
                .body(Body::from(uri))
                .unwrap()
        }
    });
    (serve_backend(app).await, seen)
}

/// Serve an arbitrary axum app as an upstream.
pub async fn serve_backend(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Backend that sends the response head with `first`, stalls for `stall`, then sends `rest`.
pub async fn start_stalling_backend(
    first: &'static str,
    stall: Duration,
    rest: &'static str,
) -> SocketAddr {
    let app = axum::Router::new().fallback(move || async move {
        let chunks = stream::iter([(first, Duration::ZERO), (rest, stall)]).then(
            |(chunk, wait)| async move {
                tokio::time::sleep(wait).await;
                Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes()))
            },
        );
        Body::from_stream(chunks)
    });
    serve_backend(app).await
}

/// Poll the rendered metrics until `check` holds or a second has passed.
pub async fn eventually_rendered(metrics: &MetricsRegistry, check: impl Fn(&str) -> bool) -> bool {
    for _ in 0..50 {
        if check(&metrics.render()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn mount(path: &str, upstream: SocketAddr, middlewares: Middlewares) -> MountPoint {
    MountPoint::new(path, format!("http://{}", upstream)).with_middlewares(middlewares)
}

/// A gateway plus its listener task on an ephemeral port.
pub struct TestGateway {
    pub gateway: Gateway,
    pub metrics: Arc<MetricsRegistry>,
    pub handle: ServerHandle,
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
}

impl TestGateway {
    pub async fn start(mount_points: Vec<MountPoint>) -> Self {
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let gateway = Gateway::new(
            GatewaySettings {
                generator_header: GENERATOR_HEADER.to_string(),
                upstream: UpstreamConfig::default(),
            },
            Arc::new(MemoryStore::new()),
            metrics.clone(),
        )
        .unwrap();

        let shutdown = Shutdown::new();
        let server = Server::new(
            ServerConfig {
                http: "127.0.0.1:0".parse().unwrap(),
                https: None,
                bind_retry: RetryPolicy::default(),
                drain_timeout: Duration::from_secs(5),
            },
            gateway.subscribe(),
            shutdown.subscribe(),
        );
        let handle = server.handle();
        tokio::spawn(server.run());

        let generation = gateway.update(mount_points).unwrap();
        let bound = handle.wait_serving(generation.id).await.unwrap();

        Self {
            gateway,
            metrics,
            handle,
            addr: bound.http.unwrap(),
            shutdown,
        }
    }

    /// Apply a new mount-point list and wait until it is being served.
    pub async fn update(&mut self, mount_points: Vec<MountPoint>) {
        let generation = self.gateway.update(mount_points).unwrap();
        let bound = self.handle.wait_serving(generation.id).await.unwrap();
        self.addr = bound.http.unwrap();
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Client that never reuses connections, so listener swaps are observed immediately.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}
