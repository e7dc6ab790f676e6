//! Terminal pipeline stage: dispatch the request to the mount point's upstream.
//!
//! # Responsibilities
//! - Enforce the mount point's host restriction
//! - Build the outbound URL (strip mount prefix, rewrite, join with the upstream base)
//! - Skip the upstream when the cache already answered
//! - Stream request and response bodies, translating failures into 400/502/504
//!
//! # Data Flow
//! ```text
//! /mnt/get/42 ──strip──▶ /get/42 ──rewrite──▶ /get?id=42 ──join──▶ https://upstream/base/get?id=42
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request};
use axum::response::Response;
use futures_util::FutureExt;
use thiserror::Error;
use tower::Service;
use url::Url;

use crate::config::{MountPoint, UpstreamConfig};
use crate::context::{CacheStatus, ChainContext};
use crate::http::middleware::{Handler, HandlerFuture};
use crate::http::request::{client_addr, is_tls};
use crate::http::response;
use crate::proxy::rewrite::RewriteRule;
use crate::routing::{request_host, HostMatcher};

/// Headers scoped to a single connection, never forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("invalid upstream url {url:?}: {source}")]
    InvalidUpstream {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid rewrite pattern: {0}")]
    InvalidRewrite(#[from] regex::Error),

    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Build the shared upstream client.
///
/// Redirects are returned to the caller untouched and environment proxies are ignored.
pub fn build_client(conf: &UpstreamConfig) -> Result<reqwest::Client, ForwarderError> {
    if conf.insecure_skip_verify {
        tracing::warn!("Upstream TLS certificates are not verified");
    }
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .danger_accept_invalid_certs(conf.insecure_skip_verify)
        .connect_timeout(conf.connect_timeout)
        .pool_idle_timeout(non_zero(conf.pool_idle_timeout))
        .build()?;
    Ok(client)
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

pub struct Forwarder {
    inner: Arc<ForwarderInner>,
}

struct ForwarderInner {
    conf: Arc<MountPoint>,
    upstream: Url,
    host: Option<HostMatcher>,
    rewrite: Option<RewriteRule>,
    client: reqwest::Client,
    generator_header: HeaderName,
}

impl Forwarder {
    pub fn new(
        conf: Arc<MountPoint>,
        client: reqwest::Client,
        generator_header: HeaderName,
    ) -> Result<Self, ForwarderError> {
        let upstream = Url::parse(&conf.upstream).map_err(|source| ForwarderError::InvalidUpstream {
            url: conf.upstream.clone(),
            source,
        })?;
        let host = Some(HostMatcher::new(conf.middlewares.match_host.as_str()))
            .filter(|m| !m.is_wildcard());
        let rewrite = conf
            .middlewares
            .rewrite
            .as_ref()
            .map(RewriteRule::new)
            .transpose()?;

        Ok(Self {
            inner: Arc::new(ForwarderInner {
                conf,
                upstream,
                host,
                rewrite,
                client,
                generator_header,
            }),
        })
    }

    pub fn into_handler(self) -> Handler {
        Handler::new(ForwarderService { inner: self.inner })
    }
}

#[derive(Clone)]
pub struct ForwarderService {
    inner: Arc<ForwarderInner>,
}

impl Service<Request<Body>> for ForwarderService {
    type Response = Response;
    type Error = Infallible;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        let ctx = ChainContext::ensure(&mut req, &inner.conf);

        Box::pin(async move {
            if let Some(host) = &inner.host {
                if !host.matches(&req) {
                    return Ok(response::not_found());
                }
            }

            let url = inner.outbound_url(req.uri().path(), req.uri().query());
            ctx.set_proxy_uri(url.to_string());

            if ctx.cache_status() == Some(CacheStatus::Hit) {
                tracing::debug!(upstream = %inner.conf.upstream, "Already served from cache, skipping upstream");
                return Ok(Response::new(Body::empty()));
            }

            ctx.start_upstream_request();
            let forwarded = AssertUnwindSafe(inner.forward(req, url, &ctx))
                .catch_unwind()
                .await;
            match forwarded {
                Ok(response) => Ok(response),
                Err(_) => {
                    tracing::warn!(upstream = %inner.conf.upstream, "Request aborted");
                    ctx.mark_upstream_failed();
                    Ok(response::bad_gateway())
                }
            }
        })
    }
}

impl ForwarderInner {
    fn outbound_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut path = strip_mount(&self.conf.path, path);
        let mut query = query.map(str::to_string);

        if let Some(rule) = &self.rewrite {
            let target = match &query {
                Some(q) => format!("{}?{}", path, q),
                None => path.clone(),
            };
            let rewritten = rule.apply(&target);
            match rewritten.split_once('?') {
                Some((p, q)) => {
                    path = p.to_string();
                    query = Some(q.to_string());
                }
                None => {
                    path = rewritten;
                    query = None;
                }
            }
        }

        let mut joined = join_paths(self.upstream.path(), &path);
        if !self.conf.path.ends_with('/') && joined.len() > 1 && joined.ends_with('/') {
            joined.pop();
        }

        let query = match (self.upstream.query().filter(|q| !q.is_empty()), query.as_deref()) {
            (Some(base), Some(q)) if !q.is_empty() => Some(format!("{}&{}", base, q)),
            (Some(base), _) => Some(base.to_string()),
            (None, q) => q.filter(|q| !q.is_empty()).map(str::to_string),
        };

        let mut url = self.upstream.clone();
        url.set_path(&joined);
        url.set_query(query.as_deref());
        url
    }

    fn forward(
        &self,
        req: Request<Body>,
        url: Url,
        ctx: &ChainContext,
    ) -> impl Future<Output = Response> + Send + '_ {
        let ctx = ctx.clone();
        async move {
            let has_body = req.headers().contains_key(header::CONTENT_LENGTH)
                || req.headers().contains_key(header::TRANSFER_ENCODING);
            let headers = self.outbound_headers(&req);
            let method = req.method().clone();

            let mut outbound = self.client.request(method, url).headers(headers);
            // The client timeout also covers reading the response body.
            if let Some(deadline) = ctx.deadline() {
                outbound = outbound.timeout(deadline.saturating_duration_since(Instant::now()));
            }
            if has_body {
                outbound = outbound.body(reqwest::Body::wrap_stream(
                    req.into_body().into_data_stream(),
                ));
            }

            match outbound.send().await {
                Ok(upstream) => self.relay(upstream),
                Err(e) => {
                    ctx.mark_upstream_failed();
                    if ctx.body_limit_exceeded() {
                        tracing::debug!(upstream = %self.conf.upstream, error = %e, "Request body over limit");
                        return response::body_too_large();
                    }
                    if ctx.deadline_elapsed() {
                        tracing::warn!(upstream = %self.conf.upstream, error = %e, "Upstream timed out");
                        return response::gateway_timeout();
                    }
                    tracing::warn!(upstream = %self.conf.upstream, error = %e, "Upstream unavailable");
                    response::bad_gateway()
                }
            }
        }
    }

    fn outbound_headers(&self, req: &Request<Body>) -> HeaderMap {
        let mut headers = req.headers().clone();
        strip_hop_by_hop(&mut headers);

        if let Some(addr) = client_addr(req) {
            append_forwarded_for(&mut headers, addr);
        }
        if let Some(host) = req
            .headers()
            .get(header::HOST)
            .cloned()
            .or_else(|| request_host(req).and_then(|h| HeaderValue::from_str(&h).ok()))
        {
            headers.insert("x-forwarded-host", host);
        }
        let proto = if is_tls(req) { "https" } else { "http" };
        headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));

        if !self.conf.middlewares.preserve_host_header {
            // The client fills Host in from the upstream URL.
            headers.remove(header::HOST);
        }
        headers
    }

    fn relay(&self, upstream: reqwest::Response) -> Response {
        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.insert(
            self.generator_header.clone(),
            HeaderValue::from_static(response::GENERATOR_UPSTREAM),
        );

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

/// Remove the mount prefix, keeping a leading slash. A `/` mount forwards the path as is.
fn strip_mount(mount: &str, path: &str) -> String {
    if mount == "/" {
        return path.to_string();
    }
    let rest = path
        .strip_prefix(mount.trim_end_matches('/'))
        .unwrap_or(path);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let ip = addr.ip().to_string();
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Middlewares, RewriteConfig};
    use crate::http::middleware::call_next;
    use crate::http::middleware::test_support::body_string;
    use axum::extract::ConnectInfo;
    use axum::http::StatusCode;

    fn forwarder(path: &str, upstream: &str, middlewares: Middlewares) -> ForwarderInner {
        let conf = Arc::new(MountPoint::new(path, upstream).with_middlewares(middlewares));
        let forwarder = Forwarder::new(
            conf,
            reqwest::Client::new(),
            HeaderName::from_static("x-generator"),
        )
        .unwrap();
        Arc::try_unwrap(forwarder.inner).ok().unwrap()
    }

    fn rewrite(pattern: &str, target: &str) -> Middlewares {
        Middlewares {
            rewrite: Some(RewriteConfig {
                pattern: pattern.to_string(),
                target: target.to_string(),
            }),
            ..Middlewares::default()
        }
    }

    #[test]
    fn test_strip_and_join() {
        let f = forwarder("/mnt/", "http://up:8080/base/", Middlewares::default());
        assert_eq!(
            f.outbound_url("/mnt/get/1", Some("a=1")).as_str(),
            "http://up:8080/base/get/1?a=1"
        );

        let f = forwarder("/", "http://up", Middlewares::default());
        assert_eq!(f.outbound_url("/x/y", None).as_str(), "http://up/x/y");
    }

    #[test]
    fn test_exact_mount_drops_trailing_slash() {
        let f = forwarder(
            "/api/config/v1/apps",
            "https://api.example.com/config/v1/apps",
            Middlewares::default(),
        );
        assert_eq!(
            f.outbound_url("/api/config/v1/apps", None).as_str(),
            "https://api.example.com/config/v1/apps"
        );
    }

    #[test]
    fn test_rewrite_after_strip() {
        let f = forwarder("/mnt/", "http://up", rewrite("/get/(.+)", "/get?id=$1"));
        assert_eq!(f.outbound_url("/mnt/get/42", None).as_str(), "http://up/get?id=42");

        let f = forwarder("/", "http://up", rewrite(r".*/t\?a=(.+)&b=(.+)", "/t/$1/$2"));
        assert_eq!(f.outbound_url("/pp/t", Some("a=1&b=2")).as_str(), "http://up/t/1/2");
    }

    #[test]
    fn test_upstream_query_is_kept() {
        let f = forwarder("/", "http://up/?key=k", Middlewares::default());
        assert_eq!(f.outbound_url("/a", Some("b=2")).as_str(), "http://up/a?key=k&b=2");
        assert_eq!(f.outbound_url("/a", None).as_str(), "http://up/a?key=k");
    }

    #[test]
    fn test_outbound_headers() {
        let f = forwarder("/", "http://up", Middlewares::default());
        let mut req = Request::builder()
            .uri("/a")
            .header("host", "gw.test")
            .header("connection", "keep-alive, x-secret")
            .header("x-secret", "1")
            .header("x-forwarded-for", "10.0.0.1")
            .header("accept", "text/plain")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 2], 5555))));

        let headers = f.outbound_headers(&req);
        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-secret").is_none());
        assert_eq!(headers["accept"], "text/plain");
        assert_eq!(headers["x-forwarded-for"], "10.0.0.1, 192.168.1.2");
        assert_eq!(headers["x-forwarded-host"], "gw.test");
        assert_eq!(headers["x-forwarded-proto"], "http");

        let f = forwarder(
            "/",
            "http://up",
            Middlewares {
                preserve_host_header: true,
                ..Middlewares::default()
            },
        );
        assert_eq!(f.outbound_headers(&req)["host"], "gw.test");
    }

    #[tokio::test]
    async fn test_host_mismatch_is_not_found() {
        let conf = Arc::new(MountPoint::new("/", "http://127.0.0.1:9").with_middlewares(Middlewares {
            match_host: "a.test".to_string(),
            ..Middlewares::default()
        }));
        let handler = Forwarder::new(conf, reqwest::Client::new(), HeaderName::from_static("x-generator"))
            .unwrap()
            .into_handler();

        let req = Request::builder()
            .uri("/")
            .header("host", "b.test")
            .body(Body::empty())
            .unwrap();
        let response = call_next(handler, req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, response::NOT_FOUND_BODY);
    }

    #[tokio::test]
    async fn test_hit_skips_upstream() {
        // Nothing listens on the discard port; a real call would fail with 502.
        let conf = Arc::new(MountPoint::new("/", "http://127.0.0.1:9"));
        let handler = Forwarder::new(conf.clone(), reqwest::Client::new(), HeaderName::from_static("x-generator"))
            .unwrap()
            .into_handler();

        let mut req = Request::builder().uri("/a").body(Body::empty()).unwrap();
        let ctx = ChainContext::ensure(&mut req, &conf);
        ctx.set_cache_status(CacheStatus::Hit);

        let response = call_next(handler, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!ctx.snapshot().proxy.proxied_request);
        assert_eq!(ctx.snapshot().proxy.uri, "http://127.0.0.1:9/a");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conf = Arc::new(MountPoint::new("/", format!("http://{}", addr)));
        let handler = Forwarder::new(conf.clone(), reqwest::Client::new(), HeaderName::from_static("x-generator"))
            .unwrap()
            .into_handler();

        let mut req = Request::builder().uri("/a").body(Body::empty()).unwrap();
        let ctx = ChainContext::ensure(&mut req, &conf);
        let response = call_next(handler, req).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(ctx.upstream_failed());
        assert!(ctx.snapshot().proxy.proxied_request);
    }

    #[tokio::test]
    async fn test_relays_upstream_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/echo/{id}",
            axum::routing::get(
                |axum::extract::Path(id): axum::extract::Path<String>, headers: HeaderMap| async move {
                    let host = headers
                        .get("host")
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    (StatusCode::ACCEPTED, format!("{} via {}", id, host))
                },
            ),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let conf = Arc::new(MountPoint::new("/mnt/", format!("http://{}", addr)));
        let handler = Forwarder::new(conf, reqwest::Client::new(), HeaderName::from_static("x-generator"))
            .unwrap()
            .into_handler();

        let req = Request::builder()
            .uri("/mnt/echo/7")
            .header("host", "gw.test")
            .body(Body::empty())
            .unwrap();
        let response = call_next(handler, req).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["x-generator"], response::GENERATOR_UPSTREAM);
        assert_eq!(body_string(response).await, format!("7 via {}", addr));
    }
}
