//! Read-through, write-back response cache stage.
//!
//! # Data Flow
//! ```text
//! method not cacheable      → BYPASS  → downstream
//! Cache-Control: max-age=0  → IGNORED → downstream → store
//! stored                    → HIT     → downstream (forwarder skips upstream) → stored response
//! not stored                → lock key → re-check (HIT) or MISS → downstream → store → unlock
//! ```
//!
//! # Design Decisions
//! - Backend failures and malformed entries read as a miss; the request never fails because of the cache
//! - Only one fill per key is in flight in this process
//! - Responses the gateway generated for failed or timed out upstream calls are not stored

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use thiserror::Error;
use tower::Service;

use crate::cache::key::CacheKeyBuilder;
use crate::cache::locks::KeyedLocks;
use crate::cache::store::{CacheStore, StoreValue};
use crate::config::MountPoint;
use crate::context::{CacheStatus, ChainContext};
use crate::http::middleware::{call_next, Handler, HandlerFuture, Middleware};
use crate::http::response;
use crate::proxy::BufferPool;

const HEADERS_PREFIX: &str = "headers:";
const STATUS_PREFIX: &str = "status:";
const BODY_PREFIX: &str = "body:";

pub(crate) fn headers_key(key: &str) -> String {
    format!("{}{}", HEADERS_PREFIX, key)
}

pub(crate) fn status_key(key: &str) -> String {
    format!("{}{}", STATUS_PREFIX, key)
}

pub(crate) fn body_key(key: &str) -> String {
    format!("{}{}", BODY_PREFIX, key)
}

/// Glob patterns covering the three stored parts of every key matching `pattern`.
pub fn stored_patterns(pattern: &str) -> [String; 3] {
    [headers_key(pattern), status_key(pattern), body_key(pattern)]
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed stored header line {0:?}")]
pub struct MalformedHeaders(String);

/// One `Name: value\r\n` line per header value.
pub fn encode_headers(headers: &HeaderMap) -> Bytes {
    let mut out = Vec::with_capacity(headers.len() * 32);
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    Bytes::from(out)
}

pub fn decode_headers(raw: &[u8]) -> Result<HeaderMap, MalformedHeaders> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| MalformedHeaders(String::from_utf8_lossy(raw).into_owned()))?;
    let mut headers = HeaderMap::new();
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let malformed = || MalformedHeaders(line.to_string());
        let (name, value) = line.split_once(": ").ok_or_else(malformed)?;
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| malformed())?;
        let value = HeaderValue::from_str(value).map_err(|_| malformed())?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn requests_fresh_copy(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|directive| directive.trim().eq_ignore_ascii_case("max-age=0"))
}

struct StoredResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

pub struct Cache {
    conf: Arc<MountPoint>,
    store: Arc<dyn CacheStore>,
    buffers: Arc<BufferPool>,
    generator_header: HeaderName,
}

impl Cache {
    pub fn new(
        conf: Arc<MountPoint>,
        store: Arc<dyn CacheStore>,
        buffers: Arc<BufferPool>,
        generator_header: HeaderName,
    ) -> Self {
        Self {
            conf,
            store,
            buffers,
            generator_header,
        }
    }
}

impl Middleware for Cache {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn init(&self, next: Handler) -> Handler {
        let settings = &self.conf.middlewares.cache;
        if !settings.enabled {
            return next;
        }

        let methods = settings
            .methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).ok())
            .collect();

        Handler::new(CacheService {
            inner: Arc::new(CacheInner {
                conf: self.conf.clone(),
                methods,
                keys: CacheKeyBuilder::new(&settings.key_headers, &settings.key_claims),
                ttl: settings.ttl,
                store: self.store.clone(),
                locks: Arc::new(KeyedLocks::new()),
                buffers: self.buffers.clone(),
                generator_header: self.generator_header.clone(),
            }),
            next,
        })
    }
}

struct CacheInner {
    conf: Arc<MountPoint>,
    methods: HashSet<Method>,
    keys: CacheKeyBuilder,
    ttl: Duration,
    store: Arc<dyn CacheStore>,
    locks: Arc<KeyedLocks>,
    buffers: Arc<BufferPool>,
    generator_header: HeaderName,
}

#[derive(Clone)]
pub struct CacheService {
    inner: Arc<CacheInner>,
    next: Handler,
}

impl Service<Request<Body>> for CacheService {
    type Response = Response;
    type Error = Infallible;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        let next = self.next.clone();
        let ctx = ChainContext::ensure(&mut req, &inner.conf);

        Box::pin(async move {
            if !inner.methods.contains(req.method()) {
                ctx.set_cache_status(CacheStatus::Bypass);
                return Ok(call_next(next, req).await);
            }

            let key = inner.keys.build(&req, ctx.claims().as_ref());
            let method = req.method().clone();

            let _fill = if requests_fresh_copy(req.headers()) {
                ctx.set_cache_status(CacheStatus::Ignored);
                None
            } else {
                if let Some(stored) = inner.lookup(&key).await {
                    return Ok(inner.serve_hit(&ctx, stored, next, req).await);
                }

                let fill = inner.locks.lock(&key).await;
                // Another request may have filled the key while we waited.
                if let Some(stored) = inner.lookup(&key).await {
                    return Ok(inner.serve_hit(&ctx, stored, next, req).await);
                }
                ctx.set_cache_status(CacheStatus::Miss);
                Some(fill)
            };

            let response = call_next(next, req).await;
            Ok(inner.capture(&ctx, &method, &key, response).await)
        })
    }
}

impl CacheInner {
    async fn lookup(&self, key: &str) -> Option<StoredResponse> {
        let status = match self.store.get_int(&status_key(key)).await {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };
        let status = u16::try_from(status)
            .ok()
            .and_then(|s| StatusCode::from_u16(s).ok())?;

        let (headers, body) = match (
            self.store.get(&headers_key(key)).await,
            self.store.get(&body_key(key)).await,
        ) {
            (Ok(Some(headers)), Ok(Some(body))) => (headers, body),
            (Err(e), _) | (_, Err(e)) => {
                tracing::debug!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
            _ => return None,
        };

        match decode_headers(&headers) {
            Ok(headers) => Some(StoredResponse {
                status,
                headers,
                body,
            }),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Discarding malformed cache entry");
                None
            }
        }
    }

    /// Downstream still runs on a hit so later stages see the request; the forwarder
    /// skips the upstream call because the context says HIT.
    async fn serve_hit(
        &self,
        ctx: &ChainContext,
        stored: StoredResponse,
        next: Handler,
        req: Request<Body>,
    ) -> Response {
        ctx.set_cache_status(CacheStatus::Hit);
        let _ = call_next(next, req).await;

        let mut response = Response::new(Body::from(stored.body));
        *response.status_mut() = stored.status;
        *response.headers_mut() = stored.headers;
        response.headers_mut().insert(
            self.generator_header.clone(),
            HeaderValue::from_static(response::GENERATOR_CACHE),
        );
        response
    }

    async fn capture(
        &self,
        ctx: &ChainContext,
        method: &Method,
        key: &str,
        response: Response,
    ) -> Response {
        let (parts, body) = response.into_parts();
        let body = match self.buffers.collect(body).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Upstream body failed while caching");
                ctx.mark_upstream_failed();
                if ctx.deadline_elapsed() {
                    return response::gateway_timeout();
                }
                return response::bad_gateway();
            }
        };

        let storable = !body.is_empty() || *method == Method::OPTIONS || *method == Method::HEAD;
        if storable && !ctx.upstream_failed() && !ctx.deadline_elapsed() {
            self.store_response(key, parts.status, &parts.headers, body.clone())
                .await;
        }

        Response::from_parts(parts, Body::from(body))
    }

    async fn store_response(&self, key: &str, status: StatusCode, headers: &HeaderMap, body: Bytes) {
        let writes = [
            (headers_key(key), StoreValue::Bytes(encode_headers(headers))),
            (status_key(key), StoreValue::Int(i64::from(status.as_u16()))),
            (body_key(key), StoreValue::Bytes(body)),
        ];
        for (stored_key, value) in writes {
            if let Err(e) = self.store.set(&stored_key, value, self.ttl).await {
                tracing::debug!(key = %stored_key, error = %e, "Cache write failed");
                return;
            }
        }
    }
}
