//! Request accounting stage: one log record and one metrics update per request.
//!
//! # Data Flow
//! ```text
//! request ──▶ snapshot request fields ──▶ downstream ──▶ response ──▶ RecordedBody
//!                                             │                           │
//!                                   client gone (future dropped)    end of body: emit(status, bytes)
//!                                             └──▶ emit(499)        body dropped early: emit(499)
//! ```
//!
//! Latency and size cover the whole body transfer, not just the response head.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use tower::Service;

use crate::config::MountPoint;
use crate::context::{ChainContext, RequestContext};
use crate::http::middleware::{call_next, Handler, HandlerFuture, Middleware};
use crate::http::request::{client_addr, request_target};
use crate::observability::metrics::RouteMetrics;
use crate::routing::request_host;

/// Status recorded for requests whose client went away before a response was produced.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

pub struct Collector {
    conf: Arc<MountPoint>,
    metrics: Arc<RouteMetrics>,
}

impl Collector {
    pub fn new(conf: Arc<MountPoint>, metrics: Arc<RouteMetrics>) -> Self {
        Self { conf, metrics }
    }
}

impl Middleware for Collector {
    fn name(&self) -> &'static str {
        "collector"
    }

    fn init(&self, next: Handler) -> Handler {
        Handler::new(CollectorService {
            conf: self.conf.clone(),
            metrics: self.metrics.clone(),
            next,
        })
    }
}

#[derive(Clone)]
pub struct CollectorService {
    conf: Arc<MountPoint>,
    metrics: Arc<RouteMetrics>,
    next: Handler,
}

impl Service<Request<Body>> for CollectorService {
    type Response = Response;
    type Error = Infallible;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let next = self.next.clone();
        let ctx = ChainContext::ensure(&mut req, &self.conf);
        let mut pending = PendingRecord {
            record: Some(RequestRecord::from_request(&req)),
            ctx,
            metrics: self.metrics.clone(),
            start: Instant::now(),
        };

        let bodyless = req.method() == Method::HEAD;
        Box::pin(async move {
            let response = call_next(next, req).await;
            let status = response.status();
            if bodyless || !status_has_body(status) {
                pending.finish(status.as_u16(), Some(0));
                return Ok(response);
            }
            Ok(response.map(|body| {
                Body::new(RecordedBody {
                    inner: body,
                    pending,
                    status: status.as_u16(),
                    written: 0,
                })
            }))
        })
    }
}

/// Request fields captured before the request moves downstream.
struct RequestRecord {
    method: String,
    host: String,
    uri: String,
    request_size: u64,
    user_agent: String,
    remote_ip: String,
    referer: String,
    protocol: String,
}

impl RequestRecord {
    fn from_request(req: &Request<Body>) -> Self {
        let headers = req.headers();
        Self {
            method: req.method().to_string(),
            host: request_host(req).unwrap_or_default(),
            uri: request_target(req).to_string(),
            request_size: content_length(headers).unwrap_or(0),
            user_agent: header_str(headers, header::USER_AGENT),
            remote_ip: client_addr(req)
                .map(|addr| addr.ip().to_string())
                .unwrap_or_default(),
            referer: header_str(headers, header::REFERER),
            protocol: format!("{:?}", req.version()),
        }
    }
}

/// Emits exactly once: on `finish`, or on drop when the request was abandoned.
struct PendingRecord {
    record: Option<RequestRecord>,
    ctx: ChainContext,
    metrics: Arc<RouteMetrics>,
    start: Instant,
}

impl PendingRecord {
    fn finish(&mut self, status: u16, response_size: Option<u64>) {
        if let Some(record) = self.record.take() {
            self.emit(&record, status, response_size, Outcome::Completed);
        }
    }

    /// The response head went out but the body failed part way.
    fn interrupt(&mut self, status: u16, response_size: Option<u64>) {
        if let Some(record) = self.record.take() {
            self.emit(&record, status, response_size, Outcome::Interrupted);
        }
    }

    fn emit(&self, record: &RequestRecord, status: u16, response_size: Option<u64>, outcome: Outcome) {
        let latency = self.start.elapsed();
        let ctx = self.ctx.snapshot();
        let upstream_latency = upstream_latency(&ctx);
        let cache = ctx
            .conf
            .middlewares
            .cache
            .enabled
            .then_some(ctx.cache.status)
            .flatten();

        self.metrics.record_status(status);
        self.metrics.record_latency(latency);
        if let Some(upstream_latency) = upstream_latency {
            self.metrics.record_upstream_latency(upstream_latency);
        }
        if let Some(cache) = cache {
            self.metrics.record_cache(cache);
        }

        let latency_human = format!("{:?}", round_millis(latency));
        let upstream_latency_secs = upstream_latency.map(|d| d.as_secs_f64());
        let cache = cache.map(|c| c.as_str());

        macro_rules! emit_record {
            ($level:ident, $message:literal) => {
                tracing::$level!(
                    method = %record.method,
                    host = %record.host,
                    uri = %record.uri,
                    status,
                    request_size = record.request_size,
                    response_size,
                    user_agent = %record.user_agent,
                    remote_ip = %record.remote_ip,
                    referer = %record.referer,
                    protocol = %record.protocol,
                    latency = latency.as_secs_f64(),
                    latency_human = %latency_human,
                    upstream_latency = upstream_latency_secs,
                    mount_path = %ctx.conf.path,
                    upstream = %ctx.conf.upstream,
                    upstream_url = %ctx.proxy.uri,
                    cache,
                    $message
                )
            };
        }

        match outcome {
            Outcome::Completed => emit_record!(info, "Request completed"),
            Outcome::Interrupted => emit_record!(warn, "Response body interrupted"),
            Outcome::Aborted => emit_record!(warn, "Request aborted by client"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Completed,
    Interrupted,
    Aborted,
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.emit(&record, CLIENT_CLOSED_REQUEST, None, Outcome::Aborted);
        }
    }
}

/// Response body that counts bytes written and emits the record when the body ends.
struct RecordedBody {
    inner: Body,
    pending: PendingRecord,
    status: u16,
    written: u64,
}

impl HttpBody for RecordedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &polled {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.written += data.len() as u64;
                }
                if this.inner.is_end_stream() {
                    this.pending.finish(this.status, Some(this.written));
                }
            }
            Some(Err(_)) => this.pending.interrupt(this.status, Some(this.written)),
            None => this.pending.finish(this.status, Some(this.written)),
        }
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RecordedBody {
    fn drop(&mut self) {
        // Bodies known to be empty may be dropped without being polled.
        if self.inner.is_end_stream() {
            self.pending.finish(self.status, Some(0));
        }
    }
}

/// Statuses whose responses carry no body on the wire.
fn status_has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn upstream_latency(ctx: &RequestContext) -> Option<Duration> {
    if !ctx.proxy.proxied_request {
        return None;
    }
    ctx.proxy.upstream_request_start_time.map(|start| start.elapsed())
}

fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis().try_into().unwrap_or(u64::MAX))
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
