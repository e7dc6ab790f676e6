//! Request body size limit.
//!
//! A declared `Content-Length` above the limit is rejected up front with 400.
//! Everything else streams through [`LimitedBody`], which fails the body once
//! more bytes than allowed have actually been read.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use axum::body::Body;
use axum::http::{header, Request};
use axum::response::Response;
use axum::BoxError;
use bytes::Bytes;
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use thiserror::Error;
use tower::Service;

use crate::config::size::{parse_size, SizeError};
use crate::config::MountPoint;
use crate::context::ChainContext;
use crate::http::middleware::{call_next, Handler, HandlerFuture, Middleware};
use crate::http::response;

#[derive(Debug, Error)]
#[error("request too large: body exceeds {limit} bytes")]
pub struct BodyLimitExceeded {
    pub limit: u64,
}

pub struct BodyLimit {
    conf: Arc<MountPoint>,
    limit: u64,
}

impl BodyLimit {
    pub fn new(conf: Arc<MountPoint>) -> Result<Self, SizeError> {
        let limit = parse_size(&conf.middlewares.max_request_body_size)?;
        Ok(Self { conf, limit })
    }
}

impl Middleware for BodyLimit {
    fn name(&self) -> &'static str {
        "body-limit"
    }

    fn init(&self, next: Handler) -> Handler {
        if self.limit == 0 {
            return next;
        }
        Handler::new(BodyLimitService {
            conf: self.conf.clone(),
            limit: self.limit,
            next,
        })
    }
}

#[derive(Clone)]
pub struct BodyLimitService {
    conf: Arc<MountPoint>,
    limit: u64,
    next: Handler,
}

impl Service<Request<Body>> for BodyLimitService {
    type Response = Response;
    type Error = Infallible;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let limit = self.limit;
        let declared = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        if matches!(declared, Some(len) if len > limit) {
            tracing::debug!(limit, declared = ?declared, "Rejecting oversized request body");
            return Box::pin(async { Ok(response::body_too_large()) });
        }

        let ctx = ChainContext::ensure(&mut req, &self.conf);
        let req = req.map(|body| Body::new(LimitedBody::new(body, limit, ctx)));
        let next = self.next.clone();
        Box::pin(async move { Ok(call_next(next, req).await) })
    }
}

/// Body wrapper failing once more than `limit` bytes have been read.
pub struct LimitedBody {
    inner: Body,
    read: u64,
    limit: u64,
    ctx: ChainContext,
}

impl LimitedBody {
    pub fn new(inner: Body, limit: u64, ctx: ChainContext) -> Self {
        Self {
            inner,
            read: 0,
            limit,
            ctx,
        }
    }
}

impl HttpBody for LimitedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.read += data.len() as u64;
                    if this.read > this.limit {
                        this.ctx.mark_body_limit_exceeded();
                        return Poll::Ready(Some(Err(Box::new(BodyLimitExceeded {
                            limit: this.limit,
                        }))));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(e.into()))),
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
