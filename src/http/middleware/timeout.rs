//! Route deadlines.
//!
//! [`Timeout`] establishes the deadline and cancels everything downstream when it
//! passes. [`TimeoutResponse`] sits directly around the forwarder and replaces a
//! response that came back after the deadline.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use tokio::time::Instant;
use tower::Service;

use crate::config::MountPoint;
use crate::context::ChainContext;
use crate::http::middleware::{call_next, Handler, HandlerFuture, Middleware};
use crate::http::response;

pub struct Timeout {
    conf: Arc<MountPoint>,
}

impl Timeout {
    pub fn new(conf: Arc<MountPoint>) -> Self {
        Self { conf }
    }
}

impl Middleware for Timeout {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn init(&self, next: Handler) -> Handler {
        let timeout = self.conf.middlewares.timeout;
        if timeout.is_zero() {
            return next;
        }
        Handler::new(TimeoutService {
            conf: self.conf.clone(),
            timeout,
            next,
        })
    }
}

#[derive(Clone)]
pub struct TimeoutService {
    conf: Arc<MountPoint>,
    timeout: Duration,
    next: Handler,
}

impl Service<Request<Body>> for TimeoutService {
    type Response = Response;
    type Error = Infallible;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let ctx = ChainContext::ensure(&mut req, &self.conf);
        let deadline = Instant::now() + self.timeout;
        ctx.set_deadline(deadline.into_std());
        let next = self.next.clone();

        Box::pin(async move {
            match tokio::time::timeout_at(deadline, call_next(next, req)).await {
                Ok(response) => Ok(response),
                Err(_) => {
                    tracing::warn!(
                        mount_path = %ctx.conf().path,
                        "Deadline elapsed, upstream call cancelled"
                    );
                    Ok(response::gateway_timeout())
                }
            }
        })
    }
}

/// Substitutes the timeout response when the deadline passed while the forwarder ran.
pub struct TimeoutResponse {
    conf: Arc<MountPoint>,
}

impl TimeoutResponse {
    pub fn new(conf: Arc<MountPoint>) -> Self {
        Self { conf }
    }
}

impl Middleware for TimeoutResponse {
    fn name(&self) -> &'static str {
        "timeout-response"
    }

    fn init(&self, next: Handler) -> Handler {
        if self.conf.middlewares.timeout.is_zero() {
            return next;
        }
        Handler::new(TimeoutResponseService {
            conf: self.conf.clone(),
            next,
        })
    }
}

#[derive(Clone)]
pub struct TimeoutResponseService {
    conf: Arc<MountPoint>,
    next: Handler,
}

impl Service<Request<Body>> for TimeoutResponseService {
    type Response = Response;
    type Error = Infallible;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let ctx = ChainContext::ensure(&mut req, &self.conf);
        let next = self.next.clone();
        Box::pin(async move {
            let response = call_next(next, req).await;
            if ctx.deadline_elapsed() {
                return Ok(response::gateway_timeout());
            }
            Ok(response)
        })
    }
}
