//! HTTP → HTTPS redirect.

use std::convert::Infallible;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::Request;
use axum::response::Response;
use tower::Service;

use crate::http::middleware::{call_next, Handler, HandlerFuture, Middleware};
use crate::http::request::{is_tls, request_target};
use crate::http::response;

/// ACME HTTP-01 challenges must stay reachable over plain HTTP.
const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

pub struct Redirect {
    enabled: bool,
}

impl Redirect {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Middleware for Redirect {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn init(&self, next: Handler) -> Handler {
        if !self.enabled {
            return next;
        }
        Handler::new(RedirectService { next })
    }
}

#[derive(Clone)]
pub struct RedirectService {
    next: Handler,
}

impl Service<Request<Body>> for RedirectService {
    type Response = Response;
    type Error = Infallible;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let next = self.next.clone();
        Box::pin(async move {
            if is_tls(&req) || req.uri().path().starts_with(ACME_CHALLENGE_PREFIX) {
                return Ok(call_next(next, req).await);
            }

            // The Host header is reused verbatim, port included.
            let host = req
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .or_else(|| req.uri().authority().map(|a| a.as_str()))
                .unwrap_or_default()
                .to_string();
            let location = format!("https://{}{}", host, request_target(&req));
            tracing::debug!(location = %location, "Redirecting to HTTPS");
            Ok(response::permanent_redirect(&location))
        })
    }
}
