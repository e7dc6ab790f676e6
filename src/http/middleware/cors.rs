//! CORS header injection.

use std::convert::Infallible;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{header, HeaderValue, Request};
use axum::response::Response;
use tower::Service;

use crate::http::middleware::{call_next, Handler, HandlerFuture, Middleware};

/// Clears CORS headers coming from downstream (a cached upstream response may carry
/// stale ones) and sets them again from the current request.
pub struct Cors {
    enabled: bool,
}

impl Cors {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Middleware for Cors {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn init(&self, next: Handler) -> Handler {
        if !self.enabled {
            return next;
        }
        Handler::new(CorsService { next })
    }
}

#[derive(Clone)]
pub struct CorsService {
    next: Handler,
}

impl Service<Request<Body>> for CorsService {
    type Response = Response;
    type Error = Infallible;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let origin = req.headers().get(header::ORIGIN).cloned();
        let method = HeaderValue::from_str(req.method().as_str()).ok();
        let next = self.next.clone();

        Box::pin(async move {
            let mut response = call_next(next, req).await;
            let headers = response.headers_mut();
            headers.remove(header::ACCESS_CONTROL_ALLOW_ORIGIN);
            headers.remove(header::ACCESS_CONTROL_ALLOW_METHODS);
            headers.remove(header::ACCESS_CONTROL_ALLOW_HEADERS);
            headers.remove(header::ACCESS_CONTROL_ALLOW_CREDENTIALS);

            if let Some(origin) = origin {
                headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
                if let Some(method) = method {
                    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, method);
                }
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static("*"),
                );
            }
            Ok(response)
        })
    }
}
