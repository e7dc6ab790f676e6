//! Middleware abstraction and the ancillary pipeline stages.
//!
//! # Responsibilities
//! - Define [`Handler`], the boxed service every stage produces and wraps
//! - Define [`Middleware`], a stage that turns a downstream handler into a new handler
//! - Host the small stages: context attach, redirect, timeout, body limit, CORS
//!
//! # Design Decisions
//! - Stages are plain `tower::Service`s with `Error = Infallible`; failures become responses
//! - A pipeline is an ordered `Vec<Box<dyn Middleware>>` folded over a terminal handler,
//!   so the first element ends up outermost
//! - Handlers are `Clone + Send + Sync` so the router can hold them behind an `Arc`

pub mod body_limit;
pub mod context;
pub mod cors;
pub mod redirect;
pub mod timeout;

use std::convert::Infallible;

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use futures_util::future::BoxFuture;
use tower::util::BoxCloneSyncService;
use tower::ServiceExt;

pub use body_limit::BodyLimit;
pub use context::AttachContext;
pub use cors::Cors;
pub use redirect::Redirect;
pub use timeout::{Timeout, TimeoutResponse};

/// A type-erased request handler.
pub type Handler = BoxCloneSyncService<Request<Body>, Response, Infallible>;

/// Future returned by every stage.
pub type HandlerFuture = BoxFuture<'static, Result<Response, Infallible>>;

/// One stage of a mount point's pipeline.
pub trait Middleware: Send + Sync {
    /// Stage name used in logs.
    fn name(&self) -> &'static str;

    /// Wrap `next`, returning a handler with the same contract.
    fn init(&self, next: Handler) -> Handler;
}

/// Fold `middlewares` over `terminal`. The first middleware becomes the outermost handler.
pub fn compose(middlewares: Vec<Box<dyn Middleware>>, terminal: Handler) -> Handler {
    middlewares
        .into_iter()
        .rev()
        .fold(terminal, |next, middleware| {
            tracing::trace!(middleware = middleware.name(), "Wrapping pipeline stage");
            middleware.init(next)
        })
}

/// Invoke the downstream handler.
pub async fn call_next(next: Handler, req: Request<Body>) -> Response {
    match next.oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}
