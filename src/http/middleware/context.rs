//! Context attach stage: the outermost layer of every pipeline.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use tower::Service;

use crate::config::MountPoint;
use crate::context::ContextPool;
use crate::http::middleware::{call_next, Handler, HandlerFuture, Middleware};

/// Draws a [`crate::context::RequestContext`] from the pool, resets it against the
/// mount point and puts its handle in the request extensions.
pub struct AttachContext {
    pool: Arc<ContextPool>,
    conf: Arc<MountPoint>,
}

impl AttachContext {
    pub fn new(pool: Arc<ContextPool>, conf: Arc<MountPoint>) -> Self {
        Self { pool, conf }
    }
}

impl Middleware for AttachContext {
    fn name(&self) -> &'static str {
        "context"
    }

    fn init(&self, next: Handler) -> Handler {
        Handler::new(AttachContextService {
            pool: self.pool.clone(),
            conf: self.conf.clone(),
            next,
        })
    }
}

#[derive(Clone)]
pub struct AttachContextService {
    pool: Arc<ContextPool>,
    conf: Arc<MountPoint>,
    next: Handler,
}

impl Service<Request<Body>> for AttachContextService {
    type Response = Response;
    type Error = Infallible;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        // The loan is returned when this future completes, is dropped, or unwinds.
        let pooled = self.pool.acquire(self.conf.clone());
        req.extensions_mut().insert(pooled.handle());
        let next = self.next.clone();

        Box::pin(async move {
            let response = call_next(next, req).await;
            drop(pooled);
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CacheStatus, ChainContext};

    #[tokio::test]
    async fn test_context_is_visible_downstream_and_released() {
        let pool = Arc::new(ContextPool::new(8));
        let conf = Arc::new(MountPoint::new("/api/", "http://upstream"));

        let inspect = Handler::new(tower::service_fn(|req: Request<Body>| async move {
            let ctx = ChainContext::from_request(&req).expect("context attached");
            assert_eq!(ctx.conf().path, "/api/");
            assert!(ctx.cache_status().is_none());
            ctx.set_cache_status(CacheStatus::Miss);
            Ok::<_, Infallible>(Response::new(Body::empty()))
        }));

        let handler = AttachContext::new(pool.clone(), conf).init(inspect);
        call_next(handler.clone(), Request::new(Body::empty())).await;
        assert_eq!(pool.idle(), 1);

        // The reused context comes back clean.
        call_next(handler, Request::new(Body::empty())).await;
        assert_eq!(pool.idle(), 1);
    }
}
