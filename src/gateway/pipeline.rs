//! Pipeline assembly for one mount point.
//!
//! Stage order, outermost first:
//! ```text
//! AttachContext → Redirect → Collector → Timeout → BodyLimit → Cors → Cache → TimeoutResponse → Forwarder
//! ```
//! The collector sees the final status of everything below it. The timeout sets the
//! deadline before any stage that reads it. The cache answers hits before the forwarder
//! would dial the upstream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderName, Request};
use thiserror::Error;

use crate::cache::{Cache, CacheStore};
use crate::config::size::SizeError;
use crate::config::{Middlewares, MountPoint};
use crate::context::ContextPool;
use crate::http::middleware::{
    compose, AttachContext, BodyLimit, Cors, Handler, Middleware, Redirect, Timeout, TimeoutResponse,
};
use crate::http::response;
use crate::observability::{Collector, RouteMetrics};
use crate::proxy::{BufferPool, Forwarder, ForwarderError};
use crate::routing::RouteError;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("mount point {path:?}: {source}")]
    Forwarder {
        path: String,
        #[source]
        source: ForwarderError,
    },

    #[error("mount point {path:?}: {source}")]
    BodyLimit {
        path: String,
        #[source]
        source: SizeError,
    },

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Shared collaborators every pipeline is built from.
#[derive(Clone)]
pub struct PipelineDeps {
    pub contexts: Arc<ContextPool>,
    pub store: Arc<dyn CacheStore>,
    pub buffers: Arc<BufferPool>,
    pub client: reqwest::Client,
    pub generator_header: HeaderName,
}

/// Compile the full pipeline of one mount point.
pub fn build_pipeline(
    conf: Arc<MountPoint>,
    deps: &PipelineDeps,
    metrics: Arc<RouteMetrics>,
) -> Result<Handler, BuildError> {
    let forwarder = Forwarder::new(conf.clone(), deps.client.clone(), deps.generator_header.clone())
        .map_err(|source| BuildError::Forwarder {
            path: conf.path.clone(),
            source,
        })?;
    let body_limit = BodyLimit::new(conf.clone()).map_err(|source| BuildError::BodyLimit {
        path: conf.path.clone(),
        source,
    })?;

    let stages: Vec<Box<dyn Middleware>> = vec![
        Box::new(AttachContext::new(deps.contexts.clone(), conf.clone())),
        Box::new(Redirect::new(conf.middlewares.redirect_to_https)),
        Box::new(Collector::new(conf.clone(), metrics)),
        Box::new(Timeout::new(conf.clone())),
        Box::new(body_limit),
        Box::new(Cors::new(conf.middlewares.cors_enabled)),
        Box::new(Cache::new(
            conf.clone(),
            deps.store.clone(),
            deps.buffers.clone(),
            deps.generator_header.clone(),
        )),
        Box::new(TimeoutResponse::new(conf.clone())),
    ];
    Ok(compose(stages, forwarder.into_handler()))
}

/// The mount point a synthetic 404 scope is accounted under.
pub fn not_found_mount_point(host: &str) -> MountPoint {
    MountPoint::new("/", "").with_middlewares(Middlewares {
        match_host: host.to_string(),
        ..Middlewares::default()
    })
}

/// Root handler for a scope nobody mounted `/` in: logged and counted, then 404.
pub fn not_found_pipeline(
    conf: Arc<MountPoint>,
    deps: &PipelineDeps,
    metrics: Arc<RouteMetrics>,
) -> Handler {
    let terminal = Handler::new(tower::service_fn(|_req: Request<Body>| async {
        Ok::<_, Infallible>(response::not_found())
    }));
    let stages: Vec<Box<dyn Middleware>> = vec![
        Box::new(AttachContext::new(deps.contexts.clone(), conf.clone())),
        Box::new(Collector::new(conf, metrics)),
    ];
    compose(stages, terminal)
}
