//! Host and path dispatch.
//!
//! # Responsibilities
//! - Keep one path table for default mount points and one per `matchHost`
//! - Resolve a request to the compiled pipeline of its mount point
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(1) host lookup via HashMap, unknown hosts fall back to the default table
//! - Every scope owns a `/` route, synthetic if no mount point declares one,
//!   so unmatched requests still run through observability

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use tower::Service;

use crate::http::middleware::{call_next, Handler, HandlerFuture};
use crate::http::response;
use crate::routing::matcher::{request_host, strip_port};
use crate::routing::mux::{PathMux, Route, RouteError};

/// Collects mount point handlers before freezing them into a [`Router`].
#[derive(Default)]
pub struct RouterBuilder {
    default: PathMux,
    hosts: HashMap<String, PathMux>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern` in the scope of `host` (empty = default scope).
    pub fn mount(&mut self, host: &str, pattern: &str, handler: Handler) -> Result<(), RouteError> {
        self.table_mut(host).handle(pattern, handler)
    }

    /// Scopes with no `/` route, as host names (empty = default scope).
    pub fn scopes_without_root(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .hosts
            .iter()
            .filter(|(_, table)| !table.contains("/"))
            .map(|(host, _)| host.clone())
            .collect();
        missing.sort();
        if !self.default.contains("/") {
            missing.insert(0, String::new());
        }
        missing
    }

    /// Host names with a dedicated table.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.hosts.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn build(self) -> Router {
        Router {
            tables: Arc::new(Tables {
                default: self.default,
                hosts: self.hosts,
            }),
        }
    }

    fn table_mut(&mut self, host: &str) -> &mut PathMux {
        let host = strip_port(host.trim()).to_ascii_lowercase();
        if host.is_empty() {
            &mut self.default
        } else {
            self.hosts.entry(host).or_default()
        }
    }
}

struct Tables {
    default: PathMux,
    hosts: HashMap<String, PathMux>,
}

/// The two-level host+path router of one routing generation.
#[derive(Clone)]
pub struct Router {
    tables: Arc<Tables>,
}

enum Routed {
    Handler(Handler),
    Redirect(String),
    NotFound,
}

impl Router {
    fn route(&self, req: &Request<Body>) -> Routed {
        let table = request_host(req)
            .and_then(|host| self.tables.hosts.get(&host))
            .unwrap_or(&self.tables.default);

        match table.lookup(req.uri().path()) {
            Some(Route::Handler(handler)) => Routed::Handler(handler.clone()),
            Some(Route::Redirect(path)) => match req.uri().query() {
                Some(query) => Routed::Redirect(format!("{}?{}", path, query)),
                None => Routed::Redirect(path),
            },
            None => Routed::NotFound,
        }
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.tables.hosts.keys().cloned().collect();
        domains.sort();
        domains
    }
}

impl Service<Request<Body>> for Router {
    type Response = Response;
    type Error = Infallible;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let routed = self.route(&req);
        Box::pin(async move {
            Ok(match routed {
                Routed::Handler(handler) => call_next(handler, req).await,
                Routed::Redirect(location) => response::moved_permanently(&location),
                Routed::NotFound => response::not_found(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::middleware::test_support::{body_string, counting_handler};
    use axum::http::StatusCode;
    use tower::ServiceExt;

    fn request(host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("host", host)
            .body(Body::empty())
            .unwrap()
    }

    async fn get(router: &Router, host: &str, path: &str) -> (StatusCode, String) {
        let response = router.clone().oneshot(request(host, path)).await.unwrap();
        let status = response.status();
        (status, body_string(response).await)
    }

    #[tokio::test]
    async fn test_host_scoping() {
        let mut builder = RouterBuilder::new();
        builder.mount("", "/", counting_handler("default").0).unwrap();
        builder.mount("A.test", "/", counting_handler("a").0).unwrap();
        let router = builder.build();

        assert_eq!(get(&router, "a.test", "/x").await.1, "a");
        assert_eq!(get(&router, "a.test:8080", "/x").await.1, "a");
        assert_eq!(get(&router, "b.test", "/x").await.1, "default");
        assert_eq!(router.domains(), vec!["a.test"]);
    }

    #[tokio::test]
    async fn test_scopes_without_root() {
        let mut builder = RouterBuilder::new();
        builder.mount("a.test", "/api/", counting_handler("a").0).unwrap();
        builder.mount("b.test", "/", counting_handler("b").0).unwrap();
        assert_eq!(builder.scopes_without_root(), vec!["", "a.test"]);
    }

    #[tokio::test]
    async fn test_unmatched_is_not_found() {
        let mut builder = RouterBuilder::new();
        builder.mount("a.test", "/api/", counting_handler("a").0).unwrap();
        let router = builder.build();

        let (status, body) = get(&router, "b.test", "/api/x").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, response::NOT_FOUND_BODY);
    }

    #[tokio::test]
    async fn test_redirect_keeps_query() {
        let mut builder = RouterBuilder::new();
        builder.mount("", "/api/", counting_handler("api").0).unwrap();
        let router = builder.build();

        let response = router.clone().oneshot(request("x", "/api?q=1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()["location"], "/api/?q=1");
    }
}
