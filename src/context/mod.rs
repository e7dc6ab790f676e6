//! Per-request context threaded through a mount point's pipeline.
//!
//! # Responsibilities
//! - Carry the matched mount point for the lifetime of one request
//! - Hold scratch state written by one stage and read by another
//!   (proxy timing, cache outcome, deadline, auth claims)
//!
//! # Design Decisions
//! - The context travels in the request extensions as a [`ChainContext`] handle
//! - Handles share one `Mutex<RequestContext>`; stages lock briefly and never across an await
//! - Contexts are drawn from a [`ContextPool`] and reset on every acquire

pub mod pool;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use axum::http::Request;
use serde_json::Value;

use crate::config::MountPoint;

pub use pool::{ContextPool, PooledContext};

/// Cache outcome recorded for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    Bypass,
    Hit,
    Ignored,
    Miss,
}

impl CacheStatus {
    pub const ALL: [CacheStatus; 4] = [
        CacheStatus::Bypass,
        CacheStatus::Hit,
        CacheStatus::Ignored,
        CacheStatus::Miss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Bypass => "BYPASS",
            CacheStatus::Hit => "HIT",
            CacheStatus::Ignored => "IGNORED",
            CacheStatus::Miss => "MISS",
        }
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProxyContext {
    /// Set once the upstream call is actually attempted.
    pub proxied_request: bool,
    pub upstream_request_start_time: Option<Instant>,
    /// Outbound path and query after stripping and rewriting.
    pub uri: String,
    /// The forwarder answered on behalf of a failed upstream.
    pub upstream_failed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CacheContext {
    /// `None` until the cache stage has run.
    pub status: Option<CacheStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub claims: BTreeMap<String, Value>,
    pub authorized: bool,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub conf: Arc<MountPoint>,
    pub proxy: ProxyContext,
    pub cache: CacheContext,
    pub auth: AuthContext,
    /// Absolute deadline set by the timeout stage.
    pub deadline: Option<Instant>,
    pub body_limit_exceeded: bool,
}

impl RequestContext {
    pub fn new(conf: Arc<MountPoint>) -> Self {
        Self {
            conf,
            proxy: ProxyContext::default(),
            cache: CacheContext::default(),
            auth: AuthContext::default(),
            deadline: None,
            body_limit_exceeded: false,
        }
    }

    /// Overwrite every field so nothing from a previous request survives.
    pub fn reset(&mut self, conf: Arc<MountPoint>) {
        *self = Self::new(conf);
    }
}

/// Cloneable handle to the live [`RequestContext`] of one request.
#[derive(Debug, Clone)]
pub struct ChainContext(Arc<Mutex<RequestContext>>);

impl ChainContext {
    /// A context that does not come from a pool.
    pub fn detached(conf: Arc<MountPoint>) -> Self {
        Self(Arc::new(Mutex::new(RequestContext::new(conf))))
    }

    pub(crate) fn from_slot(slot: Arc<Mutex<RequestContext>>) -> Self {
        Self(slot)
    }

    pub fn from_request<B>(req: &Request<B>) -> Option<Self> {
        req.extensions().get::<ChainContext>().cloned()
    }

    /// Return the request's context, attaching a detached one when a stage runs standalone.
    pub fn ensure<B>(req: &mut Request<B>, conf: &Arc<MountPoint>) -> Self {
        if let Some(ctx) = Self::from_request(req) {
            return ctx;
        }
        let ctx = Self::detached(conf.clone());
        req.extensions_mut().insert(ctx.clone());
        ctx
    }

    fn lock(&self) -> MutexGuard<'_, RequestContext> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn conf(&self) -> Arc<MountPoint> {
        self.lock().conf.clone()
    }

    /// Copy of the current state, for logging.
    pub fn snapshot(&self) -> RequestContext {
        self.lock().clone()
    }

    pub fn cache_status(&self) -> Option<CacheStatus> {
        self.lock().cache.status
    }

    pub fn set_cache_status(&self, status: CacheStatus) {
        self.lock().cache.status = Some(status);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.lock().deadline
    }

    pub fn set_deadline(&self, deadline: Instant) {
        self.lock().deadline = Some(deadline);
    }

    pub fn deadline_elapsed(&self) -> bool {
        self.deadline()
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }

    pub fn set_proxy_uri(&self, uri: String) {
        self.lock().proxy.uri = uri;
    }

    /// Record that the upstream call is being attempted now.
    pub fn start_upstream_request(&self) {
        let mut ctx = self.lock();
        ctx.proxy.proxied_request = true;
        ctx.proxy.upstream_request_start_time = Some(Instant::now());
    }

    pub fn mark_upstream_failed(&self) {
        self.lock().proxy.upstream_failed = true;
    }

    pub fn upstream_failed(&self) -> bool {
        self.lock().proxy.upstream_failed
    }

    pub fn mark_body_limit_exceeded(&self) {
        self.lock().body_limit_exceeded = true;
    }

    pub fn body_limit_exceeded(&self) -> bool {
        self.lock().body_limit_exceeded
    }

    /// Attach verified claims. Called by an authentication stage.
    pub fn authorize(&self, claims: BTreeMap<String, Value>) {
        let mut ctx = self.lock();
        ctx.auth.claims = claims;
        ctx.auth.authorized = true;
    }

    /// Claims of an authorized caller, `None` otherwise.
    pub fn claims(&self) -> Option<BTreeMap<String, Value>> {
        let ctx = self.lock();
        ctx.auth.authorized.then(|| ctx.auth.claims.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use std::time::Duration;

    #[test]
    fn test_reset_clears_scratch_state() {
        let first = Arc::new(MountPoint::new("/a/", "http://a"));
        let second = Arc::new(MountPoint::new("/b/", "http://b"));

        let mut ctx = RequestContext::new(first);
        ctx.proxy.proxied_request = true;
        ctx.proxy.uri = "/x".into();
        ctx.cache.status = Some(CacheStatus::Hit);
        ctx.auth.authorized = true;
        ctx.auth.claims.insert("sub".into(), Value::from("u1"));
        ctx.deadline = Some(Instant::now());
        ctx.body_limit_exceeded = true;

        ctx.reset(second.clone());
        assert!(Arc::ptr_eq(&ctx.conf, &second));
        assert!(!ctx.proxy.proxied_request);
        assert!(ctx.proxy.uri.is_empty());
        assert!(ctx.cache.status.is_none());
        assert!(!ctx.auth.authorized);
        assert!(ctx.auth.claims.is_empty());
        assert!(ctx.deadline.is_none());
        assert!(!ctx.body_limit_exceeded);
    }

    #[test]
    fn test_handle_travels_with_request() {
        let conf = Arc::new(MountPoint::new("/", "http://a"));
        let mut req = Request::new(Body::empty());
        assert!(ChainContext::from_request(&req).is_none());

        let ctx = ChainContext::ensure(&mut req, &conf);
        ctx.set_cache_status(CacheStatus::Miss);

        let again = ChainContext::ensure(&mut req, &conf);
        assert_eq!(again.cache_status(), Some(CacheStatus::Miss));
    }

    #[test]
    fn test_claims_require_authorization() {
        let ctx = ChainContext::detached(Arc::new(MountPoint::default()));
        assert!(ctx.claims().is_none());

        let mut claims = BTreeMap::new();
        claims.insert("tenant".to_string(), Value::from("acme"));
        ctx.authorize(claims);
        assert_eq!(ctx.claims().unwrap()["tenant"], "acme");
    }

    #[test]
    fn test_deadline() {
        let ctx = ChainContext::detached(Arc::new(MountPoint::default()));
        assert!(!ctx.deadline_elapsed());
        ctx.set_deadline(Instant::now() + Duration::from_secs(60));
        assert!(!ctx.deadline_elapsed());
        ctx.set_deadline(Instant::now() - Duration::from_millis(1));
        assert!(ctx.deadline_elapsed());
    }
}
