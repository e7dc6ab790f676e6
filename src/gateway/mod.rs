//! Gateway runtime: routing generations and reconfiguration.
//!
//! # Responsibilities
//! - Compile a mount-point list into a routing generation (router + metrics)
//! - Swap the active generation atomically
//! - Hand every new generation to the listener-owning server task
//!
//! # Data Flow
//! ```text
//! update(mount points)
//!     → validate (reject: previous generation stays active)
//!     → unregister previous metrics
//!     → build one pipeline per mount point, register its metrics
//!     → synthetic 404 root per scope without `/`
//!     → swap current generation → notify server (drain old listeners, bind new)
//! ```
//!
//! # Design Decisions
//! - Readers load the current generation without locking (`ArcSwap`)
//! - Updates are serialized by one mutex and never await while holding it
//! - The hand-off is a `watch` channel, so updates queued behind a drain coalesce

pub mod pipeline;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use axum::http::HeaderName;
use thiserror::Error;
use tokio::sync::watch;

use crate::cache::{self, CacheStore, StoreError};
use crate::config::loader::join_errors;
use crate::config::{validate_mount_points, GatewayConfig, MountPoint, UpstreamConfig, ValidationError};
use crate::context::ContextPool;
use crate::observability::{MetricsError, MetricsRegistry};
use crate::proxy::{build_client, BufferPool, ForwarderError};
use crate::routing::{Router, RouterBuilder};

pub use pipeline::{build_pipeline, not_found_mount_point, not_found_pipeline, BuildError, PipelineDeps};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid mount points: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("invalid generator header {0:?}")]
    InvalidGeneratorHeader(String),

    #[error(transparent)]
    Client(#[from] ForwarderError),
}

/// One complete, internally consistent routing snapshot.
pub struct Generation {
    pub id: u64,
    pub router: Router,
    /// Host names with dedicated routing tables.
    pub domains: Vec<String>,
    pub mount_points: Vec<MountPoint>,
}

impl Generation {
    fn empty() -> Self {
        Self {
            id: 0,
            router: RouterBuilder::new().build(),
            domains: Vec::new(),
            mount_points: Vec::new(),
        }
    }
}

/// Settings the gateway needs beyond the mount points.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub generator_header: String,
    pub upstream: UpstreamConfig,
}

impl From<&GatewayConfig> for GatewaySettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            generator_header: config.generator_header.clone(),
            upstream: config.upstream.clone(),
        }
    }
}

pub struct Gateway {
    deps: PipelineDeps,
    metrics: Arc<MetricsRegistry>,
    current: ArcSwap<Generation>,
    next_id: AtomicU64,
    update_lock: Mutex<()>,
    updates: watch::Sender<Option<Arc<Generation>>>,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        store: Arc<dyn CacheStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, GatewayError> {
        let generator_header = HeaderName::from_bytes(settings.generator_header.as_bytes())
            .map_err(|_| GatewayError::InvalidGeneratorHeader(settings.generator_header.clone()))?;
        let client = build_client(&settings.upstream)?;
        let (updates, _) = watch::channel(None);

        Ok(Self {
            deps: PipelineDeps {
                contexts: Arc::new(ContextPool::default()),
                store,
                buffers: Arc::new(BufferPool::default()),
                client,
                generator_header,
            },
            metrics,
            current: ArcSwap::from_pointee(Generation::empty()),
            next_id: AtomicU64::new(1),
            update_lock: Mutex::new(()),
            updates,
        })
    }

    /// Rebuild routing from `mount_points` and make it the active generation.
    ///
    /// On error the previous generation keeps serving.
    pub fn update(&self, mount_points: Vec<MountPoint>) -> Result<Arc<Generation>, GatewayError> {
        let _serialized = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);

        validate_mount_points(&mount_points).map_err(GatewayError::Validation)?;

        self.metrics.unregister_all()?;
        let mut builder = RouterBuilder::new();
        for mp in &mount_points {
            let conf = Arc::new(mp.clone());
            let route_metrics = self.metrics.register_route(
                &mp.path,
                &mp.upstream,
                &mp.middlewares.match_host,
                mp.middlewares.cache.enabled,
            )?;
            let handler = build_pipeline(conf, &self.deps, route_metrics)?;
            builder
                .mount(&mp.middlewares.match_host, &mp.path, handler)
                .map_err(BuildError::from)?;
        }

        for host in builder.scopes_without_root() {
            let conf = Arc::new(not_found_mount_point(&host));
            let route_metrics = self.metrics.register_route("/", "", &host, false)?;
            let handler = not_found_pipeline(conf, &self.deps, route_metrics);
            builder.mount(&host, "/", handler).map_err(BuildError::from)?;
        }

        let generation = Arc::new(Generation {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            domains: builder.domains(),
            router: builder.build(),
            mount_points,
        });
        self.current.store(generation.clone());
        self.updates.send_replace(Some(generation.clone()));

        tracing::info!(
            generation = generation.id,
            mount_points = generation.mount_points.len(),
            domains = ?generation.domains,
            "Routing generation activated"
        );
        Ok(generation)
    }

    /// The active generation.
    pub fn current(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    /// Router of the active generation, for in-process dispatch.
    pub fn router(&self) -> Router {
        self.current.load().router.clone()
    }

    /// Receiver of every activated generation; the newest wins.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Generation>>> {
        self.updates.subscribe()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Expire cached responses whose key matches the glob `pattern`.
    pub async fn flush_cache(&self, pattern: &str) -> Result<usize, StoreError> {
        cache::invalidate(self.deps.store.as_ref(), pattern).await
    }
}
