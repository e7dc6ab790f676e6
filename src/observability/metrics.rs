//! Per-mount-point metrics and the pull endpoint.
//!
//! # Metrics
//! - `crauti_processed_requests_total` (counter): by `code` class 200/400/500
//! - `crauti_request_latency` (histogram): total latency in seconds
//! - `crauti_upstream_request_latency` (histogram): upstream latency in seconds
//! - `crauti_cache_total` (counter): by cache `status`, only for caching routes
//!
//! Every series carries `mountPath`, `matchHost` and `upstream` labels.
//!
//! # Design Decisions
//! - The registry owns its Prometheus recorder; nothing is installed process-wide
//! - Series are registered up front per routing generation and handed out as [`RouteMetrics`]
//! - `unregister_all` retires the whole recorder, so no series outlives its generation

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics::{counter, histogram, Counter, Histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::context::CacheStatus;
use crate::lifecycle::ShutdownListener;

pub const PROCESSED_REQUESTS_TOTAL: &str = "crauti_processed_requests_total";
pub const REQUEST_LATENCY: &str = "crauti_request_latency";
pub const UPSTREAM_REQUEST_LATENCY: &str = "crauti_upstream_request_latency";
pub const CACHE_TOTAL: &str = "crauti_cache_total";

const LATENCY_BUCKETS: [f64; 3] = [0.3, 0.5, 3.0];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics already registered for mount path {path:?} (host {match_host:?})")]
    AlreadyRegistered { path: String, match_host: String },

    #[error("failed to build prometheus recorder: {0}")]
    Recorder(#[from] BuildError),
}

/// Handles for one mount point's series.
pub struct RouteMetrics {
    processed_2xx: Counter,
    processed_4xx: Counter,
    processed_5xx: Counter,
    request_latency: Histogram,
    upstream_latency: Histogram,
    cache: Option<[Counter; 4]>,
}

impl RouteMetrics {
    /// Count one finished request. Statuses outside 2xx/4xx/5xx are not counted.
    pub fn record_status(&self, status: u16) {
        match status {
            200..=299 => self.processed_2xx.increment(1),
            400..=499 => self.processed_4xx.increment(1),
            500..=599 => self.processed_5xx.increment(1),
            _ => {}
        }
    }

    pub fn record_latency(&self, latency: Duration) {
        self.request_latency.record(latency.as_secs_f64());
    }

    pub fn record_upstream_latency(&self, latency: Duration) {
        self.upstream_latency.record(latency.as_secs_f64());
    }

    pub fn record_cache(&self, status: CacheStatus) {
        if let Some(counters) = &self.cache {
            let index = CacheStatus::ALL
                .iter()
                .position(|s| *s == status)
                .unwrap_or_default();
            counters[index].increment(1);
        }
    }
}

struct MetricsGeneration {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    routes: HashMap<(String, String), Arc<RouteMetrics>>,
}

impl MetricsGeneration {
    fn new() -> Result<Self, MetricsError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(REQUEST_LATENCY.to_string()), &LATENCY_BUCKETS)?
            .set_buckets_for_metric(
                Matcher::Full(UPSTREAM_REQUEST_LATENCY.to_string()),
                &LATENCY_BUCKETS,
            )?
            .build_recorder();
        let handle = recorder.handle();
        Ok(Self {
            recorder,
            handle,
            routes: HashMap::new(),
        })
    }
}

/// Metric registrations for the active routing generation.
pub struct MetricsRegistry {
    current: Mutex<MetricsGeneration>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, MetricsError> {
        Ok(Self {
            current: Mutex::new(MetricsGeneration::new()?),
        })
    }

    /// Register the series of one mount point.
    pub fn register_route(
        &self,
        path: &str,
        upstream: &str,
        match_host: &str,
        cache_enabled: bool,
    ) -> Result<Arc<RouteMetrics>, MetricsError> {
        let mut generation = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (path.to_string(), match_host.to_string());
        if generation.routes.contains_key(&key) {
            return Err(MetricsError::AlreadyRegistered {
                path: path.to_string(),
                match_host: match_host.to_string(),
            });
        }

        tracing::debug!(mount_path = %path, match_host = %match_host, "Registering route metrics");
        let labels = [
            ("mountPath", path.to_string()),
            ("matchHost", match_host.to_string()),
            ("upstream", upstream.to_string()),
        ];
        let processed = |code: &'static str| {
            let mut labels: Vec<(&'static str, String)> = labels.to_vec();
            labels.push(("code", code.to_string()));
            counter!(PROCESSED_REQUESTS_TOTAL, &labels)
        };
        let cache_counter = |status: CacheStatus| {
            let mut labels: Vec<(&'static str, String)> = labels.to_vec();
            labels.push(("status", status.as_str().to_string()));
            counter!(CACHE_TOTAL, &labels)
        };

        let route = metrics::with_local_recorder(&generation.recorder, || RouteMetrics {
            processed_2xx: processed("200"),
            processed_4xx: processed("400"),
            processed_5xx: processed("500"),
            request_latency: histogram!(REQUEST_LATENCY, &labels),
            upstream_latency: histogram!(UPSTREAM_REQUEST_LATENCY, &labels),
            cache: cache_enabled.then(|| CacheStatus::ALL.map(cache_counter)),
        });

        let route = Arc::new(route);
        generation.routes.insert(key, route.clone());
        Ok(route)
    }

    /// Drop every registered series. Handles given out earlier keep working but are no
    /// longer rendered.
    pub fn unregister_all(&self) -> Result<(), MetricsError> {
        let fresh = MetricsGeneration::new()?;
        let mut generation = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(routes = generation.routes.len(), "Unregistering route metrics");
        *generation = fresh;
        Ok(())
    }

    /// Prometheus text exposition of the current generation.
    pub fn render(&self) -> String {
        let handle = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle
            .clone();
        handle.render()
    }

    /// Registered `(mountPath, matchHost)` pairs, sorted.
    pub fn route_keys(&self) -> Vec<(String, String)> {
        let generation = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = generation.routes.keys().cloned().collect();
        keys.sort();
        keys
    }
}

async fn render_metrics(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        registry.render(),
    )
}

/// Router serving `GET /metrics`.
pub fn metrics_router(registry: Arc<MetricsRegistry>) -> axum::Router {
    axum::Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(registry)
}

/// Serve the metrics endpoint until shutdown.
pub async fn serve_metrics(
    listener: TcpListener,
    registry: Arc<MetricsRegistry>,
    mut shutdown: ShutdownListener,
) -> std::io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");

    axum::serve(listener, metrics_router(registry))
        .with_graceful_shutdown(async move { shutdown.recv().await })
        .await?;

    tracing::info!("Metrics endpoint stopped");
    Ok(())
}
