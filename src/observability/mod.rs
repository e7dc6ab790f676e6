//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every pipeline:
//!     → collector.rs (one structured record + metrics update per request)
//!         → metrics.rs (per-mount-point counters and histograms)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, text or JSON)
//!     → GET /metrics (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - The metrics registry is an explicit dependency of the gateway, not a global
//! - Aborted requests are still accounted for, with status 499

pub mod collector;
pub mod logging;
pub mod metrics;

pub use collector::Collector;
pub use logging::{init_logging, LoggingError};
pub use metrics::{metrics_router, serve_metrics, MetricsError, MetricsRegistry, RouteMetrics};
