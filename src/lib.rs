//! crauti: an HTTP(S) reverse-proxy gateway with per-route middleware pipelines.

// Request plumbing
pub mod context;
pub mod http;
pub mod routing;

// Per-route stages
pub mod cache;
pub mod proxy;

// Runtime
pub mod config;
pub mod gateway;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::{GatewayConfig, MountPoint};
pub use gateway::{Gateway, GatewayError, GatewaySettings, Generation};
pub use http::{Server, ServerConfig, ServerHandle};
pub use lifecycle::Shutdown;
