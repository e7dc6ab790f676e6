//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → loader.rs (merge global middleware defaults into every mount point)
//!     → validation.rs (semantic checks)
//!     → Vec<MountPoint> handed to Gateway::update
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → main loop calls Gateway::update with the new list
//! ```
//!
//! # Design Decisions
//! - Mount points are immutable once resolved; changes build a new routing generation
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod size;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, resolve_mount_points, ConfigError};
pub use schema::{
    CacheConfig, GatewayConfig, HttpsConfig, Middlewares, MountPoint, ObservabilityConfig,
    RewriteConfig, UpstreamConfig,
};
pub use validation::{validate_mount_points, ValidationError};
pub use watcher::ConfigWatcher;
