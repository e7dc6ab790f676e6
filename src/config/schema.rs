//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.
//!
//! Two shapes exist for middleware settings: [`Middlewares`] is the fully
//! resolved block a pipeline is built from, while [`MiddlewareOverrides`]
//! is what a mount point declares on top of the global defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Plain HTTP bind address (e.g., "0.0.0.0:8080").
    pub listen_address: String,

    /// Name of the response header marking cache or upstream origin.
    pub generator_header: String,

    /// Optional HTTPS listener.
    pub https: Option<HttpsConfig>,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,

    /// Outbound transport settings.
    pub upstream: UpstreamConfig,

    /// Global middleware defaults, overridable per mount point.
    pub middlewares: Middlewares,

    /// Route definitions, in declaration order.
    pub mount_points: Vec<MountPointConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            generator_header: "X-Generator".to_string(),
            https: None,
            observability: ObservabilityConfig::default(),
            upstream: UpstreamConfig::default(),
            middlewares: Middlewares::default(),
            mount_points: Vec::new(),
        }
    }
}

/// HTTPS listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpsConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    pub listen_address: String,

    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub log_level: String,

    /// `text` or `json`.
    pub log_format: String,

    /// Serve the pull-style metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Outbound (gateway → upstream) transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Accept any upstream certificate. On by default; turn it off in hardened deployments.
    pub insecure_skip_verify: bool,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: true,
            connect_timeout: Duration::from_secs(5),
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A mount point as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MountPointConfig {
    /// Gateway mount path, like `/api/config/`.
    pub path: String,

    /// Upstream base URL, like `http://my-service.my-namespace:8080`.
    pub upstream: String,

    /// Values that differ from the global middleware defaults.
    #[serde(default)]
    pub middlewares: MiddlewareOverrides,
}

/// A route definition with its middleware block fully resolved.
///
/// Immutable for the lifetime of one routing generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MountPoint {
    pub path: String,
    pub upstream: String,
    pub middlewares: Middlewares,
}

impl MountPoint {
    pub fn new(path: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            upstream: upstream.into(),
            middlewares: Middlewares::default(),
        }
    }

    pub fn with_middlewares(mut self, middlewares: Middlewares) -> Self {
        self.middlewares = middlewares;
        self
    }
}

/// Resolved middleware settings for one mount point.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Middlewares {
    /// Restrict the mount point to requests for this host. Empty means any host.
    pub match_host: String,

    /// Per-request deadline. Zero or negative disables it.
    #[serde(with = "route_timeout")]
    pub timeout: Duration,

    /// Human readable size such as `10b` or `5mb`. `0`, negative or empty disables the limit.
    pub max_request_body_size: String,

    /// Forward the client's Host header instead of the upstream's.
    pub preserve_host_header: bool,

    #[serde(rename = "redirectToHTTPS")]
    pub redirect_to_https: bool,

    pub rewrite: Option<RewriteConfig>,

    pub cors_enabled: bool,

    pub cache: CacheConfig,

    #[serde(rename = "jwksURL")]
    pub jwks_url: String,
}

impl Default for Middlewares {
    fn default() -> Self {
        Self {
            match_host: String::new(),
            timeout: Duration::ZERO,
            max_request_body_size: "0".to_string(),
            preserve_host_header: false,
            redirect_to_https: false,
            rewrite: None,
            cors_enabled: false,
            cache: CacheConfig::default(),
            jwks_url: String::new(),
        }
    }
}

/// Regex rewrite applied to the outbound path and query.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RewriteConfig {
    pub pattern: String,
    pub target: String,
}

/// Response cache settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Cacheable HTTP methods.
    pub methods: Vec<String>,

    /// Request headers folded into the cache key.
    pub key_headers: Vec<String>,

    /// Authenticated claims folded into the cache key.
    pub key_claims: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(600),
            methods: vec!["GET".to_string(), "HEAD".to_string(), "OPTIONS".to_string()],
            key_headers: Vec::new(),
            key_claims: Vec::new(),
        }
    }
}

/// Per mount point middleware overrides. `None` falls back to the global value.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MiddlewareOverrides {
    pub match_host: Option<String>,

    #[serde(with = "route_timeout::option")]
    pub timeout: Option<Duration>,

    pub max_request_body_size: Option<String>,

    pub preserve_host_header: Option<bool>,

    #[serde(rename = "redirectToHTTPS")]
    pub redirect_to_https: Option<bool>,

    pub rewrite: Option<RewriteConfig>,

    pub cors_enabled: Option<bool>,

    pub cache: CacheOverrides,

    #[serde(rename = "jwksURL")]
    pub jwks_url: Option<String>,
}

/// Cache overrides. An explicitly empty list means "none", an absent one means "global".
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheOverrides {
    pub enabled: Option<bool>,

    #[serde(with = "humantime_serde::option")]
    pub ttl: Option<Duration>,

    pub methods: Option<Vec<String>>,

    pub key_headers: Option<Vec<String>>,

    pub key_claims: Option<Vec<String>>,
}

/// Humantime durations that also accept a leading `-`. Negative values map to zero,
/// which disables the route timeout.
mod route_timeout {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Result<Duration, humantime::DurationError> {
        let raw = raw.trim();
        match raw.strip_prefix('-') {
            Some(magnitude) => humantime::parse_duration(magnitude.trim_start()).map(|_| Duration::ZERO),
            None => humantime::parse_duration(raw),
        }
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| super::parse(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
