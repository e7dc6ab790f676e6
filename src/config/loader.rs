//! Configuration loading from disk and global-default merging.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{
    CacheConfig, CacheOverrides, GatewayConfig, MiddlewareOverrides, Middlewares, MountPoint,
};
use crate::config::validation::{validate_mount_points, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

pub(crate) fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<GatewayConfig, ConfigError> {
    let config: GatewayConfig = toml::from_str(content)?;

    validate_mount_points(&resolve_mount_points(&config)).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Layer every mount point's overrides over the global middleware defaults.
pub fn resolve_mount_points(config: &GatewayConfig) -> Vec<MountPoint> {
    config
        .mount_points
        .iter()
        .map(|mp| MountPoint {
            path: mp.path.clone(),
            upstream: mp.upstream.clone(),
            middlewares: merge_middlewares(&config.middlewares, &mp.middlewares),
        })
        .collect()
}

fn merge_middlewares(global: &Middlewares, over: &MiddlewareOverrides) -> Middlewares {
    Middlewares {
        match_host: over
            .match_host
            .clone()
            .unwrap_or_else(|| global.match_host.clone()),
        timeout: over.timeout.unwrap_or(global.timeout),
        max_request_body_size: over
            .max_request_body_size
            .clone()
            .unwrap_or_else(|| global.max_request_body_size.clone()),
        preserve_host_header: over
            .preserve_host_header
            .unwrap_or(global.preserve_host_header),
        redirect_to_https: over.redirect_to_https.unwrap_or(global.redirect_to_https),
        rewrite: over.rewrite.clone().or_else(|| global.rewrite.clone()),
        cors_enabled: over.cors_enabled.unwrap_or(global.cors_enabled),
        cache: merge_cache(&global.cache, &over.cache),
        jwks_url: over
            .jwks_url
            .clone()
            .unwrap_or_else(|| global.jwks_url.clone()),
    }
}

// An explicit empty list in the overrides wins over the global list.
fn merge_cache(global: &CacheConfig, over: &CacheOverrides) -> CacheConfig {
    CacheConfig {
        enabled: over.enabled.unwrap_or(global.enabled),
        ttl: over.ttl.unwrap_or(global.ttl),
        methods: over
            .methods
            .clone()
            .unwrap_or_else(|| global.methods.clone()),
        key_headers: over
            .key_headers
            .clone()
            .unwrap_or_else(|| global.key_headers.clone()),
        key_claims: over
            .key_claims
            .clone()
            .unwrap_or_else(|| global.key_claims.clone()),
    }
}
