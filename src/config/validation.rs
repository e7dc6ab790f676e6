//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation of resolved mount points (serde handles syntactic)
//! - Check upstream URLs, rewrite patterns and body sizes
//! - Detect conflicting routes (same host scope and path)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: &[MountPoint] → Result<(), Vec<ValidationError>>
//! - Runs both when a file is loaded and before a routing generation is built

use std::collections::HashSet;

use thiserror::Error;
use url::Url;

use crate::config::schema::MountPoint;
use crate::config::size::{parse_size, SizeError};

/// A single semantic problem with a mount point.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("mount point #{index}: path {path:?} must start with '/'")]
    InvalidPath { index: usize, path: String },

    #[error("mount point {path:?}: upstream {upstream:?} is not an absolute http(s) URL")]
    InvalidUpstream { path: String, upstream: String },

    #[error("mount point {path:?}: rewrite pattern does not compile: {reason}")]
    InvalidRewrite { path: String, reason: String },

    #[error("mount point {path:?}: {source}")]
    InvalidBodySize { path: String, source: SizeError },

    #[error("mount point {path:?} is declared twice for host {host:?}")]
    DuplicateMountPoint { path: String, host: String },
}

/// Validate a resolved mount-point list.
pub fn validate_mount_points(mount_points: &[MountPoint]) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, mp) in mount_points.iter().enumerate() {
        if !mp.path.starts_with('/') {
            errors.push(ValidationError::InvalidPath {
                index,
                path: mp.path.clone(),
            });
        }

        let upstream_ok = Url::parse(&mp.upstream)
            .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
            .unwrap_or(false);
        if !upstream_ok {
            errors.push(ValidationError::InvalidUpstream {
                path: mp.path.clone(),
                upstream: mp.upstream.clone(),
            });
        }

        if let Some(rewrite) = &mp.middlewares.rewrite {
            if let Err(e) = regex::Regex::new(&rewrite.pattern) {
                errors.push(ValidationError::InvalidRewrite {
                    path: mp.path.clone(),
                    reason: e.to_string(),
                });
            }
        }

        if let Err(source) = parse_size(&mp.middlewares.max_request_body_size) {
            errors.push(ValidationError::InvalidBodySize {
                path: mp.path.clone(),
                source,
            });
        }

        let host = mp.middlewares.match_host.to_ascii_lowercase();
        if !seen.insert((host.clone(), mp.path.clone())) {
            errors.push(ValidationError::DuplicateMountPoint {
                path: mp.path.clone(),
                host,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
