//! Path table with prefix-router semantics.
//!
//! # Design Decisions
//! - A pattern ending in `/` owns its whole subtree; any other pattern matches exactly
//! - Exact registrations win, then the longest subtree
//! - A subtree root requested without its trailing slash is redirected to the slashed form

use std::collections::HashMap;

use thiserror::Error;

use crate::http::middleware::Handler;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("pattern {0:?} registered twice")]
    Duplicate(String),

    #[error("pattern {0:?} must start with '/'")]
    InvalidPattern(String),
}

/// Outcome of a path lookup.
pub enum Route<'a> {
    Handler(&'a Handler),
    /// Redirect to this path (query not included).
    Redirect(String),
}

#[derive(Clone, Default)]
pub struct PathMux {
    exact: HashMap<String, Handler>,
    /// Subtree patterns, longest first.
    subtrees: Vec<(String, Handler)>,
}

impl PathMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, pattern: &str, handler: Handler) -> Result<(), RouteError> {
        if !pattern.starts_with('/') {
            return Err(RouteError::InvalidPattern(pattern.to_string()));
        }
        if self.contains(pattern) {
            return Err(RouteError::Duplicate(pattern.to_string()));
        }

        if pattern.ends_with('/') {
            self.subtrees.push((pattern.to_string(), handler));
            self.subtrees.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        } else {
            self.exact.insert(pattern.to_string(), handler);
        }
        Ok(())
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.exact.contains_key(pattern) || self.subtrees.iter().any(|(p, _)| p == pattern)
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.subtrees.is_empty()
    }

    pub fn lookup(&self, path: &str) -> Option<Route<'_>> {
        if let Some(handler) = self.exact.get(path) {
            return Some(Route::Handler(handler));
        }

        if !path.ends_with('/') {
            let slashed = format!("{}/", path);
            if self.subtrees.iter().any(|(p, _)| *p == slashed) {
                return Some(Route::Redirect(slashed));
            }
        }

        self.subtrees
            .iter()
            .find(|(pattern, _)| path.starts_with(pattern.as_str()))
            .map(|(_, handler)| Route::Handler(handler))
    }
}
