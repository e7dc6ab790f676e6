//! Host extraction and matching.
//!
//! # Responsibilities
//! - Extract the request host (Host header, or URI authority for HTTP/2)
//! - Strip the port, including from bracketed IPv6 literals
//! - Match a mount point's `matchHost`
//!
//! # Design Decisions
//! - Host matching is case-insensitive
//! - Empty expected host = always matches (wildcard)

use axum::http::{header, Request};

/// Host of the request, lowercased and without port.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;
    let host = strip_port(raw.trim());
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// `example.com:8080` → `example.com`, `[::1]:443` → `[::1]`.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rfind(':') {
        // A second colon means an unbracketed IPv6 literal without port.
        Some(idx) if !host[..idx].contains(':') => &host[..idx],
        _ => host,
    }
}

/// Matches the request host against a mount point's `matchHost`.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// Create a new host matcher.
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        let host: String = host.into();
        Self {
            expected_host: strip_port(host.trim()).to_ascii_lowercase(),
        }
    }

    /// True when no host restriction is configured.
    pub fn is_wildcard(&self) -> bool {
        self.expected_host.is_empty()
    }

    pub fn host(&self) -> &str {
        &self.expected_host
    }

    pub fn matches<B>(&self, req: &Request<B>) -> bool {
        if self.is_wildcard() {
            return true;
        }
        request_host(req)
            .map(|h| h == self.expected_host)
            .unwrap_or(false)
    }
}
