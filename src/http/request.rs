//! Request inspection helpers.
//!
//! # Responsibilities
//! - Tell whether a request arrived over TLS
//! - Extract the client address and the request target
//!
//! # Design Decisions
//! - The HTTPS listener marks its requests with a [`TlsConnection`] extension
//! - The client address comes from axum's `ConnectInfo` and is optional
//!   so stages can be driven without a socket

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;

/// Extension present on requests accepted by the HTTPS listener.
#[derive(Debug, Clone, Copy)]
pub struct TlsConnection;

pub fn is_tls<B>(req: &Request<B>) -> bool {
    req.extensions().get::<TlsConnection>().is_some()
        || req.uri().scheme_str() == Some("https")
}

pub fn client_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Path and query as sent on the request line.
pub fn request_target<B>(req: &Request<B>) -> &str {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}
