//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (listeners of the active generation)
//!     → routing::Router (host + path lookup)
//!     → middleware/ (per-mount-point pipeline stages)
//!     → proxy::Forwarder or cache
//!     → response.rs (gateway-generated responses)
//!     → Send to client
//! ```

pub mod middleware;
pub mod request;
pub mod response;
pub mod server;

pub use request::{client_addr, is_tls, request_target, TlsConnection};
pub use server::{Bound, Server, ServerConfig, ServerError, ServerHandle, TlsSettings};
