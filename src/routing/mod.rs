//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path)
//!     → matcher.rs (extract host, strip port)
//!     → router.rs (pick host table, fall back to default table)
//!     → mux.rs (exact pattern, subtree redirect, longest subtree)
//!     → compiled pipeline of the matched mount point
//!
//! Generation build (on every update):
//!     MountPoint[]
//!     → one pipeline per mount point
//!     → RouterBuilder::mount(matchHost, path, pipeline)
//!     → synthetic 404 per scope without "/"
//!     → freeze as immutable Router
//! ```
//!
//! # Design Decisions
//! - Routers are built per generation, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route

pub mod matcher;
pub mod mux;
pub mod router;

pub use matcher::{request_host, HostMatcher};
pub use mux::{PathMux, RouteError};
pub use router::{Router, RouterBuilder};
