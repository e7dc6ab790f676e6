//! Upstream forwarding.
//!
//! # Responsibilities
//! - Forward a mount point's requests to its upstream ([`Forwarder`])
//! - Rewrite outbound paths with regex rules ([`RewriteRule`])
//! - Pool the buffers used to copy bodies ([`BufferPool`])
//!
//! # Design Decisions
//! - One `reqwest::Client` per gateway, shared by every mount point so connections pool
//! - The forwarder is the terminal handler of a pipeline; it never calls further stages

pub mod buffer_pool;
pub mod forwarder;
pub mod rewrite;

pub use buffer_pool::BufferPool;
pub use forwarder::{build_client, Forwarder, ForwarderError};
pub use rewrite::RewriteRule;
