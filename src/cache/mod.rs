//! Response cache: keying, storage backends, per-key fill locks and the pipeline stage.
//!
//! # Responsibilities
//! - Derive a deterministic key from method, target, selected headers and claims
//! - Store status, headers and body of cacheable responses with the route's TTL
//! - Collapse concurrent misses for one key into a single upstream call
//! - Flush entries by glob pattern on demand
//!
//! # Design Decisions
//! - Each response is stored under three keys (`headers:`, `status:`, `body:`) so a
//!   Redis-like backend can hold them without a serialization format
//! - Backend errors are logged at debug and read as misses

pub mod key;
pub mod layer;
pub mod locks;
pub mod store;

pub use key::CacheKeyBuilder;
pub use layer::{Cache, CacheService};
pub use locks::{KeyGuard, KeyedLocks};
pub use store::{CacheStore, MemoryStore, StoreError, StoreValue};

/// Flush every stored response whose key matches the glob `pattern`.
///
/// Returns the number of stored parts removed (three per response).
pub async fn invalidate(store: &dyn CacheStore, pattern: &str) -> Result<usize, StoreError> {
    let mut removed = 0;
    for stored in layer::stored_patterns(pattern) {
        removed += store.flush(&stored).await?;
    }
    tracing::info!(pattern = %pattern, removed, "Cache flushed");
    Ok(removed)
}
