//! Reuse pool for request contexts.

use std::sync::{Arc, Mutex, PoisonError};

use crate::config::MountPoint;
use crate::context::{ChainContext, RequestContext};

type Slot = Arc<Mutex<RequestContext>>;

/// Pool of context allocations.
///
/// A slot goes back to the pool only when no handle to it survives the request,
/// so a context is never visible to two requests at once.
#[derive(Debug)]
pub struct ContextPool {
    free: Mutex<Vec<Slot>>,
    max_idle: usize,
}

impl ContextPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            max_idle,
        }
    }

    /// Take a context and reset it against `conf`.
    pub fn acquire(self: &Arc<Self>, conf: Arc<MountPoint>) -> PooledContext {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let slot = match reused {
            Some(slot) => {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .reset(conf);
                slot
            }
            None => Arc::new(Mutex::new(RequestContext::new(conf))),
        };

        PooledContext {
            slot,
            pool: self.clone(),
        }
    }

    fn release(&self, slot: Slot) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_idle {
            free.push(slot);
        }
    }

    /// Number of idle contexts waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A context on loan from the pool. Returned on drop, including during unwinding.
#[derive(Debug)]
pub struct PooledContext {
    slot: Slot,
    pool: Arc<ContextPool>,
}

impl PooledContext {
    pub fn handle(&self) -> ChainContext {
        ChainContext::from_slot(self.slot.clone())
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if Arc::strong_count(&self.slot) == 1 {
            self.pool.release(self.slot.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CacheStatus;

    #[test]
    fn test_released_context_is_reset_on_reuse() {
        let pool = Arc::new(ContextPool::new(4));
        let a = Arc::new(MountPoint::new("/a/", "http://a"));
        let b = Arc::new(MountPoint::new("/b/", "http://b"));

        {
            let pooled = pool.acquire(a);
            pooled.handle().set_cache_status(CacheStatus::Hit);
        }
        assert_eq!(pool.idle(), 1);

        let pooled = pool.acquire(b.clone());
        let ctx = pooled.handle();
        assert_eq!(pool.idle(), 0);
        assert!(ctx.cache_status().is_none());
        assert!(Arc::ptr_eq(&ctx.conf(), &b));
    }

    #[test]
    fn test_retained_handle_is_not_recycled() {
        let pool = Arc::new(ContextPool::new(4));
        let conf = Arc::new(MountPoint::default());

        let pooled = pool.acquire(conf);
        let leaked = pooled.handle();
        drop(pooled);
        assert_eq!(pool.idle(), 0);

        leaked.set_cache_status(CacheStatus::Miss);
        assert_eq!(leaked.cache_status(), Some(CacheStatus::Miss));
    }

    #[test]
    fn test_idle_cap() {
        let pool = Arc::new(ContextPool::new(1));
        let conf = Arc::new(MountPoint::default());
        let first = pool.acquire(conf.clone());
        let second = pool.acquire(conf);
        drop(first);
        drop(second);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_released_during_panic() {
        let pool = Arc::new(ContextPool::new(4));
        let conf = Arc::new(MountPoint::default());
        let p = pool.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _pooled = p.acquire(conf);
            panic!("stage failed");
        }));
        assert!(result.is_err());
        assert_eq!(pool.idle(), 1);
    }
}
