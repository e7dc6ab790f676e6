//! Per-key locks for single-flight cache fills.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as KeyMutex, OwnedMutexGuard};

/// Map from cache key to a dedicated lock.
///
/// The std mutex guards structure only (get-or-create and delete) and is never held
/// across an await. The per-key tokio mutex provides the actual exclusion.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<KeyMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the caller is the only holder for `key`.
    ///
    /// Cancelling the wait is safe: the pending guard cleans the entry up on drop.
    pub async fn lock(self: &Arc<Self>, key: &str) -> KeyGuard {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();

        let mut pending = KeyGuard {
            key: key.to_string(),
            lock: lock.clone(),
            registry: self.clone(),
            guard: None,
        };
        pending.guard = Some(lock.lock_owned().await);
        pending
    }

    /// Number of keys with a live lock.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive hold on one key. Dropping it unlocks, and the last holder deletes the entry.
pub struct KeyGuard {
    key: String,
    lock: Arc<KeyMutex<()>>,
    registry: Arc<KeyedLocks>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut locks = self
            .registry
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Registry entry, `self.lock`, plus either the owned guard or our own pending
        // acquisition. Every other holder or waiter adds at least two more.
        let unclaimed = Arc::strong_count(&self.lock) <= 3;
        let same_entry = locks
            .get(&self.key)
            .map(|entry| Arc::ptr_eq(entry, &self.lock))
            .unwrap_or(false);
        if unclaimed && same_entry {
            locks.remove(&self.key);
        }

        // Unlock while structure changes are still excluded.
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_one_holder_per_key() {
        let locks = Arc::new(KeyedLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("GET/hot").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = Arc::new(KeyedLocks::new());
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak() {
        let locks = Arc::new(KeyedLocks::new());
        let holder = locks.lock("k").await;
        let waited = tokio::time::timeout(Duration::from_millis(20), locks.lock("k")).await;
        assert!(waited.is_err());
        drop(holder);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_entry_deleted_after_release() {
        let locks = Arc::new(KeyedLocks::new());
        {
            let _guard = locks.lock("k").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }
}
