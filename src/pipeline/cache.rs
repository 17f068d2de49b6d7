use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

/// Process-lifetime memoization keyed by token.
///
/// Each key owns a [`OnceCell`]; concurrent callers for the same missing key
/// queue on that cell so only one of them runs `compute`. A failed
/// computation leaves the cell empty and the next caller in line tries again;
/// the last failing caller drops the empty slot from the map.
pub struct ResolutionCache<V> {
    entries: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
}

impl<V: Clone> ResolutionCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the stored value for `key`, or run `compute` and store its
    /// result if it succeeds. Errors are returned as-is and never stored.
    pub async fn get_or_compute<E, F, Fut>(&self, key: &str, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell.get_or_try_init(compute).await.cloned();
        if result.is_err() {
            self.forget_empty(key, &cell).await;
        }
        result
    }

    // New callers clone the cell under the map lock, so a count of two (map
    // plus ours) means nobody else is queued on it.
    async fn forget_empty(&self, key: &str, cell: &Arc<OnceCell<V>>) {
        let mut entries = self.entries.lock().await;
        let idle = entries.get(key).is_some_and(|stored| {
            Arc::ptr_eq(stored, cell) && !stored.initialized() && Arc::strong_count(stored) == 2
        });
        if idle {
            entries.remove(key);
        }
    }

    /// Stored value for `key`, without computing anything.
    #[cfg(test)]
    pub async fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.lock().await;
        entries.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Number of keys holding a value.
    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().filter(|cell| cell.initialized()).count()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<V: Clone> Default for ResolutionCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
