//! Per-resource serialization.
//!
//! One logical lock per resource key. Waiters on a key run in FIFO order
//! (tokio's mutex is fair), so for any key the Nth operation never starts
//! before the (N-1)th has fully settled. Key entries are dropped from the
//! map once the last holder or waiter departs, so the map never grows
//! beyond the set of keys currently in use.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    holders: usize,
}

type LockMap = Arc<StdMutex<HashMap<String, LockEntry>>>;

pub struct LockManager {
    locks: LockMap,
}

/// Registration of interest in a key. Dropping deregisters and removes
/// the map entry when nobody else holds or waits on the key. Held even
/// while still waiting, so a cancelled acquire cannot leak an entry.
struct Registration {
    key: String,
    locks: LockMap,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut map = self.locks.lock().expect("lock map poisoned");
        if let Some(entry) = map.get_mut(&self.key) {
            entry.holders -= 1;
            if entry.holders == 0 {
                map.remove(&self.key);
            }
        }
    }
}

/// Held lock on one key.
pub struct LockGuard {
    _permit: OwnedMutexGuard<()>,
    _registration: Registration,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Acquire the lock for one key, waiting behind earlier acquirers.
    pub async fn acquire(&self, key: &str) -> LockGuard {
        let mutex = {
            let mut map = self.locks.lock().expect("lock map poisoned");
            let entry = map.entry(key.to_string()).or_insert_with(|| LockEntry {
                mutex: Arc::new(Mutex::new(())),
                holders: 0,
            });
            entry.holders += 1;
            Arc::clone(&entry.mutex)
        };
        let registration = Registration {
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
        };
        let permit = mutex.lock_owned().await;
        LockGuard {
            _permit: permit,
            _registration: registration,
        }
    }

    /// Run an operation while holding the lock for `key`. The future is
    /// not polled until the lock is held.
    pub async fn run_serialized<T, Fut>(&self, key: &str, op: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key).await;
        op.await
    }

    /// Run an operation while holding every key in `keys`. Keys are
    /// acquired in sorted order so two multi-key operations can never
    /// deadlock against each other.
    pub async fn run_serialized_multi<T, Fut>(&self, keys: &[String], op: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            guards.push(self.acquire(key).await);
        }
        op.await
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_operations_are_totally_ordered_per_key() {
        let manager = Arc::new(LockManager::new());
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();

        for i in 0..8 {
            let manager = Arc::clone(&manager);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                manager
                    .run_serialized("note:a", async move {
                        order.lock().unwrap().push((i, "start"));
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        order.lock().unwrap().push((i, "end"));
                    })
                    .await;
            }));
            // Give each task a chance to enqueue before the next
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let order = order.lock().unwrap();
        // Every start is immediately followed by its own end
        for pair in order.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "start");
            assert_eq!(pair[1].1, "end");
        }
    }

    #[tokio::test]
    async fn test_distinct_keys_run_concurrently() {
        let manager = Arc::new(LockManager::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for i in 0..4 {
            let manager = Arc::clone(&manager);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                manager
                    .run_serialized(&format!("note:{}", i), async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_lock_map_is_garbage_collected() {
        let manager = LockManager::new();
        manager.run_serialized("note:a", async {}).await;
        manager
            .run_serialized_multi(&["b".to_string(), "a".to_string()], async {})
            .await;
        assert_eq!(manager.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_opposite_order_multi_key_does_not_deadlock() {
        let manager = Arc::new(LockManager::new());
        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .run_serialized_multi(
                        &["note:a".to_string(), "note:b".to_string()],
                        async { tokio::time::sleep(Duration::from_millis(5)).await },
                    )
                    .await;
            })
        };
        let second = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .run_serialized_multi(
                        &["note:b".to_string(), "note:a".to_string()],
                        async { tokio::time::sleep(Duration::from_millis(5)).await },
                    )
                    .await;
            })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .expect("multi-key locking deadlocked");
    }
}
