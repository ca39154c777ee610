//! Advisory in-flight operation tracking.
//!
//! Tracks pending operation ids per resource key for idempotency checks
//! and observability. This does not block anything — serialization is the
//! lock manager's job, upstream of this. Stale entries are swept after a
//! timeout so a crashed operation cannot pin its id forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

/// Pending operations older than this are considered leaked
pub const STALE_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct KeyState {
    pending: HashMap<String, Instant>,
    sequence: u64,
}

type StateMap = Arc<StdMutex<HashMap<String, KeyState>>>;

pub struct AtomicOperationCoordinator {
    state: StateMap,
    timeout: Duration,
}

impl AtomicOperationCoordinator {
    pub fn new() -> Self {
        Self::with_timeout(STALE_OPERATION_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            state: Arc::new(StdMutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Register an operation id under a key. Returns true when the id is
    /// new, false when it is already pending (a duplicate begin). A stale
    /// sweep is scheduled for the entry.
    pub fn begin(&self, key: &str, op_id: &str) -> bool {
        let started = {
            let mut map = self.state.lock().expect("coordinator state poisoned");
            let state = map.entry(key.to_string()).or_default();
            if state.pending.contains_key(op_id) {
                return false;
            }
            let now = Instant::now();
            state.pending.insert(op_id.to_string(), now);
            now
        };

        let state = Arc::clone(&self.state);
        let (key, op_id) = (key.to_string(), op_id.to_string());
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut map = state.lock().expect("coordinator state poisoned");
            if let Some(entry) = map.get_mut(&key) {
                if entry.pending.get(&op_id) == Some(&started) {
                    entry.pending.remove(&op_id);
                    log::warn!(
                        "Atomic coordinator: operation {} on {} still pending after {:?}, cleaning up",
                        op_id,
                        key,
                        timeout,
                    );
                }
            }
        });
        true
    }

    /// Clear a pending operation and bump the key's sequence counter.
    /// Returns the new sequence, or None when the id was not pending
    /// (already completed, or swept as stale).
    pub fn complete(&self, key: &str, op_id: &str) -> Option<u64> {
        let mut map = self.state.lock().expect("coordinator state poisoned");
        let state = map.get_mut(key)?;
        state.pending.remove(op_id)?;
        state.sequence += 1;
        Some(state.sequence)
    }

    /// Completed-operation count for a key since startup.
    pub fn sequence(&self, key: &str) -> u64 {
        let map = self.state.lock().expect("coordinator state poisoned");
        map.get(key).map(|s| s.sequence).unwrap_or(0)
    }

    pub fn pending_count(&self, key: &str) -> usize {
        let map = self.state.lock().expect("coordinator state poisoned");
        map.get(key).map(|s| s.pending.len()).unwrap_or(0)
    }
}

impl Default for AtomicOperationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_begin_is_rejected() {
        let coordinator = AtomicOperationCoordinator::new();
        assert!(coordinator.begin("note:a", "op-1"));
        assert!(!coordinator.begin("note:a", "op-1"));
        assert!(coordinator.begin("note:a", "op-2"));
        assert_eq!(coordinator.pending_count("note:a"), 2);
    }

    #[tokio::test]
    async fn test_complete_bumps_sequence() {
        let coordinator = AtomicOperationCoordinator::new();
        coordinator.begin("note:a", "op-1");
        coordinator.begin("note:a", "op-2");

        assert_eq!(coordinator.complete("note:a", "op-1"), Some(1));
        assert_eq!(coordinator.complete("note:a", "op-2"), Some(2));
        // Completing twice is a no-op
        assert_eq!(coordinator.complete("note:a", "op-2"), None);
        assert_eq!(coordinator.sequence("note:a"), 2);
    }

    #[tokio::test]
    async fn test_stale_entries_are_swept() {
        let coordinator = AtomicOperationCoordinator::with_timeout(Duration::from_millis(10));
        coordinator.begin("note:a", "op-1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.pending_count("note:a"), 0);
        // A swept operation no longer counts as pending
        assert_eq!(coordinator.complete("note:a", "op-1"), None);
    }
}
