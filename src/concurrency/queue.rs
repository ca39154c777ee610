//! Priority task queues, one per scope key.
//!
//! Each key gets an independent concurrency-1 queue: at most one task for
//! a key runs at a time, and pending tasks are admitted by priority, then
//! FIFO. A higher-priority task never preempts a task that is already
//! executing. Multi-key adds acquire queues in sorted key order through
//! nested scheduling, which gives the same no-deadlock property as the
//! lock manager's multi-key path.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::oneshot;

use crate::error::{HistoryError, Result};

/// Admission priority. Lower value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
type Job = BoxFuture<()>;

struct PendingTask {
    priority: Priority,
    seq: u64,
    job: Job,
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    // BinaryHeap pops its greatest element; invert so the lowest
    // (priority, seq) pair pops first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

#[derive(Default)]
struct KeyQueue {
    running: bool,
    pending: BinaryHeap<PendingTask>,
}

type QueueMap = Arc<StdMutex<HashMap<String, KeyQueue>>>;

pub struct QueueService {
    queues: QueueMap,
    seq: AtomicU64,
}

impl QueueService {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(StdMutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
        }
    }

    /// Queue a task under one or more scope keys and await its result.
    /// Returns `Cancelled` when the pending task was dropped by `clear`.
    pub async fn add<T, Fut>(&self, keys: Vec<String>, priority: Priority, task: Fut) -> Result<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut keys = keys;
        keys.sort();
        keys.dedup();

        if keys.is_empty() {
            return Ok(task.await);
        }

        // Wrap from the innermost key outward: the task for the first
        // sorted key, once running, enqueues onto the second, and so on.
        let mut fut: BoxFuture<Result<T>> = Box::pin(async move { Ok(task.await) });
        for key in keys.into_iter().rev() {
            fut = self.enqueue_level(key, priority, fut);
        }
        fut.await
    }

    /// Drop every pending (not running) task for a key. Their callers
    /// observe `Cancelled`. Teardown only — a cleared task is gone for
    /// good, so this is unsafe while the engine is live.
    pub fn clear(&self, key: &str) {
        let mut map = self.queues.lock().expect("queue map poisoned");
        if let Some(queue) = map.get_mut(key) {
            let dropped = queue.pending.len();
            queue.pending.clear();
            if !queue.running {
                map.remove(key);
            }
            if dropped > 0 {
                log::warn!("Queue service: cleared {} pending task(s) for {}", dropped, key);
            }
        }
    }

    pub fn pending_count(&self, key: &str) -> usize {
        let map = self.queues.lock().expect("queue map poisoned");
        map.get(key).map(|q| q.pending.len()).unwrap_or(0)
    }

    fn enqueue_level<T: Send + 'static>(
        &self,
        key: String,
        priority: Priority,
        inner: BoxFuture<Result<T>>,
    ) -> BoxFuture<Result<T>> {
        let queues = Arc::clone(&self.queues);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let (tx, rx) = oneshot::channel::<Result<T>>();
            let job: Job = Box::pin(async move {
                let out = inner.await;
                let _ = tx.send(out);
            });
            schedule_job(&queues, &key, priority, seq, job);
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(HistoryError::Cancelled),
            }
        })
    }
}

impl Default for QueueService {
    fn default() -> Self {
        Self::new()
    }
}

fn schedule_job(queues: &QueueMap, key: &str, priority: Priority, seq: u64, job: Job) {
    let immediate = {
        let mut map = queues.lock().expect("queue map poisoned");
        let queue = map.entry(key.to_string()).or_default();
        if queue.running {
            queue.pending.push(PendingTask { priority, seq, job });
            None
        } else {
            queue.running = true;
            Some(job)
        }
    };
    if let Some(job) = immediate {
        drive_queue(Arc::clone(queues), key.to_string(), job);
    }
}

/// Run the given job, then keep draining the key's pending heap until it
/// is empty, at which point the key entry is garbage-collected.
fn drive_queue(queues: QueueMap, key: String, first: Job) {
    tokio::spawn(async move {
        let mut job = first;
        loop {
            job.await;
            let next = {
                let mut map = queues.lock().expect("queue map poisoned");
                match map.get_mut(&key).and_then(|q| q.pending.pop()) {
                    Some(task) => Some(task.job),
                    None => {
                        map.remove(&key);
                        None
                    }
                }
            };
            match next {
                Some(next_job) => job = next_job,
                None => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_high_priority_runs_before_pending_normal() {
        let service = Arc::new(QueueService::new());
        let order = Arc::new(StdMutex::new(Vec::new()));

        // Occupy the key so subsequent adds pile up as pending
        let blocker = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .add(keys(&["note:a"]), Priority::Normal, async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                    })
                    .await
                    .unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let low = {
            let (service, order) = (Arc::clone(&service), Arc::clone(&order));
            tokio::spawn(async move {
                service
                    .add(keys(&["note:a"]), Priority::Low, async move {
                        order.lock().unwrap().push("low");
                    })
                    .await
                    .unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let high = {
            let (service, order) = (Arc::clone(&service), Arc::clone(&order));
            tokio::spawn(async move {
                service
                    .add(keys(&["note:a"]), Priority::High, async move {
                        order.lock().unwrap().push("high");
                    })
                    .await
                    .unwrap();
            })
        };

        blocker.await.unwrap();
        low.await.unwrap();
        high.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_clear_cancels_pending_tasks() {
        let service = Arc::new(QueueService::new());

        let blocker = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .add(keys(&["note:a"]), Priority::Normal, async {
                        tokio::time::sleep(Duration::from_millis(40)).await;
                    })
                    .await
                    .unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let pending = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .add(keys(&["note:a"]), Priority::Normal, async { 42 })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(service.pending_count("note:a"), 1);

        service.clear("note:a");

        match pending.await.unwrap() {
            Err(HistoryError::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other),
        }
        blocker.await.unwrap();
    }

    #[tokio::test]
    async fn test_multi_key_opposite_order_completes() {
        let service = Arc::new(QueueService::new());
        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .add(keys(&["a", "b"]), Priority::Normal, async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    })
                    .await
                    .unwrap();
            })
        };
        let second = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .add(keys(&["b", "a"]), Priority::Normal, async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    })
                    .await
                    .unwrap();
            })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .expect("multi-key queueing deadlocked");
    }

    #[tokio::test]
    async fn test_returns_task_result() {
        let service = QueueService::new();
        let result = service
            .add(keys(&["note:a"]), Priority::Normal, async { "done" })
            .await
            .unwrap();
        assert_eq!(result, "done");
    }
}
