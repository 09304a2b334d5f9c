use crate::domain::flow_instance::FlowInstanceId;
use crate::CoreError;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

/// Queue of instances that are due for advancement
///
/// An instance is queued at most once; enqueueing it again before a worker
/// picked it up is a no-op.
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<FlowInstanceId>,
    rx: Mutex<mpsc::UnboundedReceiver<FlowInstanceId>>,
    queued: DashSet<FlowInstanceId>,
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            queued: DashSet::new(),
        }
    }

    /// Admit an instance; returns false when it was already queued
    pub fn enqueue(&self, id: FlowInstanceId) -> bool {
        if !self.queued.insert(id.clone()) {
            return false;
        }
        if self.tx.send(id.clone()).is_err() {
            self.queued.remove(&id);
            return false;
        }
        true
    }

    /// Wait for the next queued instance
    pub async fn next(&self) -> Option<FlowInstanceId> {
        let id = self.rx.lock().await.recv().await?;
        self.queued.remove(&id);
        Some(id)
    }

    /// Take the next queued instance without waiting
    pub fn try_next(&self) -> Option<FlowInstanceId> {
        let id = self.rx.try_lock().ok()?.try_recv().ok()?;
        self.queued.remove(&id);
        Some(id)
    }

    /// Number of queued instances
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Held while an instance is owned by a worker
pub type InstanceGuard = OwnedMutexGuard<()>;

/// Per-instance exclusive locks
#[derive(Default)]
pub struct InstanceLocks {
    locks: DashMap<FlowInstanceId, Arc<Mutex<()>>>,
}

impl InstanceLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock of an instance, waiting at most `wait`
    pub async fn acquire(
        &self,
        id: &FlowInstanceId,
        wait: Duration,
    ) -> Result<InstanceGuard, CoreError> {
        let lock = self.locks.entry(id.clone()).or_default().clone();

        tokio::time::timeout(wait, lock.lock_owned())
            .await
            .map_err(|_| {
                CoreError::ConcurrencyConflict(format!(
                    "Flow instance {} is locked by another worker",
                    id
                ))
            })
    }

    /// Drop the lock entry of an instance that reached a terminal status
    pub fn forget(&self, id: &FlowInstanceId) {
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_dedupes() {
        let queue = WorkQueue::new();
        let id = FlowInstanceId::from("a");

        assert!(queue.enqueue(id.clone()));
        assert!(!queue.enqueue(id.clone()));
        assert!(queue.enqueue(FlowInstanceId::from("b")));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.next().await, Some(id.clone()));
        assert!(queue.enqueue(id.clone()));
        assert_eq!(queue.try_next(), Some(FlowInstanceId::from("b")));
        assert_eq!(queue.try_next(), Some(id));
        assert_eq!(queue.try_next(), None);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_contention() {
        let locks = InstanceLocks::new();
        let id = FlowInstanceId::from("a");

        let guard = locks.acquire(&id, Duration::from_secs(1)).await.unwrap();
        let contended = locks.acquire(&id, Duration::from_millis(100)).await;
        assert!(matches!(contended, Err(CoreError::ConcurrencyConflict(_))));

        let other = locks.acquire(&FlowInstanceId::from("b"), Duration::from_millis(100)).await;
        assert!(other.is_ok());

        drop(guard);
        assert!(locks.acquire(&id, Duration::from_millis(100)).await.is_ok());
    }
}
