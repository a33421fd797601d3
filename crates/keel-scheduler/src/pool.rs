//! Worker pool: the single synchronized resource manager for workers.

use keel_core::worker::{Worker, WorkerSelector, WorkerStatus};
use keel_core::{Error, Result, WorkerId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::debug;

struct Slot {
    worker: Worker,
    busy: bool,
}

/// Pool of workers with mutually exclusive acquire/release.
pub struct WorkerPool {
    slots: Mutex<Vec<Slot>>,
    released: Notify,
}

impl WorkerPool {
    pub fn new(workers: Vec<Worker>) -> Result<Arc<Self>> {
        let mut seen = HashSet::new();
        for worker in &workers {
            if !seen.insert(worker.id.clone()) {
                return Err(Error::Configuration(format!("duplicate worker id `{}`", worker.id)));
            }
        }

        Ok(Arc::new(Self {
            slots: Mutex::new(
                workers
                    .into_iter()
                    .map(|worker| Slot { worker, busy: false })
                    .collect(),
            ),
            released: Notify::new(),
        }))
    }

    /// Acquire an idle worker matching `selector`, preferring the one with the
    /// fewest tags. The worker returns to the pool when the lease drops.
    pub fn try_acquire(self: &Arc<Self>, selector: &WorkerSelector) -> Option<WorkerLease> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.busy && s.worker.satisfies(selector))
            .min_by_key(|(i, s)| (s.worker.tags.len(), *i))
            .map(|(i, _)| i)?;

        slots[index].busy = true;
        let worker = slots[index].worker.clone();
        debug!(worker = %worker.id, %selector, "Worker acquired");

        Some(WorkerLease {
            pool: Arc::clone(self),
            index,
            worker,
        })
    }

    /// Whether any worker, busy or not, could ever run a stage with `selector`.
    pub fn can_ever_satisfy(&self, selector: &WorkerSelector) -> bool {
        self.slots.lock().iter().any(|s| s.worker.satisfies(selector))
    }

    /// Ids of every worker matching `selector`.
    pub fn matching(&self, selector: &WorkerSelector) -> Vec<WorkerId> {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.worker.satisfies(selector))
            .map(|s| s.worker.id.clone())
            .collect()
    }

    /// Future completing on the next release. Enable it before checking for
    /// idle workers to avoid missing a release in between.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    pub fn snapshot(&self) -> Vec<(Worker, WorkerStatus)> {
        self.slots
            .lock()
            .iter()
            .map(|s| {
                let status = if s.busy {
                    WorkerStatus::Busy
                } else {
                    WorkerStatus::Idle
                };
                (s.worker.clone(), status)
            })
            .collect()
    }

    pub fn idle_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| !s.busy).count()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn release(&self, index: usize) {
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(index) {
                slot.busy = false;
                debug!(worker = %slot.worker.id, "Worker released");
            }
        }
        self.released.notify_waiters();
    }
}

/// Exclusive use of one worker.
pub struct WorkerLease {
    pool: Arc<WorkerPool>,
    index: usize,
    worker: Worker,
}

impl WorkerLease {
    pub fn worker(&self) -> &Worker {
        &self.worker
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.worker.id)
            .finish()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn production() -> WorkerSelector {
        WorkerSelector::new().with("production", "true")
    }

    #[test]
    fn test_no_double_assignment() {
        let pool = WorkerPool::new(vec![Worker::new("w1").tag("production", "true")]).unwrap();

        let lease = pool.try_acquire(&production()).unwrap();
        assert_eq!(lease.worker().id.as_str(), "w1");
        assert!(pool.try_acquire(&production()).is_none());
        assert_eq!(pool.idle_count(), 0);

        drop(lease);
        assert!(pool.try_acquire(&production()).is_some());
    }

    #[test]
    fn test_prefers_least_specialised_worker() {
        let pool = WorkerPool::new(vec![
            Worker::new("gpu").tag("production", "true").tag("gpu", "a100"),
            Worker::new("plain").tag("production", "true"),
        ])
        .unwrap();

        let lease = pool.try_acquire(&production()).unwrap();
        assert_eq!(lease.worker().id.as_str(), "plain");
    }

    #[test]
    fn test_starvation_detection() {
        let pool = WorkerPool::new(vec![Worker::new("w1").tag("os", "linux")]).unwrap();
        let _lease = pool.try_acquire(&WorkerSelector::new()).unwrap();

        // Busy workers still count.
        assert!(pool.can_ever_satisfy(&WorkerSelector::new().with("os", "linux")));
        assert!(!pool.can_ever_satisfy(&production()));
        assert!(pool.matching(&production()).is_empty());
    }

    #[test]
    fn test_duplicate_worker_ids() {
        let err = WorkerPool::new(vec![Worker::new("w1"), Worker::new("w1")]).err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_release_wakes_waiters() {
        let pool = WorkerPool::new(vec![Worker::new("w1")]).unwrap();
        let lease = pool.try_acquire(&WorkerSelector::new()).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let released = pool.released();
                tokio::pin!(released);
                released.as_mut().enable();
                if pool.idle_count() == 0 {
                    released.await;
                }
                pool.try_acquire(&WorkerSelector::new()).is_some()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(lease);

        let acquired = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired);
    }
}
