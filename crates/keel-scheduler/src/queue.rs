//! Ready queue for stages waiting on a worker.

use keel_core::stage::{ConcurrencyLimit, Stage};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A stage whose barrier has cleared and whose predicate passed.
#[derive(Debug, Clone)]
pub struct QueuedStage {
    pub position: usize,
    pub priority: i32,
    pub concurrency: Option<ConcurrencyLimit>,
}

impl PartialEq for QueuedStage {
    fn eq(&self, other: &Self) -> bool {
        self.position == other.position
    }
}

impl Eq for QueuedStage {}

impl PartialOrd for QueuedStage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedStage {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier declared position
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.position.cmp(&self.position),
            other => other,
        }
    }
}

/// Ready queue enforcing the run-wide parallelism cap and concurrency groups.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    queue: BinaryHeap<QueuedStage>,
    max_parallel: Option<usize>,
    running: usize,
    group_running: HashMap<String, u32>,
}

impl ReadyQueue {
    pub fn new(max_parallel: Option<usize>) -> Self {
        Self {
            max_parallel,
            ..Default::default()
        }
    }

    pub fn enqueue(&mut self, stage: &Stage) {
        self.queue.push(QueuedStage {
            position: stage.position,
            priority: stage.priority,
            concurrency: stage.concurrency.clone(),
        });
    }

    /// Take the best stage that is within limits and for which `acquire`
    /// yields a resource (a worker). Stages that cannot start stay queued.
    pub fn dequeue_with<T>(
        &mut self,
        mut acquire: impl FnMut(usize) -> Option<T>,
    ) -> Option<(QueuedStage, T)> {
        if self.max_parallel.is_some_and(|max| self.running >= max) {
            return None;
        }

        let mut temp = Vec::new();
        let mut result = None;

        while let Some(stage) = self.queue.pop() {
            if self.within_group_limit(&stage)
                && let Some(resource) = acquire(stage.position)
            {
                self.running += 1;
                if let Some(ref limit) = stage.concurrency {
                    *self.group_running.entry(limit.group.clone()).or_insert(0) += 1;
                }
                result = Some((stage, resource));
                break;
            }
            temp.push(stage);
        }

        // Put back stages that couldn't start
        for stage in temp {
            self.queue.push(stage);
        }

        result
    }

    /// Mark a started stage as finished, freeing its slots.
    pub fn complete(&mut self, stage: &QueuedStage) {
        self.running = self.running.saturating_sub(1);
        if let Some(ref limit) = stage.concurrency
            && let Some(count) = self.group_running.get_mut(&limit.group)
        {
            *count = count.saturating_sub(1);
        }
    }

    /// Remove every queued stage, in priority order.
    pub fn drain(&mut self) -> Vec<usize> {
        let mut positions = Vec::with_capacity(self.queue.len());
        while let Some(stage) = self.queue.pop() {
            positions.push(stage.position);
        }
        positions
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn running(&self) -> usize {
        self.running
    }

    fn within_group_limit(&self, stage: &QueuedStage) -> bool {
        match stage.concurrency {
            Some(ref limit) => {
                self.group_running.get(&limit.group).copied().unwrap_or(0) < limit.limit
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::StageId;
    use keel_core::predicate::Predicate;
    use keel_core::worker::WorkerSelector;
    use std::collections::BTreeMap;

    fn stage(position: usize, priority: i32, group: Option<(&str, u32)>) -> Stage {
        Stage {
            id: StageId::new(format!("s{position}")),
            position,
            commands: vec!["true".to_string()],
            predicate: Predicate::Always,
            selector: WorkerSelector::new(),
            env: BTreeMap::new(),
            artifact_paths: Vec::new(),
            timeout_minutes: None,
            priority,
            concurrency: group.map(|(g, limit)| ConcurrencyLimit {
                group: g.to_string(),
                limit,
            }),
        }
    }

    #[test]
    fn test_priority_then_declared_order() {
        let mut queue = ReadyQueue::new(None);
        queue.enqueue(&stage(0, 0, None));
        queue.enqueue(&stage(1, 5, None));
        queue.enqueue(&stage(2, 0, None));

        let order: Vec<usize> = std::iter::from_fn(|| queue.dequeue_with(Some).map(|(s, _)| s.position))
            .collect();
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn test_concurrency_group_limit() {
        let mut queue = ReadyQueue::new(None);
        queue.enqueue(&stage(0, 0, Some(("deploy", 1))));
        queue.enqueue(&stage(1, 0, Some(("deploy", 1))));
        queue.enqueue(&stage(2, 0, None));

        let (first, _) = queue.dequeue_with(Some).unwrap();
        assert_eq!(first.position, 0);

        // Second deploy is blocked, the ungrouped stage overtakes it
        let (next, _) = queue.dequeue_with(Some).unwrap();
        assert_eq!(next.position, 2);
        assert!(queue.dequeue_with(Some).is_none());

        queue.complete(&first);
        let (second, _) = queue.dequeue_with(Some).unwrap();
        assert_eq!(second.position, 1);
    }

    #[test]
    fn test_max_parallel() {
        let mut queue = ReadyQueue::new(Some(1));
        queue.enqueue(&stage(0, 0, None));
        queue.enqueue(&stage(1, 0, None));

        let (first, _) = queue.dequeue_with(Some).unwrap();
        assert!(queue.dequeue_with(Some).is_none());
        queue.complete(&first);
        assert!(queue.dequeue_with(Some).is_some());
        assert_eq!(queue.running(), 1);
    }

    #[test]
    fn test_stage_without_resource_stays_queued() {
        let mut queue = ReadyQueue::new(None);
        queue.enqueue(&stage(0, 0, None));
        queue.enqueue(&stage(1, 0, None));

        let (got, worker) = queue
            .dequeue_with(|p| (p == 1).then_some("w1"))
            .unwrap();
        assert_eq!((got.position, worker), (1, "w1"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(), vec![0]);
        assert!(queue.is_empty());
    }
}
