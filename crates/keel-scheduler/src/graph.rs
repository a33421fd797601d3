//! Stage graph: batches of stages separated by `wait` barriers.

use keel_core::pipeline::BarrierPolicy;
use keel_core::stage::{Barrier, Stage};
use keel_core::{Error, Result};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

/// A node in the stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphNode {
    Stage(usize),
    /// Barrier gating batch `batch`.
    Barrier { batch: usize, policy: BarrierPolicy },
}

/// A maximal run of consecutive stages with no interposed barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub index: usize,
    /// Stage positions, in declared order.
    pub stages: Vec<usize>,
    /// Policy of the barrier in front of this batch; `None` for the first batch.
    pub gate: Option<BarrierPolicy>,
}

/// Stages plus the barrier structure between them.
///
/// Every stage of batch *i* has an edge into the barrier node of batch
/// *i+1*, which in turn has an edge to every stage of batch *i+1*.
#[derive(Debug)]
pub struct StageGraph {
    graph: DiGraph<GraphNode, ()>,
    stages: Vec<Stage>,
    stage_nodes: Vec<NodeIndex>,
    batches: Vec<Batch>,
}

impl StageGraph {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, position: usize) -> Option<&Stage> {
        self.stages.get(position)
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn batch_of(&self, position: usize) -> Option<&Batch> {
        self.batches.iter().find(|b| b.stages.contains(&position))
    }

    /// Stages that must be terminal before `position` may start: the whole
    /// previous batch.
    pub fn predecessors(&self, position: usize) -> Vec<usize> {
        let Some(&node) = self.stage_nodes.get(position) else {
            return Vec::new();
        };
        let mut preds: Vec<usize> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .flat_map(|barrier| self.graph.neighbors_directed(barrier, Direction::Incoming))
            .filter_map(|n| match self.graph[n] {
                GraphNode::Stage(p) => Some(p),
                GraphNode::Barrier { .. } => None,
            })
            .collect();
        preds.sort_unstable();
        preds
    }

    /// Check if a stage may start given which stages are terminal.
    pub fn is_ready(&self, position: usize, is_terminal: impl Fn(usize) -> bool) -> bool {
        self.predecessors(position).into_iter().all(is_terminal)
    }

    /// Stage positions in an order respecting every barrier.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let order = toposort(&self.graph, None)
            .map_err(|_| Error::Internal("cycle in stage graph".to_string()))?;
        Ok(order
            .into_iter()
            .filter_map(|n| match self.graph[n] {
                GraphNode::Stage(p) => Some(p),
                GraphNode::Barrier { .. } => None,
            })
            .collect())
    }
}

/// Builder for constructing stage graphs.
pub struct StageGraphBuilder {
    default_policy: BarrierPolicy,
}

impl StageGraphBuilder {
    pub fn new(default_policy: BarrierPolicy) -> Self {
        Self { default_policy }
    }

    /// Split `stages` into batches at the barrier positions.
    ///
    /// Barriers with no stage before them, or none after them, are dropped.
    /// Consecutive barriers collapse into one carrying the strictest policy.
    pub fn build(&self, stages: Vec<Stage>, barriers: &[Barrier]) -> Result<StageGraph> {
        if stages.is_empty() {
            return Err(Error::Configuration("pipeline has no stages".to_string()));
        }
        if let Some((i, stage)) = stages.iter().enumerate().find(|(i, s)| s.position != *i) {
            return Err(Error::Internal(format!(
                "stage `{}` has position {} but sits at index {i}",
                stage.id, stage.position
            )));
        }

        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut gate = None;
        let mut pending: Option<BarrierPolicy> = None;
        let mut next_barrier = 0;

        for position in 0..stages.len() {
            while let Some(barrier) = barriers.get(next_barrier).filter(|b| b.after <= position) {
                let policy = barrier.policy.unwrap_or(self.default_policy);
                pending = Some(pending.map_or(policy, |p| p.strictest(policy)));
                next_barrier += 1;
            }
            if let Some(policy) = pending.take()
                && !current.is_empty()
            {
                batches.push(Batch {
                    index: batches.len(),
                    stages: std::mem::take(&mut current),
                    gate,
                });
                gate = Some(policy);
            }
            current.push(position);
        }
        batches.push(Batch {
            index: batches.len(),
            stages: current,
            gate,
        });

        let mut graph = DiGraph::new();
        let stage_nodes: Vec<NodeIndex> = (0..stages.len())
            .map(|p| graph.add_node(GraphNode::Stage(p)))
            .collect();

        for pair in batches.windows(2) {
            let (prior, next) = (&pair[0], &pair[1]);
            let barrier = graph.add_node(GraphNode::Barrier {
                batch: next.index,
                policy: next.gate.unwrap_or(self.default_policy),
            });
            for &p in &prior.stages {
                graph.add_edge(stage_nodes[p], barrier, ());
            }
            for &p in &next.stages {
                graph.add_edge(barrier, stage_nodes[p], ());
            }
        }

        debug!(
            stages = stages.len(),
            batches = batches.len(),
            declared_barriers = barriers.len(),
            "Built stage graph"
        );

        Ok(StageGraph {
            graph,
            stages,
            stage_nodes,
            batches,
        })
    }
}

impl Default for StageGraphBuilder {
    fn default() -> Self {
        Self::new(BarrierPolicy::default())
    }
}
