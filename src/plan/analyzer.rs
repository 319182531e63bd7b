//! Dependency analyzer: inspects a validated task batch and computes
//! which footprints intersect, producing the conflict graph the
//! ownership assigner partitions.

use crate::core::errors::{FanoutError, Result};
use crate::model::{ResourcePattern, Task};
use petgraph::graph::{NodeIndex, UnGraph};
use tracing::debug;

/// Conflict graph over a task batch. Nodes carry the task's submission
/// index; an edge links two tasks whose footprints intersect and carries
/// the intersecting pattern pairs.
#[derive(Debug)]
pub struct ConflictGraph {
    pub graph: UnGraph<usize, Vec<(ResourcePattern, ResourcePattern)>>,
    nodes: Vec<NodeIndex>,
    /// Submission indices of tasks whose footprint is unknown
    pub unknown: Vec<usize>,
}

impl ConflictGraph {
    /// Submission indices of tasks conflicting with the given task
    pub fn conflicts_of(&self, task_index: usize) -> Vec<usize> {
        self.graph
            .neighbors(self.nodes[task_index])
            .map(|n| self.graph[n])
            .collect()
    }

    /// Intersecting pattern pairs between two tasks, if any
    pub fn intersection(
        &self,
        a: usize,
        b: usize,
    ) -> Option<&Vec<(ResourcePattern, ResourcePattern)>> {
        self.graph
            .find_edge(self.nodes[a], self.nodes[b])
            .map(|e| &self.graph[e])
    }

    pub fn conflict_count(&self) -> usize {
        self.graph.edge_count()
    }
}

/// Build the conflict graph for a batch. Tasks must already have passed
/// batch validation; an empty declared footprint slipping through here is
/// still rejected rather than silently assigned.
pub fn analyze(tasks: &[Task]) -> Result<ConflictGraph> {
    let mut graph = UnGraph::new_undirected();
    let mut nodes = Vec::with_capacity(tasks.len());
    let mut unknown = Vec::new();

    for task in tasks {
        if !task.footprint.is_unknown() && task.footprint.patterns().is_empty() {
            return Err(FanoutError::validation_field(
                format!("task '{}' has an empty declared footprint", task.id),
                "resource_footprint",
            ));
        }
        nodes.push(graph.add_node(task.submission_index));
        if task.footprint.is_unknown() {
            unknown.push(task.submission_index);
        }
    }

    for i in 0..tasks.len() {
        for j in (i + 1)..tasks.len() {
            let pairs = tasks[i].footprint.intersections(&tasks[j].footprint);
            if !pairs.is_empty() {
                let owned: Vec<_> = pairs
                    .into_iter()
                    .map(|(a, b)| (a.clone(), b.clone()))
                    .collect();
                debug!(
                    left = %tasks[i].id,
                    right = %tasks[j].id,
                    intersections = owned.len(),
                    "footprint conflict detected"
                );
                graph.add_edge(nodes[i], nodes[j], owned);
            }
        }
    }

    debug!(
        tasks = tasks.len(),
        conflicts = graph.edge_count(),
        unknown = unknown.len(),
        "conflict analysis complete"
    );

    Ok(ConflictGraph {
        graph,
        nodes,
        unknown,
    })
}
