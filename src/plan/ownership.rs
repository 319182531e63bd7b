//! Ownership assigner: partitions resources across workers so that no
//! two concurrently-running workers own an overlapping resource, and
//! defers every contested resource to the sequential phase.

use crate::core::errors::{FanoutError, Result};
use crate::model::{ResourceAddress, ResourcePattern, Task, UNKNOWN_SHARED_BUCKET};
use crate::plan::analyzer::ConflictGraph;
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

/// One worker's assignment: an exclusive set of resource patterns and the
/// tasks (submission indices) it runs, in dependency order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerGroup {
    pub worker_id: String,
    pub task_indices: Vec<usize>,
    pub exclusive: Vec<ResourcePattern>,
}

/// A resource touched by more than one task, with its touchers in
/// submission order. Resolved strictly sequentially after the parallel
/// phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedResource {
    pub pattern: ResourcePattern,
    pub address: ResourceAddress,
    pub task_indices: Vec<usize>,
}

/// The conflict-free partition produced at planning time. Created once
/// per session and only consumed afterwards, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnershipAssignment {
    pub groups: Vec<WorkerGroup>,
    /// Shared resources ordered by the submission index of their first toucher
    pub shared: Vec<SharedResource>,
    /// Tasks with no parallel work left; they exist only through shared
    /// resolutions
    pub deferred: Vec<usize>,
}

impl OwnershipAssignment {
    /// Re-check that exclusive sets are pairwise disjoint across workers.
    /// A failure here is an assigner bug, not a caller error.
    pub fn verify_disjoint(&self) -> Result<()> {
        for (i, a) in self.groups.iter().enumerate() {
            for b in self.groups.iter().skip(i + 1) {
                for pa in &a.exclusive {
                    for pb in &b.exclusive {
                        if pa.intersects(pb) {
                            return Err(FanoutError::internal(format!(
                                "exclusive sets overlap: {} ({}) vs {} ({})",
                                a.worker_id, pa, b.worker_id, pb
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn group_of_task(&self, task_index: usize) -> Option<&WorkerGroup> {
        self.groups
            .iter()
            .find(|g| g.task_indices.contains(&task_index))
    }
}

/// Partition a batch given its conflict graph.
///
/// Returns a rejection, never a partial assignment, when a task cannot be
/// isolated: a match-all footprint in a multi-task batch, a task that
/// conflicts with every sibling, or a dependency on a task that can only
/// run sequentially.
pub fn assign(tasks: &[Task], graph: &ConflictGraph) -> Result<OwnershipAssignment> {
    let n = tasks.len();
    if n == 0 {
        return Ok(OwnershipAssignment::default());
    }

    for task in tasks {
        let match_all = task.footprint.patterns().iter().any(|p| p.is_match_all());
        if match_all && n > 1 {
            return Err(FanoutError::ownership_conflict(
                &task.id,
                "footprint matches every resource and cannot be isolated",
            ));
        }
    }
    if n >= 3 {
        for task in tasks {
            if graph.conflicts_of(task.submission_index).len() == n - 1 {
                return Err(FanoutError::ownership_conflict(
                    &task.id,
                    "footprint intersects every other task in the batch",
                ));
            }
        }
    }

    // Every pattern involved in any conflict leaves both exclusive sets;
    // the narrower side becomes the canonical shared resource.
    let mut excluded: Vec<HashSet<ResourcePattern>> = vec![HashSet::new(); n];
    let mut shared_map: BTreeMap<String, (ResourcePattern, usize, BTreeSet<usize>)> =
        BTreeMap::new();
    for i in 0..n {
        for j in graph.conflicts_of(i) {
            if j <= i {
                continue;
            }
            let pairs = graph
                .intersection(i, j)
                .ok_or_else(|| FanoutError::internal("conflict edge missing intersection"))?;
            for (p, q) in pairs {
                excluded[i].insert(p.clone());
                excluded[j].insert(q.clone());
                let canonical = p.narrower(q).clone();
                let key = canonical.to_string();
                let entry = shared_map
                    .entry(key)
                    .or_insert_with(|| (canonical, i.min(j), BTreeSet::new()));
                entry.1 = entry.1.min(i.min(j));
                entry.2.insert(i);
                entry.2.insert(j);
            }
        }
    }
    if !graph.unknown.is_empty() {
        let bucket = ResourcePattern::Exact(ResourceAddress::new(UNKNOWN_SHARED_BUCKET)?);
        let first = graph.unknown.iter().copied().min().unwrap_or(0);
        let entry = shared_map
            .entry(bucket.to_string())
            .or_insert_with(|| (bucket, first, BTreeSet::new()));
        entry.2.extend(graph.unknown.iter().copied());
    }

    // Exclusive set per task; a task with nothing left runs only in the
    // sequential phase.
    let mut exclusive: Vec<Vec<ResourcePattern>> = Vec::with_capacity(n);
    let mut deferred: BTreeSet<usize> = BTreeSet::new();
    for (i, task) in tasks.iter().enumerate() {
        let remaining: Vec<ResourcePattern> = task
            .footprint
            .patterns()
            .iter()
            .filter(|p| !excluded[i].contains(*p))
            .cloned()
            .collect();
        if remaining.is_empty() {
            deferred.insert(i);
        }
        exclusive.push(remaining);
    }

    // A parallel task depending on a sequential-only task would silently
    // serialize the parallel phase; escalate instead.
    let index_of: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    for (i, task) in tasks.iter().enumerate() {
        if deferred.contains(&i) {
            continue;
        }
        for dep in &task.dependencies {
            let dep_index = index_of[dep.as_str()];
            if deferred.contains(&dep_index) {
                return Err(FanoutError::ownership_conflict(
                    &task.id,
                    format!("depends on '{dep}', which can only run sequentially"),
                ));
            }
        }
    }

    // Dependency-connected tasks run on the same worker, in order.
    let mut uf = UnionFind::<usize>::new(n);
    for (i, task) in tasks.iter().enumerate() {
        if deferred.contains(&i) {
            continue;
        }
        for dep in &task.dependencies {
            let dep_index = index_of[dep.as_str()];
            if !deferred.contains(&dep_index) {
                uf.union(i, dep_index);
            }
        }
    }

    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        if deferred.contains(&i) {
            continue;
        }
        let root = uf.find(i);
        components.entry(root).or_default().push(i);
    }

    // Groups ordered by their earliest submitted task; one worker per
    // component keeps the partition deterministic and balanced.
    let mut ordered: Vec<Vec<usize>> = components.into_values().collect();
    ordered.sort_by_key(|members| members.iter().copied().min().unwrap_or(usize::MAX));

    let mut groups = Vec::with_capacity(ordered.len());
    for (gi, members) in ordered.into_iter().enumerate() {
        let order = topo_order(tasks, &members, &index_of)?;
        let mut patterns: Vec<ResourcePattern> = Vec::new();
        for &ti in &order {
            for p in &exclusive[ti] {
                if !patterns.contains(p) {
                    patterns.push(p.clone());
                }
            }
        }
        groups.push(WorkerGroup {
            worker_id: format!("worker-{gi}"),
            task_indices: order,
            exclusive: patterns,
        });
    }

    let mut shared: Vec<SharedResource> = shared_map
        .into_values()
        .map(|(pattern, _first, members)| SharedResource {
            address: pattern.canonical_address(),
            pattern,
            task_indices: {
                let mut v: Vec<usize> = members.into_iter().collect();
                v.sort_unstable();
                v
            },
        })
        .collect();
    // deterministic sequential order: by submission index of the first toucher
    shared.sort_by_key(|s| s.task_indices.first().copied().unwrap_or(usize::MAX));

    let assignment = OwnershipAssignment {
        groups,
        shared,
        deferred: deferred.into_iter().collect(),
    };
    assignment.verify_disjoint()?;

    info!(
        workers = assignment.groups.len(),
        shared = assignment.shared.len(),
        deferred = assignment.deferred.len(),
        "ownership assignment complete"
    );
    Ok(assignment)
}

/// Dependency order within one group: dependencies first, submission
/// index as the tie-break. Cycles are a validation failure.
fn topo_order(
    tasks: &[Task],
    members: &[usize],
    index_of: &HashMap<&str, usize>,
) -> Result<Vec<usize>> {
    let member_set: HashSet<usize> = members.iter().copied().collect();
    let mut pending: Vec<usize> = members.to_vec();
    pending.sort_unstable();
    let mut emitted: HashSet<usize> = HashSet::new();
    let mut order = Vec::with_capacity(members.len());

    while !pending.is_empty() {
        let before = order.len();
        pending.retain(|&ti| {
            let ready = tasks[ti].dependencies.iter().all(|dep| {
                let di = index_of[dep.as_str()];
                !member_set.contains(&di) || emitted.contains(&di)
            });
            if ready {
                emitted.insert(ti);
                order.push(ti);
                false
            } else {
                true
            }
        });
        if order.len() == before {
            let stuck: Vec<&str> = pending.iter().map(|&ti| tasks[ti].id.as_str()).collect();
            return Err(FanoutError::validation_field(
                format!("dependency cycle among tasks: {}", stuck.join(", ")),
                "dependencies",
            ));
        }
    }
    debug!(tasks = order.len(), "group execution order resolved");
    Ok(order)
}
