//! Budget manager: derives a per-task unit allowance from complexity
//! factors and tracks consumption against it in real time.

use crate::core::errors::{FanoutError, Result};
use crate::model::Task;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// The multiplier chain an allocation was derived from. Kept with the
/// budget so reports can explain where a number came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultiplierChain {
    pub base_units: u64,
    pub depth: f64,
    pub complexity: f64,
    pub resource_factor: f64,
    pub priority: f64,
}

impl MultiplierChain {
    pub fn for_task(base_units: u64, task: &Task) -> Self {
        let resources = task.footprint.resource_count() as f64;
        Self {
            base_units,
            depth: task.depth.multiplier(),
            complexity: task.complexity.multiplier(),
            resource_factor: 1.0 + 0.3 * (resources - 1.0),
            priority: task.priority.multiplier(),
        }
    }

    pub fn allocation(&self) -> u64 {
        let units = self.base_units as f64
            * self.depth
            * self.complexity
            * self.resource_factor
            * self.priority;
        units.round() as u64
    }
}

/// Signal returned on every usage report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetSignal {
    Ok {
        remaining: u64,
    },
    /// Consumption reached 80% of the current cap
    Warning {
        consumed: u64,
        allocated: u64,
    },
    /// Consumption reached the allocation; a one-time extension is the
    /// only permitted override
    Exceeded {
        consumed: u64,
        allocated: u64,
        extension_available: bool,
    },
}

#[derive(Debug)]
struct TaskBudget {
    allocated: u64,
    consumed: AtomicU64,
    extension_granted: AtomicBool,
    chain: MultiplierChain,
}

impl TaskBudget {
    /// Hard cap: allocation plus the one extension, whether or not it has
    /// been granted yet. Nothing may consume past this.
    fn hard_cap(&self, extension_ratio: f64) -> u64 {
        self.allocated + (self.allocated as f64 * extension_ratio).round() as u64
    }

    fn current_cap(&self, extension_ratio: f64) -> u64 {
        if self.extension_granted.load(Ordering::Relaxed) {
            self.hard_cap(extension_ratio)
        } else {
            self.allocated
        }
    }
}

/// Serializable budget snapshot for checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub task_id: String,
    pub allocated: u64,
    pub consumed: u64,
    pub extension_granted: bool,
    pub chain: MultiplierChain,
}

/// Per-task slice of the aggregate report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBudgetReport {
    pub task_id: String,
    pub allocated: u64,
    pub consumed: u64,
    pub remaining: u64,
    pub extension_granted: bool,
}

/// Aggregate allocated-vs-consumed view, used for monitoring and for
/// sizing future sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetReport {
    pub per_task: Vec<TaskBudgetReport>,
    pub total_allocated: u64,
    pub total_consumed: u64,
    pub total_remaining: u64,
}

/// Tracks every task budget in a session. Consumption is reported by the
/// owning worker; everything else only reads.
#[derive(Debug)]
pub struct BudgetManager {
    budgets: DashMap<String, TaskBudget>,
    base_units: u64,
    extension_ratio: f64,
}

impl BudgetManager {
    pub fn new(base_units: u64, extension_ratio: f64) -> Self {
        Self {
            budgets: DashMap::new(),
            base_units,
            extension_ratio,
        }
    }

    /// Compute and register the allocation for a task:
    /// `base × depth × complexity × (1 + 0.3 × (resources − 1)) × priority`
    pub fn allocate(&self, task: &Task) -> u64 {
        let chain = MultiplierChain::for_task(self.base_units, task);
        let allocated = chain.allocation();
        debug!(
            task_id = %task.id,
            allocated,
            depth = chain.depth,
            complexity = chain.complexity,
            resource_factor = chain.resource_factor,
            priority = chain.priority,
            "budget allocated"
        );
        self.budgets.insert(
            task.id.clone(),
            TaskBudget {
                allocated,
                consumed: AtomicU64::new(0),
                extension_granted: AtomicBool::new(false),
                chain,
            },
        );
        allocated
    }

    pub fn allocation_of(&self, task_id: &str) -> Option<u64> {
        self.budgets.get(task_id).map(|b| b.allocated)
    }

    /// Record usage against a task's budget.
    ///
    /// Consumption past the hard cap (allocation + one extension) is an
    /// error; anything below it returns a signal the caller acts on.
    pub fn record_usage(&self, task_id: &str, units: u64) -> Result<BudgetSignal> {
        let budget = self.budgets.get(task_id).ok_or_else(|| {
            FanoutError::internal(format!("no budget allocated for task '{task_id}'"))
        })?;
        let consumed = budget.consumed.fetch_add(units, Ordering::SeqCst) + units;
        let cap = budget.current_cap(self.extension_ratio);
        let hard_cap = budget.hard_cap(self.extension_ratio);

        if consumed > hard_cap {
            // clamp the stored counter so snapshots and reports never
            // carry consumption past the cap; the error keeps the
            // attempted total
            budget
                .consumed
                .fetch_sub(consumed - hard_cap, Ordering::SeqCst);
            warn!(
                task_id,
                consumed, hard_cap, "hard budget cap breached, cancelling task"
            );
            return Err(FanoutError::budget_exceeded(
                task_id,
                budget.allocated,
                consumed,
            ));
        }
        if consumed >= cap {
            let extension_available = !budget.extension_granted.load(Ordering::Relaxed);
            warn!(task_id, consumed, allocated = budget.allocated, "budget exceeded");
            return Ok(BudgetSignal::Exceeded {
                consumed,
                allocated: budget.allocated,
                extension_available,
            });
        }
        if consumed * 10 >= cap * 8 {
            return Ok(BudgetSignal::Warning {
                consumed,
                allocated: budget.allocated,
            });
        }
        Ok(BudgetSignal::Ok {
            remaining: cap - consumed,
        })
    }

    /// Grant the one-time extension, capped at the configured fraction of
    /// the original allocation. The grant is the only logged override of
    /// the consumed-within-allocated invariant.
    pub fn request_extension(&self, task_id: &str) -> Result<u64> {
        let budget = self.budgets.get(task_id).ok_or_else(|| {
            FanoutError::internal(format!("no budget allocated for task '{task_id}'"))
        })?;
        if budget.extension_granted.swap(true, Ordering::SeqCst) {
            return Err(FanoutError::budget_exceeded(
                task_id,
                budget.allocated,
                budget.consumed.load(Ordering::SeqCst),
            ));
        }
        let new_cap = budget.hard_cap(self.extension_ratio);
        warn!(
            task_id,
            allocated = budget.allocated,
            new_cap,
            "one-time budget extension granted"
        );
        Ok(new_cap)
    }

    pub fn consumed_of(&self, task_id: &str) -> Option<u64> {
        self.budgets
            .get(task_id)
            .map(|b| b.consumed.load(Ordering::SeqCst))
    }

    /// Aggregate report over every allocated task
    pub fn report(&self) -> BudgetReport {
        let mut per_task: Vec<TaskBudgetReport> = self
            .budgets
            .iter()
            .map(|entry| {
                let consumed = entry.consumed.load(Ordering::SeqCst);
                let cap = entry.current_cap(self.extension_ratio);
                TaskBudgetReport {
                    task_id: entry.key().clone(),
                    allocated: entry.allocated,
                    consumed,
                    remaining: cap.saturating_sub(consumed),
                    extension_granted: entry.extension_granted.load(Ordering::Relaxed),
                }
            })
            .collect();
        per_task.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let total_allocated = per_task.iter().map(|t| t.allocated).sum();
        let total_consumed = per_task.iter().map(|t| t.consumed).sum();
        let total_remaining = per_task.iter().map(|t| t.remaining).sum();
        BudgetReport {
            per_task,
            total_allocated,
            total_consumed,
            total_remaining,
        }
    }

    /// Snapshot for checkpointing, ordered by task id
    pub fn snapshot(&self) -> Vec<BudgetSnapshot> {
        let mut snaps: Vec<BudgetSnapshot> = self
            .budgets
            .iter()
            .map(|entry| BudgetSnapshot {
                task_id: entry.key().clone(),
                allocated: entry.allocated,
                consumed: entry.consumed.load(Ordering::SeqCst),
                extension_granted: entry.extension_granted.load(Ordering::Relaxed),
                chain: entry.chain,
            })
            .collect();
        snaps.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        snaps
    }

    /// Replace all tracked budgets with a checkpoint's contents
    pub fn load_snapshot(&self, snapshot: &[BudgetSnapshot]) {
        self.budgets.clear();
        for snap in snapshot {
            self.budgets.insert(
                snap.task_id.clone(),
                TaskBudget {
                    allocated: snap.allocated,
                    consumed: AtomicU64::new(snap.consumed),
                    extension_granted: AtomicBool::new(snap.extension_granted),
                    chain: snap.chain,
                },
            );
        }
        info!(budgets = snapshot.len(), "budget state restored from snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Complexity, Depth, Footprint, Priority, ResourcePattern, Task};
    use pretty_assertions::assert_eq;

    fn task(id: &str, depth: Depth, complexity: Complexity, priority: Priority, resources: usize) -> Task {
        let patterns = (0..resources)
            .map(|i| ResourcePattern::parse(&format!("docs/{id}/{i}")).unwrap())
            .collect();
        Task {
            id: id.to_string(),
            description: String::new(),
            footprint: Footprint::Declared(patterns),
            depth,
            complexity,
            priority,
            dependencies: vec![],
            submission_index: 0,
        }
    }

    #[test]
    fn test_scenario_b_allocation() {
        // thorough × complex × critical on a single resource:
        // 10000 × 2.0 × 1.5 × 1.0 × 1.5 = 45000
        let manager = BudgetManager::new(10_000, 0.2);
        let t = task("t", Depth::Thorough, Complexity::Complex, Priority::Critical, 1);
        assert_eq!(manager.allocate(&t), 45_000);
    }

    #[test]
    fn test_resource_factor() {
        // three resources: 1 + 0.3 × 2 = 1.6
        let manager = BudgetManager::new(10_000, 0.2);
        let t = task("t", Depth::Standard, Complexity::Standard, Priority::Medium, 3);
        assert_eq!(manager.allocate(&t), 16_000);
    }

    #[test]
    fn test_signals_and_extension() {
        let manager = BudgetManager::new(1_000, 0.2);
        let t = task("t", Depth::Standard, Complexity::Standard, Priority::Medium, 1);
        assert_eq!(manager.allocate(&t), 1_000);

        assert_eq!(
            manager.record_usage("t", 500).unwrap(),
            BudgetSignal::Ok { remaining: 500 }
        );
        assert!(matches!(
            manager.record_usage("t", 350).unwrap(),
            BudgetSignal::Warning { .. }
        ));
        let signal = manager.record_usage("t", 150).unwrap();
        assert_eq!(
            signal,
            BudgetSignal::Exceeded {
                consumed: 1_000,
                allocated: 1_000,
                extension_available: true
            }
        );

        // extension lifts the cap to 1200, once
        assert_eq!(manager.request_extension("t").unwrap(), 1_200);
        assert!(manager.request_extension("t").is_err());
        assert!(matches!(
            manager.record_usage("t", 150).unwrap(),
            BudgetSignal::Warning { .. }
        ));

        // past the hard cap is an error
        let err = manager.record_usage("t", 100).unwrap_err();
        assert!(matches!(err, FanoutError::BudgetExceeded { .. }));
    }

    #[test]
    fn test_hard_cap_without_extension() {
        let manager = BudgetManager::new(1_000, 0.2);
        let t = task("t", Depth::Standard, Complexity::Standard, Priority::Medium, 1);
        manager.allocate(&t);
        // 25% over allocation breaches the hard cap even unextended
        let err = manager.record_usage("t", 1_250).unwrap_err();
        assert!(matches!(err, FanoutError::BudgetExceeded { .. }));
    }

    #[test]
    fn test_breach_clamps_stored_consumption_to_hard_cap() {
        let manager = BudgetManager::new(1_000, 0.2);
        let t = task("t", Depth::Standard, Complexity::Standard, Priority::Medium, 1);
        manager.allocate(&t);
        manager.record_usage("t", 400).unwrap();
        assert!(manager.record_usage("t", 1_200).is_err());

        // the breach is rejected, not accounted: counters stay at the cap
        assert_eq!(manager.consumed_of("t"), Some(1_200));
        let report = manager.report();
        assert_eq!(report.per_task[0].consumed, 1_200);
        assert_eq!(report.per_task[0].remaining, 0);
        assert_eq!(manager.snapshot()[0].consumed, 1_200);
    }

    #[test]
    fn test_aggregate_report() {
        let manager = BudgetManager::new(1_000, 0.2);
        let a = task("a", Depth::Standard, Complexity::Standard, Priority::Medium, 1);
        let b = task("b", Depth::Minimal, Complexity::Standard, Priority::Medium, 1);
        manager.allocate(&a);
        manager.allocate(&b);
        manager.record_usage("a", 300).unwrap();

        let report = manager.report();
        assert_eq!(report.total_allocated, 1_500);
        assert_eq!(report.total_consumed, 300);
        assert_eq!(report.per_task[0].task_id, "a");
        assert_eq!(report.per_task[0].remaining, 700);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let manager = BudgetManager::new(1_000, 0.2);
        let t = task("t", Depth::Standard, Complexity::Standard, Priority::Medium, 2);
        manager.allocate(&t);
        manager.record_usage("t", 400).unwrap();
        let snapshot = manager.snapshot();

        let restored = BudgetManager::new(1_000, 0.2);
        restored.load_snapshot(&snapshot);
        assert_eq!(restored.consumed_of("t"), Some(400));
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn test_usage_against_unallocated_task_fails() {
        let manager = BudgetManager::new(1_000, 0.2);
        assert!(manager.record_usage("ghost", 10).is_err());
    }
}
