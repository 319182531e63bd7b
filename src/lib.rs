//! # Fanout
//!
//! A coordination engine for running batches of sub-tasks in parallel
//! without letting them trample each other's outputs.
//!
//! A batch of [`TaskSpec`]s declares, per task, which resources it will
//! write. Planning builds a conflict graph over those footprints and
//! partitions the batch into worker groups with pairwise-disjoint
//! exclusive resource sets; every contested resource is pulled out of the
//! parallel phase entirely and resolved one task at a time afterwards.
//! Workers run concurrently under a budget derived from each task's
//! depth, complexity, and priority, write results into private session
//! registries, and a consolidation step merges those into a master
//! registry where a cross-worker duplicate is a fatal integrity error
//! rather than a silent overwrite.
//!
//! The engine checkpoints its full state (session phase, budgets,
//! consolidation progress) at every phase boundary and on an interval,
//! behind a write-verify-swap protocol, so a crashed session restores to
//! a structurally identical state.
//!
//! ```no_run
//! use fanout::{CoordinatorConfig, Orchestrator, TaskSpec};
//! # use std::sync::Arc;
//! # async fn run(executor: Arc<dyn fanout::TaskExecutor>) -> fanout::Result<()> {
//! let orchestrator = Orchestrator::open(CoordinatorConfig::default(), "./fanout-db")?;
//! let batch = vec![TaskSpec {
//!     id: "document-auth".into(),
//!     description: "write docs for the auth module".into(),
//!     resource_footprint: Some(vec!["docs/auth/*".into()]),
//!     depth: Default::default(),
//!     complexity: Default::default(),
//!     priority: Default::default(),
//!     dependencies: vec![],
//! }];
//! let report = orchestrator.run_session(&batch, executor).await?;
//! println!("completed {} of {}", report.completed, report.outcomes.len());
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod core;
pub mod exec;
pub mod health;
pub mod model;
pub mod plan;
pub mod registry;
pub mod state;

pub use crate::core::config::CoordinatorConfig;
pub use crate::core::errors::{FanoutError, Result};
pub use budget::{BudgetManager, BudgetReport, BudgetSignal, BudgetSnapshot, MultiplierChain};
pub use exec::{
    EventBus, Orchestrator, Session, SessionEvent, SessionEventEnvelope, SessionReport,
    SessionStatus, SessionStatusView, SequentialContext, TaskExecutor, WorkerContext,
};
pub use health::StuckVerdict;
pub use model::{
    validate_batch, Complexity, Depth, Footprint, PartialReason, Priority, ResourceAddress,
    ResourcePattern, Task, TaskOutcome, TaskSpec, UNKNOWN_SHARED_BUCKET,
};
pub use plan::{analyze, assign, ConflictGraph, OwnershipAssignment, SharedResource, WorkerGroup};
pub use registry::{
    ConsolidationRecord, RegistryEntry, RegistryManager, SessionRegistry, SEQUENTIAL_WORKER,
};
pub use state::{
    Checkpoint, CheckpointInfo, CheckpointTrigger, ConsolidationProgress, StateDocument,
    StateManager,
};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    fn spec(id: &str, footprint: Option<&[&str]>) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            description: format!("task {id}"),
            resource_footprint: footprint.map(|f| f.iter().map(|s| s.to_string()).collect()),
            depth: Depth::Standard,
            complexity: Complexity::Standard,
            priority: Priority::Medium,
            dependencies: vec![],
        }
    }

    fn orchestrator() -> (Orchestrator, tempfile::TempDir) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempfile::TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (
            Orchestrator::new(CoordinatorConfig::conservative(), db).unwrap(),
            dir,
        )
    }

    /// Writes every owned resource in the parallel phase and records the
    /// order of sequential resolutions.
    struct RecordingExecutor {
        resolutions: Mutex<Vec<(String, String)>>,
    }

    impl RecordingExecutor {
        fn new() -> Self {
            Self {
                resolutions: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute(&self, task: &Task, ctx: &WorkerContext) -> anyhow::Result<()> {
            ctx.record_usage(100)?;
            for pattern in task.footprint.patterns() {
                let address = pattern.canonical_address();
                if ctx
                    .write_entry(address.as_str(), &task.id, json!({}), 10)
                    .is_err()
                {
                    // contested resource, left for the sequential phase
                    continue;
                }
            }
            Ok(())
        }

        async fn resolve_shared(
            &self,
            task: &Task,
            address: &ResourceAddress,
            ctx: &SequentialContext,
        ) -> anyhow::Result<()> {
            ctx.record_usage(10)?;
            self.resolutions
                .lock()
                .unwrap()
                .push((address.to_string(), task.id.clone()));
            ctx.write_entry(
                address.as_str(),
                &format!("resolved by {}", task.id),
                json!({}),
                5,
            )?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_six_tasks_sharing_one_report_get_four_workers() {
        // t1..t4 own disjoint resources; t5 and t6 both write only the
        // shared report, so neither has any parallel work left
        let (orch, _dir) = orchestrator();
        let mut rx = orch.subscribe();
        let executor = Arc::new(RecordingExecutor::new());
        let report = orch
            .run_session(
                &[
                    spec("t1", Some(&["module/a/*"])),
                    spec("t2", Some(&["module/b/*"])),
                    spec("t3", Some(&["module/c/*"])),
                    spec("t4", Some(&["module/d/*"])),
                    spec("t5", Some(&["shared/report"])),
                    spec("t6", Some(&["shared/report"])),
                ],
                Arc::clone(&executor) as Arc<dyn TaskExecutor>,
            )
            .await
            .unwrap();

        assert_eq!(report.completed, 6);
        assert_eq!(report.failed, 0);

        let mut workers = HashSet::new();
        while let Ok(envelope) = rx.try_recv() {
            if let SessionEvent::WorkerStarted { worker_id, .. } = envelope.event {
                workers.insert(worker_id);
            }
        }
        assert_eq!(workers.len(), 4);

        // the report was resolved by t5 then t6, in submission order
        let resolutions = executor.resolutions.lock().unwrap().clone();
        assert_eq!(
            resolutions,
            vec![
                ("shared/report".to_string(), "t5".to_string()),
                ("shared/report".to_string(), "t6".to_string()),
            ]
        );
        let entry = orch.registry().get("shared/report").unwrap().unwrap();
        assert_eq!(entry.summary, "resolved by t6");
    }

    #[tokio::test]
    async fn test_overlapping_footprints_split_into_exclusive_and_shared() {
        let (orch, _dir) = orchestrator();
        let executor = Arc::new(RecordingExecutor::new());
        let report = orch
            .run_session(
                &[
                    spec("t1", Some(&["docs/*", "src/a"])),
                    spec("t2", Some(&["docs/auth", "src/b"])),
                ],
                Arc::clone(&executor) as Arc<dyn TaskExecutor>,
            )
            .await
            .unwrap();
        assert_eq!(report.completed, 2);

        // exclusive work merged from two different workers, contested
        // resource written sequentially
        let a = orch.registry().get("src/a").unwrap().unwrap();
        let b = orch.registry().get("src/b").unwrap().unwrap();
        assert_ne!(a.worker_id, b.worker_id);
        assert!(!a.sequential && !b.sequential);
        let contested = orch.registry().get("docs/auth").unwrap().unwrap();
        assert!(contested.sequential);

        // every parallel write made it into the master registry
        assert_eq!(orch.registry().master_len(), 3);
        let log = orch.registry().consolidation_log().unwrap();
        assert!(!log.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_footprint_routed_to_shared_bucket() {
        let (orch, _dir) = orchestrator();
        let executor = Arc::new(RecordingExecutor::new());
        let report = orch
            .run_session(
                &[spec("t1", Some(&["docs/a"])), spec("t2", None)],
                Arc::clone(&executor) as Arc<dyn TaskExecutor>,
            )
            .await
            .unwrap();
        assert_eq!(report.completed, 2);

        let resolutions = executor.resolutions.lock().unwrap().clone();
        assert_eq!(
            resolutions,
            vec![(UNKNOWN_SHARED_BUCKET.to_string(), "t2".to_string())]
        );
    }

    /// Consumes far past its allocation on one designated task
    struct OverspendingExecutor {
        spendthrift: String,
    }

    #[async_trait]
    impl TaskExecutor for OverspendingExecutor {
        async fn execute(&self, task: &Task, ctx: &WorkerContext) -> anyhow::Result<()> {
            if task.id == self.spendthrift {
                // burns through the allocation and the one-time extension
                for _ in 0..6 {
                    ctx.record_usage(250)?;
                }
                return Ok(());
            }
            ctx.record_usage(100)?;
            for pattern in task.footprint.patterns() {
                ctx.write_entry(pattern.canonical_address().as_str(), "ok", json!({}), 5)?;
            }
            Ok(())
        }

        async fn resolve_shared(
            &self,
            _task: &Task,
            _address: &ResourceAddress,
            _ctx: &SequentialContext,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overspender_ends_partial_and_session_completes() {
        // conservative limits allocate 1000 units per standard task; the
        // spendthrift hits the 1200-unit hard cap and stops there
        let (orch, _dir) = orchestrator();
        let report = orch
            .run_session(
                &[
                    spec("t1", Some(&["docs/a"])),
                    spec("t2", Some(&["docs/b"])),
                    spec("t3", Some(&["docs/c"])),
                ],
                Arc::new(OverspendingExecutor {
                    spendthrift: "t2".into(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(report.completed, 2);
        assert_eq!(report.partial, 1);
        assert_eq!(
            report.outcomes["t2"],
            TaskOutcome::Partial {
                reason: PartialReason::BudgetExceeded
            }
        );
        assert_eq!(orch.status().await.status, SessionStatus::Complete);

        let t2 = report
            .budget
            .per_task
            .iter()
            .find(|t| t.task_id == "t2")
            .unwrap();
        assert!(t2.extension_granted);
        assert!(t2.consumed <= 1_250);
    }

    #[tokio::test]
    async fn test_restore_reproduces_checkpointed_session_state() {
        let (orch, _dir) = orchestrator();
        orch.run_session(
            &[spec("t1", Some(&["docs/a"])), spec("t2", Some(&["docs/b"]))],
            Arc::new(RecordingExecutor::new()),
        )
        .await
        .unwrap();

        // restore the oldest checkpoint, taken on entering the parallel
        // phase with both budgets untouched
        let checkpoints = orch.state().list_checkpoints().unwrap();
        let oldest = checkpoints.last().unwrap();
        assert_eq!(oldest.trigger, CheckpointTrigger::PhaseTransition);
        let restored = orch.resume_from(&oldest.id).await.unwrap();

        assert_eq!(restored.session.status, SessionStatus::Running);
        assert_eq!(restored.budgets.len(), 2);
        assert!(restored.budgets.iter().all(|b| b.consumed == 0));
        // live state, budget manager, and status all reflect the restore
        assert_eq!(orch.state().load().unwrap().unwrap(), restored);
        assert_eq!(orch.budgets().snapshot(), restored.budgets);
        let status = orch.status().await;
        assert_eq!(status.status, SessionStatus::Running);
        assert_eq!(status.active_workers, restored.session.active_workers);
    }
}
