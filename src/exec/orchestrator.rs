//! Orchestrator: drives one batch through planning, budgeted parallel
//! execution, registry consolidation, and sequential shared-resource
//! resolution, checkpointing at every phase boundary.

use crate::budget::{BudgetManager, BudgetReport};
use crate::core::config::CoordinatorConfig;
use crate::core::errors::{FanoutError, Result};
use crate::exec::events::{EventBus, SessionEvent};
use crate::exec::session::{Session, SessionStatus};
use crate::exec::worker::{SequentialContext, TaskExecutor, WorkerContext};
use crate::health::{spawn_health_monitor, StuckVerdict};
use crate::model::{validate_batch, PartialReason, Task, TaskOutcome, TaskSpec};
use crate::plan::{self, WorkerGroup};
use crate::registry::{spawn_consolidator, RegistryManager};
use crate::state::{CheckpointTrigger, ConsolidationProgress, StateDocument, StateManager};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

/// Live view of a running (or finished) session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusView {
    pub session_id: String,
    pub status: SessionStatus,
    pub active_workers: Vec<String>,
    pub completed_tasks: usize,
    pub total_tasks: usize,
    pub elapsed: Duration,
    /// Naive projection from throughput so far; absent until at least one
    /// task has finished
    pub eta: Option<Duration>,
}

/// Final report for one coordinated batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub outcomes: BTreeMap<String, TaskOutcome>,
    pub completed: usize,
    pub partial: usize,
    pub failed: usize,
    pub budget: BudgetReport,
    pub stuck_workers: Vec<StuckVerdict>,
    pub elapsed: Duration,
}

/// The coordination engine. One orchestrator runs one session at a time;
/// all monitoring surfaces (`status`, `subscribe`, `abort`) are safe to
/// call concurrently from other tasks.
pub struct Orchestrator {
    config: CoordinatorConfig,
    budgets: Arc<BudgetManager>,
    registry: Arc<RegistryManager>,
    state: Arc<StateManager>,
    events: EventBus,
    session: Arc<RwLock<Session>>,
    outcomes: Arc<DashMap<String, TaskOutcome>>,
    progress: Arc<DashMap<String, Instant>>,
    cancel_flags: Arc<DashMap<String, Arc<AtomicBool>>>,
    verdicts: Arc<DashMap<String, StuckVerdict>>,
    consolidation: Arc<Mutex<ConsolidationProgress>>,
    /// Serializes registry consolidation against phase transitions
    phase_lock: Arc<tokio::sync::Mutex<()>>,
    /// Fatal error parked by the background consolidator
    fatal: Arc<Mutex<Option<FanoutError>>>,
    total_tasks: AtomicUsize,
    aborted: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: CoordinatorConfig, db: sled::Db) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(RegistryManager::new(&db)?);
        let state = Arc::new(StateManager::new(&db)?);
        let budgets = Arc::new(BudgetManager::new(
            config.base_units,
            config.budget_extension_ratio,
        ));
        let events = EventBus::new(config.event_capacity);
        Ok(Self {
            config,
            budgets,
            registry,
            state,
            events,
            session: Arc::new(RwLock::new(Session::new())),
            outcomes: Arc::new(DashMap::new()),
            progress: Arc::new(DashMap::new()),
            cancel_flags: Arc::new(DashMap::new()),
            verdicts: Arc::new(DashMap::new()),
            consolidation: Arc::new(Mutex::new(ConsolidationProgress::default())),
            phase_lock: Arc::new(tokio::sync::Mutex::new(())),
            fatal: Arc::new(Mutex::new(None)),
            total_tasks: AtomicUsize::new(0),
            aborted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Open the backing database at `path` and build an orchestrator on it
    pub fn open<P: AsRef<Path>>(config: CoordinatorConfig, path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::new(config, db)
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<crate::exec::SessionEventEnvelope> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<RegistryManager> {
        &self.registry
    }

    pub fn budgets(&self) -> &Arc<BudgetManager> {
        &self.budgets
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// Request cooperative cancellation of everything in flight.
    pub fn abort(&self, reason: &str) {
        warn!(reason, "session abort requested");
        self.aborted.store(true, Ordering::SeqCst);
        for entry in self.cancel_flags.iter() {
            entry.value().store(true, Ordering::SeqCst);
        }
        let session_id = self
            .session
            .try_read()
            .map(|s| s.id.clone())
            .unwrap_or_default();
        self.events.emit(
            &session_id,
            SessionEvent::SessionAlert {
                message: format!("abort requested: {reason}"),
            },
        );
    }

    pub async fn status(&self) -> SessionStatusView {
        let session = self.session.read().await.clone();
        let total = self.total_tasks.load(Ordering::SeqCst);
        let completed = self
            .outcomes
            .iter()
            .filter(|e| e.value().is_completed())
            .count();
        let elapsed = (Utc::now() - session.started_at)
            .to_std()
            .unwrap_or_default();
        let eta = if !session.status.is_terminal() && completed > 0 && total > completed {
            let remaining = (total - completed) as f64 / completed as f64;
            Some(elapsed.mul_f64(remaining))
        } else {
            None
        };
        SessionStatusView {
            session_id: session.id,
            status: session.status,
            active_workers: session.active_workers,
            completed_tasks: completed,
            total_tasks: total,
            elapsed,
            eta,
        }
    }

    /// Restore a checkpoint as the live state. Budgets and consolidation
    /// progress come back exactly as captured; the session resumes from
    /// the phase the checkpoint recorded.
    pub async fn resume_from(&self, checkpoint_id: &str) -> Result<StateDocument> {
        let document = self.state.restore(checkpoint_id)?;
        self.budgets.load_snapshot(&document.budgets);
        if let Ok(mut progress) = self.consolidation.lock() {
            *progress = document.consolidation.clone();
        }
        self.total_tasks
            .store(document.budgets.len(), Ordering::SeqCst);
        *self.session.write().await = document.session.clone();
        info!(checkpoint_id, session_id = %document.session.id, "session state resumed");
        Ok(document)
    }

    async fn current_document(&self) -> StateDocument {
        let session = self.session.read().await.clone();
        let consolidation = self
            .consolidation
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default();
        StateDocument {
            session,
            budgets: self.budgets.snapshot(),
            consolidation,
        }
    }

    async fn checkpoint_now(&self, trigger: CheckpointTrigger) -> Result<()> {
        let document = self.current_document().await;
        self.state.checkpoint(trigger, &document)?;
        Ok(())
    }

    async fn set_phase(&self, next: SessionStatus, trigger: CheckpointTrigger) -> Result<()> {
        let (session_id, from) = {
            let mut session = self.session.write().await;
            let from = session.status;
            session.transition_to(next)?;
            (session.id.clone(), from)
        };
        self.events
            .emit(&session_id, SessionEvent::PhaseChanged { from, to: next });
        self.checkpoint_now(trigger).await
    }

    /// Mark the session failed, checkpoint the wreckage, and hand the
    /// error back. Used on every fatal path so recovery always has a
    /// checkpoint to start from.
    async fn fail_session(&self, err: FanoutError) -> FanoutError {
        error!(error = %err, "session failed");
        {
            let mut session = self.session.write().await;
            if !session.status.is_terminal() {
                let _ = session.transition_to(SessionStatus::Failed);
            }
        }
        if let Err(ckpt_err) = self.checkpoint_now(CheckpointTrigger::ErrorCaught).await {
            warn!(error = %ckpt_err, "failure checkpoint could not be written");
        }
        err
    }

    /// Run one batch end to end and return the per-task report.
    pub async fn run_session(
        &self,
        specs: &[TaskSpec],
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<SessionReport> {
        self.reset_run_state().await;
        let started = Instant::now();
        let session_id = self.session.read().await.id.clone();
        info!(session_id = %session_id, tasks = specs.len(), "session starting");

        // planning: validation and ownership assignment happen before any
        // worker exists, so a rejection costs nothing
        let tasks = match validate_batch(specs) {
            Ok(tasks) => Arc::new(tasks),
            Err(err) => return Err(self.fail_session(err).await),
        };
        self.total_tasks.store(tasks.len(), Ordering::SeqCst);
        let graph = match plan::analyze(&tasks) {
            Ok(graph) => graph,
            Err(err) => return Err(self.fail_session(err).await),
        };
        let assignment = match plan::assign(&tasks, &graph) {
            Ok(assignment) => assignment,
            Err(err) => return Err(self.fail_session(err).await),
        };
        for task in tasks.iter() {
            self.budgets.allocate(task);
        }
        {
            let mut session = self.session.write().await;
            session.assignment = Some(assignment.clone());
            session.active_workers = assignment
                .groups
                .iter()
                .map(|g| g.worker_id.clone())
                .collect();
        }
        if let Err(err) = self
            .set_phase(SessionStatus::Running, CheckpointTrigger::PhaseTransition)
            .await
        {
            return Err(self.fail_session(err).await);
        }

        // background services for the parallel phase
        let service_shutdown = Arc::new(AtomicBool::new(false));
        let monitor = spawn_health_monitor(
            self.config.health_poll_interval,
            self.config.stuck_threshold,
            Arc::clone(&self.progress),
            Arc::clone(&self.cancel_flags),
            Arc::clone(&self.verdicts),
            Arc::clone(&service_shutdown),
            self.events.clone(),
            session_id.clone(),
        );
        let consolidator = spawn_consolidator(
            Arc::clone(&self.registry),
            self.config.consolidation_interval,
            Arc::clone(&self.phase_lock),
            Arc::clone(&service_shutdown),
            Arc::clone(&self.fatal),
            self.events.clone(),
            session_id.clone(),
        );
        let checkpointer = self.spawn_interval_checkpointer(Arc::clone(&service_shutdown));

        // parallel phase: one tokio task per worker group, gated by the
        // concurrency budget
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut handles = Vec::with_capacity(assignment.groups.len());
        for group in assignment.groups.clone() {
            handles.push(self.spawn_group(
                group,
                Arc::clone(&tasks),
                Arc::clone(&executor),
                Arc::clone(&semaphore),
                session_id.clone(),
            ));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker task panicked");
            }
        }

        service_shutdown.store(true, Ordering::SeqCst);
        monitor.abort();
        consolidator.abort();
        checkpointer.abort();
        let _ = monitor.await;
        let _ = consolidator.await;
        let _ = checkpointer.await;

        if self.aborted.load(Ordering::SeqCst) {
            let err = FanoutError::cancelled_because(&session_id, "session aborted");
            return Err(self.fail_session(err).await);
        }
        if let Some(err) = self.fatal.lock().ok().and_then(|mut slot| slot.take()) {
            return Err(self.fail_session(err).await);
        }

        // consolidation: the final merge runs under the phase lock so no
        // background run can interleave
        if let Err(err) = self
            .set_phase(
                SessionStatus::Consolidating,
                CheckpointTrigger::PhaseTransition,
            )
            .await
        {
            return Err(self.fail_session(err).await);
        }
        {
            let _guard = self.phase_lock.lock().await;
            let record = match self.registry.consolidate() {
                Ok(record) => record,
                Err(err) => return Err(self.fail_session(err).await),
            };
            self.events.emit(
                &session_id,
                SessionEvent::Consolidated {
                    entries_merged: record.entries_merged,
                    source_registries: record.source_registries.len(),
                },
            );
            if let Ok(mut progress) = self.consolidation.lock() {
                progress.merged_entries = self.registry.master_len();
            }
        }

        // sequential phase: contested resources, one at a time, in
        // submission order
        if let Err(err) = self
            .set_phase(
                SessionStatus::SequentialPhase,
                CheckpointTrigger::RiskyOperation,
            )
            .await
        {
            return Err(self.fail_session(err).await);
        }
        if let Err(err) = self
            .run_sequential_phase(&assignment, &tasks, &executor, &session_id)
            .await
        {
            return Err(self.fail_session(err).await);
        }

        // deferred tasks completed entirely through shared resolutions
        for &ti in &assignment.deferred {
            let task = &tasks[ti];
            if !self.outcomes.contains_key(&task.id) {
                self.outcomes
                    .insert(task.id.clone(), TaskOutcome::Completed);
                self.events.emit(
                    &session_id,
                    SessionEvent::TaskFinished {
                        task_id: task.id.clone(),
                        completed: true,
                        partial: None,
                    },
                );
            }
        }

        if let Err(err) = self
            .set_phase(SessionStatus::Complete, CheckpointTrigger::PhaseTransition)
            .await
        {
            return Err(self.fail_session(err).await);
        }
        if let Err(err) = self.registry.archive_expired(self.config.registry_retention) {
            warn!(error = %err, "registry archival failed");
        }

        let report = self.build_report(&session_id, started.elapsed());
        info!(
            session_id = %session_id,
            completed = report.completed,
            partial = report.partial,
            failed = report.failed,
            "session complete"
        );
        Ok(report)
    }

    async fn reset_run_state(&self) {
        self.outcomes.clear();
        self.progress.clear();
        self.cancel_flags.clear();
        self.verdicts.clear();
        self.aborted.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.fatal.lock() {
            *slot = None;
        }
        if let Ok(mut progress) = self.consolidation.lock() {
            *progress = ConsolidationProgress::default();
        }
        *self.session.write().await = Session::new();
    }

    fn spawn_interval_checkpointer(
        &self,
        shutdown: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.config.checkpoint_interval;
        let session = Arc::clone(&self.session);
        let budgets = Arc::clone(&self.budgets);
        let consolidation = Arc::clone(&self.consolidation);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let document = StateDocument {
                    session: session.read().await.clone(),
                    budgets: budgets.snapshot(),
                    consolidation: consolidation
                        .lock()
                        .map(|p| p.clone())
                        .unwrap_or_default(),
                };
                if let Err(err) = state.checkpoint(CheckpointTrigger::Interval, &document) {
                    warn!(error = %err, "interval checkpoint failed");
                }
            }
        })
    }

    fn spawn_group(
        &self,
        group: WorkerGroup,
        tasks: Arc<Vec<Task>>,
        executor: Arc<dyn TaskExecutor>,
        semaphore: Arc<Semaphore>,
        session_id: String,
    ) -> tokio::task::JoinHandle<()> {
        // per-attempt timeout scales with the heaviest task in the group
        let scale = group
            .task_indices
            .iter()
            .map(|&ti| tasks[ti].complexity.multiplier())
            .fold(1.0f64, f64::max);
        let attempt_timeout = self.config.worker_timeout.mul_f64(scale);
        let max_retries = self.config.max_worker_retries;

        let registry = Arc::clone(&self.registry);
        let budgets = Arc::clone(&self.budgets);
        let events = self.events.clone();
        let outcomes = Arc::clone(&self.outcomes);
        let progress = Arc::clone(&self.progress);
        let cancel_flags = Arc::clone(&self.cancel_flags);
        let verdicts = Arc::clone(&self.verdicts);
        let aborted = Arc::clone(&self.aborted);
        let session = Arc::clone(&self.session);

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let worker_id = group.worker_id.clone();
            let flag = Arc::new(AtomicBool::new(aborted.load(Ordering::SeqCst)));
            progress.insert(worker_id.clone(), Instant::now());
            cancel_flags.insert(worker_id.clone(), Arc::clone(&flag));

            let success = run_group(
                &group,
                &tasks,
                executor.as_ref(),
                &registry,
                &budgets,
                &events,
                &outcomes,
                &progress,
                &flag,
                &verdicts,
                &aborted,
                &session_id,
                attempt_timeout,
                max_retries,
            )
            .await;

            events.emit(
                &session_id,
                SessionEvent::WorkerFinished {
                    worker_id: worker_id.clone(),
                    success,
                },
            );
            cancel_flags.remove(&worker_id);
            progress.remove(&worker_id);
            session
                .write()
                .await
                .active_workers
                .retain(|w| w != &worker_id);
        })
    }

    async fn run_sequential_phase(
        &self,
        assignment: &plan::OwnershipAssignment,
        tasks: &Arc<Vec<Task>>,
        executor: &Arc<dyn TaskExecutor>,
        session_id: &str,
    ) -> Result<()> {
        for (position, shared) in assignment.shared.iter().enumerate() {
            // resumable: a crash mid-resolution restarts at this resource
            if let Err(err) = self.checkpoint_now(CheckpointTrigger::SharedResolution).await {
                warn!(error = %err, "pre-resolution checkpoint failed");
            }
            // pull any straggler parallel writes into the master so each
            // resolution sees the latest merged state; an integrity
            // violation surfacing here is as fatal as anywhere else
            {
                let _guard = self.phase_lock.lock().await;
                self.registry.consolidate()?;
            }

            let mut resolved = true;
            for &ti in &shared.task_indices {
                let task = &tasks[ti];
                let skip = matches!(
                    self.outcomes.get(&task.id).map(|o| o.value().clone()),
                    Some(TaskOutcome::Failed { .. })
                );
                if skip {
                    debug!(task_id = %task.id, address = %shared.address, "skipping resolution for failed task");
                    continue;
                }
                let ctx = SequentialContext::new(
                    session_id.to_string(),
                    task.id.clone(),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.budgets),
                    self.events.clone(),
                );
                let timeout = self
                    .config
                    .worker_timeout
                    .mul_f64(task.complexity.multiplier());
                let result = tokio::time::timeout(
                    timeout,
                    executor.resolve_shared(task, &shared.address, &ctx),
                )
                .await;
                let failure = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(format!("{err:#}")),
                    Err(_) => Some(format!(
                        "resolution of '{}' timed out after {:?}",
                        shared.address, timeout
                    )),
                };
                if let Some(reason) = failure {
                    warn!(
                        task_id = %task.id,
                        address = %shared.address,
                        %reason,
                        "shared resolution failed"
                    );
                    self.outcomes
                        .insert(task.id.clone(), TaskOutcome::Failed { reason });
                    resolved = false;
                }
            }

            if resolved {
                self.events.emit(
                    session_id,
                    SessionEvent::SharedResolved {
                        address: shared.address.to_string(),
                        position,
                    },
                );
                if let Ok(mut progress) = self.consolidation.lock() {
                    progress.resolved_shared.push(shared.address.to_string());
                }
            }
        }
        Ok(())
    }

    fn build_report(&self, session_id: &str, elapsed: Duration) -> SessionReport {
        let outcomes: BTreeMap<String, TaskOutcome> = self
            .outcomes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let completed = outcomes.values().filter(|o| o.is_completed()).count();
        let partial = outcomes
            .values()
            .filter(|o| matches!(o, TaskOutcome::Partial { .. }))
            .count();
        let failed = outcomes
            .values()
            .filter(|o| matches!(o, TaskOutcome::Failed { .. }))
            .count();
        let mut stuck_workers: Vec<StuckVerdict> =
            self.verdicts.iter().map(|e| e.value().clone()).collect();
        stuck_workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        SessionReport {
            session_id: session_id.to_string(),
            outcomes,
            completed,
            partial,
            failed,
            budget: self.budgets.report(),
            stuck_workers,
            elapsed,
        }
    }
}

/// Run every task of one worker group, with one retry round for
/// recoverable failures. Returns true when all of them completed.
#[allow(clippy::too_many_arguments)]
async fn run_group(
    group: &WorkerGroup,
    tasks: &Arc<Vec<Task>>,
    executor: &dyn TaskExecutor,
    registry: &Arc<RegistryManager>,
    budgets: &Arc<BudgetManager>,
    events: &EventBus,
    outcomes: &Arc<DashMap<String, TaskOutcome>>,
    progress: &Arc<DashMap<String, Instant>>,
    cancel_flag: &Arc<AtomicBool>,
    verdicts: &Arc<DashMap<String, StuckVerdict>>,
    aborted: &Arc<AtomicBool>,
    session_id: &str,
    attempt_timeout: Duration,
    max_retries: u32,
) -> bool {
    let session_registry = match registry.session_registry(session_id, &group.worker_id) {
        Ok(r) => r,
        Err(err) => {
            for &ti in &group.task_indices {
                outcomes.insert(
                    tasks[ti].id.clone(),
                    TaskOutcome::Failed {
                        reason: format!("session registry unavailable: {err}"),
                    },
                );
            }
            return false;
        }
    };
    let exclusive = Arc::new(group.exclusive.clone());
    let shared_progress = Arc::clone(progress);

    let mut remaining: Vec<usize> = group.task_indices.clone();
    let mut attempt: u32 = 0;
    while !remaining.is_empty() {
        attempt += 1;
        let final_attempt = attempt > max_retries;
        events.emit(
            session_id,
            SessionEvent::WorkerStarted {
                worker_id: group.worker_id.clone(),
                task_count: remaining.len(),
                attempt,
            },
        );

        let mut retry: Vec<usize> = Vec::new();
        for &ti in &remaining {
            let task = &tasks[ti];
            if cancel_flag.load(Ordering::SeqCst) {
                // a session abort outranks any earlier stuck verdict on
                // this worker
                let stuck = !aborted.load(Ordering::SeqCst)
                    && verdicts.contains_key(&group.worker_id);
                // stuck cancellation gets the same retry-once treatment
                // as a timeout; an abort does not
                if stuck && !final_attempt {
                    retry.push(ti);
                    continue;
                }
                let reason = if stuck {
                    PartialReason::Stuck
                } else {
                    PartialReason::Cancelled
                };
                record_outcome(
                    outcomes,
                    events,
                    session_id,
                    &task.id,
                    TaskOutcome::Partial { reason },
                );
                continue;
            }

            shared_progress.insert(group.worker_id.clone(), Instant::now());
            let ctx = WorkerContext::new(
                group.worker_id.clone(),
                session_id.to_string(),
                task.id.clone(),
                Arc::clone(&exclusive),
                session_registry.clone(),
                Arc::clone(budgets),
                Arc::clone(&shared_progress),
                Arc::clone(cancel_flag),
                events.clone(),
            );

            match tokio::time::timeout(attempt_timeout, executor.execute(task, &ctx)).await {
                Ok(Ok(())) => {
                    record_outcome(outcomes, events, session_id, &task.id, TaskOutcome::Completed);
                }
                Ok(Err(err)) => match err.downcast_ref::<FanoutError>() {
                    Some(FanoutError::BudgetExceeded { .. }) => {
                        // hard budget stop keeps its partial results and
                        // never retries
                        record_outcome(
                            outcomes,
                            events,
                            session_id,
                            &task.id,
                            TaskOutcome::Partial {
                                reason: PartialReason::BudgetExceeded,
                            },
                        );
                    }
                    Some(FanoutError::Cancelled { .. }) => {
                        let stuck = !aborted.load(Ordering::SeqCst)
                            && verdicts.contains_key(&group.worker_id);
                        if stuck && !final_attempt {
                            retry.push(ti);
                            continue;
                        }
                        let reason = if stuck {
                            PartialReason::Stuck
                        } else {
                            PartialReason::Cancelled
                        };
                        record_outcome(
                            outcomes,
                            events,
                            session_id,
                            &task.id,
                            TaskOutcome::Partial { reason },
                        );
                    }
                    _ => {
                        if final_attempt {
                            record_outcome(
                                outcomes,
                                events,
                                session_id,
                                &task.id,
                                TaskOutcome::Failed {
                                    reason: format!("{err:#}"),
                                },
                            );
                        } else {
                            debug!(task_id = %task.id, error = %err, "task failed, queued for retry");
                            retry.push(ti);
                        }
                    }
                },
                Err(_) => {
                    if final_attempt {
                        warn!(
                            task_id = %task.id,
                            timeout_ms = attempt_timeout.as_millis() as u64,
                            "task timed out on final attempt"
                        );
                        record_outcome(
                            outcomes,
                            events,
                            session_id,
                            &task.id,
                            TaskOutcome::Partial {
                                reason: PartialReason::Timeout,
                            },
                        );
                    } else {
                        debug!(task_id = %task.id, "task timed out, queued for retry");
                        retry.push(ti);
                    }
                }
            }
        }

        // lift a stuck-driven cancellation before the retry round; the
        // refreshed marker keeps the monitor from instantly re-flagging
        if !retry.is_empty()
            && cancel_flag.load(Ordering::SeqCst)
            && !aborted.load(Ordering::SeqCst)
            && verdicts.contains_key(&group.worker_id)
        {
            cancel_flag.store(false, Ordering::SeqCst);
            shared_progress.insert(group.worker_id.clone(), Instant::now());
        }
        remaining = retry;
    }

    group
        .task_indices
        .iter()
        .all(|&ti| matches!(outcomes.get(&tasks[ti].id).map(|o| o.value().clone()), Some(TaskOutcome::Completed)))
}

fn record_outcome(
    outcomes: &DashMap<String, TaskOutcome>,
    events: &EventBus,
    session_id: &str,
    task_id: &str,
    outcome: TaskOutcome,
) {
    let (completed, partial) = match &outcome {
        TaskOutcome::Completed => (true, None),
        TaskOutcome::Partial { reason } => (false, Some(*reason)),
        TaskOutcome::Failed { .. } => (false, None),
    };
    outcomes.insert(task_id.to_string(), outcome);
    events.emit(
        session_id,
        SessionEvent::TaskFinished {
            task_id: task_id.to_string(),
            completed,
            partial,
        },
    );
}
