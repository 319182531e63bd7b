//! Worker-side execution surface: the `TaskExecutor` trait implemented by
//! callers, plus the contexts handed to it. The context is where ownership
//! and budget enforcement actually happen; an executor physically cannot
//! write outside its worker's exclusive set.

use crate::budget::{BudgetManager, BudgetSignal};
use crate::core::errors::{FanoutError, Result};
use crate::exec::events::{EventBus, SessionEvent};
use crate::model::{ResourceAddress, ResourcePattern, Task};
use crate::registry::{RegistryManager, SessionRegistry};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Implemented by the caller to do the actual work of a task. The engine
/// owns scheduling, isolation, and accounting; the executor owns the
/// domain logic.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one task inside the parallel phase. Registry writes and usage
    /// reports go through the context.
    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> anyhow::Result<()>;

    /// Resolve one task's contribution to a shared resource during the
    /// sequential phase. Called once per (resource, touching task), in
    /// submission order.
    async fn resolve_shared(
        &self,
        task: &Task,
        address: &ResourceAddress,
        ctx: &SequentialContext,
    ) -> anyhow::Result<()>;
}

/// Per-attempt execution context for one task on one worker.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub worker_id: String,
    pub session_id: String,
    pub task_id: String,
    exclusive: Arc<Vec<ResourcePattern>>,
    registry: SessionRegistry,
    budgets: Arc<BudgetManager>,
    progress: Arc<DashMap<String, Instant>>,
    cancelled: Arc<AtomicBool>,
    events: EventBus,
}

impl WorkerContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker_id: String,
        session_id: String,
        task_id: String,
        exclusive: Arc<Vec<ResourcePattern>>,
        registry: SessionRegistry,
        budgets: Arc<BudgetManager>,
        progress: Arc<DashMap<String, Instant>>,
        cancelled: Arc<AtomicBool>,
        events: EventBus,
    ) -> Self {
        Self {
            worker_id,
            session_id,
            task_id,
            exclusive,
            registry,
            budgets,
            progress,
            cancelled,
            events,
        }
    }

    /// Record a created or updated resource in this worker's session
    /// registry. The address must fall inside the worker's exclusive set;
    /// anything else is an ownership violation, not a write.
    pub fn write_entry(
        &self,
        address: &str,
        summary: &str,
        metadata: serde_json::Value,
        cost_units: u64,
    ) -> Result<()> {
        let addr = ResourceAddress::new(address)?;
        if !self.exclusive.iter().any(|p| p.matches(&addr)) {
            warn!(
                worker_id = %self.worker_id,
                task_id = %self.task_id,
                address = %addr,
                "write outside exclusive set rejected"
            );
            return Err(FanoutError::ownership_conflict(
                &self.task_id,
                format!(
                    "worker '{}' attempted to write '{}' outside its exclusive set",
                    self.worker_id, addr
                ),
            ));
        }
        self.mark_progress();
        self.registry
            .append(&addr, &self.task_id, summary, metadata, cost_units)
    }

    /// Report units consumed by the running task. On first exhaustion the
    /// one-time extension is claimed automatically; only consumption past
    /// the extended cap comes back as an error.
    pub fn record_usage(&self, units: u64) -> Result<()> {
        self.mark_progress();
        match self.budgets.record_usage(&self.task_id, units)? {
            BudgetSignal::Ok { .. } => Ok(()),
            BudgetSignal::Warning {
                consumed,
                allocated,
            } => {
                self.events.emit(
                    &self.session_id,
                    SessionEvent::BudgetWarning {
                        task_id: self.task_id.clone(),
                        consumed,
                        allocated,
                    },
                );
                Ok(())
            }
            BudgetSignal::Exceeded {
                consumed,
                allocated,
                extension_available,
            } => {
                self.events.emit(
                    &self.session_id,
                    SessionEvent::BudgetWarning {
                        task_id: self.task_id.clone(),
                        consumed,
                        allocated,
                    },
                );
                if extension_available {
                    let new_cap = self.budgets.request_extension(&self.task_id)?;
                    debug!(
                        task_id = %self.task_id,
                        new_cap,
                        "budget extension claimed"
                    );
                }
                Ok(())
            }
        }
    }

    /// Touch this worker's liveness marker. Called implicitly by every
    /// context operation; long pure-compute stretches should call it
    /// directly.
    pub fn mark_progress(&self) {
        self.progress.insert(self.worker_id.clone(), Instant::now());
    }

    /// Set once the health monitor declares this worker stuck. Executors
    /// should stop at the next convenient point.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cooperative cancellation point: cheap to call between work steps,
    /// returns the cancellation as an error so `?` unwinds the executor.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(FanoutError::cancelled_because(
                &self.task_id,
                "worker cancelled by health monitor",
            ));
        }
        self.mark_progress();
        Ok(())
    }
}

/// Context for sequential-phase resolutions. Writes go straight to the
/// master registry; with a single resolver running, last-writer-wins is
/// deterministic.
pub struct SequentialContext {
    pub session_id: String,
    pub task_id: String,
    registry: Arc<RegistryManager>,
    budgets: Arc<BudgetManager>,
    events: EventBus,
}

impl SequentialContext {
    pub(crate) fn new(
        session_id: String,
        task_id: String,
        registry: Arc<RegistryManager>,
        budgets: Arc<BudgetManager>,
        events: EventBus,
    ) -> Self {
        Self {
            session_id,
            task_id,
            registry,
            budgets,
            events,
        }
    }

    /// Write to the master registry on behalf of the resolving task
    pub fn write_entry(
        &self,
        address: &str,
        summary: &str,
        metadata: serde_json::Value,
        cost_units: u64,
    ) -> Result<()> {
        let addr = ResourceAddress::new(address)?;
        self.registry
            .write_sequential(&addr, &self.task_id, summary, metadata, cost_units)
    }

    /// Read the consolidated state of a resource, typically the parallel
    /// phase's partial contributions to the one being resolved
    pub fn read_entry(&self, address: &str) -> Result<Option<crate::registry::RegistryEntry>> {
        self.registry.get(address)
    }

    /// Sequential work draws from the same per-task budget as the
    /// parallel phase did.
    pub fn record_usage(&self, units: u64) -> Result<()> {
        match self.budgets.record_usage(&self.task_id, units)? {
            BudgetSignal::Ok { .. } => Ok(()),
            BudgetSignal::Warning {
                consumed,
                allocated,
            }
            | BudgetSignal::Exceeded {
                consumed,
                allocated,
                ..
            } => {
                self.events.emit(
                    &self.session_id,
                    SessionEvent::BudgetWarning {
                        task_id: self.task_id.clone(),
                        consumed,
                        allocated,
                    },
                );
                Ok(())
            }
        }
    }
}
