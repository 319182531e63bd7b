//! State and checkpoint manager. Every persist goes through a staging
//! key, a flush, a re-read, and a schema check before it replaces the
//! live document, so a half-written or hand-edited state can never be
//! picked up silently.

use crate::budget::BudgetSnapshot;
use crate::core::errors::{FanoutError, Result};
use crate::exec::session::Session;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STATE_TREE: &str = "state";
const CHECKPOINT_TREE: &str = "checkpoints";
const LIVE_KEY: &[u8] = b"live";
const STAGING_KEY: &[u8] = b"staging";

/// Why a checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    PhaseTransition,
    Interval,
    RiskyOperation,
    ErrorCaught,
    /// Taken before each shared-resource resolution, so a sequential-phase
    /// crash resumes at the failed resolution instead of replaying all
    SharedResolution,
}

/// How far consolidation and sequential resolution have progressed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationProgress {
    pub merged_entries: usize,
    /// Shared addresses fully resolved, in resolution order
    pub resolved_shared: Vec<String>,
}

/// The complete recoverable state of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub session: Session,
    pub budgets: Vec<BudgetSnapshot>,
    pub consolidation: ConsolidationProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub trigger: CheckpointTrigger,
    pub created_at: DateTime<Utc>,
    pub state: StateDocument,
}

/// Listing entry; the full document stays on disk until restored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub id: String,
    pub trigger: CheckpointTrigger,
    pub created_at: DateTime<Utc>,
}

fn state_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["session", "budgets", "consolidation"],
        "properties": {
            "session": {
                "type": "object",
                "required": ["id", "started_at", "status", "active_workers"],
                "properties": {
                    "id": { "type": "string", "minLength": 1 },
                    "started_at": { "type": "string" },
                    "status": {
                        "enum": [
                            "planning", "running", "consolidating",
                            "sequential_phase", "complete", "failed"
                        ]
                    },
                    "active_workers": {
                        "type": "array",
                        "items": { "type": "string" }
                    }
                }
            },
            "budgets": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["task_id", "allocated", "consumed", "extension_granted"],
                    "properties": {
                        "task_id": { "type": "string", "minLength": 1 },
                        "allocated": { "type": "integer", "minimum": 0 },
                        "consumed": { "type": "integer", "minimum": 0 },
                        "extension_granted": { "type": "boolean" }
                    }
                }
            },
            "consolidation": {
                "type": "object",
                "required": ["merged_entries", "resolved_shared"],
                "properties": {
                    "merged_entries": { "type": "integer", "minimum": 0 },
                    "resolved_shared": {
                        "type": "array",
                        "items": { "type": "string" }
                    }
                }
            }
        }
    })
}

/// Owns the live state document and the checkpoint history.
pub struct StateManager {
    state: sled::Tree,
    checkpoints: sled::Tree,
    validator: jsonschema::Validator,
    sequence: std::sync::atomic::AtomicU64,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("checkpoints", &self.checkpoints.len())
            .finish()
    }
}

impl StateManager {
    pub fn new(db: &sled::Db) -> Result<Self> {
        let validator = jsonschema::validator_for(&state_schema())
            .map_err(|e| FanoutError::internal(format!("state schema is invalid: {e}")))?;
        Ok(Self {
            state: db.open_tree(STATE_TREE)?,
            checkpoints: db.open_tree(CHECKPOINT_TREE)?,
            validator,
            sequence: std::sync::atomic::AtomicU64::new(0),
        })
    }

    fn check_schema(&self, raw: &[u8]) -> Result<StateDocument> {
        let value: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| FanoutError::state_corruption(format!("unparseable state: {e}")))?;
        if let Err(error) = self.validator.validate(&value) {
            return Err(FanoutError::state_corruption(format!(
                "state failed schema validation at {}: {}",
                error.instance_path, error
            )));
        }
        serde_json::from_value(value)
            .map_err(|e| FanoutError::state_corruption(format!("undeserializable state: {e}")))
    }

    /// Persist the live document: stage, flush, read back, schema-check,
    /// then swap in. A failure at any step leaves the previous live state
    /// untouched.
    pub fn persist(&self, document: &StateDocument) -> Result<()> {
        let raw = serde_json::to_vec(document)?;
        self.state.insert(STAGING_KEY, raw)?;
        self.state.flush()?;

        let staged = self.state.get(STAGING_KEY)?.ok_or_else(|| {
            FanoutError::state_corruption("staged state disappeared before verification")
        })?;
        if let Err(err) = self.check_schema(&staged) {
            warn!(error = %err, "state verification failed, previous state retained");
            self.state.remove(STAGING_KEY)?;
            return Err(err);
        }

        self.state.insert(LIVE_KEY, staged)?;
        self.state.remove(STAGING_KEY)?;
        self.state.flush()?;
        debug!(session_id = %document.session.id, "state persisted");
        Ok(())
    }

    /// Load the live document, if any. Validation runs again on read; a
    /// corrupted document is an error, never a default.
    pub fn load(&self) -> Result<Option<StateDocument>> {
        match self.state.get(LIVE_KEY)? {
            Some(raw) => Ok(Some(self.check_schema(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist the document and record it as a named checkpoint.
    pub fn checkpoint(
        &self,
        trigger: CheckpointTrigger,
        document: &StateDocument,
    ) -> Result<Checkpoint> {
        self.persist(document)?;
        let created_at = Utc::now();
        // zero-padded millis plus a process-local counter keep
        // lexicographic key order chronological
        let seq = self
            .sequence
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let id = format!(
            "ckpt-{:020}-{seq:06}-{}",
            created_at.timestamp_millis(),
            &Uuid::new_v4().to_string()[..8]
        );
        let checkpoint = Checkpoint {
            id: id.clone(),
            trigger,
            created_at,
            state: document.clone(),
        };
        self.checkpoints
            .insert(id.as_bytes(), serde_json::to_vec(&checkpoint)?)?;
        self.checkpoints.flush()?;
        info!(checkpoint_id = %id, ?trigger, "checkpoint recorded");
        Ok(checkpoint)
    }

    /// All checkpoints, newest first
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>> {
        let mut out = Vec::new();
        for item in self.checkpoints.iter().rev() {
            let (_, raw) = item?;
            let checkpoint: Checkpoint = serde_json::from_slice(&raw)
                .map_err(|e| FanoutError::state_corruption(format!("bad checkpoint: {e}")))?;
            out.push(CheckpointInfo {
                id: checkpoint.id,
                trigger: checkpoint.trigger,
                created_at: checkpoint.created_at,
            });
        }
        Ok(out)
    }

    /// Replace the live state with a checkpoint's document and return it.
    pub fn restore(&self, checkpoint_id: &str) -> Result<StateDocument> {
        let raw = self
            .checkpoints
            .get(checkpoint_id.as_bytes())?
            .ok_or_else(|| {
                FanoutError::validation_field(
                    format!("unknown checkpoint '{checkpoint_id}'"),
                    "checkpoint_id",
                )
            })?;
        let checkpoint: Checkpoint = serde_json::from_slice(&raw)
            .map_err(|e| FanoutError::state_corruption(format!("bad checkpoint: {e}")))?;
        self.persist(&checkpoint.state)?;
        info!(checkpoint_id, "state restored from checkpoint");
        Ok(checkpoint.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::session::SessionStatus;
    use pretty_assertions::assert_eq;

    fn open_manager() -> (StateManager, sled::Db, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (StateManager::new(&db).unwrap(), db, dir)
    }

    fn document() -> StateDocument {
        let mut session = Session::new();
        session.transition_to(SessionStatus::Running).unwrap();
        session.active_workers = vec!["worker-0".into(), "worker-1".into()];
        StateDocument {
            session,
            budgets: vec![BudgetSnapshot {
                task_id: "t1".into(),
                allocated: 10_000,
                consumed: 2_500,
                extension_granted: false,
                chain: crate::budget::MultiplierChain {
                    base_units: 10_000,
                    depth: 1.0,
                    complexity: 1.0,
                    resource_factor: 1.0,
                    priority: 1.0,
                },
            }],
            consolidation: ConsolidationProgress::default(),
        }
    }

    #[test]
    fn test_persist_and_load_round_trip() {
        let (manager, _db, _dir) = open_manager();
        assert!(manager.load().unwrap().is_none());

        let doc = document();
        manager.persist(&doc).unwrap();
        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn test_corrupted_live_state_is_an_error_not_a_default() {
        let (manager, db, _dir) = open_manager();
        manager.persist(&document()).unwrap();

        let tree = db.open_tree(STATE_TREE).unwrap();
        tree.insert(LIVE_KEY, &b"{\"session\": 42}"[..]).unwrap();

        let err = manager.load().unwrap_err();
        assert!(matches!(err, FanoutError::StateCorruption { .. }));
    }

    #[test]
    fn test_restore_reproduces_checkpointed_state_exactly() {
        let (manager, _db, _dir) = open_manager();
        let doc = document();
        let checkpoint = manager
            .checkpoint(CheckpointTrigger::PhaseTransition, &doc)
            .unwrap();

        // live state moves on
        let mut later = doc.clone();
        later.budgets[0].consumed = 9_000;
        later.consolidation.merged_entries = 4;
        manager.persist(&later).unwrap();
        assert_eq!(manager.load().unwrap().unwrap(), later);

        let restored = manager.restore(&checkpoint.id).unwrap();
        assert_eq!(restored, doc);
        assert_eq!(manager.load().unwrap().unwrap(), doc);
    }

    #[test]
    fn test_checkpoints_listed_newest_first() {
        let (manager, _db, _dir) = open_manager();
        let doc = document();
        let first = manager
            .checkpoint(CheckpointTrigger::PhaseTransition, &doc)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = manager
            .checkpoint(CheckpointTrigger::Interval, &doc)
            .unwrap();

        let listed = manager.list_checkpoints().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[test]
    fn test_restore_unknown_checkpoint_fails() {
        let (manager, _db, _dir) = open_manager();
        assert!(manager.restore("ckpt-missing").is_err());
    }
}
