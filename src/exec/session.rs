//! Session lifecycle: one end-to-end coordinated execution spanning
//! planning, parallel, consolidation, and sequential phases.

use crate::core::errors::{FanoutError, Result};
use crate::plan::OwnershipAssignment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Session phase. `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Planning,
    Running,
    Consolidating,
    SequentialPhase,
    Complete,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Planning, Running)
                | (Running, Consolidating)
                | (Consolidating, SequentialPhase)
                | (SequentialPhase, Complete)
        )
    }
}

/// Snapshot of one coordinated execution. Checkpointable; structural
/// equality is the restore contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// Worker ids currently executing
    pub active_workers: Vec<String>,
    /// Set once planning succeeds; consumed, never mutated, afterwards
    pub assignment: Option<OwnershipAssignment>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: format!("session-{}", Uuid::new_v4()),
            started_at: Utc::now(),
            status: SessionStatus::Planning,
            active_workers: Vec::new(),
            assignment: None,
        }
    }

    /// Advance the phase, rejecting transitions the state machine does
    /// not define.
    pub fn transition_to(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FanoutError::internal(format!(
                "invalid session transition {:?} -> {:?}",
                self.status, next
            )));
        }
        info!(session_id = %self.id, from = ?self.status, to = ?next, "session phase change");
        self.status = next;
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut session = Session::new();
        assert_eq!(session.status, SessionStatus::Planning);
        session.transition_to(SessionStatus::Running).unwrap();
        session.transition_to(SessionStatus::Consolidating).unwrap();
        session.transition_to(SessionStatus::SequentialPhase).unwrap();
        session.transition_to(SessionStatus::Complete).unwrap();
        assert!(session.status.is_terminal());
    }

    #[test]
    fn test_failed_reachable_from_any_active_state() {
        for status in [
            SessionStatus::Planning,
            SessionStatus::Running,
            SessionStatus::Consolidating,
            SessionStatus::SequentialPhase,
        ] {
            assert!(status.can_transition_to(SessionStatus::Failed));
        }
        assert!(!SessionStatus::Complete.can_transition_to(SessionStatus::Failed));
        assert!(!SessionStatus::Failed.can_transition_to(SessionStatus::Failed));
    }

    #[test]
    fn test_skipping_phases_rejected() {
        let mut session = Session::new();
        assert!(session.transition_to(SessionStatus::Consolidating).is_err());
        assert!(session.transition_to(SessionStatus::Complete).is_err());
        // state unchanged after the rejections
        assert_eq!(session.status, SessionStatus::Planning);
    }

    #[test]
    fn test_session_serde_round_trip() {
        let session = Session::new();
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
