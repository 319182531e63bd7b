//! Typed session events for external status consumers.
//!
//! The core only emits; dashboards and task producers subscribe. Emission
//! never blocks the engine: the channel drops its oldest entry on overflow.

use crate::exec::session::SessionStatus;
use crate::model::PartialReason;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Runtime event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    PhaseChanged {
        from: SessionStatus,
        to: SessionStatus,
    },
    WorkerStarted {
        worker_id: String,
        task_count: usize,
        attempt: u32,
    },
    WorkerFinished {
        worker_id: String,
        success: bool,
    },
    TaskFinished {
        task_id: String,
        completed: bool,
        partial: Option<PartialReason>,
    },
    BudgetWarning {
        task_id: String,
        consumed: u64,
        allocated: u64,
    },
    WorkerStuck {
        worker_id: String,
        idle_ms: u64,
    },
    /// More than half the active workers are stuck at once; usually a
    /// shared-resource misconfiguration rather than isolated failures
    SessionAlert {
        message: String,
    },
    Consolidated {
        entries_merged: usize,
        source_registries: usize,
    },
    SharedResolved {
        address: String,
        position: usize,
    },
}

/// Event envelope with ordering metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEventEnvelope {
    pub sequence: u64,
    pub session_id: String,
    pub timestamp_ms: u64,
    pub event: SessionEvent,
}

/// Broadcast bus for session events. Cloning is cheap; every component
/// that emits holds one.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: async_broadcast::Sender<SessionEventEnvelope>,
    // keeps the channel open while no external subscriber is attached
    inactive: async_broadcast::InactiveReceiver<SessionEventEnvelope>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity);
        tx.set_overflow(true);
        Self {
            tx,
            inactive: rx.deactivate(),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<SessionEventEnvelope> {
        self.inactive.activate_cloned()
    }

    pub fn emit(&self, session_id: &str, event: SessionEvent) {
        let envelope = SessionEventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            session_id: session_id.to_string(),
            timestamp_ms: now_ms(),
            event,
        };
        tracing::debug!(sequence = envelope.sequence, event = ?envelope.event, "session event");
        let _ = self.tx.try_broadcast(envelope);
    }
}

/// Current timestamp in milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit("s1", SessionEvent::SessionAlert { message: "a".into() });
        bus.emit("s1", SessionEvent::SessionAlert { message: "b".into() });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.sequence < second.sequence);
        assert_eq!(first.session_id, "s1");
    }

    #[tokio::test]
    async fn test_emission_without_subscribers_does_not_block() {
        let bus = EventBus::new(2);
        for i in 0..10 {
            bus.emit("s1", SessionEvent::SessionAlert { message: format!("{i}") });
        }
        // a late subscriber still receives fresh events
        let mut rx = bus.subscribe();
        bus.emit("s1", SessionEvent::SessionAlert { message: "late".into() });
        loop {
            let envelope = rx.recv().await.unwrap();
            if let SessionEvent::SessionAlert { message } = &envelope.event {
                if message == "late" {
                    break;
                }
            }
        }
    }
}
