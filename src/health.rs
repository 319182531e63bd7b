//! Health monitor: watches worker liveness markers and cancels workers
//! that stop making progress. Detection is conservative; a slow worker is
//! only stuck once it has been silent past the configured threshold.

use crate::exec::events::{EventBus, SessionEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Record of a stuck detection, kept for the session report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckVerdict {
    pub worker_id: String,
    pub idle_ms: u64,
    pub detected_at: DateTime<Utc>,
}

/// Workers whose last progress marker is older than the threshold.
/// Workers already cancelled are not re-reported.
fn stale_workers(
    progress: &DashMap<String, Instant>,
    cancel_flags: &DashMap<String, Arc<AtomicBool>>,
    threshold: Duration,
) -> Vec<(String, Duration)> {
    let mut out = Vec::new();
    for entry in cancel_flags.iter() {
        if entry.value().load(Ordering::SeqCst) {
            continue;
        }
        let idle = match progress.get(entry.key()) {
            Some(mark) => mark.elapsed(),
            // registered but never marked progress: treat as stale once
            // the threshold has passed since monitoring began, which the
            // orchestrator guarantees by seeding the marker at spawn
            None => continue,
        };
        if idle > threshold {
            out.push((entry.key().clone(), idle));
        }
    }
    out
}

/// Spawn the monitoring loop. Each poll marks stale workers stuck, sets
/// their cancellation flags, and raises a session-level alert once more
/// than half the registered workers are stuck at the same time.
#[allow(clippy::too_many_arguments)]
pub fn spawn_health_monitor(
    poll_interval: Duration,
    stuck_threshold: Duration,
    progress: Arc<DashMap<String, Instant>>,
    cancel_flags: Arc<DashMap<String, Arc<AtomicBool>>>,
    verdicts: Arc<DashMap<String, StuckVerdict>>,
    shutdown: Arc<AtomicBool>,
    events: EventBus,
    session_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut alerted = false;
        loop {
            tokio::time::sleep(poll_interval).await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            for (worker_id, idle) in stale_workers(&progress, &cancel_flags, stuck_threshold) {
                let idle_ms = idle.as_millis() as u64;
                warn!(worker_id = %worker_id, idle_ms, "worker stuck, cancelling");
                if let Some(flag) = cancel_flags.get(&worker_id) {
                    flag.store(true, Ordering::SeqCst);
                }
                verdicts.insert(
                    worker_id.clone(),
                    StuckVerdict {
                        worker_id: worker_id.clone(),
                        idle_ms,
                        detected_at: Utc::now(),
                    },
                );
                events.emit(&session_id, SessionEvent::WorkerStuck { worker_id, idle_ms });
            }

            let registered = cancel_flags.len();
            if !alerted && registered > 0 && verdicts.len() * 2 > registered {
                alerted = true;
                let message = format!(
                    "{} of {} workers stuck; the batch itself looks unhealthy",
                    verdicts.len(),
                    registered
                );
                warn!(session_id = %session_id, "{message}");
                events.emit(&session_id, SessionEvent::SessionAlert { message });
            }
        }
        debug!("health monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(
        progress: &DashMap<String, Instant>,
        flags: &DashMap<String, Arc<AtomicBool>>,
        worker_id: &str,
    ) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        progress.insert(worker_id.to_string(), Instant::now());
        flags.insert(worker_id.to_string(), Arc::clone(&flag));
        flag
    }

    #[test]
    fn test_fresh_workers_are_not_stale() {
        let progress = DashMap::new();
        let flags = DashMap::new();
        register(&progress, &flags, "worker-0");
        assert!(stale_workers(&progress, &flags, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_silent_worker_goes_stale() {
        let progress = DashMap::new();
        let flags = DashMap::new();
        register(&progress, &flags, "worker-0");
        std::thread::sleep(Duration::from_millis(20));
        let stale = stale_workers(&progress, &flags, Duration::from_millis(5));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, "worker-0");
    }

    #[test]
    fn test_cancelled_workers_not_re_reported() {
        let progress = DashMap::new();
        let flags = DashMap::new();
        let flag = register(&progress, &flags, "worker-0");
        std::thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::SeqCst);
        assert!(stale_workers(&progress, &flags, Duration::from_millis(5)).is_empty());
    }

    #[tokio::test]
    async fn test_monitor_cancels_stuck_worker_and_alerts() {
        let progress = Arc::new(DashMap::new());
        let flags = Arc::new(DashMap::new());
        let verdicts = Arc::new(DashMap::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let flag = register(&progress, &flags, "worker-0");
        let handle = spawn_health_monitor(
            Duration::from_millis(10),
            Duration::from_millis(25),
            Arc::clone(&progress),
            Arc::clone(&flags),
            Arc::clone(&verdicts),
            Arc::clone(&shutdown),
            bus.clone(),
            "s1".into(),
        );

        // the single worker stops marking progress entirely
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(flag.load(Ordering::SeqCst));
        assert!(verdicts.contains_key("worker-0"));

        let mut saw_stuck = false;
        let mut saw_alert = false;
        while let Ok(envelope) = rx.try_recv() {
            match envelope.event {
                SessionEvent::WorkerStuck { ref worker_id, .. } => {
                    assert_eq!(worker_id, "worker-0");
                    saw_stuck = true;
                }
                SessionEvent::SessionAlert { .. } => saw_alert = true,
                _ => {}
            }
        }
        assert!(saw_stuck);
        // 1 of 1 stuck crosses the half-of-active threshold
        assert!(saw_alert);

        shutdown.store(true, Ordering::SeqCst);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_active_worker_survives_monitoring() {
        let progress = Arc::new(DashMap::new());
        let flags = Arc::new(DashMap::new());
        let verdicts = Arc::new(DashMap::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let bus = EventBus::new(16);

        let flag = register(&progress, &flags, "worker-0");
        let handle = spawn_health_monitor(
            Duration::from_millis(10),
            Duration::from_millis(40),
            Arc::clone(&progress),
            Arc::clone(&flags),
            Arc::clone(&verdicts),
            Arc::clone(&shutdown),
            bus.clone(),
            "s1".into(),
        );

        for _ in 0..8 {
            progress.insert("worker-0".to_string(), Instant::now());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!flag.load(Ordering::SeqCst));
        assert!(verdicts.is_empty());

        shutdown.store(true, Ordering::SeqCst);
        handle.await.unwrap();
    }
}
