//! Registry manager: each worker appends to its own session-scoped sled
//! tree during the parallel phase, eliminating write contention; a
//! consolidation step merges session registries into the master registry
//! on a timer and at session end.

use crate::core::errors::{FanoutError, Result};
use crate::exec::events::{EventBus, SessionEvent};
use crate::model::ResourceAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SESSION_TREE_PREFIX: &str = "registry/";
const MASTER_TREE: &str = "registry_master";
const LOG_TREE: &str = "registry_log";
const META_TREE: &str = "registry_meta";

/// Worker id recorded on entries written by the sequential phase, which
/// runs on the orchestrator rather than any parallel worker
pub const SEQUENTIAL_WORKER: &str = "sequential";

/// One record of a created/updated resource. Written once by its owning
/// worker; merged (read-copied) into the master, never mutated in place
/// after merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub address: String,
    pub worker_id: String,
    /// The task the write was made on behalf of
    pub task_id: String,
    pub summary: String,
    pub metadata: serde_json::Value,
    pub cost_units: u64,
    pub created_at: DateTime<Utc>,
    /// Consolidation status: false = pending, true = merged
    pub merged: bool,
    /// Written by the single-threaded sequential phase; last-writer-wins
    /// applies only to these
    pub sequential: bool,
}

/// Append-only audit record of one merge event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationRecord {
    pub timestamp: DateTime<Utc>,
    pub entries_merged: usize,
    pub source_registries: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionTreeMeta {
    created_at_ms: u64,
    fully_merged: bool,
}

/// Handle to one worker's private session registry. Only the owning
/// worker writes here.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    tree: sled::Tree,
    pub session_id: String,
    pub worker_id: String,
}

impl SessionRegistry {
    pub fn append(
        &self,
        address: &ResourceAddress,
        task_id: &str,
        summary: &str,
        metadata: serde_json::Value,
        cost_units: u64,
    ) -> Result<()> {
        let entry = RegistryEntry {
            address: address.to_string(),
            worker_id: self.worker_id.clone(),
            task_id: task_id.to_string(),
            summary: summary.to_string(),
            metadata,
            cost_units,
            created_at: Utc::now(),
            merged: false,
            sequential: false,
        };
        // a retried attempt may rewrite its own entry; that resets it to
        // pending and it re-merges under the same worker id
        self.tree
            .insert(entry.address.as_bytes(), serde_json::to_vec(&entry)?)?;
        debug!(
            worker_id = %self.worker_id,
            address = %entry.address,
            "registry entry written"
        );
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<RegistryEntry>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Owns the master registry, the consolidation log, and the lifecycle of
/// session registries.
#[derive(Debug)]
pub struct RegistryManager {
    db: sled::Db,
    master: sled::Tree,
    log: sled::Tree,
    meta: sled::Tree,
}

impl RegistryManager {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            db: db.clone(),
            master: db.open_tree(MASTER_TREE)?,
            log: db.open_tree(LOG_TREE)?,
            meta: db.open_tree(META_TREE)?,
        })
    }

    fn session_tree_name(session_id: &str, worker_id: &str) -> String {
        format!("{SESSION_TREE_PREFIX}{session_id}/{worker_id}")
    }

    /// Open (creating if needed) the private registry for one worker
    pub fn session_registry(&self, session_id: &str, worker_id: &str) -> Result<SessionRegistry> {
        let name = Self::session_tree_name(session_id, worker_id);
        let tree = self.db.open_tree(name.as_bytes())?;
        if self.meta.get(name.as_bytes())?.is_none() {
            let meta = SessionTreeMeta {
                created_at_ms: Utc::now().timestamp_millis() as u64,
                fully_merged: false,
            };
            self.meta
                .insert(name.as_bytes(), serde_json::to_vec(&meta)?)?;
        }
        Ok(SessionRegistry {
            tree,
            session_id: session_id.to_string(),
            worker_id: worker_id.to_string(),
        })
    }

    fn session_tree_names(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter_map(|name| String::from_utf8(name.to_vec()).ok())
            .filter(|name| name.starts_with(SESSION_TREE_PREFIX))
            .collect()
    }

    /// Merge pending session-registry entries into the master registry.
    ///
    /// A duplicate address from two different workers in the parallel
    /// phase means the ownership assignment was violated; that raises a
    /// `ResourceIntegrity` error instead of picking a winner.
    pub fn consolidate(&self) -> Result<ConsolidationRecord> {
        let mut entries_merged = 0usize;
        let mut sources = Vec::new();

        for name in self.session_tree_names() {
            let tree = self.db.open_tree(name.as_bytes())?;
            let mut merged_from_tree = 0usize;
            let mut pending = 0usize;

            for item in tree.iter() {
                let (key, value) = item?;
                let mut entry: RegistryEntry = serde_json::from_slice(&value)?;
                if entry.merged {
                    continue;
                }
                pending += 1;

                if let Some(existing_raw) = self.master.get(&key)? {
                    let existing: RegistryEntry = serde_json::from_slice(&existing_raw)?;
                    if existing.worker_id != entry.worker_id
                        && !existing.sequential
                        && !entry.sequential
                    {
                        return Err(FanoutError::resource_integrity(
                            entry.address,
                            format!(
                                "written by both '{}' and '{}' during the parallel phase",
                                existing.worker_id, entry.worker_id
                            ),
                        ));
                    }
                }

                let mut master_copy = entry.clone();
                master_copy.merged = true;
                self.master
                    .insert(&key, serde_json::to_vec(&master_copy)?)?;

                entry.merged = true;
                tree.insert(&key, serde_json::to_vec(&entry)?)?;
                merged_from_tree += 1;
            }

            if merged_from_tree > 0 {
                sources.push(name.clone());
            }
            if pending == merged_from_tree {
                self.mark_fully_merged(&name)?;
            }
            entries_merged += merged_from_tree;
        }
        self.db.flush()?;

        self.finish_consolidation(ConsolidationRecord {
            timestamp: Utc::now(),
            entries_merged,
            source_registries: sources,
        })
    }

    fn finish_consolidation(&self, record: ConsolidationRecord) -> Result<ConsolidationRecord> {
        let key = self.db.generate_id()?.to_be_bytes();
        self.log.insert(key, serde_json::to_vec(&record)?)?;
        info!(
            entries_merged = record.entries_merged,
            sources = record.source_registries.len(),
            "registry consolidation complete"
        );
        Ok(record)
    }

    fn mark_fully_merged(&self, tree_name: &str) -> Result<()> {
        if let Some(raw) = self.meta.get(tree_name.as_bytes())? {
            let mut meta: SessionTreeMeta = serde_json::from_slice(&raw)?;
            if !meta.fully_merged {
                meta.fully_merged = true;
                self.meta
                    .insert(tree_name.as_bytes(), serde_json::to_vec(&meta)?)?;
            }
        }
        Ok(())
    }

    /// Direct master write from the single-threaded sequential phase.
    /// Last-writer-wins is intended here, and only here.
    pub fn write_sequential(
        &self,
        address: &ResourceAddress,
        task_id: &str,
        summary: &str,
        metadata: serde_json::Value,
        cost_units: u64,
    ) -> Result<()> {
        let entry = RegistryEntry {
            address: address.to_string(),
            worker_id: SEQUENTIAL_WORKER.to_string(),
            task_id: task_id.to_string(),
            summary: summary.to_string(),
            metadata,
            cost_units,
            created_at: Utc::now(),
            merged: true,
            sequential: true,
        };
        self.master
            .insert(entry.address.as_bytes(), serde_json::to_vec(&entry)?)?;
        debug!(address = %entry.address, task_id, "sequential registry write");
        Ok(())
    }

    pub fn get(&self, address: &str) -> Result<Option<RegistryEntry>> {
        match self.master.get(address.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn master_len(&self) -> usize {
        self.master.len()
    }

    /// Merged entries whose address starts with the given prefix
    pub fn query_prefix(&self, prefix: &str) -> Result<Vec<RegistryEntry>> {
        let mut out = Vec::new();
        for item in self.master.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Merged entries created by the given worker
    pub fn query_worker(&self, worker_id: &str) -> Result<Vec<RegistryEntry>> {
        let mut out = Vec::new();
        for item in self.master.iter() {
            let (_, value) = item?;
            let entry: RegistryEntry = serde_json::from_slice(&value)?;
            if entry.worker_id == worker_id {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// The full append-only audit log, oldest first
    pub fn consolidation_log(&self) -> Result<Vec<ConsolidationRecord>> {
        let mut out = Vec::new();
        for item in self.log.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Drop fully-merged session registries older than the retention
    /// window. Returns how many were archived.
    pub fn archive_expired(&self, retention: Duration) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis() as u64;
        let cutoff = now_ms.saturating_sub(retention.as_millis() as u64);
        let mut archived = 0usize;

        for name in self.session_tree_names() {
            let Some(raw) = self.meta.get(name.as_bytes())? else {
                continue;
            };
            let meta: SessionTreeMeta = serde_json::from_slice(&raw)?;
            if meta.fully_merged && meta.created_at_ms <= cutoff {
                self.db.drop_tree(name.as_bytes())?;
                self.meta.remove(name.as_bytes())?;
                info!(registry = %name, "session registry archived");
                archived += 1;
            }
        }
        Ok(archived)
    }
}

/// Background consolidation loop: runs on a fixed interval until shut
/// down. An integrity failure is fatal to the session; it is parked in
/// the shared slot for the orchestrator and the loop stops.
pub fn spawn_consolidator(
    manager: Arc<RegistryManager>,
    interval: Duration,
    phase_lock: Arc<tokio::sync::Mutex<()>>,
    shutdown: Arc<AtomicBool>,
    fatal: Arc<Mutex<Option<FanoutError>>>,
    events: EventBus,
    session_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let _guard = phase_lock.lock().await;
            match manager.consolidate() {
                Ok(record) if record.entries_merged > 0 => {
                    events.emit(
                        &session_id,
                        SessionEvent::Consolidated {
                            entries_merged: record.entries_merged,
                            source_registries: record.source_registries.len(),
                        },
                    );
                }
                Ok(_) => {}
                Err(err @ FanoutError::ResourceIntegrity { .. }) => {
                    events.emit(
                        &session_id,
                        SessionEvent::SessionAlert {
                            message: err.to_string(),
                        },
                    );
                    if let Ok(mut slot) = fatal.lock() {
                        *slot = Some(err);
                    }
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "background consolidation failed, will retry");
                }
            }
        }
        debug!("background consolidator stopped");
    })
}
