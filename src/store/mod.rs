/// Record Store Layer
///
/// This module holds the in-memory tables of one logical database and their
/// snapshot persistence:
/// - Type definitions (runs, steps, events, hooks, queue messages)
/// - Versioned snapshot documents in a local key-value layer
/// - The registry that owns one store per database name

// Record type definitions
pub mod types;

// Snapshot documents and key-value backends (SQLite, memory)
pub mod snapshot;

// Registry of stores keyed by database name
pub mod registry;

use anyhow::Result;
use snapshot::SnapshotBackend;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{Mutex, MutexGuard};
use types::{QueueMessage, WorkflowEvent, WorkflowHook, WorkflowRun, WorkflowStep};
use uuid::Uuid;

pub use registry::StoreRegistry;
pub use snapshot::{MemorySnapshotBackend, SnapshotChange, SqliteSnapshotBackend};

/// All tables of one database
#[derive(Debug, Default, Clone)]
pub struct Tables {
    /// Key: run_id
    pub runs: BTreeMap<String, WorkflowRun>,
    /// Key: "{run_id}-{step_id}"
    pub steps: BTreeMap<String, WorkflowStep>,
    /// Append-only, creation order
    pub events: Vec<WorkflowEvent>,
    /// Key: hook_id
    pub hooks: BTreeMap<String, WorkflowHook>,
    /// Enqueue order
    pub queue: Vec<QueueMessage>,
}

/// Tables of one database name plus its snapshot location
///
/// Holding the guard returned by [`Store::lock`] makes a read-check-write
/// sequence atomic with respect to every other operation on this store.
pub struct Store {
    db_name: String,
    snapshot_key: String,
    tables: Mutex<Tables>,
    /// Serializes snapshot writes and reloads
    persist_lock: Mutex<()>,
    backend: Arc<dyn SnapshotBackend>,
    origin: Uuid,
}

impl Store {
    pub(crate) fn new(
        db_name: String,
        snapshot_key: String,
        backend: Arc<dyn SnapshotBackend>,
        origin: Uuid,
    ) -> Self {
        Self {
            db_name,
            snapshot_key,
            tables: Mutex::new(Tables::default()),
            persist_lock: Mutex::new(()),
            backend,
            origin,
        }
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn snapshot_key(&self) -> &str {
        &self.snapshot_key
    }

    /// Exclusive access to the tables
    pub async fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().await
    }

    /// Write the current tables to the snapshot layer
    ///
    /// The document is taken while holding the write lock, so a snapshot of a
    /// later state is never overwritten by one of an earlier state.
    pub async fn persist(&self) -> Result<()> {
        let _write = self.persist_lock.lock().await;
        let document = {
            let tables = self.tables.lock().await;
            snapshot::encode(&tables)?
        };
        self.backend
            .put(&self.snapshot_key, &document, self.origin)
            .await
    }

    /// Replace the in-memory tables with the persisted snapshot
    ///
    /// A missing snapshot yields empty tables; an unreadable one is logged and
    /// also yields empty tables.
    pub async fn load(&self) {
        let _write = self.persist_lock.lock().await;
        let loaded = match self.read_snapshot().await {
            Ok(Some(tables)) => {
                tracing::debug!(
                    "Loaded snapshot for '{}': {} runs, {} events, {} queue messages",
                    self.db_name,
                    tables.runs.len(),
                    tables.events.len(),
                    tables.queue.len()
                );
                tables
            }
            Ok(None) => Tables::default(),
            Err(e) => {
                tracing::warn!(
                    "Failed to load snapshot for '{}', starting empty: {}",
                    self.db_name,
                    e
                );
                Tables::default()
            }
        };
        *self.tables.lock().await = loaded;
    }

    async fn read_snapshot(&self) -> Result<Option<Tables>> {
        match self.backend.get(&self.snapshot_key).await? {
            Some(text) => Ok(Some(snapshot::decode(&text)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_name", &self.db_name)
            .field("snapshot_key", &self.snapshot_key)
            .finish()
    }
}
