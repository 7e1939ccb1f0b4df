/// Registry of record stores keyed by database name
///
/// The single place stores are created. A store is created lazily on first
/// access, loaded from its snapshot, and cached for the registry's lifetime.

use super::snapshot::{MemorySnapshotBackend, SnapshotBackend};
use super::Store;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tokio::{
    sync::{broadcast::error::RecvError, RwLock},
    task::JoinHandle,
};
use uuid::Uuid;

/// Default key namespace of snapshots
pub const DEFAULT_NAMESPACE: &str = "wkf_emulator";

pub struct StoreRegistry {
    stores: RwLock<HashMap<String, Arc<Store>>>,
    backend: Arc<dyn SnapshotBackend>,
    namespace: String,
    /// Identity stamped on every snapshot this registry writes
    origin: Uuid,
}

impl StoreRegistry {
    pub fn new(backend: Arc<dyn SnapshotBackend>, namespace: impl Into<String>) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            backend,
            namespace: namespace.into(),
            origin: Uuid::new_v4(),
        }
    }

    /// Registry over a fresh in-memory key-value layer
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySnapshotBackend::new()), DEFAULT_NAMESPACE)
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn backend(&self) -> Arc<dyn SnapshotBackend> {
        Arc::clone(&self.backend)
    }

    fn key_prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    pub fn snapshot_key(&self, db_name: &str) -> String {
        format!("{}:{}", self.namespace, db_name)
    }

    fn db_name_from_key<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(&self.key_prefix())
    }

    /// Get or create the store for a database name
    pub async fn get(&self, db_name: &str) -> Arc<Store> {
        // Fast path for existing stores
        {
            let stores = self.stores.read().await;
            if let Some(store) = stores.get(db_name) {
                return Arc::clone(store);
            }
        }

        let mut stores = self.stores.write().await;

        // Double-check, another task might have created it
        if let Some(store) = stores.get(db_name) {
            return Arc::clone(store);
        }

        tracing::info!("Opening record store for database '{}'", db_name);
        let store = Arc::new(Store::new(
            db_name.to_string(),
            self.snapshot_key(db_name),
            Arc::clone(&self.backend),
            self.origin,
        ));
        store.load().await;
        stores.insert(db_name.to_string(), Arc::clone(&store));
        store
    }

    /// Database names touched in this session plus those only present in the
    /// snapshot layer, sorted
    pub async fn known_db_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.stores.read().await.keys().cloned().collect();

        match self.backend.list_keys(&self.key_prefix()).await {
            Ok(keys) => {
                names.extend(
                    keys.iter()
                        .filter_map(|key| self.db_name_from_key(key))
                        .map(str::to_string),
                );
            }
            Err(e) => tracing::warn!("Failed to list persisted databases: {}", e),
        }

        names.into_iter().collect()
    }

    /// Reload a cached store from its snapshot after an outside write
    ///
    /// Returns false when the store was never opened; it will load fresh on
    /// first access anyway.
    pub async fn reload(&self, db_name: &str) -> bool {
        let store = self.stores.read().await.get(db_name).cloned();
        match store {
            Some(store) => {
                tracing::info!("Reloading database '{}' after external change", db_name);
                store.load().await;
                true
            }
            None => false,
        }
    }

    async fn reload_all(&self) {
        let names: Vec<String> = self.stores.read().await.keys().cloned().collect();
        for name in names {
            self.reload(&name).await;
        }
    }

    /// Follow snapshot writes made by other registries sharing the backend
    ///
    /// Last write wins: a reload replaces local state that was not persisted yet.
    pub fn watch_changes(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut changes = self.backend.subscribe();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if change.origin == registry.origin {
                            continue;
                        }
                        if let Some(db_name) = registry.db_name_from_key(&change.key) {
                            let db_name = db_name.to_string();
                            registry.reload(&db_name).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} snapshot notifications, reloading all stores", skipped);
                        registry.reload_all().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("namespace", &self.namespace)
            .field("origin", &self.origin)
            .finish()
    }
}
