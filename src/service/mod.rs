/// Record Service
///
/// The only mutation path into the record stores. Every operation takes the
/// database name first and behaves the same whichever transport invoked it:
/// - Runs, steps, events and hooks CRUD
/// - Queue enqueue / poll / ack / nack / touch and stuck-message reclamation
/// - Wait resolution and signal derivation

// Run, step, event and hook operations
pub mod records;

// Queue message operations
pub mod queue;

// Time-based wait resolution and signal derivation
pub mod waits;

use crate::store::{Store, StoreRegistry};
use chrono::Utc;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

pub use queue::{
    Acknowledged, EnqueueOptions, Enqueued, PolledMessage, DEFAULT_MAX_ATTEMPTS, NACK_BACKOFF,
    STUCK_PROCESSING_TIMEOUT,
};
pub use records::{
    CreateEventRequest, CreateHookRequest, CreateRunRequest, CreateStepRequest, ListRunsParams,
    RunPage, StepPage, UpdateRunRequest, UpdateStepRequest, DEFAULT_LIST_LIMIT,
};
pub use waits::continuation_queue_name;

/// Generates `prefix + hex(millis) + random suffix` identifiers
///
/// The time component is strictly increasing per generator, so ids sort in
/// generation order even when several are issued in the same millisecond.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last_millis: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, prefix: &str) -> String {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let previous = self
            .last_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        let millis = now.max(previous + 1);
        let suffix: u32 = rand::random();
        format!("{}{:012x}{:08x}", prefix, millis, suffix)
    }
}

/// Record service over a store registry
#[derive(Debug)]
pub struct WorkflowService {
    registry: Arc<StoreRegistry>,
    ids: IdGenerator,
}

impl WorkflowService {
    pub fn new(registry: Arc<StoreRegistry>) -> Self {
        Self {
            registry,
            ids: IdGenerator::new(),
        }
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    async fn store(&self, db_name: &str) -> Arc<Store> {
        self.registry.get(db_name).await
    }

    /// Best-effort snapshot after a mutation; failures are logged, not returned
    async fn persist(&self, store: &Store) {
        if let Err(e) = store.persist().await {
            tracing::error!("Failed to persist snapshot for '{}': {}", store.db_name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_generation_order() {
        let ids = IdGenerator::new();
        let generated: Vec<String> = (0..200).map(|_| ids.next("wevt_")).collect();

        let mut sorted = generated.clone();
        sorted.sort();
        assert_eq!(generated, sorted);
        assert!(generated.iter().all(|id| id.starts_with("wevt_") && id.len() == 5 + 12 + 8));
    }
}
