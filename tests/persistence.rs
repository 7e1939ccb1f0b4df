//! Snapshot persistence and change propagation between registries.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;
use wkf_emulator::service::{CreateRunRequest, EnqueueOptions, UpdateRunRequest};
use wkf_emulator::store::snapshot::SnapshotBackend;
use wkf_emulator::store::types::RunStatus;
use wkf_emulator::store::{MemorySnapshotBackend, SqliteSnapshotBackend};
use wkf_emulator::{EmulatorError, StoreRegistry, WorkflowService};

const NAMESPACE: &str = "wkf_emulator";

fn run_request(workflow_name: &str) -> CreateRunRequest {
    CreateRunRequest {
        workflow_name: workflow_name.to_string(),
        ..CreateRunRequest::default()
    }
}

#[tokio::test]
async fn state_survives_a_restart_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshots").join("emulator.db");

    let (run, message_id) = {
        let backend = SqliteSnapshotBackend::connect(&path).await.unwrap();
        let service = WorkflowService::new(Arc::new(StoreRegistry::new(Arc::new(backend), NAMESPACE)));
        let run = service.create_run("app", run_request("approval")).await.unwrap();
        let run = service
            .update_run(
                "app",
                &run.run_id,
                UpdateRunRequest {
                    status: Some(RunStatus::Running),
                    ..UpdateRunRequest::default()
                },
            )
            .await
            .unwrap();
        let enqueued = service
            .queue("app", "jobs", &json!({ "n": 1 }), EnqueueOptions::default())
            .await
            .unwrap();
        (run, enqueued.message_id)
    };

    let backend = SqliteSnapshotBackend::connect(&path).await.unwrap();
    let registry = Arc::new(StoreRegistry::new(Arc::new(backend), NAMESPACE));
    assert_eq!(registry.known_db_names().await, vec!["app".to_string()]);

    let service = WorkflowService::new(registry);
    let restored = service.get_run("app", &run.run_id).await.unwrap();
    assert_eq!(restored, run);
    assert!(restored.started_at.is_some());

    let job = service.poll("app", "jobs").await.unwrap().unwrap();
    assert_eq!(job.id, message_id);
}

#[tokio::test]
async fn corrupt_snapshot_loads_as_empty() {
    let backend = Arc::new(MemorySnapshotBackend::new());
    backend
        .put("wkf_emulator:app", "{\"version\":99}", Uuid::new_v4())
        .await
        .unwrap();

    let service = WorkflowService::new(Arc::new(StoreRegistry::new(backend, NAMESPACE)));
    let err = service.get_run("app", "wrun_1").await.unwrap_err();
    assert!(matches!(err, EmulatorError::NotFound(_)));

    // The store stays usable and overwrites the bad document
    let run = service.create_run("app", run_request("w")).await.unwrap();
    assert_eq!(service.get_run("app", &run.run_id).await.unwrap(), run);
}

#[tokio::test]
async fn sibling_registry_follows_changes() {
    let backend = Arc::new(MemorySnapshotBackend::new());
    let writer = WorkflowService::new(Arc::new(StoreRegistry::new(backend.clone(), NAMESPACE)));
    let reader_registry = Arc::new(StoreRegistry::new(backend, NAMESPACE));
    let reader = WorkflowService::new(Arc::clone(&reader_registry));

    // Open the store before the write so the reader holds a stale copy
    assert!(reader.list_runs("app", Default::default()).await.unwrap().data.is_empty());
    let watcher = reader_registry.watch_changes();

    let run = writer.create_run("app", run_request("approval")).await.unwrap();

    let mut seen = None;
    for _ in 0..100 {
        if let Ok(found) = reader.get_run("app", &run.run_id).await {
            seen = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, Some(run));

    watcher.abort();
}

#[tokio::test]
async fn explicit_reload_only_touches_open_stores() {
    let backend = Arc::new(MemorySnapshotBackend::new());
    let writer = WorkflowService::new(Arc::new(StoreRegistry::new(backend.clone(), NAMESPACE)));
    let registry = Arc::new(StoreRegistry::new(backend, NAMESPACE));
    let reader = WorkflowService::new(Arc::clone(&registry));

    assert!(!registry.reload("app").await);

    reader.list_runs("app", Default::default()).await.unwrap();
    let run = writer.create_run("app", run_request("w")).await.unwrap();
    assert!(reader.get_run("app", &run.run_id).await.is_err());

    assert!(registry.reload("app").await);
    assert_eq!(reader.get_run("app", &run.run_id).await.unwrap(), run);
}
