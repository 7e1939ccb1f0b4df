/// Snapshot persistence for record stores
///
/// Every store is saved as one versioned JSON document in a local key-value
/// layer. Timestamps are tagged structurally (`{"$type":"date","value":...}`)
/// so that loading never has to guess which strings were dates.
///
/// Two backends are provided: SQLite through sqlx for the server, and a plain
/// in-memory map for tests and for sibling emulator instances sharing state.

use super::types::{
    EventType, QueueMessage, QueueMessageStatus, RunStatus, StepStatus, WorkflowEvent,
    WorkflowHook, WorkflowRun, WorkflowStep,
};
use super::Tables;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Row,
};
use std::{collections::HashMap, path::Path};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Current schema version of the snapshot document
pub const SNAPSHOT_VERSION: u32 = 1;

/// Notification that a snapshot key was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChange {
    pub key: String,
    /// Identity of the registry that wrote it
    pub origin: Uuid,
}

/// Local persisted key-value layer
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value and notify subscribers
    async fn put(&self, key: &str, value: &str, origin: Uuid) -> Result<()>;

    /// All keys starting with `prefix`
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    fn subscribe(&self) -> broadcast::Receiver<SnapshotChange>;
}

/// In-process key-value layer
#[derive(Debug)]
pub struct MemorySnapshotBackend {
    entries: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<SnapshotChange>,
}

impl MemorySnapshotBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }
}

impl Default for MemorySnapshotBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotBackend for MemorySnapshotBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str, origin: Uuid) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        // No subscribers is fine
        let _ = self.changes.send(SnapshotChange {
            key: key.to_string(),
            origin,
        });
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<SnapshotChange> {
        self.changes.subscribe()
    }
}

/// SQLite-backed key-value layer
///
/// One row per snapshot key in a `snapshots` table, upserted on every persist.
#[derive(Debug)]
pub struct SqliteSnapshotBackend {
    pool: SqlitePool,
    changes: broadcast::Sender<SnapshotChange>,
}

impl SqliteSnapshotBackend {
    /// Open (or create) the snapshot database at `path` and ensure its schema
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("Failed to create snapshot directory '{}': {}", parent.display(), e)
            })?;
        }

        tracing::info!("Opening snapshot database: {}", path.display());
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let backend = Self::from_pool(pool);
        backend.init_schema().await?;
        Ok(backend)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self { pool, changes }
    }

    /// Create the snapshots table. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotBackend for SqliteSnapshotBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM snapshots WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn put(&self, key: &str, value: &str, origin: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (key, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        let _ = self.changes.send(SnapshotChange {
            key: key.to_string(),
            origin,
        });
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM snapshots WHERE substr(key, 1, length(?1)) = ?1")
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("key")).collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<SnapshotChange> {
        self.changes.subscribe()
    }
}

/// Structurally tagged value; only dates need tagging today
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "$type", content = "value")]
enum Tagged {
    #[serde(rename = "date")]
    Date(DateTime<Utc>),
}

impl From<DateTime<Utc>> for Tagged {
    fn from(at: DateTime<Utc>) -> Self {
        Tagged::Date(at)
    }
}

impl From<Tagged> for DateTime<Utc> {
    fn from(tagged: Tagged) -> Self {
        match tagged {
            Tagged::Date(at) => at,
        }
    }
}

/// On-disk layout of one store
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    version: u32,
    runs: Vec<(String, RunRecord)>,
    steps: Vec<(String, StepRecord)>,
    events: Vec<EventRecord>,
    hooks: Vec<(String, HookRecord)>,
    queue: Vec<MessageRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRecord {
    run_id: String,
    deployment_id: String,
    workflow_name: String,
    status: RunStatus,
    input: Vec<Value>,
    output: Option<Value>,
    error: Option<Value>,
    execution_context: Value,
    started_at: Option<Tagged>,
    completed_at: Option<Tagged>,
    created_at: Tagged,
    updated_at: Tagged,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepRecord {
    id: String,
    run_id: String,
    step_id: String,
    step_name: String,
    status: StepStatus,
    input: Vec<Value>,
    output: Option<Value>,
    error: Option<Value>,
    attempt: u32,
    started_at: Option<Tagged>,
    completed_at: Option<Tagged>,
    created_at: Tagged,
    updated_at: Tagged,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRecord {
    event_id: String,
    run_id: String,
    event_type: EventType,
    correlation_id: Option<String>,
    payload: Value,
    created_at: Tagged,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HookRecord {
    hook_id: String,
    run_id: String,
    token: String,
    metadata: Value,
    created_at: Tagged,
    updated_at: Tagged,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRecord {
    message_id: String,
    queue_name: String,
    payload: String,
    idempotency_key: Option<String>,
    status: QueueMessageStatus,
    attempt: u32,
    max_attempts: u32,
    not_before: Tagged,
    created_at: Tagged,
    updated_at: Tagged,
    processed_at: Option<Tagged>,
}

impl From<&WorkflowRun> for RunRecord {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            deployment_id: run.deployment_id.clone(),
            workflow_name: run.workflow_name.clone(),
            status: run.status,
            input: run.input.clone(),
            output: run.output.clone(),
            error: run.error.clone(),
            execution_context: run.execution_context.clone(),
            started_at: run.started_at.map(Tagged::from),
            completed_at: run.completed_at.map(Tagged::from),
            created_at: run.created_at.into(),
            updated_at: run.updated_at.into(),
        }
    }
}

impl From<RunRecord> for WorkflowRun {
    fn from(record: RunRecord) -> Self {
        Self {
            run_id: record.run_id,
            deployment_id: record.deployment_id,
            workflow_name: record.workflow_name,
            status: record.status,
            input: record.input,
            output: record.output,
            error: record.error,
            execution_context: record.execution_context,
            started_at: record.started_at.map(Into::into),
            completed_at: record.completed_at.map(Into::into),
            created_at: record.created_at.into(),
            updated_at: record.updated_at.into(),
        }
    }
}

impl From<&WorkflowStep> for StepRecord {
    fn from(step: &WorkflowStep) -> Self {
        Self {
            id: step.id.clone(),
            run_id: step.run_id.clone(),
            step_id: step.step_id.clone(),
            step_name: step.step_name.clone(),
            status: step.status,
            input: step.input.clone(),
            output: step.output.clone(),
            error: step.error.clone(),
            attempt: step.attempt,
            started_at: step.started_at.map(Tagged::from),
            completed_at: step.completed_at.map(Tagged::from),
            created_at: step.created_at.into(),
            updated_at: step.updated_at.into(),
        }
    }
}

impl From<StepRecord> for WorkflowStep {
    fn from(record: StepRecord) -> Self {
        Self {
            id: record.id,
            run_id: record.run_id,
            step_id: record.step_id,
            step_name: record.step_name,
            status: record.status,
            input: record.input,
            output: record.output,
            error: record.error,
            attempt: record.attempt,
            started_at: record.started_at.map(Into::into),
            completed_at: record.completed_at.map(Into::into),
            created_at: record.created_at.into(),
            updated_at: record.updated_at.into(),
        }
    }
}

impl From<&WorkflowEvent> for EventRecord {
    fn from(event: &WorkflowEvent) -> Self {
        Self {
            event_id: event.event_id.clone(),
            run_id: event.run_id.clone(),
            event_type: event.event_type.clone(),
            correlation_id: event.correlation_id.clone(),
            payload: event.payload.clone(),
            created_at: event.created_at.into(),
        }
    }
}

impl From<EventRecord> for WorkflowEvent {
    fn from(record: EventRecord) -> Self {
        Self {
            event_id: record.event_id,
            run_id: record.run_id,
            event_type: record.event_type,
            correlation_id: record.correlation_id,
            payload: record.payload,
            created_at: record.created_at.into(),
        }
    }
}

impl From<&WorkflowHook> for HookRecord {
    fn from(hook: &WorkflowHook) -> Self {
        Self {
            hook_id: hook.hook_id.clone(),
            run_id: hook.run_id.clone(),
            token: hook.token.clone(),
            metadata: hook.metadata.clone(),
            created_at: hook.created_at.into(),
            updated_at: hook.updated_at.into(),
        }
    }
}

impl From<HookRecord> for WorkflowHook {
    fn from(record: HookRecord) -> Self {
        Self {
            hook_id: record.hook_id,
            run_id: record.run_id,
            token: record.token,
            metadata: record.metadata,
            created_at: record.created_at.into(),
            updated_at: record.updated_at.into(),
        }
    }
}

impl From<&QueueMessage> for MessageRecord {
    fn from(msg: &QueueMessage) -> Self {
        Self {
            message_id: msg.message_id.clone(),
            queue_name: msg.queue_name.clone(),
            payload: msg.payload.clone(),
            idempotency_key: msg.idempotency_key.clone(),
            status: msg.status,
            attempt: msg.attempt,
            max_attempts: msg.max_attempts,
            not_before: msg.not_before.into(),
            created_at: msg.created_at.into(),
            updated_at: msg.updated_at.into(),
            processed_at: msg.processed_at.map(Tagged::from),
        }
    }
}

impl From<MessageRecord> for QueueMessage {
    fn from(record: MessageRecord) -> Self {
        Self {
            message_id: record.message_id,
            queue_name: record.queue_name,
            payload: record.payload,
            idempotency_key: record.idempotency_key,
            status: record.status,
            attempt: record.attempt,
            max_attempts: record.max_attempts,
            not_before: record.not_before.into(),
            created_at: record.created_at.into(),
            updated_at: record.updated_at.into(),
            processed_at: record.processed_at.map(Into::into),
        }
    }
}

/// Serialize all tables into a snapshot document
pub fn encode(tables: &Tables) -> Result<String> {
    let document = SnapshotDocument {
        version: SNAPSHOT_VERSION,
        runs: tables
            .runs
            .iter()
            .map(|(key, run)| (key.clone(), run.into()))
            .collect(),
        steps: tables
            .steps
            .iter()
            .map(|(key, step)| (key.clone(), step.into()))
            .collect(),
        events: tables.events.iter().map(EventRecord::from).collect(),
        hooks: tables
            .hooks
            .iter()
            .map(|(key, hook)| (key.clone(), hook.into()))
            .collect(),
        queue: tables.queue.iter().map(MessageRecord::from).collect(),
    };
    Ok(serde_json::to_string(&document)?)
}

/// Rebuild tables from a snapshot document
pub fn decode(text: &str) -> Result<Tables> {
    let document: SnapshotDocument = serde_json::from_str(text)?;
    if document.version != SNAPSHOT_VERSION {
        anyhow::bail!(
            "unsupported snapshot version {} (expected {})",
            document.version,
            SNAPSHOT_VERSION
        );
    }

    Ok(Tables {
        runs: document
            .runs
            .into_iter()
            .map(|(key, run)| (key, run.into()))
            .collect(),
        steps: document
            .steps
            .into_iter()
            .map(|(key, step)| (key, step.into()))
            .collect(),
        events: document.events.into_iter().map(Into::into).collect(),
        hooks: document
            .hooks
            .into_iter()
            .map(|(key, hook)| (key, hook.into()))
            .collect(),
        queue: document.queue.into_iter().map(Into::into).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tables() -> Tables {
        let now = Utc::now();
        let mut tables = Tables::default();
        tables.runs.insert(
            "wrun_1".to_string(),
            WorkflowRun {
                run_id: "wrun_1".to_string(),
                deployment_id: "default".to_string(),
                workflow_name: "order".to_string(),
                status: RunStatus::Running,
                input: vec![json!(500), json!("MacBook Pro")],
                output: None,
                error: None,
                execution_context: json!({}),
                started_at: Some(now),
                completed_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        tables.events.push(WorkflowEvent {
            event_id: "wevt_1".to_string(),
            run_id: "wrun_1".to_string(),
            event_type: EventType::WaitCreated,
            correlation_id: Some("wait-1".to_string()),
            payload: json!({ "resumeAt": "2025-01-01T00:00:00Z" }),
            created_at: now,
        });
        tables
    }

    #[test]
    fn timestamps_are_tagged_and_strings_are_left_alone() {
        let original = sample_tables();
        let text = encode(&original).unwrap();
        let document: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(document["version"], json!(SNAPSHOT_VERSION));
        let run = &document["runs"][0][1];
        assert_eq!(run["createdAt"]["$type"], json!("date"));
        assert_eq!(run["startedAt"]["$type"], json!("date"));

        // A date-shaped string inside a payload stays a plain string
        let payload = &document["events"][0]["payload"];
        assert_eq!(payload["resumeAt"], json!("2025-01-01T00:00:00Z"));

        let restored = decode(&text).unwrap();
        assert_eq!(restored.runs["wrun_1"], original.runs["wrun_1"]);
        assert_eq!(restored.events[0].payload, original.events[0].payload);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let text = json!({
            "version": 99,
            "runs": [],
            "steps": [],
            "events": [],
            "hooks": [],
            "queue": []
        })
        .to_string();
        assert!(decode(&text).is_err());
        assert!(decode("not json").is_err());
    }

    #[tokio::test]
    async fn memory_backend_notifies_on_put() {
        let backend = MemorySnapshotBackend::new();
        let mut changes = backend.subscribe();
        let origin = Uuid::new_v4();

        backend.put("ns:postgres", "{}", origin).await.unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.key, "ns:postgres");
        assert_eq!(change.origin, origin);
        assert_eq!(backend.list_keys("ns:").await.unwrap(), vec!["ns:postgres"]);
        assert!(backend.list_keys("other:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sqlite_backend_upserts_and_lists_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteSnapshotBackend::connect(dir.path().join("snapshots.db"))
            .await
            .unwrap();
        let origin = Uuid::new_v4();

        backend.put("wkf_emulator:postgres", "first", origin).await.unwrap();
        backend.put("wkf_emulator:postgres", "second", origin).await.unwrap();
        backend.put("wkfXemulator:other", "x", origin).await.unwrap();

        assert_eq!(
            backend.get("wkf_emulator:postgres").await.unwrap().as_deref(),
            Some("second")
        );
        assert_eq!(backend.get("missing").await.unwrap(), None);
        assert_eq!(
            backend.list_keys("wkf_emulator:").await.unwrap(),
            vec!["wkf_emulator:postgres".to_string()]
        );
    }
}
