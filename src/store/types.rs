/// Record type definitions
///
/// Runs, steps, events, hooks and queue messages as the workflow SDK sees them.
/// All types serialize with camelCase field names and omit absent optional fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Position in the forward-only lifecycle: pending, running, terminal
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle status of a step; steps may re-enter running on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Event type; unknown names are preserved verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetrying,
    WaitCreated,
    WaitCompleted,
    SignalWaiting,
    SignalReceived,
    RollbackRegistered,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepRetrying => "step_retrying",
            Self::WaitCreated => "wait_created",
            Self::WaitCompleted => "wait_completed",
            Self::SignalWaiting => "signal_waiting",
            Self::SignalReceived => "signal_received",
            Self::RollbackRegistered => "rollback_registered",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "step_started" => Self::StepStarted,
            "step_completed" => Self::StepCompleted,
            "step_failed" => Self::StepFailed,
            "step_retrying" => Self::StepRetrying,
            "wait_created" => Self::WaitCreated,
            "wait_completed" => Self::WaitCompleted,
            "signal_waiting" => Self::SignalWaiting,
            "signal_received" => Self::SignalReceived,
            "rollback_registered" => Self::RollbackRegistered,
            _ => Self::Other(name),
        }
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// One durable execution of a named workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub run_id: String,
    pub deployment_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub input: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub execution_context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One durable execution of a unit of work inside a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Composite key "{run_id}-{step_id}"
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
    pub input: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStep {
    pub fn key(run_id: &str, step_id: &str) -> String {
        format!("{}-{}", run_id, step_id)
    }
}

/// Append-only record of something that happened during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub event_id: String,
    pub run_id: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Token-addressable callback reference owned by a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowHook {
    pub hook_id: String,
    pub run_id: String,
    pub token: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Dispatchable unit of work with idempotency, retry and backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub message_id: String,
    pub queue_name: String,
    /// Message body as JSON text
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub status: QueueMessageStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_preserves_unknown_names() {
        let known: EventType = serde_json::from_str("\"wait_created\"").unwrap();
        assert_eq!(known, EventType::WaitCreated);

        let custom: EventType = serde_json::from_str("\"stream_chunk\"").unwrap();
        assert_eq!(custom, EventType::Other("stream_chunk".to_string()));
        assert_eq!(serde_json::to_string(&custom).unwrap(), "\"stream_chunk\"");
    }

    #[test]
    fn run_status_ranks_are_forward_only() {
        assert!(RunStatus::Pending.rank() < RunStatus::Running.rank());
        assert!(RunStatus::Running.rank() < RunStatus::Cancelled.rank());
        assert_eq!(RunStatus::Completed.rank(), RunStatus::Failed.rank());
        assert!(!RunStatus::Running.is_terminal());
    }
}
