/// Time-based wait resolution and signal derivation
///
/// A wait is a `wait_created` event carrying `resumeAt` in its payload. Once
/// that time has passed, a matching `wait_completed` event is recorded and the
/// owning run is re-queued so the workflow runtime can continue it.

use super::WorkflowService;
use crate::{
    error::EmulatorResult,
    store::{
        types::{EventType, WorkflowEvent},
        Tables,
    },
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Queue the workflow runtime listens on for continuations of a workflow
pub fn continuation_queue_name(workflow_name: &str) -> String {
    format!("__wkf_workflow_{}", workflow_name)
}

/// Resume time of a wait; RFC 3339 text or epoch milliseconds
fn resume_at(payload: &Value) -> Option<DateTime<Utc>> {
    match payload.get("resumeAt")? {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|at| at.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|millis| millis as i64))
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn is_wait_completed(tables: &Tables, run_id: &str, correlation_id: Option<&str>) -> bool {
    tables.events.iter().any(|event| {
        event.event_type == EventType::WaitCompleted
            && event.run_id == run_id
            && event.correlation_id.as_deref() == correlation_id
    })
}

/// Correlation id the run is currently waiting on for a signal name
///
/// Taken from the latest `signal_waiting` event with that name, unless a
/// `signal_received` event already answers its correlation id.
pub fn waiting_correlation(events: &[WorkflowEvent], signal_name: &str) -> Option<String> {
    let waiting = events.iter().rev().find(|event| {
        event.event_type == EventType::SignalWaiting
            && event.payload.get("name").and_then(Value::as_str) == Some(signal_name)
    })?;
    let correlation_id = waiting.correlation_id.as_deref()?;

    let received = events.iter().any(|event| {
        event.event_type == EventType::SignalReceived
            && event.correlation_id.as_deref() == Some(correlation_id)
    });
    (!received).then(|| correlation_id.to_string())
}

impl WorkflowService {
    /// Resolve every elapsed wait of a database exactly once
    ///
    /// Returns the number of waits resolved by this pass. The pass holds the
    /// store lock throughout, so overlapping passes cannot resolve a wait twice.
    pub async fn process_waits(&self, db_name: &str) -> EmulatorResult<usize> {
        let store = self.store(db_name).await;
        let now = Utc::now();

        let resolved = {
            let mut tables = store.lock().await;
            let due: Vec<(String, Option<String>)> = tables
                .events
                .iter()
                .filter(|event| event.event_type == EventType::WaitCreated)
                .filter(|event| resume_at(&event.payload).is_some_and(|at| at <= now))
                .map(|event| (event.run_id.clone(), event.correlation_id.clone()))
                .collect();

            let mut resolved = 0;
            for (run_id, correlation_id) in due {
                if is_wait_completed(&tables, &run_id, correlation_id.as_deref()) {
                    continue;
                }

                self.append_event(
                    &mut tables,
                    &run_id,
                    EventType::WaitCompleted,
                    correlation_id.clone(),
                    json!({}),
                );

                let continuation = tables.runs.get(&run_id).map(|run| {
                    (
                        continuation_queue_name(&run.workflow_name),
                        json!({
                            "runId": run.run_id,
                            "workflowName": run.workflow_name,
                            "input": run.input,
                            "executionContext": run.execution_context,
                        }),
                    )
                });
                match continuation {
                    Some((queue_name, message)) => {
                        self.enqueue_locked(&mut tables, &queue_name, &message, None)?;
                        tracing::debug!(
                            "Wait {:?} of run {} elapsed, continuation queued on '{}'",
                            correlation_id,
                            run_id,
                            queue_name
                        );
                    }
                    None => tracing::warn!(
                        "Wait {:?} elapsed for unknown run {} in '{}'",
                        correlation_id,
                        run_id,
                        db_name
                    ),
                }
                resolved += 1;
            }
            resolved
        };

        if resolved > 0 {
            self.persist(&store).await;
        }
        Ok(resolved)
    }

    /// Correlation id of the signal a run is waiting on, if any
    pub async fn waiting_signal(
        &self,
        db_name: &str,
        run_id: &str,
        signal_name: &str,
    ) -> EmulatorResult<Option<String>> {
        let events = self.list_events(db_name, run_id).await?;
        Ok(waiting_correlation(&events, signal_name))
    }
}
