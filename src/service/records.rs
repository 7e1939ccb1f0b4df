/// Run, step, event and hook operations

use super::WorkflowService;
use crate::{
    error::{EmulatorError, EmulatorResult},
    store::{
        types::{
            EventType, RunStatus, StepStatus, WorkflowEvent, WorkflowHook, WorkflowRun,
            WorkflowStep,
        },
        Tables,
    },
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Page size of `list_runs` when the caller gives none
pub const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateRunRequest {
    pub deployment_id: Option<String>,
    pub workflow_name: String,
    pub input: Option<Vec<Value>>,
    pub execution_context: Option<Value>,
}

/// Partial run update; absent fields are left untouched
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateRunRequest {
    pub status: Option<RunStatus>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub input: Option<Vec<Value>>,
    pub execution_context: Option<Value>,
}

/// Query of `list_runs`; values arrive as raw query-string text
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListRunsParams {
    pub workflow_name: Option<String>,
    pub status: Option<String>,
    pub limit: Option<String>,
}

impl ListRunsParams {
    /// Positive integer limit, otherwise the default
    fn page_size(&self) -> usize {
        self.limit
            .as_deref()
            .and_then(|limit| limit.trim().parse::<usize>().ok())
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_LIST_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPage {
    pub data: Vec<WorkflowRun>,
    pub has_more: bool,
    /// Last returned run id when more remain
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPage {
    pub data: Vec<WorkflowStep>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateStepRequest {
    pub run_id: String,
    pub step_id: String,
    pub step_name: String,
    pub input: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateStepRequest {
    pub status: Option<StepStatus>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub attempt: Option<u32>,
    pub input: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventRequest {
    pub run_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    /// Legacy alias of `payload`
    #[serde(default)]
    pub event_data: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateHookRequest {
    pub run_id: String,
    pub hook_id: Option<String>,
    pub token: String,
    pub metadata: Option<Value>,
}

impl WorkflowService {
    pub async fn create_run(
        &self,
        db_name: &str,
        request: CreateRunRequest,
    ) -> EmulatorResult<WorkflowRun> {
        let store = self.store(db_name).await;
        let now = Utc::now();
        let run = WorkflowRun {
            run_id: self.ids.next("wrun_"),
            deployment_id: request
                .deployment_id
                .unwrap_or_else(|| "default".to_string()),
            workflow_name: request.workflow_name,
            status: RunStatus::Pending,
            input: request.input.unwrap_or_default(),
            output: None,
            error: None,
            execution_context: request.execution_context.unwrap_or_else(|| json!({})),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        store
            .lock()
            .await
            .runs
            .insert(run.run_id.clone(), run.clone());
        self.persist(&store).await;

        tracing::debug!("Created run {} ({}) in '{}'", run.run_id, run.workflow_name, db_name);
        Ok(run)
    }

    pub async fn get_run(&self, db_name: &str, run_id: &str) -> EmulatorResult<WorkflowRun> {
        let store = self.store(db_name).await;
        let tables = store.lock().await;
        tables
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| EmulatorError::run_not_found(run_id))
    }

    /// Merge a partial update into a run
    ///
    /// Status only moves forward (pending, running, terminal). A backward or
    /// post-terminal status change is ignored while the other fields still
    /// merge. `startedAt` and `completedAt` are stamped once. Reaching a
    /// terminal status removes the run's hooks.
    pub async fn update_run(
        &self,
        db_name: &str,
        run_id: &str,
        update: UpdateRunRequest,
    ) -> EmulatorResult<WorkflowRun> {
        let store = self.store(db_name).await;
        let now = Utc::now();

        let updated = {
            let mut tables = store.lock().await;
            let run = tables
                .runs
                .get_mut(run_id)
                .ok_or_else(|| EmulatorError::run_not_found(run_id))?;

            if let Some(next) = update.status {
                let current = run.status;
                let blocked = (current.is_terminal() && next != current) || next.rank() < current.rank();
                if blocked {
                    tracing::warn!(
                        "Ignoring status change of run {} from {} to {}",
                        run_id,
                        current.as_str(),
                        next.as_str()
                    );
                } else {
                    if next == RunStatus::Running && run.started_at.is_none() {
                        run.started_at = Some(now);
                    }
                    if next.is_terminal() && run.completed_at.is_none() {
                        run.completed_at = Some(now);
                    }
                    run.status = next;
                }
            }
            if let Some(output) = update.output {
                run.output = Some(output);
            }
            if let Some(error) = update.error {
                run.error = Some(error);
            }
            if let Some(input) = update.input {
                run.input = input;
            }
            if let Some(context) = update.execution_context {
                run.execution_context = context;
            }
            run.updated_at = now;

            let updated = run.clone();
            if updated.status.is_terminal() {
                remove_hooks_of_run(&mut tables, run_id);
            }
            updated
        };
        self.persist(&store).await;

        Ok(updated)
    }

    /// Runs filtered by workflow name and status, newest first
    pub async fn list_runs(&self, db_name: &str, params: ListRunsParams) -> EmulatorResult<RunPage> {
        let store = self.store(db_name).await;
        let mut runs: Vec<WorkflowRun> = {
            let tables = store.lock().await;
            tables
                .runs
                .values()
                .filter(|run| {
                    params
                        .workflow_name
                        .as_deref()
                        .map_or(true, |name| run.workflow_name == name)
                })
                .filter(|run| {
                    params
                        .status
                        .as_deref()
                        .map_or(true, |status| run.status.as_str() == status)
                })
                .cloned()
                .collect()
        };

        runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));

        let limit = params.page_size();
        let has_more = runs.len() > limit;
        runs.truncate(limit);
        let cursor = if has_more {
            runs.last().map(|run| run.run_id.clone())
        } else {
            None
        };

        Ok(RunPage {
            data: runs,
            has_more,
            cursor,
        })
    }

    pub async fn create_step(
        &self,
        db_name: &str,
        request: CreateStepRequest,
    ) -> EmulatorResult<WorkflowStep> {
        let store = self.store(db_name).await;
        let now = Utc::now();
        let step = WorkflowStep {
            id: WorkflowStep::key(&request.run_id, &request.step_id),
            run_id: request.run_id,
            step_id: request.step_id,
            step_name: request.step_name,
            status: StepStatus::Pending,
            input: request.input.unwrap_or_default(),
            output: None,
            error: None,
            attempt: 0,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        let replaced = store
            .lock()
            .await
            .steps
            .insert(step.id.clone(), step.clone());
        if replaced.is_some() {
            tracing::debug!("Step {} was created again and replaced", step.id);
        }
        self.persist(&store).await;

        Ok(step)
    }

    pub async fn get_step(
        &self,
        db_name: &str,
        run_id: &str,
        step_id: &str,
    ) -> EmulatorResult<WorkflowStep> {
        let store = self.store(db_name).await;
        let tables = store.lock().await;
        tables
            .steps
            .get(&WorkflowStep::key(run_id, step_id))
            .cloned()
            .ok_or_else(|| EmulatorError::step_not_found(step_id))
    }

    /// Merge a partial update into a step
    ///
    /// `attempt` changes only when the update names it.
    pub async fn update_step(
        &self,
        db_name: &str,
        run_id: &str,
        step_id: &str,
        update: UpdateStepRequest,
    ) -> EmulatorResult<WorkflowStep> {
        let store = self.store(db_name).await;
        let now = Utc::now();

        let updated = {
            let mut tables = store.lock().await;
            let step = tables
                .steps
                .get_mut(&WorkflowStep::key(run_id, step_id))
                .ok_or_else(|| EmulatorError::step_not_found(step_id))?;

            if let Some(next) = update.status {
                if next == StepStatus::Running && step.started_at.is_none() {
                    step.started_at = Some(now);
                }
                if next.is_terminal() && step.completed_at.is_none() {
                    step.completed_at = Some(now);
                }
                step.status = next;
            }
            if let Some(output) = update.output {
                step.output = Some(output);
            }
            if let Some(error) = update.error {
                step.error = Some(error);
            }
            if let Some(attempt) = update.attempt {
                step.attempt = attempt;
            }
            if let Some(input) = update.input {
                step.input = input;
            }
            step.updated_at = now;
            step.clone()
        };
        self.persist(&store).await;

        Ok(updated)
    }

    /// All steps of a run in creation order
    pub async fn list_steps(&self, db_name: &str, run_id: &str) -> EmulatorResult<StepPage> {
        let store = self.store(db_name).await;
        let mut steps: Vec<WorkflowStep> = {
            let tables = store.lock().await;
            tables
                .steps
                .values()
                .filter(|step| step.run_id == run_id)
                .cloned()
                .collect()
        };
        steps.sort_by_key(|step| step.created_at);

        Ok(StepPage {
            data: steps,
            has_more: false,
        })
    }

    pub async fn create_event(
        &self,
        db_name: &str,
        request: CreateEventRequest,
    ) -> EmulatorResult<WorkflowEvent> {
        let store = self.store(db_name).await;
        let payload = request
            .payload
            .or(request.event_data)
            .unwrap_or_else(|| json!({}));

        let event = {
            let mut tables = store.lock().await;
            self.append_event(
                &mut tables,
                &request.run_id,
                request.event_type,
                request.correlation_id,
                payload,
            )
        };
        self.persist(&store).await;

        tracing::debug!(
            "Recorded {} event {} for run {}",
            event.event_type.as_str(),
            event.event_id,
            event.run_id
        );
        Ok(event)
    }

    /// Events of a run in creation order
    pub async fn list_events(&self, db_name: &str, run_id: &str) -> EmulatorResult<Vec<WorkflowEvent>> {
        let store = self.store(db_name).await;
        let mut events: Vec<WorkflowEvent> = {
            let tables = store.lock().await;
            tables
                .events
                .iter()
                .filter(|event| event.run_id == run_id)
                .cloned()
                .collect()
        };
        events.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        Ok(events)
    }

    pub async fn create_hook(
        &self,
        db_name: &str,
        request: CreateHookRequest,
    ) -> EmulatorResult<WorkflowHook> {
        let store = self.store(db_name).await;
        let now = Utc::now();
        let hook = WorkflowHook {
            hook_id: request
                .hook_id
                .unwrap_or_else(|| self.ids.next("whook_")),
            run_id: request.run_id,
            token: request.token,
            metadata: request.metadata.unwrap_or_else(|| json!({})),
            created_at: now,
            updated_at: now,
        };

        store
            .lock()
            .await
            .hooks
            .insert(hook.hook_id.clone(), hook.clone());
        self.persist(&store).await;

        Ok(hook)
    }

    pub async fn get_hook_by_token(&self, db_name: &str, token: &str) -> EmulatorResult<WorkflowHook> {
        let store = self.store(db_name).await;
        let tables = store.lock().await;
        tables
            .hooks
            .values()
            .find(|hook| hook.token == token)
            .cloned()
            .ok_or_else(EmulatorError::hook_not_found)
    }

    /// Append an event to already-locked tables
    pub(crate) fn append_event(
        &self,
        tables: &mut Tables,
        run_id: &str,
        event_type: EventType,
        correlation_id: Option<String>,
        payload: Value,
    ) -> WorkflowEvent {
        let event = WorkflowEvent {
            event_id: self.ids.next("wevt_"),
            run_id: run_id.to_string(),
            event_type,
            correlation_id,
            payload,
            created_at: Utc::now(),
        };
        tables.events.push(event.clone());
        event
    }
}

fn remove_hooks_of_run(tables: &mut Tables, run_id: &str) {
    let before = tables.hooks.len();
    tables.hooks.retain(|_, hook| hook.run_id != run_id);
    let removed = before - tables.hooks.len();
    if removed > 0 {
        tracing::debug!("Removed {} hooks of finished run {}", removed, run_id);
    }
}
