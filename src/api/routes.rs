/// Workflow backend REST endpoints
///
/// Maps every method + path of the backend API onto exactly one record service
/// call. The database name travels in the `x-dbname` header. Handler errors
/// come back as 500 with `{"error": message}`; unmatched paths as 404.

use crate::{
    error::{EmulatorError, EmulatorResult},
    service::{
        Acknowledged, CreateEventRequest, CreateHookRequest, CreateRunRequest, CreateStepRequest,
        EnqueueOptions, Enqueued, ListRunsParams, PolledMessage, RunPage, StepPage,
        UpdateRunRequest, UpdateStepRequest, WorkflowService,
    },
    store::types::{WorkflowEvent, WorkflowHook, WorkflowRun, WorkflowStep},
};
use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use std::{convert::Infallible, sync::Arc};

/// Path prefix of every intercepted request
pub const API_PREFIX: &str = "/api/workflows";

pub const DB_NAME_HEADER: &str = "x-dbname";

pub const DEFAULT_DB_NAME: &str = "postgres";

/// Shared state of the REST handlers
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<WorkflowService>,
}

/// Database name from the `x-dbname` header, "postgres" when absent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbName(pub String);

impl<S> FromRequestParts<S> for DbName
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let db_name = parts
            .headers
            .get(DB_NAME_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_DB_NAME);
        Ok(DbName(db_name.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueRequest {
    queue_name: String,
    #[serde(default)]
    message: Value,
    #[serde(default)]
    opts: Option<EnqueueOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageIdRequest {
    message_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct HookQuery {
    token: Option<String>,
}

/// Create the record API routes, relative to [`API_PREFIX`]
pub fn create_record_routes() -> Router<ApiState> {
    Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run).patch(update_run))
        .route("/runs/{id}/events", get(list_events))
        .route("/steps", post(create_step))
        .route("/steps/{run_id}", get(list_steps))
        .route("/steps/{run_id}/{step_id}", get(get_step).patch(update_step))
        .route("/events", post(create_event))
        .route("/hooks", post(create_hook).get(get_hook_by_token))
        .route("/queue", post(enqueue))
        .route("/queue/ack", post(ack))
        .route("/queue/nack", post(nack))
        .route("/queue/touch", post(touch))
        .route("/queue/{name}", get(poll))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
}

/// Decode a JSON request body
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> EmulatorResult<T> {
    serde_json::from_slice(body).map_err(|e| EmulatorError::malformed("request body", e))
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// POST /runs
async fn create_run(
    State(state): State<ApiState>,
    DbName(db): DbName,
    body: Bytes,
) -> EmulatorResult<Json<WorkflowRun>> {
    let request: CreateRunRequest = parse_body(&body)?;
    Ok(Json(state.service.create_run(&db, request).await?))
}

/// GET /runs/{id}
async fn get_run(
    State(state): State<ApiState>,
    DbName(db): DbName,
    Path(id): Path<String>,
) -> EmulatorResult<Json<WorkflowRun>> {
    Ok(Json(state.service.get_run(&db, &id).await?))
}

/// PATCH /runs/{id}
async fn update_run(
    State(state): State<ApiState>,
    DbName(db): DbName,
    Path(id): Path<String>,
    body: Bytes,
) -> EmulatorResult<Json<WorkflowRun>> {
    let update: UpdateRunRequest = parse_body(&body)?;
    Ok(Json(state.service.update_run(&db, &id, update).await?))
}

/// GET /runs?workflowName=&status=&limit=
async fn list_runs(
    State(state): State<ApiState>,
    DbName(db): DbName,
    Query(params): Query<ListRunsParams>,
) -> EmulatorResult<Json<RunPage>> {
    Ok(Json(state.service.list_runs(&db, params).await?))
}

/// GET /runs/{id}/events
async fn list_events(
    State(state): State<ApiState>,
    DbName(db): DbName,
    Path(id): Path<String>,
) -> EmulatorResult<Json<Vec<WorkflowEvent>>> {
    Ok(Json(state.service.list_events(&db, &id).await?))
}

/// POST /steps
async fn create_step(
    State(state): State<ApiState>,
    DbName(db): DbName,
    body: Bytes,
) -> EmulatorResult<Json<WorkflowStep>> {
    let request: CreateStepRequest = parse_body(&body)?;
    Ok(Json(state.service.create_step(&db, request).await?))
}

/// GET /steps/{run_id}/{step_id}
async fn get_step(
    State(state): State<ApiState>,
    DbName(db): DbName,
    Path((run_id, step_id)): Path<(String, String)>,
) -> EmulatorResult<Json<WorkflowStep>> {
    Ok(Json(state.service.get_step(&db, &run_id, &step_id).await?))
}

/// GET /steps/{run_id}
async fn list_steps(
    State(state): State<ApiState>,
    DbName(db): DbName,
    Path(run_id): Path<String>,
) -> EmulatorResult<Json<StepPage>> {
    Ok(Json(state.service.list_steps(&db, &run_id).await?))
}

/// PATCH /steps/{run_id}/{step_id}
async fn update_step(
    State(state): State<ApiState>,
    DbName(db): DbName,
    Path((run_id, step_id)): Path<(String, String)>,
    body: Bytes,
) -> EmulatorResult<Json<WorkflowStep>> {
    let update: UpdateStepRequest = parse_body(&body)?;
    Ok(Json(
        state.service.update_step(&db, &run_id, &step_id, update).await?,
    ))
}

/// POST /events
async fn create_event(
    State(state): State<ApiState>,
    DbName(db): DbName,
    body: Bytes,
) -> EmulatorResult<Json<WorkflowEvent>> {
    let request: CreateEventRequest = parse_body(&body)?;
    Ok(Json(state.service.create_event(&db, request).await?))
}

/// POST /hooks
async fn create_hook(
    State(state): State<ApiState>,
    DbName(db): DbName,
    body: Bytes,
) -> EmulatorResult<Json<WorkflowHook>> {
    let request: CreateHookRequest = parse_body(&body)?;
    Ok(Json(state.service.create_hook(&db, request).await?))
}

/// GET /hooks?token=
async fn get_hook_by_token(
    State(state): State<ApiState>,
    DbName(db): DbName,
    Query(query): Query<HookQuery>,
) -> EmulatorResult<Response> {
    match query.token {
        Some(token) => Ok(Json(state.service.get_hook_by_token(&db, &token).await?).into_response()),
        None => Ok(not_found().await),
    }
}

/// POST /queue
async fn enqueue(
    State(state): State<ApiState>,
    DbName(db): DbName,
    body: Bytes,
) -> EmulatorResult<Json<Enqueued>> {
    let request: EnqueueRequest = parse_body(&body)?;
    let opts = request.opts.unwrap_or_default();
    Ok(Json(
        state
            .service
            .queue(&db, &request.queue_name, &request.message, opts)
            .await?,
    ))
}

/// POST /queue/ack
async fn ack(
    State(state): State<ApiState>,
    DbName(db): DbName,
    body: Bytes,
) -> EmulatorResult<Json<Acknowledged>> {
    let request: MessageIdRequest = parse_body(&body)?;
    Ok(Json(state.service.ack(&db, &request.message_id).await?))
}

/// POST /queue/nack
async fn nack(
    State(state): State<ApiState>,
    DbName(db): DbName,
    body: Bytes,
) -> EmulatorResult<Json<Acknowledged>> {
    let request: MessageIdRequest = parse_body(&body)?;
    Ok(Json(state.service.nack(&db, &request.message_id).await?))
}

/// POST /queue/touch
async fn touch(
    State(state): State<ApiState>,
    DbName(db): DbName,
    body: Bytes,
) -> EmulatorResult<Json<Acknowledged>> {
    let request: MessageIdRequest = parse_body(&body)?;
    Ok(Json(state.service.touch(&db, &request.message_id).await?))
}

/// GET /queue/{name}; `null` when nothing is eligible
async fn poll(
    State(state): State<ApiState>,
    DbName(db): DbName,
    Path(name): Path<String>,
) -> EmulatorResult<Json<Option<PolledMessage>>> {
    Ok(Json(state.service.poll(&db, &name).await?))
}
