use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use weft_core::events::Event;
use weft_core::types::{RunId, RunRecord, WorkflowDef, WorkflowDefId};
use weft_core::workflow::{RunSnapshot, TaskOutcome};

const DEFAULT_POLL_MS: u64 = 30_000;
const MAX_POLL_MS: u64 = 120_000;

fn parse_run_id(run_id: &str) -> ApiResult<RunId> {
    run_id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid run ID: {}", run_id)))
}

/// List registered workflow definitions
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListWorkflowsResponse>> {
    let workflows = state.coordinator.definitions().list_workflows()?;
    Ok(Json(ListWorkflowsResponse { workflows }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowDef>,
}

/// Start a run of a registered workflow
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<StartRunResponse>)> {
    let run_id = match req.version {
        Some(version) => {
            state
                .coordinator
                .start_run_version(&req.workflow_def_id, version, req.input)?
        }
        None => state.coordinator.start_run(&req.workflow_def_id, req.input)?,
    };

    tracing::info!("Started run {} of {}", run_id, req.workflow_def_id);
    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { run_id })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunRequest {
    pub workflow_def_id: WorkflowDefId,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub run_id: RunId,
}

/// List all runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListRunsResponse>> {
    let runs = state.coordinator.list_runs()?;
    Ok(Json(ListRunsResponse { runs }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunRecord>,
}

/// Get a run; live runs include their context and tokens
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<GetRunResponse>> {
    let run_id = parse_run_id(&run_id)?;

    if let Some(snapshot) = state.coordinator.snapshot(run_id) {
        return Ok(Json(GetRunResponse {
            run: snapshot.record(),
            snapshot: Some(snapshot),
        }));
    }

    let run = state
        .coordinator
        .get_run(run_id)?
        .ok_or_else(|| ApiError::not_found(format!("Run {} not found", run_id)))?;
    Ok(Json(GetRunResponse {
        run,
        snapshot: None,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRunResponse {
    pub run: RunRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<RunSnapshot>,
}

/// Get events for a run
pub async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<GetRunEventsResponse>> {
    let run_id = parse_run_id(&run_id)?;
    let events = state.coordinator.events(run_id).await?;
    Ok(Json(GetRunEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRunEventsResponse {
    pub events: Vec<Event>,
}

/// Cancel a running run and its sub-runs
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(req): Json<CancelRunRequest>,
) -> ApiResult<StatusCode> {
    let run_id = parse_run_id(&run_id)?;
    let reason = req
        .reason
        .unwrap_or_else(|| "User requested cancellation".to_string());
    state.coordinator.cancel(run_id, reason).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CancelRunRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Report the outcome of a task handed out through `/api/tasks/next`
pub async fn report_result(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(outcome): Json<TaskOutcome>,
) -> ApiResult<StatusCode> {
    let run_id = parse_run_id(&run_id)?;
    tracing::debug!("Result for token {} of run {}", outcome.token_id, run_id);
    state.coordinator.report_result(run_id, outcome).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct NextTaskQuery {
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

/// Long-poll for the next queued task; 204 when none arrived in time
pub async fn next_task(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NextTaskQuery>,
) -> Response {
    let wait = query.wait_ms.unwrap_or(DEFAULT_POLL_MS).min(MAX_POLL_MS);
    match state.queue.next(Duration::from_millis(wait)).await {
        Some(request) => Json(request).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
