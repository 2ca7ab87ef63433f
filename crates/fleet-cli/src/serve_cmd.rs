use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use fleet_core::config::HeartbeatConfig;
use fleet_core::dispatch::DispatchQueue;
use fleet_core::heartbeat::{HeartbeatCache, HeartbeatRecord};
use fleet_core::run_state::{RunStateMachine, TransitionOutcome};
use fleet_core::wire::{
    AssignedRunsResponse, EventRecord, HeartbeatRequest, HeartbeatResponse, RunBody,
    RunListBody, UpdateRunStatusRequest, UpdateRunStatusResponse,
};
use fleet_db::models::{Run, RunStatus};
use fleet_db::queries::{events as event_db, nodes as node_db, runs as run_db, tasks as task_db};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub queue: DispatchQueue,
    pub heartbeats: HeartbeatCache,
    pub heartbeat_config: HeartbeatConfig,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/v1/tasks/{id}/runs", post(create_run).get(list_runs_for_task))
        .route("/api/v1/runs/{id}", get(get_run).patch(update_run_status))
        .route("/api/v1/runs/{id}/cancel", post(cancel_run))
        .route("/api/v1/runs/{id}/events", post(post_events))
        .route("/api/v1/nodes/heartbeat", post(heartbeat))
        .route("/api/v1/nodes/{id}/runs", get(assigned_runs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!(%addr, "fleetd serve listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("fleetd serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    // Give in-flight store calls a bounded grace period to finish.
    tokio::time::sleep(Duration::from_secs(0)).await;
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> impl IntoResponse {
    axum::response::Html(
        "<!DOCTYPE html><html><head><title>fleetd</title></head><body>\
<h1>fleetd</h1><p>control plane for the agent worker fleet.</p></body></html>",
    )
}

async fn create_run(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = task_db::get_task(&state.pool, task_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {task_id} not found")))?;

    let run = run_db::insert_run(&state.pool, &task)
        .await
        .map_err(AppError::internal)?;

    // Publish failure is logged and swallowed: the fallback reconciler
    // picks up any run still queued after stale_threshold.
    if let Err(err) = state.queue.publish(run.id, task.id).await {
        tracing::warn!(run_id = %run.id, task_id = %task.id, error = %err, "failed to publish dispatch message, leaving run for fallback reconciler");
    }

    Ok((StatusCode::CREATED, Json(RunBody::from(run))).into_response())
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let run = run_db::get_run(&state.pool, run_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("run {run_id} not found")))?;

    Ok(Json(RunBody::from(run)).into_response())
}

async fn list_runs_for_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let runs = run_db::list_runs_for_task(&state.pool, task_id)
        .await
        .map_err(AppError::internal)?;

    let runs: Vec<RunBody> = runs.into_iter().map(RunBody::from).collect();
    let count = runs.len();
    Ok(Json(RunListBody { runs, count }).into_response())
}

async fn update_run_status(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<UpdateRunStatusRequest>,
) -> Result<axum::response::Response, AppError> {
    let run = run_db::get_run(&state.pool, run_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("run {run_id} not found")))?;

    // Idempotent no-op: a second identical call succeeds without a write.
    if run.status == req.status
        && (req.node_id.is_none() || req.node_id.as_deref() == run.node_id.as_deref())
    {
        return Ok(Json(UpdateRunStatusResponse { status: run.status }).into_response());
    }

    if !RunStateMachine::is_valid_transition(run.status, req.status) {
        return Err(AppError::conflict(format!(
            "illegal transition {} -> {} for run {run_id}",
            run.status, req.status
        )));
    }

    let outcome = apply_transition(&state.pool, &run, req.status, req.node_id.as_deref())
        .await
        .map_err(AppError::internal)?;

    match outcome {
        TransitionOutcome::Applied => {
            if req.status == RunStatus::Failed {
                if let Some(error) = &req.error {
                    run_db::set_run_error(&state.pool, run_id, error)
                        .await
                        .map_err(AppError::internal)?;
                }
            }
            task_db::recompute_task_status(&state.pool, run.task_id)
                .await
                .map_err(AppError::internal)?;
            Ok(Json(UpdateRunStatusResponse { status: req.status }).into_response())
        }
        TransitionOutcome::Conflict => {
            let current = run_db::get_run(&state.pool, run_id)
                .await
                .map_err(AppError::internal)?
                .ok_or_else(|| AppError::not_found(format!("run {run_id} not found")))?;

            if current.status == req.status {
                Ok(Json(UpdateRunStatusResponse { status: current.status }).into_response())
            } else {
                Err(AppError::conflict(format!(
                    "run {run_id} no longer in expected status; now {}",
                    current.status
                )))
            }
        }
    }
}

async fn apply_transition(
    pool: &PgPool,
    run: &Run,
    to: RunStatus,
    node_id: Option<&str>,
) -> anyhow::Result<TransitionOutcome> {
    match node_id {
        Some(node_id) => {
            RunStateMachine::transition_from_node(pool, run.id, node_id, run.status, to).await
        }
        None => RunStateMachine::transition(pool, run.id, run.status, to).await,
    }
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let run = run_db::get_run(&state.pool, run_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("run {run_id} not found")))?;

    if run.status.is_terminal() {
        return Err(AppError::bad_request(format!(
            "run {run_id} is already in terminal status {}",
            run.status
        )));
    }

    RunStateMachine::cancel(&state.pool, run_id)
        .await
        .map_err(AppError::internal)?;
    task_db::recompute_task_status(&state.pool, run.task_id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(UpdateRunStatusResponse {
        status: RunStatus::Cancelled,
    })
    .into_response())
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<axum::response::Response, AppError> {
    node_db::upsert_node(&state.pool, &req.node_id, &req.labels, req.max_concurrent)
        .await
        .map_err(AppError::internal)?;

    state
        .heartbeats
        .write(
            &HeartbeatRecord {
                node_id: req.node_id,
                labels: req.labels,
                max_concurrent: req.max_concurrent,
                running_count: req.running_count,
            },
            state.heartbeat_config.offline_threshold(),
        )
        .await
        .map_err(AppError::internal)?;

    Ok(Json(HeartbeatResponse { accepted: true }).into_response())
}

#[derive(Debug, Deserialize)]
struct AssignedRunsQuery {
    status: Option<String>,
}

async fn assigned_runs(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(query): Query<AssignedRunsQuery>,
) -> Result<axum::response::Response, AppError> {
    node_db::get_node(&state.pool, &node_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("node {node_id} not found")))?;

    let status = match query.status.as_deref() {
        Some("assigned") | None => RunStatus::Assigned,
        Some(other) => {
            return Err(AppError::bad_request(format!(
                "unsupported status filter: {other}"
            )));
        }
    };

    let runs = run_db::list_runs_by_status(&state.pool, status)
        .await
        .map_err(AppError::internal)?
        .into_iter()
        .filter(|r| r.node_id.as_deref() == Some(node_id.as_str()))
        .map(RunBody::from)
        .collect();

    Ok(Json(AssignedRunsResponse { runs }).into_response())
}

async fn post_events(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    body: String,
) -> Result<axum::response::Response, AppError> {
    run_db::get_run(&state.pool, run_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("run {run_id} not found")))?;

    let max_seq = event_db::max_seq_for_run(&state.pool, run_id)
        .await
        .map_err(AppError::internal)?
        .unwrap_or(0);
    let mut expected = max_seq;
    let mut accepted = 0u32;

    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let record: EventRecord = serde_json::from_str(line)
            .map_err(|e| AppError::bad_request(format!("malformed event line: {e}")))?;

        if record.seq <= expected {
            // Redelivery of an already-recorded event. Accepted
            // idempotently via the unique (run_id, seq) index.
        } else if record.seq != expected + 1 {
            tracing::warn!(
                run_id = %run_id,
                expected = expected + 1,
                got = record.seq,
                "advisory sequence gap in event stream"
            );
        }

        let new_event = event_db::NewRunEvent {
            run_id,
            seq: record.seq,
            event_type: record.event_type.clone(),
            payload: record.data.clone(),
        };
        if event_db::insert_run_event(&state.pool, &new_event)
            .await
            .map_err(AppError::internal)?
            .is_some()
        {
            accepted += 1;
        }
        expected = expected.max(record.seq);

        if record.event_type == fleet_core::wire::RUN_STARTED_EVENT_TYPE {
            if let Some(run) = run_db::get_run(&state.pool, run_id)
                .await
                .map_err(AppError::internal)?
            {
                task_db::recompute_task_status(&state.pool, run.task_id)
                    .await
                    .map_err(AppError::internal)?;
            }
        }
    }

    Ok(Json(serde_json::json!({ "accepted": accepted })).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
