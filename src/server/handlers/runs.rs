// src/server/handlers/runs.rs
//! Externally-driven run lifecycle: start and finish.

use super::parse_body;
use crate::bus::{SUBJECT_RUNS_FINISHED, SUBJECT_RUNS_STARTED};
use crate::db::models::{Blueprint, Machine, Run};
use crate::error::Error;
use crate::server::{ApiError, ApiState};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use rusqlite::ErrorCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartRequest {
    #[serde(default)]
    machine_id: Option<Uuid>,
    #[serde(default)]
    blueprint_id: Option<Uuid>,
}

/// POST /v1/runs/start — create a running run, publish `runs.started`.
pub async fn start(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let req = parse_body(body)?;
    let machine_id = req
        .machine_id
        .ok_or_else(|| ApiError::bad_request("machine_id is required"))?;
    let blueprint_id = req
        .blueprint_id
        .ok_or_else(|| ApiError::bad_request("blueprint_id is required"))?;

    let run = state
        .db
        .call(move |conn| {
            if Machine::find_by_id(conn, machine_id)?.is_none() {
                return Err(Error::NotFound(format!("machine {machine_id}")));
            }
            if Blueprint::find_by_id(conn, blueprint_id)?.is_none() {
                return Err(Error::NotFound(format!("blueprint {blueprint_id}")));
            }
            match Run::start(conn, machine_id, Some(blueprint_id), Utc::now()) {
                Err(Error::Database(rusqlite::Error::SqliteFailure(e, _)))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(Error::Conflict(format!(
                        "machine {machine_id} already has a running run"
                    )))
                }
                other => other,
            }
        })
        .await?;

    state
        .publish_event(
            SUBJECT_RUNS_STARTED,
            json!({
                "run_id": run.id,
                "machine_id": run.machine_id,
                "blueprint_id": run.blueprint_id,
                "status": run.status,
                "started_at": run.started_at,
            }),
        )
        .await;

    Ok((StatusCode::CREATED, Json(json!({"run": run}))))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinishRequest {
    #[serde(default)]
    run_id: Option<Uuid>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    logs: String,
}

/// POST /v1/runs/finish — transition a run to a terminal status, publish
/// `runs.finished`.
pub async fn finish(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<FinishRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let req = parse_body(body)?;
    let run_id = req
        .run_id
        .ok_or_else(|| ApiError::bad_request("run_id is required"))?;
    let status = req.status.trim().to_string();
    if status.is_empty() {
        return Err(ApiError::bad_request("status is required"));
    }

    let logs = req.logs;
    let run = state
        .db
        .call(move |conn| Run::finish(conn, run_id, &status, Some(&logs), Utc::now()))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run {run_id} not found")))?;

    state
        .publish_event(
            SUBJECT_RUNS_FINISHED,
            json!({
                "run_id": run.id,
                "machine_id": run.machine_id,
                "blueprint_id": run.blueprint_id,
                "status": run.status,
                "finished_at": run.finished_at,
            }),
        )
        .await;

    Ok(Json(json!({"run": run})))
}
