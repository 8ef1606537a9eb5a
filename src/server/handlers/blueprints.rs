// src/server/handlers/blueprints.rs
//! Blueprint CRUD.
//!
//! Blueprints are immutable by policy once referenced by a run; updates
//! overwrite in place and bump `updated_at`.

use super::parse_body;
use crate::db::models::{Blueprint, JsonMap};
use crate::server::{ApiError, ApiState};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlueprintRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    os: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    data: Option<JsonMap>,
}

impl BlueprintRequest {
    fn validated(self) -> Result<(String, String, String, JsonMap), ApiError> {
        let name = self.name.trim().to_string();
        let os = self.os.trim().to_string();
        let version = self.version.trim().to_string();
        if name.is_empty() {
            return Err(ApiError::bad_request("name is required"));
        }
        if os.is_empty() {
            return Err(ApiError::bad_request("os is required"));
        }
        if version.is_empty() {
            return Err(ApiError::bad_request("version is required"));
        }
        Ok((name, os, version, self.data.unwrap_or_default()))
    }
}

/// GET /v1/blueprints
pub async fn list(State(state): State<Arc<ApiState>>) -> Result<Json<Value>, ApiError> {
    let blueprints = state.db.call(Blueprint::list_all).await?;
    Ok(Json(json!({"blueprints": blueprints})))
}

/// POST /v1/blueprints
pub async fn create(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<BlueprintRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (name, os, version, data) = parse_body(body)?.validated()?;

    let blueprint = state
        .db
        .call(move |conn| Blueprint::create(conn, &name, &os, &version, &data, Utc::now()))
        .await?;

    Ok((StatusCode::CREATED, Json(json!({"blueprint": blueprint}))))
}

/// GET /v1/blueprints/{id}
pub async fn fetch(
    State(state): State<Arc<ApiState>>,
    Path(blueprint_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&blueprint_id)?;
    let blueprint = state
        .db
        .call(move |conn| Blueprint::find_by_id(conn, id))
        .await?
        .ok_or_else(|| ApiError::not_found("blueprint not found"))?;
    Ok(Json(json!({"blueprint": blueprint})))
}

/// PUT /v1/blueprints/{id}
pub async fn update(
    State(state): State<Arc<ApiState>>,
    Path(blueprint_id): Path<String>,
    body: Result<Json<BlueprintRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&blueprint_id)?;
    let (name, os, version, data) = parse_body(body)?.validated()?;

    let blueprint = state
        .db
        .call(move |conn| Blueprint::update(conn, id, &name, &os, &version, &data, Utc::now()))
        .await?
        .ok_or_else(|| ApiError::not_found("blueprint not found"))?;

    Ok(Json(json!({"blueprint": blueprint})))
}

/// DELETE /v1/blueprints/{id}
pub async fn delete(
    State(state): State<Arc<ApiState>>,
    Path(blueprint_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&blueprint_id)?;
    let deleted = state
        .db
        .call(move |conn| Blueprint::delete(conn, id))
        .await?;
    if !deleted {
        return Err(ApiError::not_found("blueprint not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::bad_request("invalid blueprint id"))
}
