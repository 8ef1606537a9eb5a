// src/server/handlers/tokens.rs
//! Agent token refresh: exchanges an unexpired token for a fresh one.

use super::parse_body;
use crate::db::models::Machine;
use crate::server::{ApiError, ApiState};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshRequest {
    #[serde(default)]
    machine_id: String,
    #[serde(default)]
    old_token: String,
}

/// POST /v1/agents/token/refresh — delegates to the token store's rotate.
pub async fn refresh(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let req = parse_body(body)?;
    let machine_id = Uuid::parse_str(req.machine_id.trim())
        .map_err(|_| ApiError::bad_request("valid machine_id is required"))?;
    let old_token = req.old_token.trim().to_string();
    if old_token.is_empty() {
        return Err(ApiError::bad_request("old_token is required"));
    }

    let machine = state
        .db
        .call(move |conn| Machine::find_by_id(conn, machine_id))
        .await?
        .ok_or_else(|| ApiError::not_found("machine not found"))?;

    let rotated = state.tokens.rotate(&machine.mac, &old_token).await?;

    Ok(Json(json!({
        "token": rotated.value,
        "expires_at": rotated.expires_at.to_rfc3339(),
    })))
}
