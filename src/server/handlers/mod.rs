// src/server/handlers/mod.rs
//! Request handlers for the provisioning API.

pub mod artifacts;
pub mod blueprints;
pub mod boot;
pub mod facts;
pub mod machines;
pub mod runs;
pub mod tokens;

use crate::db::models::{JsonMap, Machine};
use crate::server::{ApiError, ApiState};
use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderMap};
use axum::Json;
use serde_json::json;

/// Decode a JSON body; malformed bodies, missing fields, and unknown fields
/// all surface as 400.
pub(crate) fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError::bad_request(rejection.body_text())),
    }
}

/// External base URL for rendered scripts: the configured value, else the
/// request's host.
pub(crate) fn api_base(state: &ApiState, headers: &HeaderMap) -> String {
    if let Some(base) = &state.config.api_base {
        if !base.is_empty() {
            return base.trim_end_matches('/').to_string();
        }
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

/// Variables available to boot-script templates.
pub(crate) fn render_vars(machine: &Machine, token: Option<&str>, api_base: &str) -> JsonMap {
    let mut vars = JsonMap::new();
    vars.insert("Token".to_string(), json!(token.unwrap_or_default()));
    vars.insert("MAC".to_string(), json!(machine.mac));
    vars.insert("APIBase".to_string(), json!(api_base));
    vars.insert("MachineID".to_string(), json!(machine.id));
    vars.insert("Serial".to_string(), json!(machine.serial));
    vars.insert(
        "Machine".to_string(),
        json!({"id": machine.id, "mac": machine.mac, "serial": machine.serial}),
    );
    vars.insert("Profile".to_string(), json!(machine.profile));
    vars
}
