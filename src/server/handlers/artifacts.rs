// src/server/handlers/artifacts.rs
//! Artifact registration: presigned-upload and direct-register modes.

use super::parse_body;
use crate::db::models::{Artifact, JsonMap};
use crate::server::{ApiError, ApiState, PRESIGN_URL_EXPIRY};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

const MODE_PRESIGN: &str = "presign";
const MODE_REGISTER: &str = "register";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRequest {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    sha256: String,
    #[serde(default)]
    meta: Option<JsonMap>,
    #[serde(default)]
    mode: String,
}

/// POST /v1/artifacts
///
/// `presign` (the default) answers with a presigned PUT URL for the caller
/// to upload through; `register` answers with the bucket and key so the
/// caller can upload with its own credentials (the bundle import path).
pub async fn create(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let storage = state
        .storage
        .as_ref()
        .ok_or_else(|| ApiError::failed_dependency("object storage not configured"))?;

    let req = parse_body(body)?;
    let kind = req.kind.trim().to_string();
    let sha256 = req.sha256.trim().to_lowercase();
    let mode = match req.mode.trim().to_lowercase().as_str() {
        "" | MODE_PRESIGN => MODE_PRESIGN,
        MODE_REGISTER => MODE_REGISTER,
        _ => return Err(ApiError::bad_request("mode must be presign or register")),
    };

    if kind.is_empty() || sha256.is_empty() {
        return Err(ApiError::bad_request("kind and sha256 are required"));
    }
    if sha256.len() != 64 || !sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ApiError::bad_request("sha256 must be 64 hex characters"));
    }

    let artifact_id = Uuid::new_v4();
    let key = format!("artifacts/{kind}/{artifact_id}");
    let bucket = state.config.artifact_bucket.clone();
    let location = format!("s3://{bucket}/{key}");

    let artifact = Artifact {
        id: artifact_id,
        kind,
        sha256,
        url: location,
        meta: req.meta.unwrap_or_default(),
        created_at: Utc::now(),
    };

    {
        let artifact = artifact.clone();
        state.db.call(move |conn| artifact.insert(conn)).await?;
    }

    let mut response = json!({"artifact": artifact});
    if mode == MODE_PRESIGN {
        let upload_url = storage.presign_put(&bucket, &key, PRESIGN_URL_EXPIRY);
        response["upload_url"] = json!(upload_url);
    } else {
        response["s3"] = json!({"bucket": bucket, "key": key});
    }

    Ok((StatusCode::CREATED, Json(response)))
}
