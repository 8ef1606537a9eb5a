// src/server/handlers/facts.rs
//! Agent fact submission.

use super::parse_body;
use crate::bus::SUBJECT_AGENT_FACTS;
use crate::db::models::{Fact, JsonMap, Machine};
use crate::server::{ApiError, ApiState};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitRequest {
    #[serde(default)]
    machine_id: Option<Uuid>,
    #[serde(default)]
    snapshot: Option<JsonMap>,
}

/// POST /v1/agents/facts — persist a snapshot and publish `agent.facts`.
pub async fn submit(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let req = parse_body(body)?;
    let machine_id = req
        .machine_id
        .ok_or_else(|| ApiError::bad_request("machine_id is required"))?;
    let snapshot = req.snapshot.unwrap_or_default();

    let fact = Fact {
        id: Uuid::new_v4(),
        machine_id,
        snapshot,
        created_at: Utc::now(),
    };

    {
        let fact = fact.clone();
        state
            .db
            .call(move |conn| {
                if Machine::find_by_id(conn, machine_id)?.is_none() {
                    return Err(crate::error::Error::NotFound(format!(
                        "machine {machine_id}"
                    )));
                }
                fact.insert_if_absent(conn)?;
                Ok(())
            })
            .await?;
    }

    state
        .publish_event(
            SUBJECT_AGENT_FACTS,
            json!({
                "fact_id": fact.id,
                "machine_id": fact.machine_id,
                "snapshot": fact.snapshot,
                "created_at": fact.created_at,
            }),
        )
        .await;

    Ok((StatusCode::CREATED, Json(json!({"fact": fact}))))
}
