// src/server/handlers/machines.rs
//! Machine enrollment and inventory listing.

use super::parse_body;
use crate::bus::SUBJECT_MACHINES_ENROLLED;
use crate::db::models::{
    normalize_mac, Fact, JsonMap, Machine, Run, MACHINE_STATUS_ERROR, MACHINE_STATUS_OFFLINE,
    MACHINE_STATUS_PROVISIONING, MACHINE_STATUS_READY,
};
use crate::server::{ApiError, ApiState};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

const RECENT_RUNS_PER_MACHINE: usize = 5;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpsertRequest {
    #[serde(default)]
    mac: String,
    #[serde(default)]
    serial: String,
    #[serde(default)]
    profile: Option<JsonMap>,
}

/// POST /v1/machines — upsert keyed on lowercase MAC, publishes
/// `machines.enrolled`.
pub async fn upsert(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<UpsertRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let req = parse_body(body)?;
    let mac = normalize_mac(&req.mac);
    if mac.is_empty() {
        return Err(ApiError::bad_request("mac is required"));
    }
    let profile = req.profile.unwrap_or_default();
    let serial = req.serial;

    let machine = state
        .db
        .call(move |conn| Machine::upsert(conn, &mac, &serial, &profile, Utc::now()))
        .await?;

    state
        .publish_event(
            SUBJECT_MACHINES_ENROLLED,
            json!({"machine_id": machine.id, "mac": machine.mac}),
        )
        .await;

    Ok(Json(json!({"machine": machine})))
}

#[derive(Serialize)]
struct MachineListItem {
    machine: Machine,
    status: &'static str,
    latest_fact: Option<Fact>,
    recent_runs: Vec<Run>,
}

/// GET /v1/machines — inventory listing with latest fact, recent runs, and a
/// derived status per machine.
pub async fn list(State(state): State<Arc<ApiState>>) -> Result<Json<Value>, ApiError> {
    let items = state
        .db
        .call(|conn| {
            let machines = Machine::list_all(conn)?;
            let mut items = Vec::with_capacity(machines.len());
            for machine in machines {
                let latest_fact = Fact::latest_for_machine(conn, machine.id)?;
                let recent_runs =
                    Run::recent_for_machine(conn, machine.id, RECENT_RUNS_PER_MACHINE)?;
                let status = derive_status(latest_fact.as_ref(), &recent_runs);
                items.push(MachineListItem {
                    machine,
                    status,
                    latest_fact,
                    recent_runs,
                });
            }
            Ok(items)
        })
        .await?;

    Ok(Json(json!({"machines": items})))
}

fn derive_status(latest_fact: Option<&Fact>, runs: &[Run]) -> &'static str {
    if let Some(latest) = runs.first() {
        match latest.status.trim().to_lowercase().as_str() {
            "running" => return MACHINE_STATUS_PROVISIONING,
            "success" | "succeeded" | "completed" => return MACHINE_STATUS_READY,
            "failed" | "failure" | "error" | "errored" => return MACHINE_STATUS_ERROR,
            _ => {}
        }
    }
    if latest_fact.is_some() {
        MACHINE_STATUS_READY
    } else {
        MACHINE_STATUS_OFFLINE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn run_with_status(status: &str) -> Run {
        Run {
            id: Uuid::new_v4(),
            machine_id: Some(Uuid::new_v4()),
            blueprint_id: None,
            status: status.to_string(),
            started_at: Some(Utc::now()),
            finished_at: None,
            logs: String::new(),
        }
    }

    fn fact() -> Fact {
        Fact {
            id: Uuid::new_v4(),
            machine_id: Uuid::new_v4(),
            snapshot: JsonMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_derivation() {
        assert_eq!(
            derive_status(None, &[run_with_status("running")]),
            MACHINE_STATUS_PROVISIONING
        );
        assert_eq!(
            derive_status(None, &[run_with_status("success")]),
            MACHINE_STATUS_READY
        );
        assert_eq!(
            derive_status(None, &[run_with_status("failed")]),
            MACHINE_STATUS_ERROR
        );
        assert_eq!(
            derive_status(Some(&fact()), &[run_with_status("mystery")]),
            MACHINE_STATUS_READY
        );
        assert_eq!(derive_status(Some(&fact()), &[]), MACHINE_STATUS_READY);
        assert_eq!(derive_status(None, &[]), MACHINE_STATUS_OFFLINE);
    }
}
