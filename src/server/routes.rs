// src/server/routes.rs
//! Axum router for the provisioning API.

use crate::server::handlers::{artifacts, blueprints, boot, facts, machines, runs, tokens};
use crate::server::ApiState;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{extract::State, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the full API router.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(ready))
        .route("/v1/machines", post(machines::upsert).get(machines::list))
        .route("/v1/boot/ipxe", get(boot::ipxe))
        .route("/v1/render/kickstart", get(boot::kickstart))
        .route("/v1/render/unattend", get(boot::unattend))
        .route("/v1/artifacts", post(artifacts::create))
        .route("/v1/agents/facts", post(facts::submit))
        .route("/v1/agents/token/refresh", post(tokens::refresh))
        .route("/v1/runs/start", post(runs::start))
        .route("/v1/runs/finish", post(runs::finish))
        .route(
            "/v1/blueprints",
            get(blueprints::list).post(blueprints::create),
        )
        .route(
            "/v1/blueprints/:blueprint_id",
            get(blueprints::fetch)
                .put(blueprints::update)
                .delete(blueprints::delete),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Readiness pings the store; a wedged database means not ready.
async fn ready(State(state): State<Arc<ApiState>>) -> StatusCode {
    let ping = state
        .db
        .call(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await;
    match ping {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
