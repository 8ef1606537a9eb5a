// src/server/handlers/boot.rs
//! Boot-time endpoints: iPXE script and unattended-install profiles.
//!
//! The iPXE path re-serves the newest unexpired token for the MAC when one
//! exists, so a machine that fetches its script twice sees the same value;
//! otherwise a fresh token is issued. Either way the token is marked
//! dispensed. The render endpoints issue a fresh token per request.

use super::{api_base, render_vars};
use crate::db::models::Machine;
use crate::render::{TEMPLATE_IPXE, TEMPLATE_KICKSTART, TEMPLATE_UNATTEND};
use crate::server::{ApiError, ApiState};
use crate::tokens::Token;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct BootQuery {
    #[serde(default)]
    mac: String,
}

#[derive(Debug, Deserialize)]
pub struct RenderQuery {
    #[serde(default)]
    machine_id: String,
}

/// GET /v1/boot/ipxe?mac=…
pub async fn ipxe(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<BootQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let mac = query.mac.trim().to_lowercase();
    if mac.is_empty() {
        return Err(ApiError::bad_request("mac query parameter is required"));
    }

    let machine = fetch_machine_by_mac(&state, &mac).await?;
    let token = dispense_token(&state, &machine.mac).await?;

    let base = api_base(&state, &headers);
    let vars = render_vars(&machine, Some(&token.value), &base);
    let rendered = state.render.render(TEMPLATE_IPXE, &vars)?;

    Ok(plain(rendered, "text/plain; charset=utf-8"))
}

/// GET /v1/render/kickstart?machine_id=…
pub async fn kickstart(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RenderQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    render_profile(state, query, headers, TEMPLATE_KICKSTART, "text/plain; charset=utf-8").await
}

/// GET /v1/render/unattend?machine_id=…
pub async fn unattend(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RenderQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    render_profile(state, query, headers, TEMPLATE_UNATTEND, "application/xml").await
}

async fn render_profile(
    state: Arc<ApiState>,
    query: RenderQuery,
    headers: HeaderMap,
    template: &str,
    content_type: &'static str,
) -> Result<Response, ApiError> {
    let machine_id = Uuid::parse_str(query.machine_id.trim())
        .map_err(|_| ApiError::bad_request("valid machine_id is required"))?;

    let machine = state
        .db
        .call(move |conn| Machine::find_by_id(conn, machine_id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("machine {machine_id} not found")))?;

    // A fresh token per rendered profile; installers embed it for callbacks.
    let token = state.tokens.issue(&machine.mac).await?;
    mark_dispensed(&state, &token).await;

    let base = api_base(&state, &headers);
    let vars = render_vars(&machine, Some(&token.value), &base);
    let rendered = state.render.render(template, &vars)?;

    Ok(plain(rendered, content_type))
}

async fn fetch_machine_by_mac(state: &ApiState, mac: &str) -> Result<Machine, ApiError> {
    let lookup = mac.to_string();
    state
        .db
        .call(move |conn| Machine::find_by_mac(conn, &lookup))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("machine with mac {mac} not found")))
}

/// Reuse the newest unexpired token or issue a fresh one, then record that
/// it has been dispensed.
async fn dispense_token(state: &ApiState, mac: &str) -> Result<Token, ApiError> {
    let token = match state.tokens.latest(mac).await? {
        Some(token) => token,
        None => state.tokens.issue(mac).await?,
    };
    mark_dispensed(state, &token).await;
    Ok(token)
}

async fn mark_dispensed(state: &ApiState, token: &Token) {
    if let Err(e) = state.tokens.mark_used(&token.value).await {
        warn!(error = %e, "failed to mark token dispensed");
    }
}

fn plain(body: String, content_type: &'static str) -> Response {
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}
