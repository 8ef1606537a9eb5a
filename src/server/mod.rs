// src/server/mod.rs

//! Provisioning API server.
//!
//! Binds the token store, run/fact pipeline, and artifact registry to the
//! outside world: machine upsert, boot-script rendering, artifact
//! registration, fact submission, run start/finish, and token refresh.
//! Handlers validate strictly (unknown JSON fields are rejected, UUIDs are
//! parsed strictly, MACs are lowercased) and every store operation runs
//! under the database deadline.

mod handlers;
mod routes;

pub use routes::create_router;

use crate::bus::Bus;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::render;
use crate::storage;
use crate::tokens::TokenStore;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// How long presigned upload/download URLs stay valid.
pub const PRESIGN_URL_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// External base URL embedded in rendered boot scripts; when unset, the
    /// request's scheme and host are used.
    pub api_base: Option<String>,
    /// Boot/agent token lifetime
    pub token_ttl: chrono::Duration,
    /// Bucket artifact uploads land in
    pub artifact_bucket: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            api_base: None,
            token_ttl: crate::tokens::default_ttl(),
            artifact_bucket: String::new(),
        }
    }
}

/// Shared server state
pub struct ApiState {
    pub db: Db,
    pub bus: Bus,
    pub tokens: TokenStore,
    pub render: render::Engine,
    pub storage: Option<storage::Client>,
    pub config: ServerConfig,
}

impl ApiState {
    pub fn new(
        db: Db,
        bus: Bus,
        storage: Option<storage::Client>,
        mut config: ServerConfig,
    ) -> Result<Self> {
        if config.artifact_bucket.is_empty() {
            config.artifact_bucket = std::env::var("S3_BUCKET").unwrap_or_default();
        }
        if config.artifact_bucket.is_empty() {
            return Err(Error::Validation("artifact bucket is required".to_string()));
        }

        let tokens = TokenStore::new(db.clone(), config.token_ttl);

        Ok(Self {
            db,
            bus,
            tokens,
            render: render::Engine::new(),
            storage,
            config,
        })
    }

    /// Best-effort event publication; API responses never fail on bus errors.
    pub async fn publish_event(&self, subject: &str, payload: Value) {
        if let Err(e) = self.bus.publish(subject, &payload).await {
            warn!(subject, error = %e, "failed to publish event");
        }
    }
}

/// Error envelope returned by every endpoint: `{"error": "..."}` with the
/// status derived from the failure kind.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn failed_dependency(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FAILED_DEPENDENCY, message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(_) | Error::TokenExpired => StatusCode::UNAUTHORIZED,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Dependency(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &err {
            Error::Unauthorized(msg) => msg.clone(),
            other => other.to_string(),
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

/// Serve the API until `shutdown` flips.
pub async fn run_server(state: Arc<ApiState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let bind_addr = state.config.bind_addr;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| Error::Dependency(format!("bind {bind_addr}: {e}")))?;
    info!("provisioning API listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| Error::Dependency(format!("server failed: {e}")))?;

    Ok(())
}
