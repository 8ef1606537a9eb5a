// src/error.rs

//! Crate-wide error type and `Result` alias.
//!
//! Variants follow the failure kinds the control plane distinguishes at its
//! boundaries: validation problems stay 4xx and are never retried, dependency
//! failures are retried by bus redelivery, integrity failures abort the whole
//! operation with no partial commit.

use thiserror::Error;

/// Errors surfaced by the provisioning control plane
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, missing required field, unknown field
    #[error("invalid input: {0}")]
    Validation(String),

    /// A referenced entity does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Token invalid or does not match
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Token elapsed its TTL
    #[error("token expired")]
    TokenExpired,

    /// Downstream dependency (store, bus, object storage) unavailable
    #[error("dependency unavailable: {0}")]
    Dependency(String),

    /// Signature or content-hash verification failed; fatal for the operation
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Unique-constraint race lost; handled internally where harmless
    #[error("conflict: {0}")]
    Conflict(String),

    /// A per-operation deadline elapsed
    #[error("operation timed out")]
    Timeout,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
