// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use foundry::db::models::JsonMap;
use foundry::server::{ApiState, ServerConfig};
use foundry::storage::{Client as StorageClient, S3Config};
use foundry::{Bus, Db};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Fresh in-memory store plus a bus over it.
pub fn setup_store() -> (Db, Bus) {
    let db = Db::open_in_memory().unwrap();
    let bus = Bus::new(db.clone());
    (db, bus)
}

/// API state without object storage (artifact registration answers 424).
pub fn api_state(db: Db, bus: Bus) -> Arc<ApiState> {
    api_state_with_storage(db, bus, None)
}

pub fn api_state_with_storage(
    db: Db,
    bus: Bus,
    storage: Option<StorageClient>,
) -> Arc<ApiState> {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        api_base: None,
        token_ttl: chrono::Duration::minutes(5),
        artifact_bucket: "test-artifacts".to_string(),
    };
    Arc::new(ApiState::new(db, bus, storage, config).unwrap())
}

/// Storage client pointed at a local stub endpoint.
pub fn storage_client(endpoint: &str) -> StorageClient {
    StorageClient::new(S3Config {
        endpoint: endpoint.to_string(),
        access_key: "test-access".to_string(),
        secret_key: "test-secret".to_string(),
        region: "us-east-1".to_string(),
        disable_tls: true,
        force_path_style: true,
    })
    .unwrap()
}

/// Serve the API on an ephemeral port; returns its base URL.
pub async fn spawn_api(state: Arc<ApiState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = foundry::server::create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Poll until `check` yields `Some`, or panic after ~2 seconds.
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..100 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

pub fn json_map(pairs: &[(&str, Value)]) -> JsonMap {
    let mut map = JsonMap::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}
