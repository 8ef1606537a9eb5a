// tests/api_http.rs

//! End-to-end HTTP scenarios against a live API server.

mod common;

use common::{api_state, api_state_with_storage, setup_store, spawn_api, storage_client};
use serde_json::{json, Value};

fn extract_token(ipxe_script: &str) -> String {
    ipxe_script
        .lines()
        .find_map(|line| line.strip_prefix("set token "))
        .expect("rendered script carries a token")
        .trim()
        .to_string()
}

#[tokio::test]
async fn enroll_and_boot_reuses_the_dispensed_token() {
    let (db, bus) = setup_store();
    let base = spawn_api(api_state(db, bus)).await;
    let http = reqwest::Client::new();

    let enroll = http
        .post(format!("{base}/v1/machines"))
        .json(&json!({"mac": "aa:bb:cc:dd:ee:ff", "serial": "S1", "profile": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(enroll.status(), 200);
    let body: Value = enroll.json().await.unwrap();
    assert_eq!(body["machine"]["mac"], "aa:bb:cc:dd:ee:ff");

    // MAC case differences are identical after lowercasing
    let boot = http
        .get(format!("{base}/v1/boot/ipxe?mac=AA:BB:CC:DD:EE:FF"))
        .send()
        .await
        .unwrap();
    assert_eq!(boot.status(), 200);
    assert!(boot
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let script = boot.text().await.unwrap();
    assert!(script.starts_with("#!ipxe"));
    assert!(script.contains(&base), "script embeds the inferred API base");

    let token_first = extract_token(&script);
    assert!(!token_first.is_empty());

    // A second immediate boot returns the same token value
    let script_again = http
        .get(format!("{base}/v1/boot/ipxe?mac=aa:bb:cc:dd:ee:ff"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(extract_token(&script_again), token_first);

    // Unknown machines cannot boot
    let missing = http
        .get(format!("{base}/v1/boot/ipxe?mac=00:00:00:00:00:00"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn token_refresh_rotates_once() {
    let (db, bus) = setup_store();
    let base = spawn_api(api_state(db, bus)).await;
    let http = reqwest::Client::new();

    let body: Value = http
        .post(format!("{base}/v1/machines"))
        .json(&json!({"mac": "aa:bb:cc:dd:ee:01", "serial": "", "profile": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let machine_id = body["machine"]["id"].as_str().unwrap().to_string();

    let script = http
        .get(format!("{base}/v1/boot/ipxe?mac=aa:bb:cc:dd:ee:01"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let t0 = extract_token(&script);

    let refreshed = http
        .post(format!("{base}/v1/agents/token/refresh"))
        .json(&json!({"machine_id": machine_id, "old_token": t0}))
        .send()
        .await
        .unwrap();
    assert_eq!(refreshed.status(), 200);
    let refreshed: Value = refreshed.json().await.unwrap();
    let t1 = refreshed["token"].as_str().unwrap();
    assert_ne!(t1, t0);
    assert!(refreshed["expires_at"].as_str().is_some());

    // The consumed token no longer refreshes
    let again = http
        .post(format!("{base}/v1/agents/token/refresh"))
        .json(&json!({"machine_id": machine_id, "old_token": t0}))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 401);
    let error: Value = again.json().await.unwrap();
    assert_eq!(error["error"], "invalid token");
}

#[tokio::test]
async fn facts_endpoint_persists_and_publishes() {
    let (db, bus) = setup_store();
    let base = spawn_api(api_state(db.clone(), bus)).await;
    let http = reqwest::Client::new();

    let body: Value = http
        .post(format!("{base}/v1/machines"))
        .json(&json!({"mac": "aa:bb:cc:dd:ee:02", "serial": "", "profile": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let machine_id = body["machine"]["id"].as_str().unwrap().to_string();

    let submitted = http
        .post(format!("{base}/v1/agents/facts"))
        .json(&json!({"machine_id": machine_id, "snapshot": {"kernel": "5.19"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(submitted.status(), 201);
    let fact: Value = submitted.json().await.unwrap();
    assert_eq!(fact["fact"]["snapshot"]["kernel"], "5.19");

    // Facts for unknown machines are rejected
    let unknown = http
        .post(format!("{base}/v1/agents/facts"))
        .json(&json!({"machine_id": uuid::Uuid::new_v4(), "snapshot": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);

    let published: i64 = db
        .call(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM bus_messages WHERE subject = 'agent.facts'",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(published, 1);
}

#[tokio::test]
async fn run_start_and_finish_round_trip() {
    let (db, bus) = setup_store();
    let base = spawn_api(api_state(db, bus)).await;
    let http = reqwest::Client::new();

    let machine: Value = http
        .post(format!("{base}/v1/machines"))
        .json(&json!({"mac": "aa:bb:cc:dd:ee:03", "serial": "", "profile": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let machine_id = machine["machine"]["id"].as_str().unwrap().to_string();

    let blueprint: Value = http
        .post(format!("{base}/v1/blueprints"))
        .json(&json!({"name": "web", "os": "rhel9", "version": "1.0", "data": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let blueprint_id = blueprint["blueprint"]["id"].as_str().unwrap().to_string();

    let started = http
        .post(format!("{base}/v1/runs/start"))
        .json(&json!({"machine_id": machine_id, "blueprint_id": blueprint_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(started.status(), 201);
    let run: Value = started.json().await.unwrap();
    assert_eq!(run["run"]["status"], "running");
    let run_id = run["run"]["id"].as_str().unwrap().to_string();

    // A second running run for the same machine is a conflict
    let duplicate = http
        .post(format!("{base}/v1/runs/start"))
        .json(&json!({"machine_id": machine_id, "blueprint_id": blueprint_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 409);

    let finished = http
        .post(format!("{base}/v1/runs/finish"))
        .json(&json!({"run_id": run_id, "status": "success", "logs": "done"}))
        .send()
        .await
        .unwrap();
    assert_eq!(finished.status(), 200);
    let finished: Value = finished.json().await.unwrap();
    assert_eq!(finished["run"]["status"], "success");
    assert!(finished["run"]["finished_at"].as_str().is_some());
    assert_eq!(finished["run"]["logs"], "done");

    let missing = http
        .post(format!("{base}/v1/runs/finish"))
        .json(&json!({"run_id": uuid::Uuid::new_v4(), "status": "failed", "logs": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    // The machine list derives "ready" from the successful latest run
    let list: Value = http
        .get(format!("{base}/v1/machines"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let items = list["machines"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["status"], "ready");
    assert_eq!(items[0]["recent_runs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn artifact_registration_modes() {
    // Without storage configured, registration is a failed dependency
    let (db, bus) = setup_store();
    let base = spawn_api(api_state(db, bus)).await;
    let http = reqwest::Client::new();

    let sha = "ab".repeat(32);
    let unconfigured = http
        .post(format!("{base}/v1/artifacts"))
        .json(&json!({"kind": "iso", "sha256": sha, "meta": {}, "mode": "presign"}))
        .send()
        .await
        .unwrap();
    assert_eq!(unconfigured.status(), 424);

    // With storage, presign answers an upload URL and register answers a key
    let (db, bus) = setup_store();
    let storage = storage_client("127.0.0.1:19000");
    let base = spawn_api(api_state_with_storage(db.clone(), bus, Some(storage))).await;

    let presigned = http
        .post(format!("{base}/v1/artifacts"))
        .json(&json!({"kind": "iso", "sha256": sha, "meta": {"path": "a.iso"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(presigned.status(), 201);
    let presigned: Value = presigned.json().await.unwrap();
    let upload_url = presigned["upload_url"].as_str().unwrap();
    assert!(upload_url.contains("X-Amz-Signature="));
    assert!(presigned["artifact"]["url"]
        .as_str()
        .unwrap()
        .starts_with("s3://test-artifacts/artifacts/iso/"));

    let registered = http
        .post(format!("{base}/v1/artifacts"))
        .json(&json!({"kind": "wim", "sha256": sha, "meta": {}, "mode": "register"}))
        .send()
        .await
        .unwrap();
    assert_eq!(registered.status(), 201);
    let registered: Value = registered.json().await.unwrap();
    assert_eq!(registered["s3"]["bucket"], "test-artifacts");
    assert!(registered["s3"]["key"]
        .as_str()
        .unwrap()
        .starts_with("artifacts/wim/"));
    assert!(registered.get("upload_url").is_none());

    let rows: i64 = db
        .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM artifacts", [], |r| r.get(0))?))
        .await
        .unwrap();
    assert_eq!(rows, 2);

    // Malformed digests are rejected
    let bad = http
        .post(format!("{base}/v1/artifacts"))
        .json(&json!({"kind": "iso", "sha256": "nothex", "meta": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
}

#[tokio::test]
async fn blueprint_crud_round_trip() {
    let (db, bus) = setup_store();
    let base = spawn_api(api_state(db, bus)).await;
    let http = reqwest::Client::new();

    let created = http
        .post(format!("{base}/v1/blueprints"))
        .json(&json!({"name": "db", "os": "rhel9", "version": "1.0", "data": {"pkgs": ["postgres"]}}))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created: Value = created.json().await.unwrap();
    let id = created["blueprint"]["id"].as_str().unwrap().to_string();

    let fetched: Value = http
        .get(format!("{base}/v1/blueprints/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["blueprint"]["data"]["pkgs"][0], "postgres");

    let updated = http
        .put(format!("{base}/v1/blueprints/{id}"))
        .json(&json!({"name": "db", "os": "rhel9", "version": "1.1", "data": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(updated.status(), 200);
    let updated: Value = updated.json().await.unwrap();
    assert_eq!(updated["blueprint"]["version"], "1.1");

    let deleted = http
        .delete(format!("{base}/v1/blueprints/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    let gone = http
        .get(format!("{base}/v1/blueprints/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn strict_request_validation() {
    let (db, bus) = setup_store();
    let base = spawn_api(api_state(db, bus)).await;
    let http = reqwest::Client::new();

    // Unknown JSON fields are rejected
    let unknown_field = http
        .post(format!("{base}/v1/machines"))
        .json(&json!({"mac": "aa:bb:cc:dd:ee:04", "bogus": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_field.status(), 400);

    // Missing required fields are rejected
    let missing_mac = http
        .post(format!("{base}/v1/machines"))
        .json(&json!({"serial": "S"}))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_mac.status(), 400);

    // UUIDs parse strictly
    let bad_uuid = http
        .get(format!("{base}/v1/render/kickstart?machine_id=not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_uuid.status(), 400);

    // Health endpoints
    assert_eq!(
        http.get(format!("{base}/healthz")).send().await.unwrap().status(),
        200
    );
    assert_eq!(
        http.get(format!("{base}/readyz")).send().await.unwrap().status(),
        200
    );
}

#[tokio::test]
async fn kickstart_renders_profile_values() {
    let (db, bus) = setup_store();
    let base = spawn_api(api_state(db, bus)).await;
    let http = reqwest::Client::new();

    let machine: Value = http
        .post(format!("{base}/v1/machines"))
        .json(&json!({
            "mac": "aa:bb:cc:dd:ee:05",
            "serial": "S5",
            "profile": {"hostname": "web01.example"}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let machine_id = machine["machine"]["id"].as_str().unwrap();

    let kickstart = http
        .get(format!("{base}/v1/render/kickstart?machine_id={machine_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(kickstart.status(), 200);
    let body = kickstart.text().await.unwrap();
    assert!(body.contains("--hostname=web01.example"));
    assert!(body.contains("AGENT_TOKEN="));

    let unattend = http
        .get(format!("{base}/v1/render/unattend?machine_id={machine_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(unattend.status(), 200);
    assert_eq!(
        unattend.headers().get("content-type").unwrap(),
        "application/xml"
    );
}
