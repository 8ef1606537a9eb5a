// src/orchestrator.rs

//! Run state machine: reacts to enrollment and fact events, keeps at most
//! one running run per machine, and publishes run lifecycle events.
//!
//! The in-memory active-run map is advisory; the store is the source of
//! truth and is re-read on every cache miss. Lifecycle events double as the
//! reconciliation signal that keeps externally-started runs (and other
//! replicas) coherent with the cache.

use crate::bus::{
    Bus, SubscriptionHandle, SUBJECT_AGENT_FACTS, SUBJECT_MACHINES_ENROLLED,
    SUBJECT_RUNS_FINISHED, SUBJECT_RUNS_STARTED,
};
use crate::db::models::{JsonMap, Run, RUN_STATUS_RUNNING, RUN_STATUS_SUCCESS};
use crate::db::Db;
use crate::error::{Error, Result};
use chrono::Utc;
use rusqlite::ErrorCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DURABLE_ORCHESTRATOR_MACHINES: &str = "orchestrator-machines";
pub const DURABLE_ORCHESTRATOR_FACTS: &str = "orchestrator-facts";
pub const DURABLE_ORCHESTRATOR_RUNS_STARTED: &str = "orchestrator-runs-started";
pub const DURABLE_ORCHESTRATOR_RUNS_FINISHED: &str = "orchestrator-runs-finished";

#[derive(Debug, Deserialize)]
struct MachineEnrolledEvent {
    #[serde(default)]
    machine_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct AgentFactsEvent {
    #[serde(default)]
    machine_id: Option<Uuid>,
    #[serde(default)]
    snapshot: Option<JsonMap>,
}

#[derive(Debug, Deserialize)]
struct RunLifecycleEvent {
    #[serde(default)]
    run_id: Option<Uuid>,
    #[serde(default)]
    machine_id: Option<Uuid>,
    #[serde(default)]
    status: Option<String>,
}

/// Coordinates provisioning runs in response to bus events.
pub struct StateMachine {
    inner: Arc<Inner>,
    subs: Vec<SubscriptionHandle>,
}

struct Inner {
    db: Db,
    bus: Bus,
    active_runs: RwLock<HashMap<Uuid, Uuid>>,
}

impl StateMachine {
    pub fn new(db: Db, bus: Bus) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                bus,
                active_runs: RwLock::new(HashMap::new()),
            }),
            subs: Vec::new(),
        }
    }

    /// Register the durable subscriptions and begin processing events.
    pub async fn start(&mut self) -> Result<()> {
        let subscriptions: [(&str, &str, fn(Arc<Inner>, Vec<u8>) -> HandlerFuture); 4] = [
            (
                SUBJECT_MACHINES_ENROLLED,
                DURABLE_ORCHESTRATOR_MACHINES,
                |inner, data| Box::pin(async move { inner.handle_machine_enrolled(&data).await }),
            ),
            (
                SUBJECT_AGENT_FACTS,
                DURABLE_ORCHESTRATOR_FACTS,
                |inner, data| Box::pin(async move { inner.handle_agent_facts(&data).await }),
            ),
            (
                SUBJECT_RUNS_STARTED,
                DURABLE_ORCHESTRATOR_RUNS_STARTED,
                |inner, data| Box::pin(async move { inner.handle_run_started(&data).await }),
            ),
            (
                SUBJECT_RUNS_FINISHED,
                DURABLE_ORCHESTRATOR_RUNS_FINISHED,
                |inner, data| Box::pin(async move { inner.handle_run_finished(&data).await }),
            ),
        ];

        for (subject, durable, dispatch) in subscriptions {
            let inner = Arc::clone(&self.inner);
            let sub = self
                .inner
                .bus
                .subscribe(subject, durable, move |data| {
                    let inner = Arc::clone(&inner);
                    async move {
                        match dispatch(inner, data).await {
                            // Malformed events are never retried; redelivery
                            // cannot fix them.
                            Err(Error::Validation(msg)) => {
                                warn!(subject, error = %msg, "dropping malformed event");
                                Ok(())
                            }
                            other => other,
                        }
                    }
                })
                .await?;
            self.subs.push(sub);
        }

        Ok(())
    }

    /// Tear down the subscriptions, draining in-flight handlers.
    pub async fn close(&mut self) {
        for sub in self.subs.drain(..) {
            sub.close().await;
        }
    }
}

type HandlerFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

impl Inner {
    async fn handle_machine_enrolled(&self, data: &[u8]) -> Result<()> {
        let evt: MachineEnrolledEvent = serde_json::from_slice(data)
            .map_err(|e| Error::Validation(format!("malformed enrollment event: {e}")))?;
        let machine_id = evt
            .machine_id
            .ok_or_else(|| Error::Validation("machine_id missing from enrollment event".to_string()))?;

        if self.cached_run(machine_id).await.is_some() {
            return Ok(());
        }

        // The store is the truth: adopt an existing running run before
        // creating a new one.
        let started_at = Utc::now();
        let (run, created) = self
            .db
            .call(move |conn| {
                if let Some(existing) = Run::find_running_for_machine(conn, machine_id)? {
                    return Ok((existing, false));
                }
                match Run::start(conn, machine_id, None, started_at) {
                    Ok(run) => Ok((run, true)),
                    Err(Error::Database(rusqlite::Error::SqliteFailure(e, _)))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        // Lost the create race; the winner's row is authoritative.
                        Run::find_running_for_machine(conn, machine_id)?
                            .map(|run| (run, false))
                            .ok_or_else(|| {
                                Error::Conflict(format!(
                                    "running run for machine {machine_id} vanished mid-race"
                                ))
                            })
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        self.cache_run(machine_id, run.id).await;

        if !created {
            debug!(machine_id = %machine_id, run_id = %run.id, "adopted existing running run");
            return Ok(());
        }

        self.bus
            .publish(
                SUBJECT_RUNS_STARTED,
                &json!({
                    "run_id": run.id,
                    "machine_id": machine_id,
                    "status": RUN_STATUS_RUNNING,
                    "started_at": run.started_at,
                }),
            )
            .await
    }

    async fn handle_agent_facts(&self, data: &[u8]) -> Result<()> {
        let evt: AgentFactsEvent = serde_json::from_slice(data)
            .map_err(|e| Error::Validation(format!("malformed facts event: {e}")))?;
        let machine_id = evt
            .machine_id
            .ok_or_else(|| Error::Validation("machine_id missing from facts event".to_string()))?;
        let snapshot = evt.snapshot.unwrap_or_default();

        if !is_postinstall_done(&snapshot) {
            return Ok(());
        }

        let run_id = match self.cached_run(machine_id).await {
            Some(run_id) => run_id,
            None => {
                let found = self
                    .db
                    .call(move |conn| Run::find_running_for_machine(conn, machine_id))
                    .await?;
                match found {
                    Some(run) => {
                        self.cache_run(machine_id, run.id).await;
                        run.id
                    }
                    None => return Ok(()),
                }
            }
        };

        let finished_at = Utc::now();
        let updated = self
            .db
            .call(move |conn| {
                Run::finish(conn, run_id, RUN_STATUS_SUCCESS, None, finished_at)
            })
            .await?;
        if updated.is_none() {
            self.clear_cached_run(machine_id, run_id).await;
            return Ok(());
        }

        self.clear_cached_run(machine_id, run_id).await;

        self.bus
            .publish(
                SUBJECT_RUNS_FINISHED,
                &json!({
                    "run_id": run_id,
                    "machine_id": machine_id,
                    "status": RUN_STATUS_SUCCESS,
                    "finished_at": finished_at,
                }),
            )
            .await
    }

    async fn handle_run_started(&self, data: &[u8]) -> Result<()> {
        let evt: RunLifecycleEvent = serde_json::from_slice(data)
            .map_err(|e| Error::Validation(format!("malformed run lifecycle event: {e}")))?;
        let (Some(run_id), Some(machine_id)) = (evt.run_id, evt.machine_id) else {
            return Ok(());
        };
        if evt
            .status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(RUN_STATUS_RUNNING))
        {
            self.cache_run(machine_id, run_id).await;
        }
        Ok(())
    }

    async fn handle_run_finished(&self, data: &[u8]) -> Result<()> {
        let evt: RunLifecycleEvent = serde_json::from_slice(data)
            .map_err(|e| Error::Validation(format!("malformed run lifecycle event: {e}")))?;
        let (Some(run_id), Some(machine_id)) = (evt.run_id, evt.machine_id) else {
            return Ok(());
        };
        self.clear_cached_run(machine_id, run_id).await;
        Ok(())
    }

    async fn cached_run(&self, machine_id: Uuid) -> Option<Uuid> {
        self.active_runs.read().await.get(&machine_id).copied()
    }

    async fn cache_run(&self, machine_id: Uuid, run_id: Uuid) {
        self.active_runs.write().await.insert(machine_id, run_id);
    }

    /// Remove the cache entry only if it still refers to `run_id`, so a
    /// newer run cached concurrently is not clobbered.
    async fn clear_cached_run(&self, machine_id: Uuid, run_id: Uuid) {
        let mut cache = self.active_runs.write().await;
        if cache.get(&machine_id) == Some(&run_id) {
            cache.remove(&machine_id);
        }
    }
}

/// `postinstall_done` is truthy as boolean true, the string "true"
/// (case-insensitive), or a nonzero number.
fn is_postinstall_done(snapshot: &JsonMap) -> bool {
    match snapshot.get("postinstall_done") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    }
}
