// src/inventory.rs

//! Fact inventory: consumes agent fact events, persists snapshots
//! idempotently, and appends a structural diff to the audit log.
//!
//! Fact events are delivered at least once, so the insert is keyed on the
//! event's fact id with on-conflict-do-nothing; a duplicate delivery is acked
//! without a second audit row. Reordered deliveries diff against whatever is
//! currently newest for the machine, which the append-only model tolerates.

use crate::bus::{Bus, SubscriptionHandle, SUBJECT_AGENT_FACTS};
use crate::db::models::{AuditEntry, Fact, JsonMap};
use crate::db::Db;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DURABLE_INVENTORY_FACTS: &str = "inventory-facts";

const AUDIT_ACTOR: &str = "agent";
const AUDIT_ACTION: &str = "facts_updated";

#[derive(Debug, Deserialize)]
struct FactEvent {
    #[serde(default)]
    fact_id: Option<Uuid>,
    #[serde(default)]
    machine_id: Option<Uuid>,
    #[serde(default)]
    snapshot: Option<JsonMap>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

/// Consumes `agent.facts` into the store with audit diffs.
pub struct Ingestor {
    db: Db,
    bus: Bus,
    sub: Option<SubscriptionHandle>,
}

impl Ingestor {
    pub fn new(db: Db, bus: Bus) -> Self {
        Self { db, bus, sub: None }
    }

    /// Subscribe the durable consumer and begin processing.
    pub async fn start(&mut self) -> Result<()> {
        let db = self.db.clone();
        let sub = self
            .bus
            .subscribe(SUBJECT_AGENT_FACTS, DURABLE_INVENTORY_FACTS, move |data| {
                let db = db.clone();
                async move {
                    match handle_fact(&db, &data).await {
                        // Malformed events are never retried; redelivery
                        // cannot fix them.
                        Err(Error::Validation(msg)) => {
                            warn!(error = %msg, "dropping malformed fact event");
                            Ok(())
                        }
                        other => other,
                    }
                }
            })
            .await?;
        self.sub = Some(sub);
        Ok(())
    }

    /// Stop the subscription, draining any in-flight handler.
    pub async fn close(&mut self) {
        if let Some(sub) = self.sub.take() {
            sub.close().await;
        }
    }
}

async fn handle_fact(db: &Db, data: &[u8]) -> Result<()> {
    let evt: FactEvent = serde_json::from_slice(data)
        .map_err(|e| Error::Validation(format!("malformed fact event: {e}")))?;
    let fact_id = evt
        .fact_id
        .ok_or_else(|| Error::Validation("fact_id missing from event".to_string()))?;
    let machine_id = evt
        .machine_id
        .ok_or_else(|| Error::Validation("machine_id missing from event".to_string()))?;
    let snapshot = evt.snapshot.unwrap_or_default();
    let created_at = evt.created_at.unwrap_or_else(Utc::now);

    db.transaction(move |tx| {
        let previous = Fact::latest_for_machine_excluding(tx, machine_id, fact_id)?
            .map(|f| f.snapshot)
            .unwrap_or_default();

        let fact = Fact {
            id: fact_id,
            machine_id,
            snapshot,
            created_at,
        };

        if !fact.insert_if_absent(tx)? {
            // Duplicate delivery of a known fact: ack without a new audit row.
            debug!(fact_id = %fact_id, machine_id = %machine_id, "duplicate fact delivery ignored");
            return Ok(());
        }

        let changes = compute_diff(&previous, &fact.snapshot);

        let mut details = JsonMap::new();
        details.insert("machine_id".to_string(), json!(machine_id));
        details.insert("fact_id".to_string(), json!(fact_id));
        details.insert("changes".to_string(), Value::Object(changes));

        AuditEntry::append(
            tx,
            AUDIT_ACTOR,
            AUDIT_ACTION,
            &machine_id.to_string(),
            &details,
            Utc::now(),
        )?;
        Ok(())
    })
    .await
}

/// Structural diff between two snapshots.
///
/// Emits `{key: {old, new}}` for every key whose value differs by deep
/// equality; a key missing on one side appears as `null` on that side.
pub fn compute_diff(previous: &JsonMap, current: &JsonMap) -> JsonMap {
    let mut diff = JsonMap::new();

    for (key, prev_val) in previous {
        match current.get(key) {
            None => {
                diff.insert(key.clone(), json!({"old": prev_val, "new": null}));
            }
            Some(cur_val) if cur_val != prev_val => {
                diff.insert(key.clone(), json!({"old": prev_val, "new": cur_val}));
            }
            Some(_) => {}
        }
    }

    for (key, cur_val) in current {
        if !previous.contains_key(key) {
            diff.insert(key.clone(), json!({"old": null, "new": cur_val}));
        }
    }

    diff
}
