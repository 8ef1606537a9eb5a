// src/db/models.rs

//! Data models for control-plane entities.
//!
//! Row structs correspond to database tables and carry the create/read/update
//! methods used by the API handlers and workers. All methods take a plain
//! `&Connection` so they compose inside transactions.

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Free-form JSON object column (machine profiles, fact snapshots, metadata).
pub type JsonMap = Map<String, Value>;

pub const RUN_STATUS_RUNNING: &str = "running";
pub const RUN_STATUS_SUCCESS: &str = "success";
pub const RUN_STATUS_FAILED: &str = "failed";

/// Derived machine status for the inventory listing.
pub const MACHINE_STATUS_PROVISIONING: &str = "provisioning";
pub const MACHINE_STATUS_READY: &str = "ready";
pub const MACHINE_STATUS_ERROR: &str = "error";
pub const MACHINE_STATUS_OFFLINE: &str = "offline";

/// Lowercase and trim a MAC address; the store only ever sees this form.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_lowercase()
}

/// Fixed-width RFC3339 UTC. Lexicographic order equals chronological order,
/// which the newest-first queries rely on.
pub fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("invalid timestamp {s:?}: {e}")))
}

pub fn json_text(map: &JsonMap) -> String {
    Value::Object(map.clone()).to_string()
}

pub fn json_map_from_text(s: &str) -> Result<JsonMap> {
    if s.is_empty() {
        return Ok(JsonMap::new());
    }
    match serde_json::from_str::<Value>(s)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Validation(format!(
            "expected JSON object, got {other}"
        ))),
    }
}

fn column_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
    )
}

fn row_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| column_error(idx, e))
}

fn row_uuid_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(s) => Uuid::parse_str(&s).map(Some).map_err(|e| column_error(idx, e)),
        None => Ok(None),
    }
}

fn row_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| column_error(idx, e))
}

fn row_ts_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| column_error(idx, e)),
        None => Ok(None),
    }
}

fn row_json(row: &Row<'_>, idx: usize) -> rusqlite::Result<JsonMap> {
    let raw: String = row.get(idx)?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(column_error(
            idx,
            std::io::Error::new(std::io::ErrorKind::InvalidData, "expected JSON object"),
        )),
        Err(e) => Err(column_error(idx, e)),
    }
}

// =============================================================================
// Machine
// =============================================================================

/// A provisionable host, keyed by lowercase MAC.
#[derive(Debug, Clone, Serialize)]
pub struct Machine {
    pub id: Uuid,
    pub mac: String,
    pub serial: String,
    pub profile: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Machine {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row_uuid(row, 0)?,
            mac: row.get(1)?,
            serial: row.get(2)?,
            profile: row_json(row, 3)?,
            created_at: row_ts(row, 4)?,
            updated_at: row_ts(row, 5)?,
        })
    }

    const COLUMNS: &'static str = "id, mac, serial, profile, created_at, updated_at";

    /// Insert or update on the MAC natural key; returns the stored row.
    pub fn upsert(
        conn: &Connection,
        mac: &str,
        serial: &str,
        profile: &JsonMap,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mac = normalize_mac(mac);
        conn.execute(
            "INSERT INTO machines (id, mac, serial, profile, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(mac) DO UPDATE SET
                 serial = excluded.serial,
                 profile = excluded.profile,
                 updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                mac,
                serial,
                json_text(profile),
                format_ts(now),
            ],
        )?;

        Self::find_by_mac(conn, &mac)?
            .ok_or_else(|| Error::NotFound(format!("machine with mac {mac}")))
    }

    pub fn find_by_mac(conn: &Connection, mac: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM machines WHERE mac = ?1",
            Self::COLUMNS
        ))?;
        Ok(stmt
            .query_row([normalize_mac(mac)], Self::from_row)
            .optional()?)
    }

    pub fn find_by_id(conn: &Connection, id: Uuid) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM machines WHERE id = ?1",
            Self::COLUMNS
        ))?;
        Ok(stmt
            .query_row([id.to_string()], Self::from_row)
            .optional()?)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM machines ORDER BY created_at DESC",
            Self::COLUMNS
        ))?;
        let machines = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(machines)
    }
}

// =============================================================================
// Blueprint
// =============================================================================

/// A declarative provisioning profile (name, OS, version, free-form data).
#[derive(Debug, Clone, Serialize)]
pub struct Blueprint {
    pub id: Uuid,
    pub name: String,
    pub os: String,
    pub version: String,
    pub data: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Blueprint {
    const COLUMNS: &'static str = "id, name, os, version, data, created_at, updated_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row_uuid(row, 0)?,
            name: row.get(1)?,
            os: row.get(2)?,
            version: row.get(3)?,
            data: row_json(row, 4)?,
            created_at: row_ts(row, 5)?,
            updated_at: row_ts(row, 6)?,
        })
    }

    pub fn create(
        conn: &Connection,
        name: &str,
        os: &str,
        version: &str,
        data: &JsonMap,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO blueprints (id, name, os, version, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id.to_string(), name, os, version, json_text(data), format_ts(now)],
        )?;
        Self::find_by_id(conn, id)?.ok_or_else(|| Error::NotFound(format!("blueprint {id}")))
    }

    /// Overwrite all mutable fields and bump `updated_at`.
    pub fn update(
        conn: &Connection,
        id: Uuid,
        name: &str,
        os: &str,
        version: &str,
        data: &JsonMap,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>> {
        let changed = conn.execute(
            "UPDATE blueprints SET name = ?2, os = ?3, version = ?4, data = ?5, updated_at = ?6
             WHERE id = ?1",
            params![id.to_string(), name, os, version, json_text(data), format_ts(now)],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Self::find_by_id(conn, id)
    }

    pub fn delete(conn: &Connection, id: Uuid) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM blueprints WHERE id = ?1", [id.to_string()])?;
        Ok(deleted > 0)
    }

    pub fn find_by_id(conn: &Connection, id: Uuid) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM blueprints WHERE id = ?1",
            Self::COLUMNS
        ))?;
        Ok(stmt
            .query_row([id.to_string()], Self::from_row)
            .optional()?)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM blueprints ORDER BY name ASC",
            Self::COLUMNS
        ))?;
        let blueprints = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(blueprints)
    }
}

// =============================================================================
// Run
// =============================================================================

/// One provisioning execution bound to a machine and optionally a blueprint.
///
/// Terminal runs are immutable; for any machine at most one run has
/// status `running` (enforced by a partial unique index).
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub machine_id: Option<Uuid>,
    pub blueprint_id: Option<Uuid>,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub logs: String,
}

impl Run {
    const COLUMNS: &'static str =
        "id, machine_id, blueprint_id, status, started_at, finished_at, logs";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row_uuid(row, 0)?,
            machine_id: row_uuid_opt(row, 1)?,
            blueprint_id: row_uuid_opt(row, 2)?,
            status: row.get(3)?,
            started_at: row_ts_opt(row, 4)?,
            finished_at: row_ts_opt(row, 5)?,
            logs: row.get(6)?,
        })
    }

    /// Insert a new running run.
    pub fn start(
        conn: &Connection,
        machine_id: Uuid,
        blueprint_id: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO runs (id, machine_id, blueprint_id, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                machine_id.to_string(),
                blueprint_id.map(|b| b.to_string()),
                RUN_STATUS_RUNNING,
                format_ts(started_at),
            ],
        )?;
        Self::find_by_id(conn, id)?.ok_or_else(|| Error::NotFound(format!("run {id}")))
    }

    /// Transition a run to a terminal status, scoped by id.
    ///
    /// `logs` of `None` leaves the stored logs untouched. Returns the updated
    /// row, or `None` when no such run exists.
    pub fn finish(
        conn: &Connection,
        id: Uuid,
        status: &str,
        logs: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<Option<Self>> {
        let changed = match logs {
            Some(logs) => conn.execute(
                "UPDATE runs SET status = ?2, logs = ?3, finished_at = ?4 WHERE id = ?1",
                params![id.to_string(), status, logs, format_ts(finished_at)],
            )?,
            None => conn.execute(
                "UPDATE runs SET status = ?2, finished_at = ?3 WHERE id = ?1",
                params![id.to_string(), status, format_ts(finished_at)],
            )?,
        };
        if changed == 0 {
            return Ok(None);
        }
        Self::find_by_id(conn, id)
    }

    pub fn find_by_id(conn: &Connection, id: Uuid) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM runs WHERE id = ?1", Self::COLUMNS))?;
        Ok(stmt
            .query_row([id.to_string()], Self::from_row)
            .optional()?)
    }

    /// Newest running run for a machine, if any.
    pub fn find_running_for_machine(conn: &Connection, machine_id: Uuid) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE machine_id = ?1 AND status = ?2
             ORDER BY started_at DESC LIMIT 1",
            Self::COLUMNS
        ))?;
        Ok(stmt
            .query_row(params![machine_id.to_string(), RUN_STATUS_RUNNING], Self::from_row)
            .optional()?)
    }

    pub fn recent_for_machine(conn: &Connection, machine_id: Uuid, limit: usize) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE machine_id = ?1
             ORDER BY started_at DESC LIMIT ?2",
            Self::COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![machine_id.to_string(), limit as i64], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

// =============================================================================
// Fact
// =============================================================================

/// One agent fact snapshot. Append-only; the newest row per machine defines
/// the current snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Fact {
    pub id: Uuid,
    pub machine_id: Uuid,
    pub snapshot: JsonMap,
    pub created_at: DateTime<Utc>,
}

impl Fact {
    const COLUMNS: &'static str = "id, machine_id, snapshot, created_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row_uuid(row, 0)?,
            machine_id: row_uuid(row, 1)?,
            snapshot: row_json(row, 2)?,
            created_at: row_ts(row, 3)?,
        })
    }

    /// Insert, doing nothing on a primary-key conflict.
    ///
    /// Returns `true` when the row was inserted, `false` for a duplicate id
    /// (the idempotency contract for redelivered fact events).
    pub fn insert_if_absent(&self, conn: &Connection) -> Result<bool> {
        let inserted = conn.execute(
            "INSERT INTO facts (id, machine_id, snapshot, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
            params![
                self.id.to_string(),
                self.machine_id.to_string(),
                json_text(&self.snapshot),
                format_ts(self.created_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Newest fact for a machine excluding the given id; the previous
    /// snapshot a diff is computed against.
    pub fn latest_for_machine_excluding(
        conn: &Connection,
        machine_id: Uuid,
        exclude: Uuid,
    ) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM facts WHERE machine_id = ?1 AND id <> ?2
             ORDER BY created_at DESC LIMIT 1",
            Self::COLUMNS
        ))?;
        Ok(stmt
            .query_row(
                params![machine_id.to_string(), exclude.to_string()],
                Self::from_row,
            )
            .optional()?)
    }

    pub fn latest_for_machine(conn: &Connection, machine_id: Uuid) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM facts WHERE machine_id = ?1
             ORDER BY created_at DESC LIMIT 1",
            Self::COLUMNS
        ))?;
        Ok(stmt
            .query_row([machine_id.to_string()], Self::from_row)
            .optional()?)
    }
}

// =============================================================================
// Artifact
// =============================================================================

/// A registered artifact: kind, canonical content hash, storage locator.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub id: Uuid,
    pub kind: String,
    pub sha256: String,
    pub url: String,
    pub meta: JsonMap,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    const COLUMNS: &'static str = "id, kind, sha256, url, meta, created_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row_uuid(row, 0)?,
            kind: row.get(1)?,
            sha256: row.get(2)?,
            url: row.get(3)?,
            meta: row_json(row, 4)?,
            created_at: row_ts(row, 5)?,
        })
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO artifacts (id, kind, sha256, url, meta, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.id.to_string(),
                self.kind,
                self.sha256.to_lowercase(),
                self.url,
                json_text(&self.meta),
                format_ts(self.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(conn: &Connection, id: Uuid) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM artifacts WHERE id = ?1",
            Self::COLUMNS
        ))?;
        Ok(stmt
            .query_row([id.to_string()], Self::from_row)
            .optional()?)
    }
}

// =============================================================================
// Audit
// =============================================================================

/// Append-only audit log entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub obj: String,
    pub details: JsonMap,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            actor: row.get(1)?,
            action: row.get(2)?,
            obj: row.get(3)?,
            details: row_json(row, 4)?,
            at: row_ts(row, 5)?,
        })
    }

    pub fn append(
        conn: &Connection,
        actor: &str,
        action: &str,
        obj: &str,
        details: &JsonMap,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO audit (actor, action, obj, details, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![actor, action, obj, json_text(details), format_ts(at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_for_obj(conn: &Connection, obj: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, actor, action, obj, details, at FROM audit
             WHERE obj = ?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map([obj], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
