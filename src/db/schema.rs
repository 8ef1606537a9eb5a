// src/db/schema.rs

//! Schema DDL and revision upgrades.
//!
//! The store remembers which schema revision it carries in a one-row-per-
//! upgrade `schema_revision` table. `migrate` walks the upgrade steps
//! forward until the database matches this build; re-running it against an
//! up-to-date store changes nothing, and a store from a newer build is
//! refused rather than guessed at.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::info;

/// Newest schema revision this build produces.
pub const SCHEMA_VERSION: i32 = 1;

/// Upgrade steps in order; the step at index `i` produces revision `i + 1`.
const UPGRADES: [fn(&Connection) -> Result<()>; 1] = [migrate_v1];

/// Bring the database up to [`SCHEMA_VERSION`], applying any pending
/// upgrade steps in order.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_revision (
            revision INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let mut current = applied_revision(conn)?;
    if current > SCHEMA_VERSION {
        return Err(Error::Integrity(format!(
            "database schema revision {current} is newer than this build supports ({SCHEMA_VERSION})"
        )));
    }

    while current < SCHEMA_VERSION {
        let next = current + 1;
        let upgrade = UPGRADES.get((next - 1) as usize).ok_or_else(|| {
            Error::Integrity(format!("no upgrade step produces schema revision {next}"))
        })?;
        upgrade(conn)?;
        conn.execute("INSERT INTO schema_revision (revision) VALUES (?1)", [next])?;
        info!("schema upgraded to revision {}", next);
        current = next;
    }

    Ok(())
}

/// Highest revision recorded in the store; 0 for a fresh database.
pub fn applied_revision(conn: &Connection) -> Result<i32> {
    let revision: Option<i32> =
        conn.query_row("SELECT MAX(revision) FROM schema_revision", [], |row| {
            row.get(0)
        })?;
    Ok(revision.unwrap_or(0))
}

/// Revision 1: the full control-plane schema.
///
/// - machines: provisionable hosts keyed by lowercase MAC
/// - blueprints: declarative provisioning profiles
/// - runs: provisioning executions (at most one running per machine)
/// - facts: append-only agent fact snapshots
/// - artifacts: content-addressed artifact registrations
/// - tokens: MAC-scoped one-shot boot/agent tokens
/// - audit: append-only audit log
/// - bus_messages / bus_consumers: durable message bus backing
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Machines: provisionable hosts, mac is the natural key
        CREATE TABLE machines (
            id TEXT PRIMARY KEY,
            mac TEXT NOT NULL UNIQUE,
            serial TEXT NOT NULL DEFAULT '',
            profile TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Blueprints: declarative OS/application profiles
        CREATE TABLE blueprints (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            os TEXT NOT NULL,
            version TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX idx_blueprints_name ON blueprints(name);

        -- Runs: provisioning executions
        CREATE TABLE runs (
            id TEXT PRIMARY KEY,
            machine_id TEXT REFERENCES machines(id) ON DELETE SET NULL,
            blueprint_id TEXT REFERENCES blueprints(id) ON DELETE SET NULL,
            status TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            logs TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX idx_runs_machine_id ON runs(machine_id);
        CREATE INDEX idx_runs_status ON runs(status);

        -- At most one running run per machine, enforced at the store
        CREATE UNIQUE INDEX idx_runs_one_running
            ON runs(machine_id) WHERE status = 'running';

        -- Facts: append-only agent snapshots, idempotent on id
        CREATE TABLE facts (
            id TEXT PRIMARY KEY,
            machine_id TEXT NOT NULL REFERENCES machines(id) ON DELETE CASCADE,
            snapshot TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_facts_machine_id ON facts(machine_id);
        CREATE INDEX idx_facts_created_at ON facts(created_at);

        -- Artifacts: content-addressed registrations
        CREATE TABLE artifacts (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            url TEXT NOT NULL,
            meta TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_artifacts_sha256 ON artifacts(sha256);

        -- Tokens: MAC-scoped one-shot boot/agent tokens
        CREATE TABLE tokens (
            id TEXT PRIMARY KEY,
            mac TEXT NOT NULL,
            token TEXT NOT NULL UNIQUE,
            expires_at TEXT NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX idx_tokens_mac ON tokens(mac);
        CREATE INDEX idx_tokens_expires_at ON tokens(expires_at);

        -- Audit: append-only audit log
        CREATE TABLE audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            obj TEXT NOT NULL DEFAULT '',
            details TEXT NOT NULL DEFAULT '{}',
            at TEXT NOT NULL
        );

        CREATE INDEX idx_audit_obj ON audit(obj);

        -- Bus: durable message log and per-durable consumer cursors
        CREATE TABLE bus_messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            subject TEXT NOT NULL,
            payload TEXT NOT NULL,
            published_at TEXT NOT NULL
        );

        CREATE INDEX idx_bus_messages_subject ON bus_messages(subject, seq);

        CREATE TABLE bus_consumers (
            durable TEXT NOT NULL,
            subject TEXT NOT NULL,
            next_seq INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (durable, subject)
        );
        ",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    #[test]
    fn migrate_from_scratch() {
        let conn = test_conn();
        migrate(&conn).unwrap();
        assert_eq!(applied_revision(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn migrate_twice_is_noop() {
        let conn = test_conn();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(applied_revision(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn refuses_a_store_from_a_newer_build() {
        let conn = test_conn();
        migrate(&conn).unwrap();
        conn.execute("INSERT INTO schema_revision (revision) VALUES (99)", [])
            .unwrap();

        let err = migrate(&conn).unwrap_err();
        assert!(matches!(err, Error::Integrity(msg) if msg.contains("newer than this build")));
    }

    #[test]
    fn single_running_run_per_machine() {
        let conn = test_conn();
        migrate(&conn).unwrap();

        conn.execute(
            "INSERT INTO machines (id, mac, serial, profile, created_at, updated_at)
             VALUES ('m1', 'aa:bb:cc:dd:ee:ff', '', '{}', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO runs (id, machine_id, status, started_at)
             VALUES ('r1', 'm1', 'running', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let second = conn.execute(
            "INSERT INTO runs (id, machine_id, status, started_at)
             VALUES ('r2', 'm1', 'running', '2026-01-01T00:00:01Z')",
            [],
        );
        assert!(second.is_err());

        // Terminal runs do not collide with the partial index
        conn.execute(
            "INSERT INTO runs (id, machine_id, status, started_at, finished_at)
             VALUES ('r3', 'm1', 'success', '2025-12-31T00:00:00Z', '2025-12-31T01:00:00Z')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn deleting_machine_cascades_facts_and_detaches_runs() {
        let conn = test_conn();
        migrate(&conn).unwrap();

        conn.execute(
            "INSERT INTO machines (id, mac, serial, profile, created_at, updated_at)
             VALUES ('m1', 'aa:bb:cc:dd:ee:ff', '', '{}', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO facts (id, machine_id, snapshot, created_at)
             VALUES ('f1', 'm1', '{}', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO runs (id, machine_id, status, started_at)
             VALUES ('r1', 'm1', 'running', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM machines WHERE id = 'm1'", []).unwrap();

        let facts: i64 = conn
            .query_row("SELECT COUNT(*) FROM facts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(facts, 0);

        let orphaned: Option<String> = conn
            .query_row("SELECT machine_id FROM runs WHERE id = 'r1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphaned, None);
    }
}
