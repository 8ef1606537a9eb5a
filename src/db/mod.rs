// src/db/mod.rs

//! SQLite-backed durable store shared by every control-plane component.
//!
//! All state lives here: machines, blueprints, runs, facts, artifacts,
//! boot tokens, the audit log, and the bus backing tables. Callers go
//! through [`Db`], which owns the connection and runs blocking SQLite work
//! on the blocking pool with a per-operation deadline.

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Deadline applied to every database operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the durable store.
///
/// Cheap to clone; clones share one WAL-mode connection. SQLite work runs on
/// the blocking pool and is abandoned (not blocked on) when the deadline
/// elapses, so async callers always get an answer within [`DEFAULT_TIMEOUT`].
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open an existing database without touching the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a database and bring its schema up to date.
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        let db = Self::open(path)?;
        {
            let conn = db.lock()?;
            schema::migrate(&conn)?;
        }
        Ok(db)
    }

    /// In-memory database with a fresh schema.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Dependency("database connection poisoned".to_string()))
    }

    /// Run a read or write against the store with the default deadline.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let task = tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::Dependency("database connection poisoned".to_string()))?;
            f(&guard)
        });

        match tokio::time::timeout(DEFAULT_TIMEOUT, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::Dependency(format!("database task failed: {join}"))),
            Err(_) => {
                debug!("database call exceeded {:?} deadline", DEFAULT_TIMEOUT);
                Err(Error::Timeout)
            }
        }
    }

    /// Run `f` inside a single IMMEDIATE transaction.
    ///
    /// The write lock is taken up front, so concurrent writers serialize at
    /// the store. Any error from `f` rolls the transaction back.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Dependency("database connection poisoned".to_string()))?;
            let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        });

        match tokio::time::timeout(DEFAULT_TIMEOUT, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::Dependency(format!("database task failed: {join}"))),
            Err(_) => Err(Error::Timeout),
        }
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(DEFAULT_TIMEOUT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_runs_against_schema() {
        let db = Db::open_in_memory().unwrap();
        let count: i64 = db
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM machines", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let db = Db::open_in_memory().unwrap();
        let result: Result<()> = db
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO audit (actor, action, obj, details, at) VALUES ('t', 'a', 'o', '{}', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Err(Error::Validation("boom".to_string()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = db
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM audit", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        Db::init(&path).unwrap();
        Db::init(&path).unwrap();
    }
}
