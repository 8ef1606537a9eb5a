// src/watcher.rs

//! Blueprint tree watcher.
//!
//! Polls `<root>/blueprints` and `<root>/workflows` on a fixed interval,
//! detects content changes by deep equality, and publishes a versioned
//! `blueprints.updated` event whenever the tree changes (and once on the
//! first cycle). Missing directories are an empty tree, not an error. The
//! in-memory snapshot is swapped atomically behind a reader/writer lock.

use crate::bus::{Bus, SUBJECT_BLUEPRINTS_UPDATED};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

const ENV_INFRA_PATH: &str = "FOUNDRY_INFRA_PATH";
const DEFAULT_INFRA_PATH: &str = "./infra";
const BLUEPRINTS_DIR: &str = "blueprints";
const WORKFLOWS_DIR: &str = "workflows";

/// Default polling interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// In-memory view of the blueprint and workflow trees.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Fresh UUID on every content change.
    pub version: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub blueprints: HashMap<String, String>,
    pub workflows: HashMap<String, String>,
}

/// Watches the on-disk blueprint tree and publishes versioned updates.
pub struct Watcher {
    bus: Bus,
    infra_path: PathBuf,
    interval: Duration,
    snapshot: Arc<RwLock<Snapshot>>,
}

impl Watcher {
    /// `infra_path` falls back to `FOUNDRY_INFRA_PATH`, then `./infra`;
    /// a zero interval falls back to [`DEFAULT_INTERVAL`].
    pub fn new(bus: Bus, infra_path: Option<PathBuf>, interval: Option<Duration>) -> Self {
        let infra_path = infra_path
            .or_else(|| std::env::var(ENV_INFRA_PATH).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INFRA_PATH));
        let interval = match interval {
            Some(i) if !i.is_zero() => i,
            _ => DEFAULT_INTERVAL,
        };
        Self {
            bus,
            infra_path,
            interval,
            snapshot: Arc::new(RwLock::new(Snapshot::default())),
        }
    }

    /// Latest published snapshot.
    pub async fn snapshot(&self) -> Snapshot {
        self.snapshot.read().await.clone()
    }

    /// Poll until `shutdown` flips. The first cycle always publishes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(path = %self.infra_path.display(), interval = ?self.interval, "watching blueprint tree");
        self.sync(true).await?;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = ticker.tick() => {
                    self.sync(false).await?;
                }
            }
        }
    }

    /// One polling cycle. Returns whether an update event was published.
    pub async fn sync(&self, force: bool) -> Result<bool> {
        let root = self.infra_path.clone();
        let (blueprints, workflows) = tokio::task::spawn_blocking(move || {
            let blueprints = read_files(&root.join(BLUEPRINTS_DIR))?;
            let workflows = read_files(&root.join(WORKFLOWS_DIR))?;
            Ok::<_, Error>((blueprints, workflows))
        })
        .await
        .map_err(|e| Error::Dependency(format!("blueprint scan failed: {e}")))??;

        let current = {
            let mut guard = self.snapshot.write().await;
            let changed = guard.version.is_empty()
                || guard.blueprints != blueprints
                || guard.workflows != workflows;
            if changed {
                *guard = Snapshot {
                    version: Uuid::new_v4().to_string(),
                    updated_at: Some(Utc::now()),
                    blueprints,
                    workflows,
                };
            }
            if !changed && !force {
                return Ok(false);
            }
            guard.clone()
        };

        debug!(
            version = %current.version,
            blueprints = current.blueprints.len(),
            workflows = current.workflows.len(),
            "publishing blueprint snapshot"
        );

        self.bus
            .publish(
                SUBJECT_BLUEPRINTS_UPDATED,
                &json!({
                    "version": current.version,
                    "updated_at": current.updated_at,
                    "blueprints_count": current.blueprints.len(),
                    "workflows_count": current.workflows.len(),
                }),
            )
            .await?;
        Ok(true)
    }
}

/// Recursively read a directory into `relative slash path -> contents`.
/// A missing directory reads as empty.
fn read_files(root: &Path) -> Result<HashMap<String, String>> {
    let mut result = HashMap::new();

    match std::fs::metadata(root) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
        Err(e) => return Err(e.into()),
        Ok(meta) if !meta.is_dir() => {
            return Err(Error::Validation(format!(
                "{} is not a directory",
                root.display()
            )))
        }
        Ok(_) => {}
    }

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Validation(format!("relative path: {e}")))?;
        let contents = std::fs::read_to_string(entry.path())?;
        result.insert(slash_path_of(rel), contents);
    }

    Ok(result)
}

fn slash_path_of(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    async fn published_count(db: &Db) -> i64 {
        db.call(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM bus_messages WHERE subject = 'blueprints.updated'",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn missing_directories_publish_an_empty_snapshot_once() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let watcher = Watcher::new(
            Bus::new(db.clone()),
            Some(dir.path().join("does-not-exist")),
            None,
        );

        assert!(watcher.sync(true).await.unwrap());
        let snapshot = watcher.snapshot().await;
        assert!(!snapshot.version.is_empty());
        assert!(snapshot.blueprints.is_empty());
        assert!(snapshot.workflows.is_empty());
        assert_eq!(published_count(&db).await, 1);

        // Nothing changed, nothing published
        assert!(!watcher.sync(false).await.unwrap());
        assert_eq!(published_count(&db).await, 1);
    }

    #[tokio::test]
    async fn content_change_bumps_the_version() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("blueprints/os")).unwrap();
        std::fs::write(dir.path().join("blueprints/os/rhel9.yaml"), "os: rhel9\n").unwrap();

        let watcher = Watcher::new(Bus::new(db.clone()), Some(dir.path().to_path_buf()), None);

        watcher.sync(true).await.unwrap();
        let first = watcher.snapshot().await;
        assert_eq!(first.blueprints.len(), 1);
        assert!(first.blueprints.contains_key("os/rhel9.yaml"));

        // Unchanged content keeps the version stable
        watcher.sync(false).await.unwrap();
        assert_eq!(watcher.snapshot().await.version, first.version);

        std::fs::write(dir.path().join("blueprints/os/rhel9.yaml"), "os: rhel9\nrev: 2\n").unwrap();
        assert!(watcher.sync(false).await.unwrap());

        let second = watcher.snapshot().await;
        assert_ne!(second.version, first.version);
        assert_eq!(published_count(&db).await, 2);
    }

    #[tokio::test]
    async fn workflows_are_tracked_independently() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("workflows")).unwrap();
        std::fs::write(dir.path().join("workflows/install.yaml"), "steps: []\n").unwrap();

        let watcher = Watcher::new(Bus::new(db.clone()), Some(dir.path().to_path_buf()), None);
        watcher.sync(true).await.unwrap();

        let snapshot = watcher.snapshot().await;
        assert_eq!(snapshot.workflows.len(), 1);
        assert!(snapshot.blueprints.is_empty());
    }
}
