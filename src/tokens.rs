// src/tokens.rs

//! MAC-scoped one-shot boot/agent tokens, durable and transactional.
//!
//! Tokens authenticate the window between PXE boot and agent enrollment, so
//! they are scoped to a MAC string rather than a machine id (boot happens
//! before the agent knows its machine id). A token is valid while unexpired;
//! `used` records that it has been dispensed to a client. Rotation is the
//! only operation that consumes a token: it invalidates the old value and
//! mints a replacement inside a single write transaction, so concurrent
//! rotations of the same value produce exactly one winner.

use crate::db::models::{format_ts, normalize_mac};
use crate::db::Db;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Default token lifetime.
pub fn default_ttl() -> Duration {
    Duration::minutes(5)
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A boot or agent authentication token.
#[derive(Debug, Clone)]
pub struct Token {
    pub id: Uuid,
    pub mac: String,
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Token> {
    let parse_uuid = |idx: usize, raw: String| {
        Uuid::parse_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })
    };
    let parse_time = |idx: usize, raw: String| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    Type::Text,
                    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
                )
            })
    };

    Ok(Token {
        id: parse_uuid(0, row.get(0)?)?,
        mac: row.get(1)?,
        value: row.get(2)?,
        expires_at: parse_time(3, row.get(3)?)?,
        used: row.get::<_, i64>(4)? != 0,
        created_at: parse_time(5, row.get(5)?)?,
    })
}

const TOKEN_COLUMNS: &str = "id, mac, token, expires_at, used, created_at";

/// Durable token store backed by the shared database.
#[derive(Clone)]
pub struct TokenStore {
    db: Db,
    ttl: Duration,
    now: Clock,
}

impl TokenStore {
    pub fn new(db: Db, ttl: Duration) -> Self {
        let ttl = if ttl <= Duration::zero() { default_ttl() } else { ttl };
        Self {
            db,
            ttl,
            now: Arc::new(Utc::now),
        }
    }

    /// Test constructor with an injected clock.
    pub fn with_clock(db: Db, ttl: Duration, now: Clock) -> Self {
        let ttl = if ttl <= Duration::zero() { default_ttl() } else { ttl };
        Self { db, ttl, now }
    }

    /// Mint a fresh token for a MAC.
    pub async fn issue(&self, mac: &str) -> Result<Token> {
        let mac = required_mac(mac)?;
        let now = (self.now)();
        let ttl = self.ttl;
        self.db
            .call(move |conn| {
                purge_expired_best_effort(conn, now);

                let token = Token {
                    id: Uuid::new_v4(),
                    mac,
                    value: Uuid::new_v4().to_string(),
                    expires_at: now + ttl,
                    used: false,
                    created_at: now,
                };
                insert_token(conn, &token)?;
                Ok(token)
            })
            .await
    }

    /// Newest unused, unexpired token for a MAC, if any.
    pub async fn active(&self, mac: &str) -> Result<Option<Token>> {
        let mac = required_mac(mac)?;
        let now = (self.now)();
        self.db
            .call(move |conn| {
                purge_expired_best_effort(conn, now);

                let mut stmt = conn.prepare(&format!(
                    "SELECT {TOKEN_COLUMNS} FROM tokens
                     WHERE mac = ?1 AND used = 0 AND expires_at > ?2
                     ORDER BY expires_at DESC LIMIT 1"
                ))?;
                Ok(stmt
                    .query_row(params![mac, format_ts(now)], token_from_row)
                    .optional()?)
            })
            .await
    }

    /// Newest unexpired token for a MAC regardless of `used`.
    ///
    /// The boot path re-serves a token it already dispensed, so a rebooting
    /// machine sees a stable value until expiry or rotation.
    pub async fn latest(&self, mac: &str) -> Result<Option<Token>> {
        let mac = required_mac(mac)?;
        let now = (self.now)();
        self.db
            .call(move |conn| {
                purge_expired_best_effort(conn, now);

                let mut stmt = conn.prepare(&format!(
                    "SELECT {TOKEN_COLUMNS} FROM tokens
                     WHERE mac = ?1 AND expires_at > ?2
                     ORDER BY expires_at DESC LIMIT 1"
                ))?;
                Ok(stmt
                    .query_row(params![mac, format_ts(now)], token_from_row)
                    .optional()?)
            })
            .await
    }

    /// Record that a token value was dispensed. Idempotent.
    pub async fn mark_used(&self, value: &str) -> Result<()> {
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(Error::Validation("token is required".to_string()));
        }
        let now = (self.now)();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE tokens SET used = 1, updated_at = ?2 WHERE token = ?1",
                    params![value, format_ts(now)],
                )?;
                if changed == 0 {
                    return Err(Error::NotFound("token".to_string()));
                }
                Ok(())
            })
            .await
    }

    /// Exchange an unexpired token for a fresh one.
    ///
    /// Runs in one write transaction: the old row is looked up by
    /// `(mac, value)`, invalidated (`used = 1`, expiry forced to now), and a
    /// replacement is inserted with a full TTL. A missing row yields
    /// `Unauthorized` ("invalid token"); an expired row yields `TokenExpired`.
    /// Two concurrent rotations with the same old value serialize at the
    /// store, and the loser observes the purged row as missing.
    pub async fn rotate(&self, mac: &str, old_value: &str) -> Result<Token> {
        let mac = required_mac(mac)?;
        let old_value = old_value.trim().to_string();
        if old_value.is_empty() {
            return Err(Error::Validation("old token is required".to_string()));
        }

        let cutoff = (self.now)();
        let now_fn = Arc::clone(&self.now);
        let ttl = self.ttl;

        self.db
            .transaction(move |tx| {
                purge_expired(tx, cutoff)?;

                let mut stmt = tx.prepare(&format!(
                    "SELECT {TOKEN_COLUMNS} FROM tokens WHERE mac = ?1 AND token = ?2"
                ))?;
                let current = stmt
                    .query_row(params![mac, old_value], token_from_row)
                    .optional()?;
                drop(stmt);

                let current = match current {
                    Some(token) => token,
                    None => return Err(Error::Unauthorized("invalid token".to_string())),
                };

                let now = now_fn();
                if current.expires_at <= now {
                    return Err(Error::TokenExpired);
                }

                tx.execute(
                    "UPDATE tokens SET used = 1, expires_at = ?2, updated_at = ?2
                     WHERE id = ?1",
                    params![current.id.to_string(), format_ts(now)],
                )?;

                let replacement = Token {
                    id: Uuid::new_v4(),
                    mac: current.mac.clone(),
                    value: Uuid::new_v4().to_string(),
                    expires_at: now + ttl,
                    used: false,
                    created_at: now,
                };
                insert_token(tx, &replacement)?;
                Ok(replacement)
            })
            .await
    }
}

fn required_mac(mac: &str) -> Result<String> {
    let mac = normalize_mac(mac);
    if mac.is_empty() {
        return Err(Error::Validation("mac is required".to_string()));
    }
    Ok(mac)
}

fn insert_token(conn: &Connection, token: &Token) -> Result<()> {
    conn.execute(
        "INSERT INTO tokens (id, mac, token, expires_at, used, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            token.id.to_string(),
            token.mac,
            token.value,
            format_ts(token.expires_at),
            token.used as i64,
            format_ts(token.created_at),
        ],
    )?;
    Ok(())
}

fn purge_expired(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM tokens WHERE expires_at <= ?1",
        [format_ts(cutoff)],
    )?)
}

/// Purge is a table-growth bound, not a correctness dependency; validity is
/// always re-checked at read time, so failures here are only logged.
fn purge_expired_best_effort(conn: &Connection, cutoff: DateTime<Utc>) {
    if let Err(e) = purge_expired(conn, cutoff) {
        warn!(error = %e, "failed to purge expired tokens");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn store(ttl: Duration) -> TokenStore {
        TokenStore::new(Db::open_in_memory().unwrap(), ttl)
    }

    /// Clock that can be advanced from the test body.
    fn adjustable_clock() -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let current = Arc::new(Mutex::new(Utc::now()));
        let handle = Arc::clone(&current);
        let clock: Clock = Arc::new(move || *current.lock().unwrap());
        (clock, handle)
    }

    #[tokio::test]
    async fn issue_then_active_round_trips() {
        let store = store(default_ttl());
        let issued = store.issue("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert_eq!(issued.mac, "aa:bb:cc:dd:ee:ff");
        assert!(!issued.used);

        let active = store.active("aa:bb:cc:dd:ee:ff").await.unwrap().unwrap();
        assert_eq!(active.value, issued.value);
    }

    #[tokio::test]
    async fn mark_used_hides_from_active_but_not_latest() {
        let store = store(default_ttl());
        let issued = store.issue("aa:bb:cc:dd:ee:01").await.unwrap();

        store.mark_used(&issued.value).await.unwrap();
        // Idempotent
        store.mark_used(&issued.value).await.unwrap();

        assert!(store.active("aa:bb:cc:dd:ee:01").await.unwrap().is_none());

        let latest = store.latest("aa:bb:cc:dd:ee:01").await.unwrap().unwrap();
        assert_eq!(latest.value, issued.value);
        assert!(latest.used);
    }

    #[tokio::test]
    async fn mark_used_unknown_value_reports_not_found() {
        let store = store(default_ttl());
        let err = store.mark_used("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn expired_tokens_never_authorize() {
        let (clock, handle) = adjustable_clock();
        let store = TokenStore::with_clock(
            Db::open_in_memory().unwrap(),
            Duration::minutes(5),
            clock,
        );

        let issued = store.issue("aa:bb:cc:dd:ee:02").await.unwrap();

        *handle.lock().unwrap() += Duration::minutes(6);

        assert!(store.active("aa:bb:cc:dd:ee:02").await.unwrap().is_none());
        assert!(store.latest("aa:bb:cc:dd:ee:02").await.unwrap().is_none());

        let err = store.rotate("aa:bb:cc:dd:ee:02", &issued.value).await.unwrap_err();
        // The purge already removed the expired row, so it reads as invalid.
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn rotate_replaces_and_invalidates() {
        let store = store(default_ttl());
        let t0 = store.issue("aa:bb:cc:dd:ee:03").await.unwrap();

        let t1 = store.rotate("aa:bb:cc:dd:ee:03", &t0.value).await.unwrap();
        assert_ne!(t1.value, t0.value);
        assert!(!t1.used);

        // A second rotation with the consumed value fails
        let err = store.rotate("aa:bb:cc:dd:ee:03", &t0.value).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        // The replacement is the active token now
        let active = store.active("aa:bb:cc:dd:ee:03").await.unwrap().unwrap();
        assert_eq!(active.value, t1.value);
    }

    #[tokio::test]
    async fn rotate_accepts_dispensed_unexpired_token() {
        let store = store(default_ttl());
        let t0 = store.issue("aa:bb:cc:dd:ee:04").await.unwrap();
        store.mark_used(&t0.value).await.unwrap();

        let t1 = store.rotate("aa:bb:cc:dd:ee:04", &t0.value).await.unwrap();
        assert_ne!(t1.value, t0.value);
    }

    #[tokio::test]
    async fn rotate_reports_expired_between_purge_and_check() {
        let (clock, handle) = adjustable_clock();
        let store = TokenStore::with_clock(
            Db::open_in_memory().unwrap(),
            Duration::minutes(5),
            Arc::clone(&clock),
        );

        let t0 = store.issue("aa:bb:cc:dd:ee:05").await.unwrap();

        // Advance the clock past expiry after the rotate cutoff was taken:
        // the purge keeps the row, the freshness check sees it expired.
        let db_clock_handle = handle;
        let expiry = t0.expires_at;
        let calls = Arc::new(Mutex::new(0usize));
        let stepping: Clock = {
            let calls = Arc::clone(&calls);
            Arc::new(move || {
                let mut n = calls.lock().unwrap();
                *n += 1;
                if *n == 1 {
                    // rotate entry: just before expiry
                    expiry - Duration::seconds(1)
                } else {
                    // freshness check: just past expiry
                    expiry + Duration::seconds(1)
                }
            })
        };
        let store = TokenStore::with_clock(store.db.clone(), Duration::minutes(5), stepping);
        let _ = db_clock_handle;

        let err = store.rotate("aa:bb:cc:dd:ee:05", &t0.value).await.unwrap_err();
        assert!(matches!(err, Error::TokenExpired));
    }
}
