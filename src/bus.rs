// src/bus.rs

//! Durable message bus over the shared store.
//!
//! Subjects are append-only logs in `bus_messages`; each durable consumer
//! tracks its position in `bus_consumers`, so progress survives restarts and
//! a re-subscribed durable name resumes where it left off. Delivery is
//! at-least-once and in order per subject: handler success acks (advances the
//! cursor), handler failure naks (the same message is redelivered after a
//! short delay). The bus is the only channel between API producers and
//! workers.

use crate::db::models::format_ts;
use crate::db::Db;
use crate::error::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const SUBJECT_MACHINES_ENROLLED: &str = "machines.enrolled";
pub const SUBJECT_AGENT_FACTS: &str = "agent.facts";
pub const SUBJECT_RUNS_STARTED: &str = "runs.started";
pub const SUBJECT_RUNS_FINISHED: &str = "runs.finished";
pub const SUBJECT_BLUEPRINTS_UPDATED: &str = "blueprints.updated";

/// Delay before a nak'd message is redelivered.
const REDELIVERY_DELAY: Duration = Duration::from_millis(500);

/// Fallback poll interval for publishes this process did not observe.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Handle to the bus. Clones share the underlying store and wakeup signal.
#[derive(Clone)]
pub struct Bus {
    db: Db,
    notify: Arc<Notify>,
}

impl Bus {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append a JSON payload to the subject log and wake local consumers.
    pub async fn publish(&self, subject: &str, payload: &Value) -> Result<()> {
        let subject = subject.to_string();
        let body = payload.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO bus_messages (subject, payload, published_at)
                     VALUES (?1, ?2, ?3)",
                    params![subject, body, format_ts(Utc::now())],
                )?;
                Ok(())
            })
            .await?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Subscribe a durable consumer to a subject.
    ///
    /// `handler` runs serially, one message at a time, in publish order.
    /// Returning `Ok` acks the message; returning `Err` naks it and the same
    /// message is redelivered after [`REDELIVERY_DELAY`]. The returned handle
    /// stops delivery and drains the in-flight handler on
    /// [`SubscriptionHandle::close`].
    pub async fn subscribe<F, Fut>(
        &self,
        subject: &str,
        durable: &str,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let subject = subject.to_string();
        let durable = durable.to_string();

        {
            let (subject, durable) = (subject.clone(), durable.clone());
            self.db
                .call(move |conn| {
                    conn.execute(
                        "INSERT OR IGNORE INTO bus_consumers (durable, subject, next_seq)
                         VALUES (?1, ?2, 1)",
                        params![durable, subject],
                    )?;
                    Ok(())
                })
                .await?;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let bus = self.clone();
        let handler: Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync> =
            Arc::new(move |data| Box::pin(handler(data)) as HandlerFuture);

        let task = tokio::spawn(consume_loop(
            bus,
            subject.clone(),
            durable.clone(),
            handler,
            stop_rx,
        ));

        debug!(subject = %subject, durable = %durable, "subscribed durable consumer");

        Ok(SubscriptionHandle {
            subject,
            durable,
            stop: stop_tx,
            task: Some(task),
        })
    }

    async fn next_pending(&self, subject: &str, durable: &str) -> Result<Option<(i64, Vec<u8>)>> {
        let subject = subject.to_string();
        let durable = durable.to_string();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT m.seq, m.payload
                         FROM bus_messages m
                         JOIN bus_consumers c ON c.subject = m.subject
                         WHERE c.durable = ?1 AND m.subject = ?2 AND m.seq >= c.next_seq
                         ORDER BY m.seq ASC LIMIT 1",
                        params![durable, subject],
                        |row| {
                            let seq: i64 = row.get(0)?;
                            let payload: String = row.get(1)?;
                            Ok((seq, payload.into_bytes()))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await
    }

    async fn ack(&self, subject: &str, durable: &str, seq: i64) -> Result<()> {
        let subject = subject.to_string();
        let durable = durable.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE bus_consumers SET next_seq = ?3
                     WHERE durable = ?1 AND subject = ?2 AND next_seq <= ?3",
                    params![durable, subject, seq + 1],
                )?;
                Ok(())
            })
            .await
    }
}

async fn consume_loop(
    bus: Bus,
    subject: String,
    durable: String,
    handler: Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        match bus.next_pending(&subject, &durable).await {
            Ok(Some((seq, payload))) => {
                match handler(payload).await {
                    Ok(()) => {
                        if let Err(e) = bus.ack(&subject, &durable, seq).await {
                            warn!(subject = %subject, durable = %durable, seq, error = %e,
                                "failed to ack message");
                        }
                    }
                    Err(e) => {
                        warn!(subject = %subject, durable = %durable, seq, error = %e,
                            "handler failed, message will be redelivered");
                        tokio::select! {
                            _ = stop.changed() => {}
                            _ = tokio::time::sleep(REDELIVERY_DELAY) => {}
                        }
                    }
                }
            }
            Ok(None) => {
                let notified = bus.notify.notified();
                tokio::select! {
                    _ = stop.changed() => {}
                    _ = notified => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
            Err(e) => {
                warn!(subject = %subject, durable = %durable, error = %e,
                    "failed to fetch pending messages");
                tokio::select! {
                    _ = stop.changed() => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        }
    }
    debug!(subject = %subject, durable = %durable, "consumer drained");
}

/// Closer for an active subscription.
pub struct SubscriptionHandle {
    subject: String,
    durable: String,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Stop delivery and wait for the in-flight handler to finish.
    pub async fn close(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!(subject = %self.subject, durable = %self.durable,
                    "subscription did not drain in time");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
