//! At-least-once work queue with delayed delivery.
//!
//! Messages carry `{job_id, kind}` and a deterministic external id, so
//! enqueueing the same work twice while a message is still queued yields a
//! single delivery. The queue rides the relational store: ready rows are
//! claimed with `FOR UPDATE SKIP LOCKED`, and a visibility window makes a
//! crashed worker's claim reappear.
//!
//! ```text
//! enqueue ──► queue_messages ──► claim (SKIP LOCKED) ──► Consumer::deliver
//!                  ▲                                          │
//!                  │         Done → delete                    │
//!                  └── Bounce(until) / Fail(backoff) ◄────────┘
//! ```
//!
//! `Bounce` re-delivers at a chosen time without consuming an attempt; it is
//! how tenant-lock contention is parked without occupying a worker slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, info, warn};

use crate::common::gid::sanitize_for_queue;

/// Which pipeline the message drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_kind", rename_all = "snake_case")]
pub enum MessageKind {
    Generate,
    Publish,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Generate => "generate",
            MessageKind::Publish => "publish",
        }
    }
}

/// Deterministic broker id: `<kind>-<job id with colons stripped>`.
pub fn external_id(kind: MessageKind, job_id: &str) -> String {
    format!("{}-{}", kind.as_str(), sanitize_for_queue(job_id))
}

/// A delivered message.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub job_id: String,
    pub kind: MessageKind,
    /// Failure attempts consumed so far (bounces do not count).
    pub attempt: i32,
}

/// What the consumer wants done with the message.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Work finished (or is permanently moot): remove the message.
    Done,
    /// Re-deliver at `until` without consuming an attempt.
    Bounce(DateTime<Utc>),
    /// Attempt failed; retry with backoff until attempts are exhausted.
    Fail(String),
}

/// Message consumer, one call per delivery.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn deliver(&self, message: &QueueMessage) -> Delivery;
}

/// Producer-side queue operations.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue for immediate delivery. Returns false when a message with the
    /// same external id is already queued.
    async fn enqueue(&self, job_id: &str, kind: MessageKind) -> Result<bool>;

    /// Best-effort removal by external id. Silent when the message is
    /// currently claimed or already gone.
    async fn remove(&self, job_id: &str, kind: MessageKind) -> Result<()>;
}

/// Queue policy. Defaults follow the broker contract: three attempts,
/// exponential backoff from two seconds.
#[derive(Debug, Clone)]
pub struct BrokerPolicy {
    pub max_attempts: i32,
    pub backoff_base: Duration,
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// How long a claim stays invisible before a crashed worker's message
    /// reappears.
    pub visibility: Duration,
}

impl Default for BrokerPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            batch_size: 5,
            visibility: Duration::from_secs(600),
        }
    }
}

impl BrokerPolicy {
    /// Retry delay after `attempts` consumed failures: `base * 2^(attempts-1)`.
    pub fn retry_delay(&self, attempts: i32) -> Duration {
        let exponent = (attempts - 1).clamp(0, 10) as u32;
        self.backoff_base.saturating_mul(2u32.pow(exponent))
    }
}

#[derive(FromRow)]
struct ClaimedRow {
    id: i64,
    job_id: String,
    kind: MessageKind,
    attempts: i32,
}

/// Postgres-backed broker.
pub struct PgBroker {
    pool: PgPool,
    policy: BrokerPolicy,
}

impl PgBroker {
    pub fn new(pool: PgPool, policy: BrokerPolicy) -> Self {
        Self { pool, policy }
    }

    async fn claim(&self) -> Result<Vec<ClaimedRow>> {
        let rows = sqlx::query_as::<_, ClaimedRow>(
            r#"
            WITH ready AS (
                SELECT id FROM queue_messages
                WHERE available_at <= NOW() AND claimed_at IS NULL
                ORDER BY available_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_messages
            SET claimed_at = NOW(),
                available_at = NOW() + ($2 || ' milliseconds')::INTERVAL
            WHERE id IN (SELECT id FROM ready)
            RETURNING id, job_id, kind, attempts
            "#,
        )
        .bind(self.policy.batch_size)
        .bind((self.policy.visibility.as_millis() as i64).to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn settle(&self, row: &ClaimedRow, outcome: Delivery) -> Result<()> {
        match outcome {
            Delivery::Done => {
                sqlx::query("DELETE FROM queue_messages WHERE id = $1")
                    .bind(row.id)
                    .execute(&self.pool)
                    .await?;
            }
            Delivery::Bounce(until) => {
                sqlx::query(
                    "UPDATE queue_messages SET available_at = $2, claimed_at = NULL \
                     WHERE id = $1",
                )
                .bind(row.id)
                .bind(until)
                .execute(&self.pool)
                .await?;
            }
            Delivery::Fail(reason) => {
                let attempts = row.attempts + 1;
                if attempts >= self.policy.max_attempts {
                    warn!(
                        job_id = %row.job_id,
                        kind = row.kind.as_str(),
                        attempts,
                        reason = %reason,
                        "message exhausted its attempts, removing"
                    );
                    sqlx::query("DELETE FROM queue_messages WHERE id = $1")
                        .bind(row.id)
                        .execute(&self.pool)
                        .await?;
                } else {
                    let delay = self.policy.retry_delay(attempts);
                    debug!(
                        job_id = %row.job_id,
                        kind = row.kind.as_str(),
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "message failed, scheduling retry"
                    );
                    sqlx::query(
                        r#"
                        UPDATE queue_messages
                        SET attempts = $2, claimed_at = NULL,
                            available_at = NOW() + ($3 || ' milliseconds')::INTERVAL
                        WHERE id = $1
                        "#,
                    )
                    .bind(row.id)
                    .bind(attempts)
                    .bind((delay.as_millis() as i64).to_string())
                    .execute(&self.pool)
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Consume until shutdown. Each claimed message becomes its own task.
    pub async fn run(&self, consumer: Arc<dyn Consumer>, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(batch_size = self.policy.batch_size, "broker consume loop starting");

        while !shutdown.load(Ordering::SeqCst) {
            let claimed = match self.claim().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(error = %e, "failed to claim messages");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if claimed.is_empty() {
                tokio::time::sleep(self.policy.poll_interval).await;
                continue;
            }

            let handled = claimed.iter().map(|row| {
                let consumer = consumer.clone();
                async move {
                    let message = QueueMessage {
                        job_id: row.job_id.clone(),
                        kind: row.kind,
                        attempt: row.attempts,
                    };
                    let outcome = consumer.deliver(&message).await;
                    if let Err(e) = self.settle(row, outcome).await {
                        error!(job_id = %row.job_id, error = %e, "failed to settle message");
                    }
                }
            });
            futures::future::join_all(handled).await;
        }

        info!("broker consume loop stopped");
        Ok(())
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn enqueue(&self, job_id: &str, kind: MessageKind) -> Result<bool> {
        let created = sqlx::query(
            r#"
            INSERT INTO queue_messages (external_id, job_id, kind)
            VALUES ($1, $2, $3)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(external_id(kind, job_id))
        .bind(job_id)
        .bind(kind)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(created > 0)
    }

    async fn remove(&self, job_id: &str, kind: MessageKind) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE external_id = $1 AND claimed_at IS NULL")
            .bind(external_id(kind, job_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory broker for tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemMessage {
    external_id: String,
    job_id: String,
    kind: MessageKind,
    attempts: i32,
    available_at: DateTime<Utc>,
}

/// In-memory [`Broker`] whose delivery is driven manually via
/// [`MemoryBroker::pump`].
#[derive(Default)]
pub struct MemoryBroker {
    policy: BrokerPolicy,
    messages: std::sync::Mutex<Vec<MemMessage>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: BrokerPolicy) -> Self {
        Self {
            policy,
            messages: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Whether a message for `(job_id, kind)` is queued (ready or delayed).
    pub fn contains(&self, job_id: &str, kind: MessageKind) -> bool {
        let wanted = external_id(kind, job_id);
        self.messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.external_id == wanted)
    }

    /// Earliest delivery time for `(job_id, kind)`, if queued.
    pub fn available_at(&self, job_id: &str, kind: MessageKind) -> Option<DateTime<Utc>> {
        let wanted = external_id(kind, job_id);
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.external_id == wanted)
            .map(|m| m.available_at)
    }

    /// Deliver every message whose `available_at` has passed, applying each
    /// outcome. Returns how many messages were delivered.
    pub async fn pump(&self, consumer: &dyn Consumer) -> usize {
        let now = Utc::now();
        let ready: Vec<MemMessage> = {
            let mut messages = self.messages.lock().unwrap();
            let (ready, rest): (Vec<_>, Vec<_>) =
                messages.drain(..).partition(|m| m.available_at <= now);
            *messages = rest;
            ready
        };

        let delivered = ready.len();
        for mut message in ready {
            let outcome = consumer
                .deliver(&QueueMessage {
                    job_id: message.job_id.clone(),
                    kind: message.kind,
                    attempt: message.attempts,
                })
                .await;
            match outcome {
                Delivery::Done => {}
                Delivery::Bounce(until) => {
                    message.available_at = until;
                    self.messages.lock().unwrap().push(message);
                }
                Delivery::Fail(_) => {
                    message.attempts += 1;
                    if message.attempts < self.policy.max_attempts {
                        message.available_at = now
                            + chrono::Duration::from_std(
                                self.policy.retry_delay(message.attempts),
                            )
                            .unwrap();
                        self.messages.lock().unwrap().push(message);
                    }
                }
            }
        }
        delivered
    }

    /// Deliver ready messages repeatedly until the queue drains or only
    /// delayed messages remain, fast-forwarding over delays.
    pub async fn pump_until_idle(&self, consumer: &dyn Consumer) -> usize {
        let mut total = 0;
        loop {
            // Fast-forward delays so tests do not wait on wall-clock time.
            {
                let now = Utc::now();
                let mut messages = self.messages.lock().unwrap();
                for m in messages.iter_mut() {
                    if m.available_at > now {
                        m.available_at = now;
                    }
                }
            }
            let delivered = self.pump(consumer).await;
            if delivered == 0 {
                return total;
            }
            total += delivered;
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, job_id: &str, kind: MessageKind) -> Result<bool> {
        let wanted = external_id(kind, job_id);
        let mut messages = self.messages.lock().unwrap();
        if messages.iter().any(|m| m.external_id == wanted) {
            return Ok(false);
        }
        messages.push(MemMessage {
            external_id: wanted,
            job_id: job_id.to_string(),
            kind,
            attempts: 0,
            available_at: Utc::now(),
        });
        Ok(true)
    }

    async fn remove(&self, job_id: &str, kind: MessageKind) -> Result<()> {
        let wanted = external_id(kind, job_id);
        self.messages
            .lock()
            .unwrap()
            .retain(|m| m.external_id != wanted);
        Ok(())
    }
}
