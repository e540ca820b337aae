//! Free-tier monthly usage accounting.
//!
//! A reservation debits the tenant's monthly counter by the job's item count
//! before any generation happens. The reserve-or-reject decision runs in a
//! SERIALIZABLE transaction so two concurrent jobs cannot both fit under the
//! cap; serialization conflicts are retried a bounded number of times.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;

const RESERVE_ATTEMPTS: u32 = 3;

/// Postgres SQLSTATE for serialization failures.
const SERIALIZATION_FAILURE: &str = "40001";

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted { used: i32, remaining: i32 },
    LimitExceeded { used: i32, remaining: i32 },
}

impl Reservation {
    pub fn is_granted(&self) -> bool {
        matches!(self, Reservation::Granted { .. })
    }
}

/// `YYYY-MM` for `now` rendered in the accounting timezone. Month
/// boundaries follow the configured zone, not UTC.
pub fn month_key(now: DateTime<Utc>, tz: Tz) -> String {
    now.with_timezone(&tz).format("%Y-%m").to_string()
}

/// Tenant-monthly usage counter.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Reserve `n` units against the tenant's current month, rejecting when
    /// `used + n` would exceed `limit`.
    async fn reserve(&self, tenant: &str, n: i32, limit: i32) -> Result<Reservation>;

    /// Current usage for the tenant's current month.
    async fn used(&self, tenant: &str) -> Result<i32>;
}

/// Postgres-backed ledger.
pub struct PgUsageLedger {
    pool: PgPool,
    tz: Tz,
}

impl PgUsageLedger {
    pub fn new(pool: PgPool, tz: Tz) -> Self {
        Self { pool, tz }
    }

    async fn reserve_once(&self, tenant: &str, month: &str, n: i32, limit: i32) -> Result<Reservation> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO usage_monthly (tenant, month_key, used) VALUES ($1, $2, 0) \
             ON CONFLICT (tenant, month_key) DO NOTHING",
        )
        .bind(tenant)
        .bind(month)
        .execute(&mut *tx)
        .await?;

        let used = sqlx::query_scalar::<_, i32>(
            "SELECT used FROM usage_monthly WHERE tenant = $1 AND month_key = $2",
        )
        .bind(tenant)
        .bind(month)
        .fetch_one(&mut *tx)
        .await?;

        if used + n > limit {
            tx.rollback().await?;
            return Ok(Reservation::LimitExceeded {
                used,
                remaining: (limit - used).max(0),
            });
        }

        sqlx::query(
            "UPDATE usage_monthly SET used = used + $3 WHERE tenant = $1 AND month_key = $2",
        )
        .bind(tenant)
        .bind(month)
        .bind(n)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Reservation::Granted {
            used: used + n,
            remaining: limit - used - n,
        })
    }
}

fn is_serialization_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .and_then(|db| db.code())
        .map(|code| code == SERIALIZATION_FAILURE)
        .unwrap_or(false)
}

#[async_trait]
impl UsageLedger for PgUsageLedger {
    async fn reserve(&self, tenant: &str, n: i32, limit: i32) -> Result<Reservation> {
        let month = month_key(Utc::now(), self.tz);
        let mut attempt = 1;
        loop {
            match self.reserve_once(tenant, &month, n, limit).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if attempt < RESERVE_ATTEMPTS && is_serialization_conflict(&err) => {
                    tracing::debug!(tenant, attempt, "usage reservation conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(err) => return Err(err).context("usage reservation failed"),
            }
        }
    }

    async fn used(&self, tenant: &str) -> Result<i32> {
        let month = month_key(Utc::now(), self.tz);
        let used = sqlx::query_scalar::<_, i32>(
            "SELECT used FROM usage_monthly WHERE tenant = $1 AND month_key = $2",
        )
        .bind(tenant)
        .bind(&month)
        .fetch_optional(&self.pool)
        .await?;
        Ok(used.unwrap_or(0))
    }
}

/// In-memory ledger for tests.
pub struct MemoryUsageLedger {
    tz: Tz,
    counters: Mutex<HashMap<(String, String), i32>>,
}

impl MemoryUsageLedger {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Pre-seed the current month's usage for a tenant.
    pub fn seed(&self, tenant: &str, used: i32) {
        let month = month_key(Utc::now(), self.tz);
        self.counters
            .lock()
            .unwrap()
            .insert((tenant.to_string(), month), used);
    }
}

#[async_trait]
impl UsageLedger for MemoryUsageLedger {
    async fn reserve(&self, tenant: &str, n: i32, limit: i32) -> Result<Reservation> {
        let month = month_key(Utc::now(), self.tz);
        let mut counters = self.counters.lock().unwrap();
        let used = counters
            .entry((tenant.to_string(), month))
            .or_insert(0);
        if *used + n > limit {
            return Ok(Reservation::LimitExceeded {
                used: *used,
                remaining: (limit - *used).max(0),
            });
        }
        *used += n;
        Ok(Reservation::Granted {
            used: *used,
            remaining: limit - *used,
        })
    }

    async fn used(&self, tenant: &str) -> Result<i32> {
        let month = month_key(Utc::now(), self.tz);
        Ok(*self
            .counters
            .lock()
            .unwrap()
            .get(&(tenant.to_string(), month))
            .unwrap_or(&0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn month_key_follows_the_accounting_timezone() {
        // 2025-12-31 22:30 UTC is already January in Istanbul (UTC+3).
        let late = Utc.with_ymd_and_hms(2025, 12, 31, 22, 30, 0).unwrap();
        assert_eq!(month_key(late, chrono_tz::Europe::Istanbul), "2026-01");
        assert_eq!(month_key(late, chrono_tz::UTC), "2025-12");
    }

    #[tokio::test]
    async fn reserve_grants_until_the_cap() {
        let ledger = MemoryUsageLedger::new(chrono_tz::Europe::Istanbul);
        assert_eq!(
            ledger.reserve("t1", 4, 10).await.unwrap(),
            Reservation::Granted { used: 4, remaining: 6 }
        );
        assert_eq!(
            ledger.reserve("t1", 6, 10).await.unwrap(),
            Reservation::Granted { used: 10, remaining: 0 }
        );
        assert_eq!(
            ledger.reserve("t1", 1, 10).await.unwrap(),
            Reservation::LimitExceeded { used: 10, remaining: 0 }
        );
    }

    #[tokio::test]
    async fn rejection_leaves_the_counter_unchanged() {
        let ledger = MemoryUsageLedger::new(chrono_tz::Europe::Istanbul);
        ledger.seed("t2", 8);
        let outcome = ledger.reserve("t2", 5, 10).await.unwrap();
        assert_eq!(outcome, Reservation::LimitExceeded { used: 8, remaining: 2 });
        assert_eq!(ledger.used("t2").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let ledger = MemoryUsageLedger::new(chrono_tz::Europe::Istanbul);
        ledger.reserve("a", 9, 10).await.unwrap();
        assert!(ledger.reserve("b", 10, 10).await.unwrap().is_granted());
    }
}
