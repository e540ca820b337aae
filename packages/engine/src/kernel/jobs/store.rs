//! Durable job/item state.
//!
//! `JobStore` is the sole source of truth for job and item state. Every
//! mutation is a guarded `UPDATE … WHERE` against current database state so
//! concurrent workers cannot step on each other; nothing is cached across
//! calls.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::item::{ItemDraft, ItemSpec, JobItem};
use super::job::{Job, JobPhase, JobSpec, JobStatus, JobType};
use crate::common::pagination::Cursor;

/// The two sub-pipelines that share item state. Each only ever touches its
/// own columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkPhase {
    Generate,
    Publish,
}

impl WorkPhase {
    /// The sub-pipeline a job phase belongs to.
    pub fn of(phase: JobPhase) -> Self {
        match phase {
            JobPhase::Generating | JobPhase::Generated => WorkPhase::Generate,
            JobPhase::Publishing | JobPhase::Published => WorkPhase::Publish,
        }
    }
}

/// Atomic counter increments applied to a job row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDeltas {
    pub ok: i32,
    pub failed: i32,
    pub publish_ok: i32,
    pub publish_failed: i32,
    pub attempts: i32,
    pub retry_wait_ms: i64,
}

/// Listing filters; all optional, combined with AND.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub phase: Option<JobPhase>,
    pub job_type: Option<JobType>,
    pub id_contains: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: i64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: 50,
        }
    }
}

#[derive(Debug)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub next_cursor: Option<String>,
}

/// Durable job/item state operations.
///
/// Lease operations are compare-and-set: they only succeed for the current
/// owner (or, for acquire, when the lease is free or expired). Releasing a
/// lease another worker owns is a no-op.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job and its items in one transaction.
    async fn create_job(&self, spec: JobSpec, items: Vec<ItemSpec>) -> Result<Job>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    async fn items_for_job(&self, job_id: &str) -> Result<Vec<JobItem>>;

    /// CAS acquire: succeeds iff the lease is free, expired, or already ours.
    async fn acquire_lease(&self, job_id: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Extend the lease and bump the heartbeat, only for the current owner.
    async fn touch_lease(&self, job_id: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Clear the lease, only for the current owner.
    async fn release_lease(&self, job_id: &str, owner: &str) -> Result<()>;

    /// Items eligible for the phase, ascending id order for deterministic
    /// replay. Generate: status ∈ {queued, failed}. Publish: publish_status ∈
    /// {queued, failed}.
    async fn next_items(&self, job_id: &str, phase: WorkPhase, limit: i64) -> Result<Vec<JobItem>>;

    async fn mark_item_running(&self, item_id: i64, phase: WorkPhase) -> Result<()>;

    /// Success for the phase. The optional draft fills the draft columns
    /// (generate) or copies the alt baseline (publish of an image).
    async fn mark_item_success(
        &self,
        item_id: i64,
        phase: WorkPhase,
        draft: Option<ItemDraft>,
    ) -> Result<()>;

    async fn mark_item_failed(&self, item_id: i64, phase: WorkPhase, error: &str) -> Result<()>;

    /// Telemetry: one more attempt against the item and the job.
    async fn record_attempt(&self, job_id: &str, item_id: i64, phase: WorkPhase) -> Result<()>;

    /// Telemetry: a retry sleep, with live narration surfaced on both the
    /// item error field and the job `last_error`.
    async fn record_retry_wait(
        &self,
        job_id: &str,
        item_id: i64,
        phase: WorkPhase,
        wait_ms: i64,
        narration: &str,
    ) -> Result<()>;

    async fn increment_counters(&self, job_id: &str, deltas: CounterDeltas) -> Result<()>;

    /// Phase/status transition with timestamp bookkeeping:
    /// `(Generating, Running)` stamps `started_at`, `(Generated, Success)`
    /// stamps `finished_at`, the publish pair stamps the publish timestamps,
    /// and a `Failed` status stamps the active phase's finish column.
    async fn set_phase(&self, job_id: &str, phase: JobPhase, status: JobStatus) -> Result<()>;

    async fn set_last_error(&self, job_id: &str, message: &str) -> Result<()>;

    async fn is_cancelled(&self, job_id: &str) -> Result<bool>;

    /// Self-heal `total` against the item count; returns the fresh count.
    async fn refresh_total(&self, job_id: &str) -> Result<i32>;

    /// Running jobs whose lease expired and that either stopped
    /// heartbeating for `stale_after` or never stamped a start. Oldest
    /// first, limit 25.
    async fn find_stuck(&self, stale_after: Duration) -> Result<Vec<Job>>;

    /// Fail a stuck job: running items of its active phase are failed with
    /// `reason`, the job is failed, the lease cleared.
    async fn recover_stuck(&self, job: &Job, reason: &str) -> Result<()>;

    /// Fail the job and all its queued/running items of `phase` atomically
    /// (free-tier denial, invariant failures).
    async fn fail_job(&self, job_id: &str, phase: WorkPhase, reason: &str) -> Result<()>;

    /// Cancel: job → cancelled, in-flight items of the active phase →
    /// failed with `reason`. Returns false when the job was already
    /// terminal.
    async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<bool>;

    /// User retry: failed items of `phase` go back to queued. Returns how
    /// many were reset.
    async fn retry_failed_items(&self, job_id: &str, phase: WorkPhase) -> Result<u64>;

    /// Publish staging: selected items → queued, everything else → skipped;
    /// records the `apply_only_changed` choice on the job.
    async fn stage_publish_selection(
        &self,
        job_id: &str,
        selected: &[i64],
        apply_only_changed: bool,
    ) -> Result<()>;

    /// Mark specific items skipped (no-change pruning).
    async fn skip_items(&self, job_id: &str, item_ids: &[i64]) -> Result<u64>;

    /// Stamp the one-time usage reservation on the job.
    async fn set_usage_reserved(&self, job_id: &str, count: i32) -> Result<()>;

    async fn list_jobs(&self, tenant: &str, filter: JobFilter, page: PageRequest)
        -> Result<JobPage>;

    /// Bulk clear for a tenant; the only path that deletes rows.
    async fn clear_tenant(&self, tenant: &str) -> Result<u64>;
}

const JOB_COLUMNS: &str = "id, tenant, job_type, phase, status, \
     total, ok_count, failed_count, publish_ok_count, publish_failed_count, \
     total_attempts, total_retry_wait_ms, \
     created_at, started_at, finished_at, publish_started_at, publish_finished_at, \
     last_heartbeat_at, lock_owner, lock_expires_at, \
     language, meta_title, meta_description, generation_hints, apply_only_changed, \
     usage_reserved, usage_count, last_error";

const ITEM_COLUMNS: &str = "id, job_id, target_type, target_id, parent_id, title, media_id, \
     image_url, status, started_at, finished_at, error, gen_attempts, gen_retry_wait_ms, \
     seo_title, seo_description, publish_status, published_at, publish_error, \
     publish_attempts, publish_retry_wait_ms";

/// PostgreSQL-backed job store.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn interval_ms(ttl: Duration) -> String {
        (ttl.as_millis() as i64).to_string()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, spec: JobSpec, items: Vec<ItemSpec>) -> Result<Job> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (id, tenant, job_type, phase, status, total,
                              language, meta_title, meta_description, generation_hints)
            VALUES ($1, $2, $3, 'generating', 'queued', $4, $5, $6, $7, $8)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&spec.id)
        .bind(&spec.tenant)
        .bind(spec.job_type)
        .bind(items.len() as i32)
        .bind(&spec.language)
        .bind(spec.meta_title)
        .bind(spec.meta_description)
        .bind(&spec.generation_hints)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert job")?;

        for item in &items {
            sqlx::query(
                r#"
                INSERT INTO job_items (job_id, target_type, target_id, parent_id,
                                       title, media_id, image_url)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (job_id, target_type, target_id) DO NOTHING
                "#,
            )
            .bind(&job.id)
            .bind(item.target_type)
            .bind(&item.target_id)
            .bind(&item.parent_id)
            .bind(&item.title)
            .bind(&item.media_id)
            .bind(&item.image_url)
            .execute(&mut *tx)
            .await
            .context("failed to insert job item")?;
        }

        tx.commit().await?;
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn items_for_job(&self, job_id: &str) -> Result<Vec<JobItem>> {
        let items = sqlx::query_as::<_, JobItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM job_items WHERE job_id = $1 ORDER BY id ASC"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn acquire_lease(&self, job_id: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_owner = $2,
                lock_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                last_heartbeat_at = NOW()
            WHERE id = $1
              AND (lock_owner IS NULL OR lock_expires_at < NOW() OR lock_owner = $2)
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .bind(Self::interval_ms(ttl))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_lease(&self, job_id: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                last_heartbeat_at = NOW()
            WHERE id = $1 AND lock_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .bind(Self::interval_ms(ttl))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, job_id: &str, owner: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lock_owner = NULL, lock_expires_at = NULL
            WHERE id = $1 AND lock_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_items(&self, job_id: &str, phase: WorkPhase, limit: i64) -> Result<Vec<JobItem>> {
        let predicate = match phase {
            WorkPhase::Generate => "status IN ('queued', 'failed')",
            WorkPhase::Publish => "publish_status IN ('queued', 'failed')",
        };
        let items = sqlx::query_as::<_, JobItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM job_items \
             WHERE job_id = $1 AND {predicate} ORDER BY id ASC LIMIT $2"
        ))
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn mark_item_running(&self, item_id: i64, phase: WorkPhase) -> Result<()> {
        let sql = match phase {
            WorkPhase::Generate => {
                "UPDATE job_items SET status = 'running', started_at = NOW(), error = NULL \
                 WHERE id = $1"
            }
            WorkPhase::Publish => {
                "UPDATE job_items SET publish_status = 'running', publish_error = NULL \
                 WHERE id = $1"
            }
        };
        sqlx::query(sql).bind(item_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn mark_item_success(
        &self,
        item_id: i64,
        phase: WorkPhase,
        draft: Option<ItemDraft>,
    ) -> Result<()> {
        match phase {
            WorkPhase::Generate => {
                let (title, description) = match draft {
                    Some(ItemDraft::Seo { title, description }) => (title, description),
                    Some(ItemDraft::Alt { alt, live_alt }) => (Some(alt), live_alt),
                    None => (None, None),
                };
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET status = 'success', finished_at = NOW(), error = NULL,
                        seo_title = COALESCE($2, seo_title),
                        seo_description = COALESCE($3, seo_description)
                    WHERE id = $1
                    "#,
                )
                .bind(item_id)
                .bind(title)
                .bind(description)
                .execute(&self.pool)
                .await?;
            }
            WorkPhase::Publish => {
                // The only draft write publish performs is the image alt
                // baseline copy.
                let baseline = match draft {
                    Some(ItemDraft::Alt { alt, .. }) => Some(alt),
                    _ => None,
                };
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET publish_status = 'success', published_at = NOW(), publish_error = NULL,
                        seo_description = COALESCE($2, seo_description)
                    WHERE id = $1
                    "#,
                )
                .bind(item_id)
                .bind(baseline)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn mark_item_failed(&self, item_id: i64, phase: WorkPhase, error: &str) -> Result<()> {
        let error = Job::clip_error(error);
        let sql = match phase {
            WorkPhase::Generate => {
                "UPDATE job_items SET status = 'failed', finished_at = NOW(), error = $2 \
                 WHERE id = $1"
            }
            WorkPhase::Publish => {
                "UPDATE job_items SET publish_status = 'failed', publish_error = $2 \
                 WHERE id = $1"
            }
        };
        sqlx::query(sql)
            .bind(item_id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_attempt(&self, job_id: &str, item_id: i64, phase: WorkPhase) -> Result<()> {
        let item_sql = match phase {
            WorkPhase::Generate => {
                "UPDATE job_items SET gen_attempts = gen_attempts + 1 WHERE id = $1"
            }
            WorkPhase::Publish => {
                "UPDATE job_items SET publish_attempts = publish_attempts + 1 WHERE id = $1"
            }
        };
        sqlx::query(item_sql).bind(item_id).execute(&self.pool).await?;
        sqlx::query("UPDATE jobs SET total_attempts = total_attempts + 1 WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_retry_wait(
        &self,
        job_id: &str,
        item_id: i64,
        phase: WorkPhase,
        wait_ms: i64,
        narration: &str,
    ) -> Result<()> {
        let narration = Job::clip_error(narration);
        let item_sql = match phase {
            WorkPhase::Generate => {
                "UPDATE job_items \
                 SET gen_retry_wait_ms = gen_retry_wait_ms + $2, error = $3 WHERE id = $1"
            }
            WorkPhase::Publish => {
                "UPDATE job_items \
                 SET publish_retry_wait_ms = publish_retry_wait_ms + $2, publish_error = $3 \
                 WHERE id = $1"
            }
        };
        sqlx::query(item_sql)
            .bind(item_id)
            .bind(wait_ms)
            .bind(&narration)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "UPDATE jobs \
             SET total_retry_wait_ms = total_retry_wait_ms + $2, last_error = $3 WHERE id = $1",
        )
        .bind(job_id)
        .bind(wait_ms)
        .bind(&narration)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_counters(&self, job_id: &str, deltas: CounterDeltas) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET ok_count = ok_count + $2,
                failed_count = failed_count + $3,
                publish_ok_count = publish_ok_count + $4,
                publish_failed_count = publish_failed_count + $5,
                total_attempts = total_attempts + $6,
                total_retry_wait_ms = total_retry_wait_ms + $7
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(deltas.ok)
        .bind(deltas.failed)
        .bind(deltas.publish_ok)
        .bind(deltas.publish_failed)
        .bind(deltas.attempts)
        .bind(deltas.retry_wait_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_phase(&self, job_id: &str, phase: JobPhase, status: JobStatus) -> Result<()> {
        let stamp = match (phase, status) {
            (JobPhase::Generating, JobStatus::Running) => "started_at = NOW()",
            (JobPhase::Publishing, JobStatus::Running) => "publish_started_at = NOW()",
            (JobPhase::Generated, JobStatus::Success) => "finished_at = NOW()",
            (JobPhase::Published, JobStatus::Success) => "publish_finished_at = NOW()",
            (JobPhase::Generating | JobPhase::Generated, JobStatus::Failed) => {
                "finished_at = NOW()"
            }
            (JobPhase::Publishing | JobPhase::Published, JobStatus::Failed) => {
                "publish_finished_at = NOW()"
            }
            _ => "id = id",
        };
        sqlx::query(&format!(
            "UPDATE jobs SET phase = $2, status = $3, {stamp} WHERE id = $1"
        ))
        .bind(job_id)
        .bind(phase)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_last_error(&self, job_id: &str, message: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET last_error = $2 WHERE id = $1")
            .bind(job_id)
            .bind(Job::clip_error(message))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_cancelled(&self, job_id: &str) -> Result<bool> {
        let cancelled = sqlx::query_scalar::<_, bool>(
            "SELECT status = 'cancelled' FROM jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cancelled.unwrap_or(false))
    }

    async fn refresh_total(&self, job_id: &str) -> Result<i32> {
        let total = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE jobs
            SET total = sub.count
            FROM (SELECT COUNT(*)::INT AS count FROM job_items WHERE job_id = $1) AS sub
            WHERE id = $1
            RETURNING total
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn find_stuck(&self, stale_after: Duration) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'running'
              AND lock_expires_at IS NOT NULL
              AND lock_expires_at < NOW()
              AND (last_heartbeat_at IS NULL
                   OR last_heartbeat_at < NOW() - ($1 || ' milliseconds')::INTERVAL
                   OR (started_at IS NULL AND publish_started_at IS NULL))
            ORDER BY created_at ASC
            LIMIT 25
            "#
        ))
        .bind(Self::interval_ms(stale_after))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn recover_stuck(&self, job: &Job, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let reason = Job::clip_error(reason);

        let item_sql = match WorkPhase::of(job.phase) {
            WorkPhase::Generate => {
                "UPDATE job_items \
                 SET status = 'failed', finished_at = NOW(), error = $2 \
                 WHERE job_id = $1 AND status = 'running'"
            }
            WorkPhase::Publish => {
                "UPDATE job_items SET publish_status = 'failed', publish_error = $2 \
                 WHERE job_id = $1 AND publish_status = 'running'"
            }
        };
        sqlx::query(item_sql)
            .bind(&job.id)
            .bind(&reason)
            .execute(&mut *tx)
            .await?;

        let finish = match WorkPhase::of(job.phase) {
            WorkPhase::Generate => "finished_at = NOW()",
            WorkPhase::Publish => "publish_finished_at = NOW()",
        };
        sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = $2, {finish},
                lock_owner = NULL, lock_expires_at = NULL
            WHERE id = $1 AND status = 'running'
            "#
        ))
        .bind(&job.id)
        .bind(&reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_job(&self, job_id: &str, phase: WorkPhase, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let reason = Job::clip_error(reason);

        let (item_sql, job_counter, finish) = match phase {
            WorkPhase::Generate => (
                "UPDATE job_items \
                 SET status = 'failed', finished_at = NOW(), error = $2 \
                 WHERE job_id = $1 AND status IN ('queued', 'running')",
                "failed_count",
                "finished_at = NOW()",
            ),
            WorkPhase::Publish => (
                "UPDATE job_items SET publish_status = 'failed', publish_error = $2 \
                 WHERE job_id = $1 AND publish_status IN ('queued', 'running')",
                "publish_failed_count",
                "publish_finished_at = NOW()",
            ),
        };

        let failed = sqlx::query(item_sql)
            .bind(job_id)
            .bind(&reason)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = $2, {finish},
                {job_counter} = {job_counter} + $3
            WHERE id = $1
            "#
        ))
        .bind(job_id)
        .bind(&reason)
        .bind(failed as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let reason = Job::clip_error(reason);

        let phase = sqlx::query_scalar::<_, JobPhase>(
            r#"
            UPDATE jobs
            SET status = 'cancelled', last_error = $2
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING phase
            "#,
        )
        .bind(job_id)
        .bind(&reason)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(phase) = phase else {
            tx.rollback().await?;
            return Ok(false);
        };

        let item_sql = match WorkPhase::of(phase) {
            WorkPhase::Generate => {
                "UPDATE job_items \
                 SET status = 'failed', finished_at = NOW(), error = $2 \
                 WHERE job_id = $1 AND status = 'running'"
            }
            WorkPhase::Publish => {
                "UPDATE job_items SET publish_status = 'failed', publish_error = $2 \
                 WHERE job_id = $1 AND publish_status = 'running'"
            }
        };
        sqlx::query(item_sql)
            .bind(job_id)
            .bind(&reason)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn retry_failed_items(&self, job_id: &str, phase: WorkPhase) -> Result<u64> {
        let (item_sql, job_sql) = match phase {
            WorkPhase::Generate => (
                "UPDATE job_items \
                 SET status = 'queued', error = NULL, started_at = NULL, finished_at = NULL \
                 WHERE job_id = $1 AND status = 'failed'",
                "UPDATE jobs SET status = 'queued', phase = 'generating', last_error = NULL \
                 WHERE id = $1",
            ),
            WorkPhase::Publish => (
                "UPDATE job_items SET publish_status = 'queued', publish_error = NULL \
                 WHERE job_id = $1 AND publish_status = 'failed'",
                "UPDATE jobs SET status = 'queued', phase = 'publishing', last_error = NULL \
                 WHERE id = $1",
            ),
        };
        let mut tx = self.pool.begin().await?;
        let reset = sqlx::query(item_sql)
            .bind(job_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if reset > 0 {
            sqlx::query(job_sql).bind(job_id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(reset)
    }

    async fn stage_publish_selection(
        &self,
        job_id: &str,
        selected: &[i64],
        apply_only_changed: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE job_items
            SET publish_status = CASE WHEN id = ANY($2) THEN 'queued' ELSE 'skipped' END::publish_status,
                publish_error = NULL, published_at = NULL
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(selected)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE jobs SET apply_only_changed = $2, phase = 'publishing', status = 'queued' \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(apply_only_changed)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn skip_items(&self, job_id: &str, item_ids: &[i64]) -> Result<u64> {
        let skipped = sqlx::query(
            "UPDATE job_items SET publish_status = 'skipped' \
             WHERE job_id = $1 AND id = ANY($2)",
        )
        .bind(job_id)
        .bind(item_ids)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(skipped)
    }

    async fn set_usage_reserved(&self, job_id: &str, count: i32) -> Result<()> {
        sqlx::query("UPDATE jobs SET usage_reserved = TRUE, usage_count = $2 WHERE id = $1")
            .bind(job_id)
            .bind(count)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_jobs(
        &self,
        tenant: &str,
        filter: JobFilter,
        page: PageRequest,
    ) -> Result<JobPage> {
        let limit = page.limit.clamp(1, 200);
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE tenant = "));
        builder.push_bind(tenant);

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(phase) = filter.phase {
            builder.push(" AND phase = ").push_bind(phase);
        }
        if let Some(job_type) = filter.job_type {
            builder.push(" AND job_type = ").push_bind(job_type);
        }
        if let Some(fragment) = filter.id_contains {
            builder
                .push(" AND id ILIKE ")
                .push_bind(format!("%{fragment}%"));
        }
        if let Some(token) = &page.cursor {
            let cursor = Cursor::decode(token)?;
            builder
                .push(" AND (created_at, id) < (")
                .push_bind(cursor.created_at)
                .push(", ")
                .push_bind(cursor.id)
                .push(")");
        }
        builder.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        builder.push_bind(limit + 1);

        let mut jobs: Vec<Job> = builder.build_query_as().fetch_all(&self.pool).await?;
        let next_cursor = if jobs.len() as i64 > limit {
            jobs.truncate(limit as usize);
            jobs.last().map(|j| {
                Cursor {
                    created_at: j.created_at,
                    id: j.id.clone(),
                }
                .encode()
            })
        } else {
            None
        };

        Ok(JobPage { jobs, next_cursor })
    }

    async fn clear_tenant(&self, tenant: &str) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM jobs WHERE tenant = $1")
            .bind(tenant)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }
}
