//! Dispatcher: one broker delivery in, one fully-owned phase run out.
//!
//! Owns both the tenant lock and the job lease for the duration of a run;
//! phase code only ever sees the refresh capability. Lock contention is
//! parked on the broker as a delayed re-delivery, so the worker slot frees
//! immediately and the bounce never consumes a delivery attempt.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::broker::{Consumer, Delivery, QueueMessage};
use super::engine::EngineKernel;
use super::jobs::{Job, JobPhase, Reservation, WorkPhase};
use super::phases::{run_generate, run_publish};
use super::tenants::{Plan, TenantRecord};

pub struct Dispatcher {
    kernel: Arc<EngineKernel>,
}

impl Dispatcher {
    pub fn new(kernel: Arc<EngineKernel>) -> Self {
        Self { kernel }
    }

    async fn handle(&self, message: &QueueMessage) -> Result<Delivery> {
        let kernel = &self.kernel;

        // Malformed deliveries are dropped, not re-driven: re-delivery
        // cannot fix them.
        if message.job_id.trim().is_empty() {
            warn!(kind = message.kind.as_str(), "delivery without job id, dropping");
            return Ok(Delivery::Done);
        }

        // A job deleted since enqueue is a stale message.
        let Some(job) = kernel.store.get_job(&message.job_id).await? else {
            debug!(job_id = %message.job_id, "job no longer exists, dropping message");
            return Ok(Delivery::Done);
        };

        if !kernel
            .locks
            .acquire(&job.tenant, &kernel.worker_id, kernel.settings.tenant_lock_ttl)
            .await?
        {
            debug!(job_id = %job.id, tenant = %job.tenant, "tenant lock busy, bouncing delivery");
            let until = Utc::now()
                + chrono::Duration::from_std(kernel.settings.tenant_lock_retry_delay)?;
            return Ok(Delivery::Bounce(until));
        }

        let leased = match kernel
            .store
            .acquire_lease(&job.id, &kernel.worker_id, kernel.settings.lease_ttl)
            .await
        {
            Ok(leased) => leased,
            Err(e) => {
                let _ = kernel.locks.release(&job.tenant, &kernel.worker_id).await;
                return Err(e);
            }
        };
        if !leased {
            // Another worker owns this job; nothing for us to do.
            debug!(job_id = %job.id, "job lease held elsewhere, dropping message");
            let _ = kernel.locks.release(&job.tenant, &kernel.worker_id).await;
            return Ok(Delivery::Done);
        }

        let outcome = self.run_locked(&job).await;

        if let Err(e) = kernel.store.release_lease(&job.id, &kernel.worker_id).await {
            warn!(job_id = %job.id, error = %e, "failed to release job lease");
        }
        if let Err(e) = kernel.locks.release(&job.tenant, &kernel.worker_id).await {
            warn!(tenant = %job.tenant, error = %e, "failed to release tenant lock");
        }

        outcome
    }

    /// Preflight and phase routing, with both locks held.
    async fn run_locked(&self, job: &Job) -> Result<Delivery> {
        let kernel = &self.kernel;

        if !job.is_runnable() || kernel.store.is_cancelled(&job.id).await? {
            debug!(job_id = %job.id, "job is terminal, dropping message");
            return Ok(Delivery::Done);
        }

        // Self-heal a drifted total before reserving usage against it.
        let total = kernel.store.refresh_total(&job.id).await?;

        let Some(tenant) = kernel.tenants.get(&job.tenant).await? else {
            warn!(job_id = %job.id, tenant = %job.tenant, "tenant record missing, failing job");
            kernel
                .store
                .fail_job(&job.id, WorkPhase::of(job.phase), "store connection is missing")
                .await?;
            return Ok(Delivery::Done);
        };

        if job.phase == JobPhase::Generating && !job.usage_reserved {
            if let Some(delivery) = self.reserve_usage(job, &tenant, total).await? {
                return Ok(delivery);
            }
        }

        let lease = kernel.lease_handle(job);
        let store_api = kernel.store_apis.open(&tenant.api_endpoint, &tenant.api_token);

        match job.phase {
            JobPhase::Generating => run_generate(kernel, job, &store_api, &lease).await?,
            JobPhase::Publishing => run_publish(kernel, job, &store_api, &lease).await?,
            JobPhase::Generated | JobPhase::Published => {
                debug!(job_id = %job.id, phase = ?job.phase, "phase already complete, dropping message");
            }
        }

        Ok(Delivery::Done)
    }

    /// One-time free-tier reservation. Returns `Some(Done)` when the job was
    /// failed for exceeding the cap.
    async fn reserve_usage(
        &self,
        job: &Job,
        tenant: &TenantRecord,
        total: i32,
    ) -> Result<Option<Delivery>> {
        let kernel = &self.kernel;
        if tenant.plan == Plan::Pro {
            return Ok(None);
        }
        match kernel
            .usage
            .reserve(&job.tenant, total, kernel.settings.free_monthly_limit)
            .await?
        {
            Reservation::Granted { used, remaining } => {
                kernel.store.set_usage_reserved(&job.id, total).await?;
                info!(job_id = %job.id, tenant = %job.tenant, used, remaining, "usage reserved");
                Ok(None)
            }
            Reservation::LimitExceeded { used, remaining } => {
                info!(
                    job_id = %job.id,
                    tenant = %job.tenant,
                    used,
                    remaining,
                    "free plan limit exceeded, failing job"
                );
                kernel
                    .store
                    .fail_job(&job.id, WorkPhase::Generate, "Free plan limit exceeded")
                    .await?;
                Ok(Some(Delivery::Done))
            }
        }
    }
}

#[async_trait]
impl Consumer for Dispatcher {
    async fn deliver(&self, message: &QueueMessage) -> Delivery {
        match self.handle(message).await {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(
                    job_id = %message.job_id,
                    kind = message.kind.as_str(),
                    attempt = message.attempt,
                    error = %e,
                    "delivery failed"
                );
                Delivery::Fail(e.to_string())
            }
        }
    }
}
