//! Per-call observer hooks wiring retry activity into job/item telemetry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::jobs::{JobStore, WorkPhase};
use super::lease::LeaseHandle;

/// Hooks fired by the external-call retry loops.
///
/// `on_attempt` fires before every attempt (1-based). `on_retry` fires
/// before a backoff sleep with the chosen wait and a short reason.
/// `on_throttle` fires when cost pacing sleeps between successful calls.
#[async_trait]
pub trait CallObserver: Send + Sync {
    async fn on_attempt(&self, attempt: u32);
    async fn on_retry(&self, wait: Duration, reason: &str);
    async fn on_throttle(&self, _wait: Duration, _currently_available: f64, _restore_rate: f64) {}
}

/// Observer that does nothing; used for internal reads.
pub struct NoopObserver;

#[async_trait]
impl CallObserver for NoopObserver {
    async fn on_attempt(&self, _attempt: u32) {}
    async fn on_retry(&self, _wait: Duration, _reason: &str) {}
}

/// Observer bound to one item of one job: counts attempts and retry waits,
/// narrates retries on the item and the job (`"Retrying <service> in Ns"`),
/// and keeps the lease warm through throttle pauses.
pub struct ItemTelemetry {
    store: Arc<dyn JobStore>,
    lease: LeaseHandle,
    job_id: String,
    item_id: i64,
    phase: WorkPhase,
    service: &'static str,
}

impl ItemTelemetry {
    pub fn new(
        store: Arc<dyn JobStore>,
        lease: LeaseHandle,
        job_id: impl Into<String>,
        item_id: i64,
        phase: WorkPhase,
        service: &'static str,
    ) -> Self {
        Self {
            store,
            lease,
            job_id: job_id.into(),
            item_id,
            phase,
            service,
        }
    }
}

#[async_trait]
impl CallObserver for ItemTelemetry {
    async fn on_attempt(&self, attempt: u32) {
        tracing::debug!(
            job_id = %self.job_id,
            item_id = self.item_id,
            service = self.service,
            attempt,
            "external call attempt"
        );
        if let Err(e) = self
            .store
            .record_attempt(&self.job_id, self.item_id, self.phase)
            .await
        {
            tracing::warn!(job_id = %self.job_id, error = %e, "failed to record attempt");
        }
    }

    async fn on_retry(&self, wait: Duration, reason: &str) {
        let secs = wait.as_millis().div_ceil(1000);
        let narration = format!("Retrying {} in {}s ({})", self.service, secs, reason);
        if let Err(e) = self
            .store
            .record_retry_wait(
                &self.job_id,
                self.item_id,
                self.phase,
                wait.as_millis() as i64,
                &narration,
            )
            .await
        {
            tracing::warn!(job_id = %self.job_id, error = %e, "failed to record retry wait");
        }
    }

    async fn on_throttle(&self, wait: Duration, currently_available: f64, restore_rate: f64) {
        tracing::debug!(
            job_id = %self.job_id,
            item_id = self.item_id,
            wait_ms = wait.as_millis() as u64,
            currently_available,
            restore_rate,
            "cost pacing pause"
        );
        if let Err(e) = self.lease.refresh().await {
            tracing::warn!(job_id = %self.job_id, error = %e, "lease refresh during throttle failed");
        }
    }
}
