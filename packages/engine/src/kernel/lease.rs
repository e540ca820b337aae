//! Borrowed lease capability handed from the dispatcher to phase code.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::jobs::JobStore;
use super::tenant_lock::TenantLocks;

/// Refresh handle for the job lease and the tenant lock.
///
/// The dispatcher owns both locks; phases only get this handle, which can
/// extend them but never release them.
#[derive(Clone)]
pub struct LeaseHandle {
    store: Arc<dyn JobStore>,
    locks: Arc<dyn TenantLocks>,
    job_id: String,
    tenant: String,
    owner: String,
    lease_ttl: Duration,
    lock_ttl: Duration,
}

impl LeaseHandle {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<dyn TenantLocks>,
        job_id: impl Into<String>,
        tenant: impl Into<String>,
        owner: impl Into<String>,
        lease_ttl: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            job_id: job_id.into(),
            tenant: tenant.into(),
            owner: owner.into(),
            lease_ttl,
            lock_ttl,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Extend the job lease (bumping the heartbeat) and the tenant lock.
    /// Losing either is logged but not fatal here; the caller keeps going
    /// and the recovery loop arbitrates true ownership.
    pub async fn refresh(&self) -> Result<()> {
        let held = self
            .store
            .touch_lease(&self.job_id, &self.owner, self.lease_ttl)
            .await?;
        if !held {
            tracing::warn!(job_id = %self.job_id, owner = %self.owner, "job lease no longer ours");
        }
        let locked = self
            .locks
            .refresh(&self.tenant, &self.owner, self.lock_ttl)
            .await?;
        if !locked {
            tracing::warn!(tenant = %self.tenant, owner = %self.owner, "tenant lock no longer ours");
        }
        Ok(())
    }
}
