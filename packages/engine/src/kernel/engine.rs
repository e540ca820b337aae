//! Engine kernel: every infrastructure dependency the worker needs,
//! injected through the seam traits so tests can swap in doubles.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use uuid::Uuid;

use super::broker::Broker;
use super::generator::Generator;
use super::jobs::{Job, JobStore, UsageLedger};
use super::lease::LeaseHandle;
use super::store_api::StoreApiFactory;
use super::tenant_lock::TenantLocks;
use super::tenants::TenantDirectory;

/// Engine tunables. Defaults match the documented configuration set.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub lease_ttl: Duration,
    pub tenant_lock_ttl: Duration,
    pub tenant_lock_retry_delay: Duration,
    pub stuck_after: Duration,
    pub recovery_interval: Duration,
    pub free_monthly_limit: i32,
    pub free_time_zone: Tz,
    /// Cooperative pause between generate items.
    pub generate_item_pause: Duration,
    /// Cooperative pause between publish items.
    pub publish_item_pause: Duration,
    /// Upper bound on items fetched per phase run.
    pub item_batch: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(300),
            tenant_lock_ttl: Duration::from_secs(900),
            tenant_lock_retry_delay: Duration::from_secs(10),
            stuck_after: Duration::from_secs(600),
            recovery_interval: Duration::from_secs(60),
            free_monthly_limit: 10,
            free_time_zone: chrono_tz::Europe::Istanbul,
            generate_item_pause: Duration::from_millis(450),
            publish_item_pause: Duration::from_millis(350),
            item_batch: 10_000,
        }
    }
}

/// Shared dependencies for dispatcher, phases, recovery, and producer.
pub struct EngineKernel {
    pub store: Arc<dyn JobStore>,
    pub usage: Arc<dyn UsageLedger>,
    pub locks: Arc<dyn TenantLocks>,
    pub broker: Arc<dyn Broker>,
    pub tenants: Arc<dyn TenantDirectory>,
    pub generator: Arc<Generator>,
    pub store_apis: Arc<dyn StoreApiFactory>,
    pub settings: EngineSettings,
    /// Stable identity of this worker process for leases and locks.
    pub worker_id: String,
}

impl EngineKernel {
    /// Generate a worker identity.
    pub fn worker_id() -> String {
        format!("worker-{}", Uuid::new_v4())
    }

    /// The borrowed refresh capability handed to phase code.
    pub fn lease_handle(&self, job: &Job) -> LeaseHandle {
        LeaseHandle::new(
            self.store.clone(),
            self.locks.clone(),
            job.id.clone(),
            job.tenant.clone(),
            self.worker_id.clone(),
            self.settings.lease_ttl,
            self.settings.tenant_lock_ttl,
        )
    }
}
