//! Stuck-job recovery.
//!
//! A job whose lease expired without a heartbeat belongs to a worker that
//! died mid-phase. On a fixed cadence, such jobs are failed with an explicit
//! reason so the user can retry them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use super::jobs::JobStore;

/// One recovery sweep. Returns how many jobs were recovered.
pub async fn recover_once(store: &Arc<dyn JobStore>, stale_after: Duration) -> Result<u32> {
    let reason = recovery_reason(stale_after);
    let stuck = store.find_stuck(stale_after).await?;
    for job in &stuck {
        warn!(
            job_id = %job.id,
            tenant = %job.tenant,
            owner = ?job.lock_owner,
            "recovering stuck job"
        );
        store.recover_stuck(job, &reason).await?;
    }
    Ok(stuck.len() as u32)
}

pub fn recovery_reason(stale_after: Duration) -> String {
    format!(
        "Recovered stuck job (no heartbeat ≥ {}m)",
        stale_after.as_secs() / 60
    )
}

/// Run recovery sweeps until shutdown.
pub async fn run_recovery_loop(
    store: Arc<dyn JobStore>,
    interval: Duration,
    stale_after: Duration,
    shutdown: Arc<AtomicBool>,
) {
    info!(interval_secs = interval.as_secs(), "recovery loop starting");
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match recover_once(&store, stale_after).await {
            Ok(0) => {}
            Ok(count) => info!(count, "recovered stuck jobs"),
            Err(e) => error!(error = %e, "recovery sweep failed"),
        }
    }
    info!("recovery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_names_the_threshold_in_minutes() {
        assert_eq!(
            recovery_reason(Duration::from_secs(600)),
            "Recovered stuck job (no heartbeat ≥ 10m)"
        );
    }
}
