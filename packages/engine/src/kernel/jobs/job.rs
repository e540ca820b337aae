//! Job model: one batch of SEO work for one tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::clip;

/// Item and job errors are clipped to this many characters before storage.
pub const ERROR_MAX_CHARS: usize = 900;

/// What kind of metadata the batch produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
pub enum JobType {
    ProductSeo,
    ImageAlt,
    BlogSeo,
}

/// Which half of the two-phase pipeline the job is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_phase", rename_all = "snake_case")]
pub enum JobPhase {
    Generating,
    Generated,
    Publishing,
    Published,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub tenant: String,
    pub job_type: JobType,
    pub phase: JobPhase,
    pub status: JobStatus,

    // Counters (monotonic)
    pub total: i32,
    pub ok_count: i32,
    pub failed_count: i32,
    pub publish_ok_count: i32,
    pub publish_failed_count: i32,
    pub total_attempts: i32,
    pub total_retry_wait_ms: i64,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub publish_started_at: Option<DateTime<Utc>>,
    pub publish_finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    // Lease (both null or both set)
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    // Generation config
    pub language: String,
    pub meta_title: bool,
    pub meta_description: bool,
    pub generation_hints: serde_json::Value,
    pub apply_only_changed: bool,

    // Free-tier accounting
    pub usage_reserved: bool,
    pub usage_count: i32,

    pub last_error: Option<String>,
}

impl Job {
    /// Whether a worker currently holds a live lease on this job.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expires_at) {
            (Some(_), Some(expires)) => expires > now,
            _ => false,
        }
    }

    /// Whether the job is in a state a dispatcher may run.
    pub fn is_runnable(&self) -> bool {
        !matches!(
            self.status,
            JobStatus::Cancelled | JobStatus::Success | JobStatus::Failed
        )
    }

    /// Clip an error message to the storable length.
    pub fn clip_error(message: &str) -> String {
        clip(message, ERROR_MAX_CHARS)
    }
}

/// Everything the producer supplies when creating a job.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobSpec {
    #[builder(default = Uuid::new_v4().to_string())]
    pub id: String,
    pub tenant: String,
    pub job_type: JobType,
    #[builder(default = "en".to_string())]
    pub language: String,
    #[builder(default = true)]
    pub meta_title: bool,
    #[builder(default = true)]
    pub meta_description: bool,
    #[builder(default = serde_json::Value::Null)]
    pub generation_hints: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> JobSpec {
        JobSpec::builder()
            .tenant("shop-1")
            .job_type(JobType::ProductSeo)
            .build()
    }

    #[test]
    fn spec_defaults_to_english_and_both_fields() {
        let spec = sample_spec();
        assert_eq!(spec.language, "en");
        assert!(spec.meta_title);
        assert!(spec.meta_description);
    }

    #[test]
    fn spec_generates_an_id_when_not_given() {
        assert_ne!(sample_spec().id, sample_spec().id);
    }

    #[test]
    fn clip_error_bounds_length() {
        let long = "x".repeat(5000);
        assert_eq!(Job::clip_error(&long).chars().count(), ERROR_MAX_CHARS);
        assert_eq!(Job::clip_error("fine"), "fine");
    }

    #[test]
    fn cancelled_and_terminal_jobs_are_not_runnable() {
        let mut job = crate::kernel::jobs::testing::job_fixture("j1", "t1");
        assert!(job.is_runnable());
        job.status = JobStatus::Cancelled;
        assert!(!job.is_runnable());
        job.status = JobStatus::Failed;
        assert!(!job.is_runnable());
    }

    #[test]
    fn lease_liveness_requires_owner_and_future_expiry() {
        let mut job = crate::kernel::jobs::testing::job_fixture("j1", "t1");
        let now = Utc::now();
        assert!(!job.has_live_lease(now));
        job.lock_owner = Some("w1".into());
        job.lock_expires_at = Some(now + chrono::Duration::minutes(5));
        assert!(job.has_live_lease(now));
        job.lock_expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!job.has_live_lease(now));
    }
}
