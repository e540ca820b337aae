//! In-memory job store for tests.
//!
//! Mirrors the guarded-update semantics of the Postgres store closely enough
//! for scenario tests to observe the same state transitions without a
//! database. Tests may backdate leases and heartbeats through
//! [`MemoryJobStore::with_job_mut`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use super::item::{ItemDraft, ItemSpec, ItemStatus, JobItem, PublishStatus, TargetType};
use super::job::{Job, JobPhase, JobSpec, JobStatus, JobType};
use super::store::{CounterDeltas, JobFilter, JobPage, JobStore, PageRequest, WorkPhase};
use crate::common::pagination::Cursor;

/// Build a queued/generating job row for tests.
pub fn job_fixture(id: &str, tenant: &str) -> Job {
    Job {
        id: id.to_string(),
        tenant: tenant.to_string(),
        job_type: JobType::ProductSeo,
        phase: JobPhase::Generating,
        status: JobStatus::Queued,
        total: 0,
        ok_count: 0,
        failed_count: 0,
        publish_ok_count: 0,
        publish_failed_count: 0,
        total_attempts: 0,
        total_retry_wait_ms: 0,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
        publish_started_at: None,
        publish_finished_at: None,
        last_heartbeat_at: None,
        lock_owner: None,
        lock_expires_at: None,
        language: "en".into(),
        meta_title: true,
        meta_description: true,
        generation_hints: serde_json::Value::Null,
        apply_only_changed: false,
        usage_reserved: false,
        usage_count: 0,
        last_error: None,
    }
}

/// Build a queued item row for tests.
pub fn item_fixture(id: i64, job_id: &str, target_type: TargetType) -> JobItem {
    JobItem {
        id,
        job_id: job_id.to_string(),
        target_type,
        target_id: format!("gid://store/Product/{id}"),
        parent_id: None,
        title: None,
        media_id: None,
        image_url: None,
        status: ItemStatus::Queued,
        started_at: None,
        finished_at: None,
        error: None,
        gen_attempts: 0,
        gen_retry_wait_ms: 0,
        seo_title: None,
        seo_description: None,
        publish_status: PublishStatus::Queued,
        published_at: None,
        publish_error: None,
        publish_attempts: 0,
        publish_retry_wait_ms: 0,
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    items: BTreeMap<i64, JobItem>,
    next_item_id: i64,
}

/// In-memory [`JobStore`].
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate a job row directly (backdating leases, forcing states).
    pub fn with_job_mut(&self, job_id: &str, f: impl FnOnce(&mut Job)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            f(job);
        }
    }

    /// Mutate an item row directly.
    pub fn with_item_mut(&self, item_id: i64, f: impl FnOnce(&mut JobItem)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            f(item);
        }
    }

    /// Snapshot an item row.
    pub fn item(&self, item_id: i64) -> Option<JobItem> {
        self.inner.lock().unwrap().items.get(&item_id).cloned()
    }

    fn job_item_ids(inner: &Inner, job_id: &str) -> Vec<i64> {
        inner
            .items
            .values()
            .filter(|i| i.job_id == job_id)
            .map(|i| i.id)
            .collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, spec: JobSpec, items: Vec<ItemSpec>) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        let mut job = job_fixture(&spec.id, &spec.tenant);
        job.job_type = spec.job_type;
        job.language = spec.language;
        job.meta_title = spec.meta_title;
        job.meta_description = spec.meta_description;
        job.generation_hints = spec.generation_hints;
        job.total = items.len() as i32;

        for spec in items {
            inner.next_item_id += 1;
            let id = inner.next_item_id;
            let mut item = item_fixture(id, &job.id, spec.target_type);
            item.target_id = spec.target_id;
            item.parent_id = spec.parent_id;
            item.title = spec.title;
            item.media_id = spec.media_id;
            item.image_url = spec.image_url;
            inner.items.insert(id, item);
        }

        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(job_id).cloned())
    }

    async fn items_for_job(&self, job_id: &str) -> Result<Vec<JobItem>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .items
            .values()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn acquire_lease(&self, job_id: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        let free = match (&job.lock_owner, job.lock_expires_at) {
            (None, _) => true,
            (Some(current), expires) => {
                current == owner || expires.map(|e| e < now).unwrap_or(true)
            }
        };
        if free {
            job.lock_owner = Some(owner.to_string());
            job.lock_expires_at = Some(now + chrono::Duration::from_std(ttl)?);
            job.last_heartbeat_at = Some(now);
        }
        Ok(free)
    }

    async fn touch_lease(&self, job_id: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.lock_owner.as_deref() == Some(owner) {
            job.lock_expires_at = Some(now + chrono::Duration::from_std(ttl)?);
            job.last_heartbeat_at = Some(now);
            return Ok(true);
        }
        Ok(false)
    }

    async fn release_lease(&self, job_id: &str, owner: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            if job.lock_owner.as_deref() == Some(owner) {
                job.lock_owner = None;
                job.lock_expires_at = None;
            }
        }
        Ok(())
    }

    async fn next_items(&self, job_id: &str, phase: WorkPhase, limit: i64) -> Result<Vec<JobItem>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .items
            .values()
            .filter(|i| i.job_id == job_id)
            .filter(|i| match phase {
                WorkPhase::Generate => {
                    matches!(i.status, ItemStatus::Queued | ItemStatus::Failed)
                }
                WorkPhase::Publish => {
                    matches!(i.publish_status, PublishStatus::Queued | PublishStatus::Failed)
                }
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_item_running(&self, item_id: i64, phase: WorkPhase) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            match phase {
                WorkPhase::Generate => {
                    item.status = ItemStatus::Running;
                    item.started_at = Some(Utc::now());
                    item.error = None;
                }
                WorkPhase::Publish => {
                    item.publish_status = PublishStatus::Running;
                    item.publish_error = None;
                }
            }
        }
        Ok(())
    }

    async fn mark_item_success(
        &self,
        item_id: i64,
        phase: WorkPhase,
        draft: Option<ItemDraft>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            match phase {
                WorkPhase::Generate => {
                    item.status = ItemStatus::Success;
                    item.finished_at = Some(Utc::now());
                    item.error = None;
                    match draft {
                        Some(ItemDraft::Seo { title, description }) => {
                            if title.is_some() {
                                item.seo_title = title;
                            }
                            if description.is_some() {
                                item.seo_description = description;
                            }
                        }
                        Some(ItemDraft::Alt { alt, live_alt }) => {
                            item.seo_title = Some(alt);
                            if live_alt.is_some() {
                                item.seo_description = live_alt;
                            }
                        }
                        None => {}
                    }
                }
                WorkPhase::Publish => {
                    item.publish_status = PublishStatus::Success;
                    item.published_at = Some(Utc::now());
                    item.publish_error = None;
                    if let Some(ItemDraft::Alt { alt, .. }) = draft {
                        item.seo_description = Some(alt);
                    }
                }
            }
        }
        Ok(())
    }

    async fn mark_item_failed(&self, item_id: i64, phase: WorkPhase, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            let error = Some(Job::clip_error(error));
            match phase {
                WorkPhase::Generate => {
                    item.status = ItemStatus::Failed;
                    item.finished_at = Some(Utc::now());
                    item.error = error;
                }
                WorkPhase::Publish => {
                    item.publish_status = PublishStatus::Failed;
                    item.publish_error = error;
                }
            }
        }
        Ok(())
    }

    async fn record_attempt(&self, job_id: &str, item_id: i64, phase: WorkPhase) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            match phase {
                WorkPhase::Generate => item.gen_attempts += 1,
                WorkPhase::Publish => item.publish_attempts += 1,
            }
        }
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.total_attempts += 1;
        }
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
        let mut inner = self.inner.lock().unwrap();
        let narration = Job::clip_error(narration);
        if let Some(item) = inner.items.get_mut(&item_id) {
            match phase {
                WorkPhase::Generate => {
                    item.gen_retry_wait_ms += wait_ms;
                    item.error = Some(narration.clone());
                }
                WorkPhase::Publish => {
                    item.publish_retry_wait_ms += wait_ms;
                    item.publish_error = Some(narration.clone());
                }
            }
        }
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.total_retry_wait_ms += wait_ms;
            job.last_error = Some(narration);
        }
        Ok(())
    }

    async fn increment_counters(&self, job_id: &str, deltas: CounterDeltas) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.ok_count += deltas.ok;
            job.failed_count += deltas.failed;
            job.publish_ok_count += deltas.publish_ok;
            job.publish_failed_count += deltas.publish_failed;
            job.total_attempts += deltas.attempts;
            job.total_retry_wait_ms += deltas.retry_wait_ms;
        }
        Ok(())
    }

    async fn set_phase(&self, job_id: &str, phase: JobPhase, status: JobStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            match (phase, status) {
                (JobPhase::Generating, JobStatus::Running) => job.started_at = Some(now),
                (JobPhase::Publishing, JobStatus::Running) => job.publish_started_at = Some(now),
                (JobPhase::Generated, JobStatus::Success) => job.finished_at = Some(now),
                (JobPhase::Published, JobStatus::Success) => job.publish_finished_at = Some(now),
                (JobPhase::Generating | JobPhase::Generated, JobStatus::Failed) => {
                    job.finished_at = Some(now)
                }
                (JobPhase::Publishing | JobPhase::Published, JobStatus::Failed) => {
                    job.publish_finished_at = Some(now)
                }
                _ => {}
            }
            job.phase = phase;
            job.status = status;
        }
        Ok(())
    }

    async fn set_last_error(&self, job_id: &str, message: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.last_error = Some(Job::clip_error(message));
        }
        Ok(())
    }

    async fn is_cancelled(&self, job_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .get(job_id)
            .map(|j| j.status == JobStatus::Cancelled)
            .unwrap_or(false))
    }

    async fn refresh_total(&self, job_id: &str) -> Result<i32> {
        let mut inner = self.inner.lock().unwrap();
        let count = Self::job_item_ids(&inner, job_id).len() as i32;
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.total = count;
        }
        Ok(count)
    }

    async fn find_stuck(&self, stale_after: Duration) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let stale = chrono::Duration::from_std(stale_after)?;
        let mut stuck: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .filter(|j| j.lock_expires_at.map(|e| e < now).unwrap_or(false))
            .filter(|j| {
                let no_heartbeat = j
                    .last_heartbeat_at
                    .map(|h| h < now - stale)
                    .unwrap_or(true);
                let never_started = j.started_at.is_none() && j.publish_started_at.is_none();
                no_heartbeat || never_started
            })
            .cloned()
            .collect();
        stuck.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        stuck.truncate(25);
        Ok(stuck)
    }

    async fn recover_stuck(&self, job: &Job, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let reason_clipped = Job::clip_error(reason);
        let phase = WorkPhase::of(job.phase);
        let ids = Self::job_item_ids(&inner, &job.id);
        for id in ids {
            let item = inner.items.get_mut(&id).unwrap();
            match phase {
                WorkPhase::Generate if item.status == ItemStatus::Running => {
                    item.status = ItemStatus::Failed;
                    item.finished_at = Some(now);
                    item.error = Some(reason_clipped.clone());
                }
                WorkPhase::Publish if item.publish_status == PublishStatus::Running => {
                    item.publish_status = PublishStatus::Failed;
                    item.publish_error = Some(reason_clipped.clone());
                }
                _ => {}
            }
        }
        if let Some(job) = inner.jobs.get_mut(&job.id) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Failed;
                job.last_error = Some(reason_clipped);
                match phase {
                    WorkPhase::Generate => job.finished_at = Some(now),
                    WorkPhase::Publish => job.publish_finished_at = Some(now),
                }
                job.lock_owner = None;
                job.lock_expires_at = None;
            }
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: &str, phase: WorkPhase, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let reason = Job::clip_error(reason);
        let ids = Self::job_item_ids(&inner, job_id);
        let mut failed = 0;
        for id in ids {
            let item = inner.items.get_mut(&id).unwrap();
            match phase {
                WorkPhase::Generate
                    if matches!(item.status, ItemStatus::Queued | ItemStatus::Running) =>
                {
                    item.status = ItemStatus::Failed;
                    item.finished_at = Some(now);
                    item.error = Some(reason.clone());
                    failed += 1;
                }
                WorkPhase::Publish
                    if matches!(
                        item.publish_status,
                        PublishStatus::Queued | PublishStatus::Running
                    ) =>
                {
                    item.publish_status = PublishStatus::Failed;
                    item.publish_error = Some(reason.clone());
                    failed += 1;
                }
                _ => {}
            }
        }
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.status = JobStatus::Failed;
            job.last_error = Some(reason);
            match phase {
                WorkPhase::Generate => {
                    job.failed_count += failed;
                    job.finished_at = Some(now);
                }
                WorkPhase::Publish => {
                    job.publish_failed_count += failed;
                    job.publish_finished_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let reason = Job::clip_error(reason);
        let phase = match inner.jobs.get_mut(job_id) {
            Some(job) if matches!(job.status, JobStatus::Queued | JobStatus::Running) => {
                job.status = JobStatus::Cancelled;
                job.last_error = Some(reason.clone());
                job.phase
            }
            _ => return Ok(false),
        };
        let ids = Self::job_item_ids(&inner, job_id);
        for id in ids {
            let item = inner.items.get_mut(&id).unwrap();
            match WorkPhase::of(phase) {
                WorkPhase::Generate if item.status == ItemStatus::Running => {
                    item.status = ItemStatus::Failed;
                    item.finished_at = Some(now);
                    item.error = Some(reason.clone());
                }
                WorkPhase::Publish if item.publish_status == PublishStatus::Running => {
                    item.publish_status = PublishStatus::Failed;
                    item.publish_error = Some(reason.clone());
                }
                _ => {}
            }
        }
        Ok(true)
    }

    async fn retry_failed_items(&self, job_id: &str, phase: WorkPhase) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let ids = Self::job_item_ids(&inner, job_id);
        let mut reset = 0;
        for id in ids {
            let item = inner.items.get_mut(&id).unwrap();
            match phase {
                WorkPhase::Generate if item.status == ItemStatus::Failed => {
                    item.status = ItemStatus::Queued;
                    item.error = None;
                    item.started_at = None;
                    item.finished_at = None;
                    reset += 1;
                }
                WorkPhase::Publish if item.publish_status == PublishStatus::Failed => {
                    item.publish_status = PublishStatus::Queued;
                    item.publish_error = None;
                    reset += 1;
                }
                _ => {}
            }
        }
        if reset > 0 {
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.status = JobStatus::Queued;
                job.phase = match phase {
                    WorkPhase::Generate => JobPhase::Generating,
                    WorkPhase::Publish => JobPhase::Publishing,
                };
                job.last_error = None;
            }
        }
        Ok(reset)
    }

    async fn stage_publish_selection(
        &self,
        job_id: &str,
        selected: &[i64],
        apply_only_changed: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ids = Self::job_item_ids(&inner, job_id);
        for id in ids {
            let item = inner.items.get_mut(&id).unwrap();
            item.publish_status = if selected.contains(&id) {
                PublishStatus::Queued
            } else {
                PublishStatus::Skipped
            };
            item.publish_error = None;
            item.published_at = None;
        }
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.apply_only_changed = apply_only_changed;
            job.phase = JobPhase::Publishing;
            job.status = JobStatus::Queued;
        }
        Ok(())
    }

    async fn skip_items(&self, job_id: &str, item_ids: &[i64]) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut skipped = 0;
        for id in item_ids {
            if let Some(item) = inner.items.get_mut(id) {
                if item.job_id == job_id {
                    item.publish_status = PublishStatus::Skipped;
                    skipped += 1;
                }
            }
        }
        Ok(skipped)
    }

    async fn set_usage_reserved(&self, job_id: &str, count: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.usage_reserved = true;
            job.usage_count = count;
        }
        Ok(())
    }

    async fn list_jobs(
        &self,
        tenant: &str,
        filter: JobFilter,
        page: PageRequest,
    ) -> Result<JobPage> {
        let inner = self.inner.lock().unwrap();
        let cursor = page
            .cursor
            .as_deref()
            .map(Cursor::decode)
            .transpose()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.tenant == tenant)
            .filter(|j| filter.status.map(|s| j.status == s).unwrap_or(true))
            .filter(|j| filter.phase.map(|p| j.phase == p).unwrap_or(true))
            .filter(|j| filter.job_type.map(|t| j.job_type == t).unwrap_or(true))
            .filter(|j| {
                filter
                    .id_contains
                    .as_deref()
                    .map(|f| j.id.contains(f))
                    .unwrap_or(true)
            })
            .filter(|j| {
                cursor
                    .as_ref()
                    .map(|c| (j.created_at, j.id.as_str()) < (c.created_at, c.id.as_str()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));

        let limit = page.limit.clamp(1, 200) as usize;
        let next_cursor = if jobs.len() > limit {
            jobs.truncate(limit);
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
        let mut inner = self.inner.lock().unwrap();
        let job_ids: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| j.tenant == tenant)
            .map(|j| j.id.clone())
            .collect();
        for id in &job_ids {
            inner.jobs.remove(id);
        }
        inner.items.retain(|_, item| !job_ids.contains(&item.job_id));
        Ok(job_ids.len() as u64)
    }
}
