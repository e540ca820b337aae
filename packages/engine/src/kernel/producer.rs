//! Producer surface: create jobs, stage publishes, cancel, retry.
//!
//! This is what the UI/API layer calls. Work is persisted first, then
//! announced on the broker; the deterministic external id keeps repeated
//! announcements idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::broker::MessageKind;
use super::engine::EngineKernel;
use super::jobs::{DraftView, ItemSpec, Job, JobItem, JobSpec, JobType, TargetType, WorkPhase};
use super::store_api::{LiveSeo, SeoFlags, StoreApi};

pub struct Producer {
    kernel: Arc<EngineKernel>,
}

impl Producer {
    pub fn new(kernel: Arc<EngineKernel>) -> Self {
        Self { kernel }
    }

    /// Create a job with its items and enqueue the generate pass.
    pub async fn create_job(&self, spec: JobSpec, targets: Vec<ItemSpec>) -> Result<Job> {
        let job = self.kernel.store.create_job(spec, targets).await?;
        self.kernel.broker.enqueue(&job.id, MessageKind::Generate).await?;
        info!(job_id = %job.id, tenant = %job.tenant, total = job.total, "job created");
        Ok(job)
    }

    /// Stage the publish pass: selected items become eligible, the rest are
    /// skipped. With `apply_only_changed`, items whose drafts match the live
    /// store state are pruned before the worker ever sees them.
    pub async fn start_publish(
        &self,
        job_id: &str,
        selected: &[i64],
        apply_only_changed: bool,
    ) -> Result<()> {
        let job = self
            .kernel
            .store
            .get_job(job_id)
            .await?
            .context("job not found")?;

        self.kernel
            .store
            .stage_publish_selection(job_id, selected, apply_only_changed)
            .await?;

        if apply_only_changed {
            match self.find_unchanged(&job, selected).await {
                Ok(unchanged) if !unchanged.is_empty() => {
                    info!(job_id, count = unchanged.len(), "pruning no-change items");
                    self.kernel.store.skip_items(job_id, &unchanged).await?;
                }
                Ok(_) => {}
                // The live read is best effort; failing it publishes
                // everything selected rather than blocking the user.
                Err(e) => warn!(job_id, error = %e, "no-change pruning skipped"),
            }
        }

        self.kernel.broker.enqueue(job_id, MessageKind::Publish).await?;
        Ok(())
    }

    /// Cancel: persisted status first, then best-effort removal of both
    /// queued messages. An already-delivered message is handled by the
    /// phases' cancellation checks.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let cancelled = self
            .kernel
            .store
            .cancel_job(job_id, "Cancelled by user")
            .await?;
        self.kernel.broker.remove(job_id, MessageKind::Generate).await?;
        self.kernel.broker.remove(job_id, MessageKind::Publish).await?;
        if cancelled {
            info!(job_id, "job cancelled");
        }
        Ok(cancelled)
    }

    /// User retry: failed items of the current phase go back to queued and
    /// the matching message kind is re-enqueued.
    pub async fn retry_failed(&self, job_id: &str) -> Result<u64> {
        let job = self
            .kernel
            .store
            .get_job(job_id)
            .await?
            .context("job not found")?;
        let phase = WorkPhase::of(job.phase);
        let reset = self.kernel.store.retry_failed_items(job_id, phase).await?;
        if reset > 0 {
            let kind = match phase {
                WorkPhase::Generate => MessageKind::Generate,
                WorkPhase::Publish => MessageKind::Publish,
            };
            self.kernel.broker.enqueue(job_id, kind).await?;
            info!(job_id, reset, "failed items requeued");
        }
        Ok(reset)
    }

    /// Items among `selected` whose drafts would not change the live state.
    async fn find_unchanged(&self, job: &Job, selected: &[i64]) -> Result<Vec<i64>> {
        let Some(tenant) = self.kernel.tenants.get(&job.tenant).await? else {
            return Ok(Vec::new());
        };
        let store_api = self
            .kernel
            .store_apis
            .open(&tenant.api_endpoint, &tenant.api_token);

        let items: Vec<JobItem> = self
            .kernel
            .store
            .items_for_job(&job.id)
            .await?
            .into_iter()
            .filter(|i| selected.contains(&i.id))
            .collect();
        let flags = SeoFlags {
            title: job.meta_title,
            description: job.meta_description,
        };

        match job.job_type {
            JobType::ProductSeo => {
                let ids: Vec<String> = items.iter().map(|i| i.target_id.clone()).collect();
                let live = store_api.fetch_product_seo_batch(&ids).await?;
                Ok(prune_unchanged_seo(&items, &live, flags, job.job_type))
            }
            JobType::BlogSeo => {
                let ids: Vec<String> = items.iter().map(|i| i.target_id.clone()).collect();
                let live = store_api.fetch_article_seo_batch(&ids).await?;
                Ok(prune_unchanged_seo(&items, &live, flags, job.job_type))
            }
            JobType::ImageAlt => prune_unchanged_alts(&store_api, &items, job.job_type).await,
        }
    }
}

/// A SEO item is unchanged when every configured, non-empty draft field
/// equals the value the store currently serves (metafield first, native
/// second). Missing live entries are conservatively treated as changed.
pub fn prune_unchanged_seo(
    items: &[JobItem],
    live: &HashMap<String, LiveSeo>,
    flags: SeoFlags,
    job_type: JobType,
) -> Vec<i64> {
    items
        .iter()
        .filter(|item| {
            let Some(live) = live.get(&item.target_id) else {
                return false;
            };
            let (title, description) = match item.draft(job_type) {
                DraftView::Seo { title, description } => (title, description),
                DraftView::ImageAlt { .. } => return false,
            };
            let title_unchanged = field_unchanged(
                flags.title,
                title,
                live.meta_title.as_deref().or(live.native_title.as_deref()),
            );
            let description_unchanged = field_unchanged(
                flags.description,
                description,
                live.meta_description
                    .as_deref()
                    .or(live.native_description.as_deref()),
            );
            title_unchanged && description_unchanged
        })
        .map(|item| item.id)
        .collect()
}

fn field_unchanged(configured: bool, draft: Option<&str>, live: Option<&str>) -> bool {
    if !configured {
        return true;
    }
    match draft.map(str::trim).filter(|d| !d.is_empty()) {
        // An empty draft writes nothing, so nothing changes.
        None => true,
        Some(draft) => live.map(str::trim) == Some(draft),
    }
}

/// An image item is unchanged when the draft alt equals the live alt.
async fn prune_unchanged_alts(
    store_api: &Arc<dyn StoreApi>,
    items: &[JobItem],
    job_type: JobType,
) -> Result<Vec<i64>> {
    let mut live_by_media: HashMap<String, Option<String>> = HashMap::new();
    let mut parents: Vec<String> = items
        .iter()
        .filter_map(|i| i.parent_id.clone())
        .collect();
    parents.sort();
    parents.dedup();
    for parent in parents {
        for image in store_api.fetch_images(&parent).await? {
            live_by_media.insert(image.id, image.alt);
        }
    }

    Ok(items
        .iter()
        .filter(|item| {
            if item.target_type != TargetType::Image {
                return false;
            }
            let draft = match item.draft(job_type) {
                DraftView::ImageAlt { alt, .. } => alt.map(str::trim).filter(|a| !a.is_empty()),
                DraftView::Seo { .. } => None,
            };
            let Some(draft) = draft else {
                // Nothing to write.
                return true;
            };
            let Some(media_id) = item.media_id.as_deref() else {
                return false;
            };
            match live_by_media.get(media_id) {
                Some(Some(live)) => live.trim() == draft,
                _ => false,
            }
        })
        .map(|item| item.id)
        .collect())
}
