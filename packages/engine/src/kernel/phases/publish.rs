//! Publish phase: write approved drafts back to the store.
//!
//! Never touches generate-phase fields. An image success additionally
//! copies the published alt into the item's live-alt baseline so change
//! detection stops reporting it as edited.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::kernel::engine::EngineKernel;
use crate::kernel::jobs::{
    CounterDeltas, DraftView, ItemDraft, Job, JobItem, JobPhase, JobStatus, TargetType, WorkPhase,
};
use crate::kernel::lease::LeaseHandle;
use crate::kernel::store_api::{SeoFlags, StoreApi};
use crate::kernel::telemetry::ItemTelemetry;

pub async fn run_publish(
    kernel: &EngineKernel,
    job: &Job,
    store_api: &Arc<dyn StoreApi>,
    lease: &LeaseHandle,
) -> Result<()> {
    let store = &kernel.store;
    store
        .set_phase(&job.id, JobPhase::Publishing, JobStatus::Running)
        .await?;

    let items = store
        .next_items(&job.id, WorkPhase::Publish, kernel.settings.item_batch)
        .await?;

    // Nothing selected (or everything pruned): complete immediately so the
    // job does not hang in Publishing.
    if items.is_empty() {
        store
            .set_phase(&job.id, JobPhase::Published, JobStatus::Success)
            .await?;
        info!(job_id = %job.id, "publish phase had no eligible items");
        return Ok(());
    }

    info!(job_id = %job.id, tenant = %job.tenant, count = items.len(), "publish phase starting");
    let flags = SeoFlags {
        title: job.meta_title,
        description: job.meta_description,
    };

    for (index, item) in items.iter().enumerate() {
        if store.is_cancelled(&job.id).await? {
            info!(job_id = %job.id, "job cancelled, stopping publish phase");
            return Ok(());
        }
        lease.refresh().await?;
        store.mark_item_running(item.id, WorkPhase::Publish).await?;

        let telemetry = ItemTelemetry::new(
            store.clone(),
            lease.clone(),
            &job.id,
            item.id,
            WorkPhase::Publish,
            "store API",
        );

        match publish_item(store_api, job, item, flags, &telemetry).await {
            Ok(draft) => {
                store
                    .mark_item_success(item.id, WorkPhase::Publish, draft)
                    .await?;
                store
                    .increment_counters(
                        &job.id,
                        CounterDeltas { publish_ok: 1, ..Default::default() },
                    )
                    .await?;
                debug!(job_id = %job.id, item_id = item.id, "item published");
            }
            Err(message) => {
                store
                    .mark_item_failed(item.id, WorkPhase::Publish, &message)
                    .await?;
                store
                    .increment_counters(
                        &job.id,
                        CounterDeltas { publish_failed: 1, ..Default::default() },
                    )
                    .await?;
                store.set_last_error(&job.id, &message).await?;
                debug!(job_id = %job.id, item_id = item.id, error = %message, "publish failed");
            }
        }

        if index + 1 < items.len() {
            tokio::time::sleep(kernel.settings.publish_item_pause).await;
        }
    }

    if store.is_cancelled(&job.id).await? {
        return Ok(());
    }
    store
        .set_phase(&job.id, JobPhase::Published, JobStatus::Success)
        .await?;
    info!(job_id = %job.id, "publish phase finished");
    Ok(())
}

/// Write one item. Returns the draft follow-up write for image baselines.
async fn publish_item(
    store_api: &Arc<dyn StoreApi>,
    job: &Job,
    item: &JobItem,
    flags: SeoFlags,
    telemetry: &ItemTelemetry,
) -> Result<Option<ItemDraft>, String> {
    match item.target_type {
        TargetType::Product => {
            let (title, description) = seo_draft(item, job);
            store_api
                .write_product_seo(&item.target_id, title, description, flags, telemetry)
                .await
                .map_err(|e| e.user_message)?;
            Ok(None)
        }
        TargetType::Article => {
            let (title, description) = seo_draft(item, job);
            store_api
                .write_article_seo(&item.target_id, title, description, flags, telemetry)
                .await
                .map_err(|e| e.user_message)?;
            Ok(None)
        }
        TargetType::Image => {
            let alt = match item.draft(job.job_type) {
                DraftView::ImageAlt { alt: Some(alt), .. } if !alt.trim().is_empty() => {
                    alt.to_string()
                }
                _ => return Err("image item has no draft alt text".to_string()),
            };
            let media_id = item
                .media_id
                .as_deref()
                .ok_or_else(|| "image item has no media id".to_string())?;
            let parent_id = item
                .parent_id
                .as_deref()
                .ok_or_else(|| "image item has no parent product".to_string())?;
            store_api
                .write_image_alt(parent_id, media_id, &alt, telemetry)
                .await
                .map_err(|e| e.user_message)?;
            Ok(Some(ItemDraft::Alt {
                live_alt: Some(alt.clone()),
                alt,
            }))
        }
    }
}

fn seo_draft<'a>(item: &'a JobItem, job: &Job) -> (Option<&'a str>, Option<&'a str>) {
    match item.draft(job.job_type) {
        DraftView::Seo { title, description } => (title, description),
        DraftView::ImageAlt { .. } => (None, None),
    }
}
