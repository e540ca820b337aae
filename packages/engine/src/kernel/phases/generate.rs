//! Generate phase: fill item drafts from the text-completion service.
//!
//! Items run strictly sequentially in ascending id order. The loop checks
//! for cancellation and refreshes the lease at every item boundary, and
//! pauses between items to pace both external services.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::kernel::engine::EngineKernel;
use crate::kernel::generator::{GeneratedFields, GenerationHints, TargetPayload};
use crate::kernel::jobs::{
    CounterDeltas, ItemDraft, Job, JobItem, JobPhase, JobStatus, TargetType, WorkPhase,
};
use crate::kernel::lease::LeaseHandle;
use crate::kernel::store_api::StoreApi;
use crate::kernel::telemetry::ItemTelemetry;

pub async fn run_generate(
    kernel: &EngineKernel,
    job: &Job,
    store_api: &Arc<dyn StoreApi>,
    lease: &LeaseHandle,
) -> Result<()> {
    let store = &kernel.store;
    store
        .set_phase(&job.id, JobPhase::Generating, JobStatus::Running)
        .await?;

    let hints = GenerationHints::from_value(&job.generation_hints);
    let items = store
        .next_items(&job.id, WorkPhase::Generate, kernel.settings.item_batch)
        .await?;
    info!(job_id = %job.id, tenant = %job.tenant, count = items.len(), "generate phase starting");

    for (index, item) in items.iter().enumerate() {
        if store.is_cancelled(&job.id).await? {
            info!(job_id = %job.id, "job cancelled, stopping generate phase");
            return Ok(());
        }
        lease.refresh().await?;
        store.mark_item_running(item.id, WorkPhase::Generate).await?;

        let telemetry = ItemTelemetry::new(
            store.clone(),
            lease.clone(),
            &job.id,
            item.id,
            WorkPhase::Generate,
            "generator",
        );

        let outcome = match load_payload(store_api, item).await {
            Ok(payload) => {
                match kernel
                    .generator
                    .generate(job.job_type, &job.language, &hints, &payload, &telemetry)
                    .await
                {
                    Ok(fields) => Ok((fields, payload)),
                    Err(e) => Err(e.user_message),
                }
            }
            Err(message) => Err(message),
        };

        match outcome {
            Ok((fields, payload)) => {
                let draft = draft_for(fields, &payload);
                store
                    .mark_item_success(item.id, WorkPhase::Generate, Some(draft))
                    .await?;
                store
                    .increment_counters(&job.id, CounterDeltas { ok: 1, ..Default::default() })
                    .await?;
                debug!(job_id = %job.id, item_id = item.id, "draft generated");
            }
            Err(message) => {
                store
                    .mark_item_failed(item.id, WorkPhase::Generate, &message)
                    .await?;
                store
                    .increment_counters(&job.id, CounterDeltas { failed: 1, ..Default::default() })
                    .await?;
                store.set_last_error(&job.id, &message).await?;
                debug!(job_id = %job.id, item_id = item.id, error = %message, "item failed");
            }
        }

        if index + 1 < items.len() {
            tokio::time::sleep(kernel.settings.generate_item_pause).await;
        }
    }

    if store.is_cancelled(&job.id).await? {
        return Ok(());
    }
    store
        .set_phase(&job.id, JobPhase::Generated, JobStatus::Success)
        .await?;
    info!(job_id = %job.id, "generate phase finished");
    Ok(())
}

/// Load the target entity behind an item. Errors are user-presentable.
async fn load_payload(
    store_api: &Arc<dyn StoreApi>,
    item: &JobItem,
) -> Result<TargetPayload, String> {
    match item.target_type {
        TargetType::Product => {
            let product = store_api
                .fetch_product(&item.target_id)
                .await
                .map_err(|e| e.user_message)?;
            Ok(TargetPayload::Product {
                title: product.title,
                description: product.description_html,
            })
        }
        TargetType::Article => {
            let article = store_api
                .fetch_article(&item.target_id)
                .await
                .map_err(|e| e.user_message)?;
            Ok(TargetPayload::Article {
                title: article.title,
                body: article.body,
            })
        }
        TargetType::Image => {
            let media_id = item
                .media_id
                .as_deref()
                .ok_or_else(|| "image item has no media id".to_string())?;
            let parent_id = item
                .parent_id
                .as_deref()
                .ok_or_else(|| "image item has no parent product".to_string())?;
            let product = store_api
                .fetch_product(parent_id)
                .await
                .map_err(|e| e.user_message)?;
            let media = product.media.iter().find(|m| m.id == media_id);
            Ok(TargetPayload::Image {
                product_title: product.title,
                image_url: media
                    .and_then(|m| m.url.clone())
                    .or_else(|| item.image_url.clone()),
                current_alt: media.and_then(|m| m.alt.clone()),
            })
        }
    }
}

/// Map accepted fields into the item's draft columns. Image drafts also
/// capture the live alt baseline observed at generation time.
fn draft_for(fields: GeneratedFields, payload: &TargetPayload) -> ItemDraft {
    match fields {
        GeneratedFields::Seo { title, description } => ItemDraft::Seo {
            title: Some(title),
            description: Some(description),
        },
        GeneratedFields::Alt { text } => {
            let live_alt = match payload {
                TargetPayload::Image { current_alt, .. } => current_alt.clone(),
                _ => None,
            };
            ItemDraft::Alt {
                alt: text,
                live_alt,
            }
        }
    }
}
