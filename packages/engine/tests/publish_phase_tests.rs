//! End-to-end publish-phase scenarios over the in-memory kernel.

mod common;

use common::{assert_counter_invariants, Harness, WriteRecord};
use engine_core::kernel::store_api::StoreCallError;
use engine_core::kernel::{
    ItemSpec, JobPhase, JobStatus, JobType, Plan, PublishStatus, TargetType,
};

/// Generate drafts, then stage every item for publish.
async fn generated_job(harness: &Harness, product_ids: &[String]) -> String {
    let job = harness.create_product_job("t1", product_ids).await;
    harness.pump().await;
    job.id
}

#[tokio::test(start_paused = true)]
async fn publish_writes_drafts_and_completes() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);
    let p1 = harness.seed_product(1, "Trail Bike");
    let p2 = harness.seed_product(2, "City Bike");

    let job_id = generated_job(&harness, &[p1.clone(), p2.clone()]).await;
    let selected: Vec<i64> = harness.items(&job_id).await.iter().map(|i| i.id).collect();
    harness
        .producer()
        .start_publish(&job_id, &selected, false)
        .await
        .unwrap();
    harness.pump().await;

    let job = harness.job(&job_id).await;
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.phase, JobPhase::Published);
    assert_eq!(job.publish_ok_count, 2);
    assert_eq!(job.publish_failed_count, 0);
    assert!(job.publish_started_at.is_some());
    assert!(job.publish_finished_at.is_some());

    let writes = harness.store_api.writes();
    assert_eq!(writes.len(), 2);
    assert!(writes.iter().any(|w| matches!(
        w,
        WriteRecord::ProductSeo { id, title: Some(t), .. } if id == &p1 && t.as_str() == "A"
    )));

    let items = harness.items(&job_id).await;
    for item in &items {
        assert_eq!(item.publish_status, PublishStatus::Success);
        assert!(item.published_at.is_some());
    }
    assert_counter_invariants(&job, &items);
}

#[tokio::test(start_paused = true)]
async fn permanent_write_failure_fails_the_item_not_the_job() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);
    let p1 = harness.seed_product(1, "Trail Bike");
    let p2 = harness.seed_product(2, "City Bike");
    harness
        .store_api
        .fail_writes_for(&p1, StoreCallError::permanent("authentication failed"));

    let job_id = generated_job(&harness, &[p1.clone(), p2]).await;
    let selected: Vec<i64> = harness.items(&job_id).await.iter().map(|i| i.id).collect();
    harness
        .producer()
        .start_publish(&job_id, &selected, false)
        .await
        .unwrap();
    harness.pump().await;

    // The phase completes even with per-item failures.
    let job = harness.job(&job_id).await;
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.phase, JobPhase::Published);
    assert_eq!(job.publish_ok_count, 1);
    assert_eq!(job.publish_failed_count, 1);

    let items = harness.items(&job_id).await;
    assert_eq!(items[0].publish_status, PublishStatus::Failed);
    assert!(items[0]
        .publish_error
        .as_deref()
        .unwrap()
        .starts_with("authentication failed"));
    // Generate-phase fields untouched.
    assert_eq!(items[0].seo_title.as_deref(), Some("A"));
    assert_eq!(items[1].publish_status, PublishStatus::Success);
    assert_counter_invariants(&job, &items);
}

#[tokio::test(start_paused = true)]
async fn unselected_items_are_skipped() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);
    let p1 = harness.seed_product(1, "Trail Bike");
    let p2 = harness.seed_product(2, "City Bike");

    let job_id = generated_job(&harness, &[p1, p2]).await;
    let items = harness.items(&job_id).await;
    harness
        .producer()
        .start_publish(&job_id, &[items[0].id], false)
        .await
        .unwrap();
    harness.pump().await;

    let items = harness.items(&job_id).await;
    assert_eq!(items[0].publish_status, PublishStatus::Success);
    assert_eq!(items[1].publish_status, PublishStatus::Skipped);
    assert_eq!(harness.store_api.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn publish_with_no_eligible_items_completes_immediately() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);
    let p1 = harness.seed_product(1, "Trail Bike");

    let job_id = generated_job(&harness, &[p1]).await;
    harness
        .producer()
        .start_publish(&job_id, &[], false)
        .await
        .unwrap();
    harness.pump().await;

    let job = harness.job(&job_id).await;
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.phase, JobPhase::Published);
    assert!(harness.store_api.writes().is_empty());

    // Re-running an already-published job with nothing eligible is a no-op
    // transition back to Success, with no side effects on items.
    let before = harness.items(&job_id).await;
    harness
        .producer()
        .start_publish(&job_id, &[], false)
        .await
        .unwrap();
    harness.pump().await;
    let job = harness.job(&job_id).await;
    assert_eq!(job.status, JobStatus::Success);
    let after = harness.items(&job_id).await;
    assert_eq!(before.len(), after.len());
    assert!(harness.store_api.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn image_publish_copies_the_alt_baseline() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);
    let media_id = "gid://store/MediaImage/9";
    let product_id = harness.seed_product_with_image(1, "Trail Bike", media_id, "old alt");
    harness
        .generator
        .set_default_response(r#"{"altText":"a red trail bike"}"#);

    let item = ItemSpec::builder()
        .target_type(TargetType::Image)
        .target_id(media_id)
        .parent_id(Some(product_id.clone()))
        .media_id(Some(media_id.to_string()))
        .build();
    let job = harness
        .producer()
        .create_job(Harness::job_spec("t1", JobType::ImageAlt), vec![item])
        .await
        .unwrap();
    harness.pump().await;

    // Draft alt in seo_title, observed live alt as the baseline.
    let items = harness.items(&job.id).await;
    assert_eq!(items[0].seo_title.as_deref(), Some("a red trail bike"));
    assert_eq!(items[0].seo_description.as_deref(), Some("old alt"));

    harness
        .producer()
        .start_publish(&job.id, &[items[0].id], false)
        .await
        .unwrap();
    harness.pump().await;

    let items = harness.items(&job.id).await;
    assert_eq!(items[0].publish_status, PublishStatus::Success);
    // Baseline now reflects the published alt.
    assert_eq!(items[0].seo_description.as_deref(), Some("a red trail bike"));
    assert_eq!(
        harness.store_api.writes(),
        vec![WriteRecord::ImageAlt {
            product_id,
            media_id: media_id.to_string(),
            alt: "a red trail bike".to_string(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn apply_only_changed_prunes_identical_drafts() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);
    let p1 = harness.seed_product(1, "Trail Bike");
    let p2 = harness.seed_product(2, "City Bike");

    let job_id = generated_job(&harness, &[p1.clone(), p2]).await;
    // Make p1's live state match the draft exactly.
    {
        let mut products = harness.store_api.products.lock().unwrap();
        let snapshot = products.get_mut(&p1).unwrap();
        snapshot.seo.meta_title = Some("A".into());
        snapshot.seo.meta_description = Some("B".into());
    }

    let selected: Vec<i64> = harness.items(&job_id).await.iter().map(|i| i.id).collect();
    harness
        .producer()
        .start_publish(&job_id, &selected, true)
        .await
        .unwrap();
    harness.pump().await;

    let items = harness.items(&job_id).await;
    // p1 had nothing visibly to change at selection time.
    assert_eq!(items[0].publish_status, PublishStatus::Skipped);
    assert_eq!(items[1].publish_status, PublishStatus::Success);
    assert_eq!(harness.store_api.writes().len(), 1);
}
