//! End-to-end generate-phase scenarios over the in-memory kernel.

mod common;

use common::{assert_counter_invariants, Harness};
use engine_core::kernel::{
    ItemStatus, JobPhase, JobStatus, MessageKind, Plan, PublishStatus,
};

#[tokio::test(start_paused = true)]
async fn happy_generate_fills_both_drafts() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);
    let p1 = harness.seed_product(1, "Trail Bike");
    let p2 = harness.seed_product(2, "City Bike");

    let job = harness.create_product_job("t1", &[p1, p2]).await;
    harness.pump().await;

    let job = harness.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.phase, JobPhase::Generated);
    assert_eq!(job.ok_count, 2);
    assert_eq!(job.failed_count, 0);
    assert!(job.started_at.is_some());
    assert!(job.finished_at.is_some());
    // Lease released after the run.
    assert!(job.lock_owner.is_none());
    assert!(job.lock_expires_at.is_none());

    let items = harness.items(&job.id).await;
    for item in &items {
        assert_eq!(item.status, ItemStatus::Success);
        assert_eq!(item.seo_title.as_deref(), Some("A"));
        assert_eq!(item.seo_description.as_deref(), Some("B"));
        assert!(item.finished_at.is_some());
    }
    assert_counter_invariants(&job, &items);
}

#[tokio::test(start_paused = true)]
async fn transient_generator_errors_retry_then_succeed() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);
    let p1 = harness.seed_product(1, "Trail Bike");

    // Two 503s, then valid JSON.
    harness.generator.push_service_unavailable();
    harness.generator.push_service_unavailable();

    let job = harness.create_product_job("t1", &[p1]).await;
    harness.pump().await;

    let job = harness.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.ok_count, 1);
    assert_eq!(job.total_attempts, 3);

    let items = harness.items(&job.id).await;
    assert_eq!(items[0].status, ItemStatus::Success);
    assert_eq!(items[0].gen_attempts, 3);
    // Two backoff sleeps from a 1 s base: ≥ 1500 ms + ≥ 3000 ms.
    assert!(items[0].gen_retry_wait_ms >= 4000, "waited {} ms", items[0].gen_retry_wait_ms);
    assert_eq!(job.total_retry_wait_ms, items[0].gen_retry_wait_ms);
}

#[tokio::test(start_paused = true)]
async fn per_item_failures_do_not_fail_the_job() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);
    let p1 = harness.seed_product(1, "Trail Bike");
    // Second item's product does not exist in the store.
    let ghost = "gid://store/Product/404".to_string();

    let job = harness.create_product_job("t1", &[p1, ghost]).await;
    harness.pump().await;

    let job = harness.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.ok_count, 1);
    assert_eq!(job.failed_count, 1);
    assert_eq!(job.last_error.as_deref(), Some("product not found"));

    let items = harness.items(&job.id).await;
    assert_eq!(items[0].status, ItemStatus::Success);
    assert_eq!(items[1].status, ItemStatus::Failed);
    assert_eq!(items[1].error.as_deref(), Some("product not found"));
    assert_counter_invariants(&job, &items);
}

#[tokio::test(start_paused = true)]
async fn empty_job_completes_without_external_calls() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);

    let job = harness.create_product_job("t1", &[]).await;
    harness.pump().await;

    let job = harness.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.phase, JobPhase::Generated);
    assert_eq!(harness.generator.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_phase_stops_at_the_item_boundary() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);
    let ids: Vec<String> = (1..=3).map(|n| harness.seed_product(n, "Bike")).collect();

    let job = harness.create_product_job("t1", &ids).await;
    // The user cancels while the first item's completion is in flight.
    harness
        .generator
        .cancel_job_at_call(harness.store.clone(), &job.id, 1);

    harness.pump().await;

    let job = harness.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    // Never finalized as Success.
    assert_ne!(job.phase, JobPhase::Generated);

    let items = harness.items(&job.id).await;
    // The in-flight item completed (at-least-one-extra-item semantics);
    // the rest were never started.
    assert_eq!(items[0].status, ItemStatus::Success);
    assert_eq!(items[1].status, ItemStatus::Queued);
    assert_eq!(items[2].status, ItemStatus::Queued);
    assert_eq!(harness.generator.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_before_dispatch_drops_the_delivery_and_messages() {
    let harness = Harness::new();
    harness.register_tenant("t1", Plan::Pro);
    let p1 = harness.seed_product(1, "Trail Bike");

    let job = harness.create_product_job("t1", &[p1]).await;
    let cancelled = harness.producer().cancel(&job.id).await.unwrap();
    assert!(cancelled);
    // Best-effort broker removal already emptied the queue.
    assert!(!harness.broker.contains(&job.id, MessageKind::Generate));

    harness.pump().await;
    let job = harness.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(harness.generator.calls(), 0);

    let items = harness.items(&job.id).await;
    assert_eq!(items[0].status, ItemStatus::Queued);
    assert_eq!(items[0].publish_status, PublishStatus::Queued);
}
