//! Aggregation engine integration tests over the memory stores.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use serde_json::json;
use tally_core::{Address, BucketInfo, DocumentStore, FileInfo, FileStatus, Kind};
use tally_engine::{AggregationEngine, EngineConfig, SummaryStore};
use tally_test_utils::{
    FailingDocumentStore, RecordingDocumentStore, TestContext, at, bucket_info, create, delete,
    event, init_test_logging, update, with_issuer,
};

async fn file(docs: &Arc<dyn DocumentStore>, path: &str) -> Option<FileInfo> {
    SummaryStore::new(docs.clone(), &EngineConfig::default())
        .file_infos_by_paths(&[path.to_string()])
        .await
        .unwrap()
        .remove(path)
}

async fn bucket(docs: &Arc<dyn DocumentStore>, address: &str) -> Option<BucketInfo> {
    SummaryStore::new(docs.clone(), &EngineConfig::default())
        .bucket_info(&Address::new(address).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn create_update_delete_rolls_up_to_zero() {
    init_test_logging();
    let ctx = TestContext::new();
    ctx.log([
        create("k1", "a/1", 10, 1_000),
        update("k2", "a/1", 15, 5, 2_000),
        delete("k3", "a/1", -15, 3_000),
    ]);

    let engine = AggregationEngine::new(ctx.doc_store(), EngineConfig::default()).unwrap();
    let report = engine.run().await.unwrap();

    assert_eq!(report.events_applied, 3);
    assert_eq!(report.file_infos_written, 1);
    assert_eq!(report.bucket_infos_written, 1);
    assert_eq!(report.watermark, at(3_000));
    assert!(!report.fetch_capped);

    let docs = ctx.doc_store();
    let info = file(&docs, "a/1").await.unwrap();
    assert_eq!(info.status, FileStatus::Deleted);
    assert_eq!(info.size, 15);
    assert_eq!(info.create_date, at(1_000));
    assert_eq!(info.update_date, at(3_000));

    let rollup = bucket(&docs, "a").await.unwrap();
    assert_eq!(rollup.item_count, 0);
    assert_eq!(rollup.total_size, 0);
    assert_eq!(rollup.issuer_address, "n/a");
    assert_eq!(rollup.create_date, at(1_000));
    assert_eq!(rollup.update_date, at(3_000));
}

#[tokio::test]
async fn later_runs_add_onto_stored_rollups() {
    let ctx = TestContext::new();
    ctx.log([
        create("k1", "a/1", 10, 1_000),
        with_issuer(create("k2", "a/2", 5, 2_000), "issuer-1"),
    ]);
    let engine = AggregationEngine::new(ctx.doc_store(), EngineConfig::default()).unwrap();
    engine.run().await.unwrap();

    ctx.log([update("k3", "a/1", 12, 2, 3_000), create("k4", "b/x", 7, 3_000)]);
    let report = engine.run().await.unwrap();
    assert_eq!(report.events_applied, 2);
    assert_eq!(report.previous_watermark, at(2_000));

    let docs = ctx.doc_store();
    let a = bucket(&docs, "a").await.unwrap();
    assert_eq!((a.item_count, a.total_size), (2, 17));
    assert_eq!(a.issuer_address, "issuer-1");
    assert_eq!(a.create_date, at(1_000));
    assert_eq!(a.update_date, at(3_000));

    let b = bucket(&docs, "b").await.unwrap();
    assert_eq!((b.item_count, b.total_size), (1, 7));

    let updated = file(&docs, "a/1").await.unwrap();
    assert_eq!(updated.size, 12);
    assert_eq!(updated.create_date, at(1_000));
}

#[tokio::test]
async fn second_run_without_new_events_writes_no_summaries() {
    let ctx = TestContext::new();
    ctx.log([
        create("k1", "a/1", 10, 1_000),
        create("k2", "a/2", 4, 2_000),
        create("k3", "b/1", 1, 2_000),
    ]);
    let recording = Arc::new(RecordingDocumentStore::new(ctx.doc_store()));
    let engine = AggregationEngine::new(recording.clone(), EngineConfig::default()).unwrap();

    engine.run().await.unwrap();
    recording.clear_operations();

    let report = engine.run().await.unwrap();
    assert_eq!(report.events_applied, 0);
    assert_eq!(report.events_skipped, 2);
    assert_eq!(report.file_infos_written, 0);
    assert_eq!(report.bucket_infos_written, 0);
    assert_eq!(recording.saves_of(Kind::FileInfo), 0);
    assert_eq!(recording.saves_of(Kind::BucketInfo), 0);
    assert_eq!(recording.saves_of(Kind::FileWorkLog), 1);
    assert_eq!(report.watermark, at(2_000));
}

#[tokio::test]
async fn tied_timestamps_survive_a_fetch_limit_of_one() {
    let ctx = TestContext::new();
    ctx.log([
        create("k1", "a/1", 1, 5_000),
        create("k2", "a/2", 2, 5_000),
        create("k3", "a/3", 3, 5_000),
    ]);
    let config = EngineConfig {
        fetch_limit: 1,
        min_retained_keys: 1,
        ..EngineConfig::default()
    };
    let engine = AggregationEngine::new(ctx.doc_store(), config).unwrap();

    for _ in 0..3 {
        let report = engine.run().await.unwrap();
        assert_eq!(report.events_applied, 1);
        assert!(report.fetch_capped);
        assert_eq!(report.watermark, at(5_000));
    }
    let report = engine.run().await.unwrap();
    assert_eq!(report.events_applied, 0);
    assert!(!report.fetch_capped);

    let rollup = bucket(&ctx.doc_store(), "a").await.unwrap();
    assert_eq!((rollup.item_count, rollup.total_size), (3, 6));
}

#[tokio::test]
async fn limit_reached_inside_a_short_page_reports_capped() {
    let ctx = TestContext::new();
    ctx.log([create("p1", "a/p", 1, 5_000)]);
    let config = EngineConfig {
        fetch_limit: 3,
        min_retained_keys: 1,
        ..EngineConfig::default()
    };
    let engine = AggregationEngine::new(ctx.doc_store(), config).unwrap();
    assert_eq!(engine.run().await.unwrap().events_applied, 1);

    ctx.log([
        create("n1", "a/1", 1, 6_000),
        create("n2", "a/2", 1, 7_000),
        create("n3", "a/3", 1, 8_000),
        create("n4", "a/4", 1, 9_000),
    ]);

    // The second page holds two new events but only one fits the budget.
    let report = engine.run().await.unwrap();
    assert_eq!(report.events_applied, 3);
    assert_eq!(report.events_skipped, 1);
    assert!(report.fetch_capped);
    assert_eq!(report.watermark, at(8_000));

    let report = engine.run().await.unwrap();
    assert_eq!(report.events_applied, 1);
    assert!(!report.fetch_capped);
    assert_eq!(report.watermark, at(9_000));

    let rollup = bucket(&ctx.doc_store(), "a").await.unwrap();
    assert_eq!((rollup.item_count, rollup.total_size), (5, 5));
}

#[tokio::test]
async fn event_arriving_at_the_watermark_is_applied_once() {
    let ctx = TestContext::new();
    ctx.log([create("k1", "a/1", 1, 5_000)]);
    let engine = AggregationEngine::new(ctx.doc_store(), EngineConfig::default()).unwrap();
    engine.run().await.unwrap();

    // Same timestamp as the watermark, written after the first run.
    ctx.log([create("k2", "a/2", 2, 5_000)]);
    let report = engine.run().await.unwrap();
    assert_eq!(report.events_skipped, 1);
    assert_eq!(report.events_applied, 1);

    let report = engine.run().await.unwrap();
    assert_eq!(report.events_applied, 0);

    let rollup = bucket(&ctx.doc_store(), "a").await.unwrap();
    assert_eq!((rollup.item_count, rollup.total_size), (2, 3));
}

#[tokio::test]
async fn unknown_actions_are_skipped_and_the_run_continues() {
    let ctx = TestContext::new();
    let mut renamed = create("k2", "a/2", 9, 2_000);
    renamed.action = "renameFile".into();
    ctx.log([
        create("k1", "a/1", 3, 1_000),
        renamed,
        event("k3", "nopath", tally_core::Action::Create, Some(1), 1, 3_000),
    ]);

    let engine = AggregationEngine::new(ctx.doc_store(), EngineConfig::default()).unwrap();
    let report = engine.run().await.unwrap();
    assert_eq!(report.events_applied, 1);
    assert_eq!(report.events_rejected, 2);
    assert_eq!(report.watermark, at(3_000));

    let docs = ctx.doc_store();
    assert!(file(&docs, "a/2").await.is_none());
    let rollup = bucket(&docs, "a").await.unwrap();
    assert_eq!((rollup.item_count, rollup.total_size), (1, 3));
}

#[tokio::test]
async fn failed_batch_keeps_the_checkpoint_and_the_next_run_converges() {
    init_test_logging();
    let ctx = TestContext::new();
    ctx.log([create("k1", "a/1", 10, 1_000), create("k2", "a/2", 5, 2_000)]);
    let failing = Arc::new(FailingDocumentStore::new(ctx.doc_store()));
    let engine = AggregationEngine::new(failing.clone(), EngineConfig::default()).unwrap();

    failing.fail_commits_touching(Kind::BucketInfo);
    assert!(engine.run().await.is_err());
    assert_eq!(ctx.docs.count(Kind::FileWorkLog).unwrap(), 0);
    assert_eq!(ctx.docs.count(Kind::BucketInfo).unwrap(), 0);

    failing.clear_failures();
    let report = engine.run().await.unwrap();
    assert_eq!(report.events_applied, 2);
    assert_eq!(report.file_infos_written, 0);
    assert_eq!(report.bucket_infos_written, 1);

    let rollup = bucket(&ctx.doc_store(), "a").await.unwrap();
    assert_eq!((rollup.item_count, rollup.total_size), (2, 15));
    assert_eq!(ctx.docs.count(Kind::FileWorkLog).unwrap(), 1);
}

#[tokio::test]
async fn writes_are_split_into_batches() {
    let ctx = TestContext::new();
    ctx.log((0..10).map(|i| create(&format!("k{i:02}"), &format!("a/{i}"), 1, 1_000 + i)));
    let recording = Arc::new(RecordingDocumentStore::new(ctx.doc_store()));
    let config = EngineConfig {
        write_batch_size: 4,
        ..EngineConfig::default()
    };
    let engine = AggregationEngine::new(recording.clone(), config).unwrap();

    let report = engine.run().await.unwrap();
    assert_eq!(report.file_infos_written, 10);
    assert_eq!(recording.saves_of(Kind::FileInfo), 10);
    assert_eq!(recording.largest_commit(), 4);
    // 3 FileInfo batches, 1 BucketInfo batch, 1 checkpoint.
    assert_eq!(recording.commits(), 5);
}

#[tokio::test]
async fn malformed_checkpoint_keys_are_read_as_empty() {
    let ctx = TestContext::new();
    ctx.docs
        .seed_raw(
            Kind::FileWorkLog,
            "c0",
            json!({"id": "c0", "lastKeys": {"bad": true}, "lastCreateDate": 5_000, "createDate": 5_000}),
        )
        .unwrap();
    ctx.docs.seed([bucket_info("a", "n/a", 1, 1, 4_000)]).unwrap();
    ctx.log([create("k1", "a/1", 1, 4_000), create("k2", "a/2", 2, 5_000)]);

    let engine = AggregationEngine::new(ctx.doc_store(), EngineConfig::default()).unwrap();
    let report = engine.run().await.unwrap();

    // Only events at or after the watermark are read; with no keys none are skipped.
    assert_eq!(report.previous_watermark, at(5_000));
    assert_eq!(report.events_skipped, 0);
    assert_eq!(report.events_applied, 1);
    let rollup = bucket(&ctx.doc_store(), "a").await.unwrap();
    assert_eq!((rollup.item_count, rollup.total_size), (2, 3));
}
