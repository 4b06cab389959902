//! Reconciliation engine integration tests over the memory stores.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use async_trait::async_trait;
use tally_core::{
    Address, BlobMeta, BlobStore, DocumentStore, FileInfo, FileStatus, Kind, LogEvent,
    MemoryDocumentStore,
};
use tally_engine::{
    AggregationEngine, EngineConfig, IssueType, ReconciliationEngine, Severity, SummaryStore,
};
use tally_test_utils::{
    BACKUP, PRIMARY, RecordingDocumentStore, TestContext, at, bucket_info, create, file_info,
    init_test_logging,
};

fn summaries(docs: Arc<dyn DocumentStore>) -> SummaryStore {
    SummaryStore::new(docs, &EngineConfig::default())
}

async fn file(ctx: &TestContext, path: &str) -> Option<FileInfo> {
    summaries(ctx.doc_store())
        .file_infos_by_paths(&[path.to_string()])
        .await
        .unwrap()
        .remove(path)
}

#[tokio::test]
async fn missing_backup_and_summaries_are_repaired() {
    init_test_logging();
    let ctx = TestContext::new();
    ctx.put_primary("a/1", 4, 1_000);
    ctx.put_primary("a/2", 6, 2_000);
    ctx.put_backup("a/2", 6, 2_000);

    let engine = ReconciliationEngine::new(ctx.doc_store(), ctx.blob_store(), EngineConfig::default()).unwrap();
    let report = engine.run().await.unwrap();

    assert_eq!(report.primary_objects, 2);
    assert_eq!(report.backup_objects, 1);
    assert_eq!(report.backup_copies, vec!["a/1".to_string()]);
    assert_eq!(report.file_infos_written, 2);
    assert_eq!(report.bucket_infos_written, 1);
    assert!(!report.has_issues());
    assert!(ctx.blobs.contains(BACKUP, "a/1").unwrap());

    let info = file(&ctx, "a/1").await.unwrap();
    assert_eq!(info.status, FileStatus::Active);
    assert_eq!(info.size, 4);
    assert_eq!(info.create_date, at(1_000));

    let rollup = summaries(ctx.doc_store())
        .bucket_info(&Address::new("a").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((rollup.item_count, rollup.total_size), (2, 10));
    assert_eq!(rollup.issuer_address, "n/a");
    assert_eq!(rollup.create_date, at(1_000));
    assert_eq!(rollup.update_date, at(2_000));
}

#[tokio::test]
async fn stale_backup_copies_are_refreshed() {
    let ctx = TestContext::new();
    ctx.put_primary("a/1", 4, 2_000);
    ctx.put_backup("a/1", 3, 1_000);

    let engine = ReconciliationEngine::new(ctx.doc_store(), ctx.blob_store(), EngineConfig::default()).unwrap();
    let report = engine.run().await.unwrap();
    assert_eq!(report.backup_copies, vec!["a/1".to_string()]);

    let backup = ctx.blobs.list(BACKUP, "a/").await.unwrap();
    assert_eq!(backup[0].size, 4);
}

#[tokio::test]
async fn backup_only_objects_become_deleted_files() {
    let ctx = TestContext::new();
    ctx.put_primary("a/live", 2, 1_000);
    ctx.put_backup("a/live", 2, 1_000);
    ctx.put_backup("a/gone", 9, 1_500);
    ctx.docs
        .seed([file_info("a/gone", FileStatus::Active, 9, 500)])
        .unwrap();

    let engine = ReconciliationEngine::new(ctx.doc_store(), ctx.blob_store(), EngineConfig::default()).unwrap();
    engine.run().await.unwrap();

    let gone = file(&ctx, "a/gone").await.unwrap();
    assert_eq!(gone.status, FileStatus::Deleted);
    assert_eq!(gone.size, 9);
    assert_eq!(gone.create_date, at(500));
    assert_eq!(gone.update_date, at(1_500));

    let rollup = summaries(ctx.doc_store())
        .bucket_info(&Address::new("a").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((rollup.item_count, rollup.total_size), (1, 2));
}

#[tokio::test]
async fn stale_update_time_is_repaired() {
    let ctx = TestContext::new();
    ctx.put_primary("a/1", 3, 9_000);
    ctx.put_backup("a/1", 3, 9_000);
    ctx.docs
        .seed([file_info("a/1", FileStatus::Active, 3, 1_000)])
        .unwrap();

    let engine = ReconciliationEngine::new(ctx.doc_store(), ctx.blob_store(), EngineConfig::default()).unwrap();
    let report = engine.run().await.unwrap();
    assert_eq!(report.file_infos_written, 1);

    let info = file(&ctx, "a/1").await.unwrap();
    assert_eq!(info.update_date, at(9_000));
    assert_eq!(info.create_date, at(1_000));

    let report = engine.run().await.unwrap();
    assert_eq!(report.file_infos_written, 0);
}

#[tokio::test]
async fn rebuilt_rollups_keep_issuer_and_creation_time() {
    let ctx = TestContext::new();
    ctx.put_primary("a/1", 5, 3_000);
    ctx.put_backup("a/1", 5, 3_000);
    ctx.docs
        .seed([bucket_info("a", "issuer-9", 7, 70, 100)])
        .unwrap();

    let engine = ReconciliationEngine::new(ctx.doc_store(), ctx.blob_store(), EngineConfig::default()).unwrap();
    let report = engine.run().await.unwrap();
    assert_eq!(report.bucket_infos_written, 1);

    let rollup = summaries(ctx.doc_store())
        .bucket_info(&Address::new("a").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rollup.issuer_address, "issuer-9");
    assert_eq!(rollup.create_date, at(100));
    assert_eq!((rollup.item_count, rollup.total_size), (1, 5));
    assert_eq!(rollup.update_date, at(3_000));
}

#[tokio::test]
async fn orphans_are_reported_and_left_in_place() {
    let ctx = TestContext::new();
    ctx.put_primary("a/1", 1, 1_000);
    ctx.put_backup("a/1", 1, 1_000);
    ctx.docs
        .seed([file_info("a/ghost", FileStatus::Active, 3, 1_000)])
        .unwrap();
    ctx.docs.seed([bucket_info("z", "n/a", 4, 40, 1_000)]).unwrap();

    let engine = ReconciliationEngine::new(ctx.doc_store(), ctx.blob_store(), EngineConfig::default()).unwrap();
    let report = engine.run().await.unwrap();

    let orphan_files = report.issues_of_type(IssueType::OrphanedFileInfo);
    assert_eq!(orphan_files.len(), 1);
    assert_eq!(orphan_files[0].subject, "a/ghost");
    assert_eq!(orphan_files[0].severity, Severity::Warning);

    let orphan_buckets = report.issues_of_type(IssueType::OrphanedBucketInfo);
    assert_eq!(orphan_buckets.len(), 1);
    assert_eq!(orphan_buckets[0].subject, "z");

    assert!(file(&ctx, "a/ghost").await.is_some());
    let z = summaries(ctx.doc_store())
        .bucket_info(&Address::new("z").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((z.item_count, z.total_size), (4, 40));
}

#[tokio::test]
async fn invalid_object_paths_are_reported_and_not_copied() {
    let ctx = TestContext::new();
    ctx.put_primary("loose-object", 1, 1_000);
    ctx.put_primary("a/1", 1, 1_000);
    ctx.put_backup("a/1", 1, 1_000);

    let engine = ReconciliationEngine::new(ctx.doc_store(), ctx.blob_store(), EngineConfig::default()).unwrap();
    let report = engine.run().await.unwrap();

    let invalid = report.issues_of_type(IssueType::InvalidObjectPath);
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].subject, "primary/loose-object");
    assert_eq!(invalid[0].severity, Severity::Error);
    assert!(!ctx.blobs.contains(BACKUP, "loose-object").unwrap());
    assert!(file(&ctx, "loose-object").await.is_none());
    assert!(report.backup_copies.is_empty());
}

#[tokio::test]
async fn second_reconciliation_writes_nothing() {
    let ctx = TestContext::new();
    ctx.put_primary("a/1", 4, 1_000);
    ctx.put_primary("b/1", 6, 2_000);
    ctx.put_backup("c/old", 1, 500);

    let recording = Arc::new(RecordingDocumentStore::new(ctx.doc_store()));
    let engine = ReconciliationEngine::new(recording.clone(), ctx.blob_store(), EngineConfig::default()).unwrap();
    engine.run().await.unwrap();
    recording.clear_operations();

    let report = engine.run().await.unwrap();
    assert_eq!(report.file_infos_written, 0);
    assert_eq!(report.bucket_infos_written, 0);
    assert!(report.backup_copies.is_empty());
    assert_eq!(recording.saves_of(Kind::FileInfo), 0);
    assert_eq!(recording.saves_of(Kind::BucketInfo), 0);
    assert_eq!(recording.saves_of(Kind::FileWorkLog), 1);
}

#[tokio::test]
async fn checkpoint_covers_the_snapshot_for_later_aggregation() {
    let ctx = TestContext::new();
    ctx.log([create("k1", "a/1", 4, 1_000)]);
    ctx.put_primary("a/1", 4, 1_000);

    let config = EngineConfig::default();
    let reconcile = ReconciliationEngine::new(ctx.doc_store(), ctx.blob_store(), config.clone()).unwrap();
    let report = reconcile.run().await.unwrap();
    assert_eq!(report.snapshot_events, 1);
    assert_eq!(report.snapshot_watermark, at(1_000));
    assert_eq!(report.watermark, at(1_000));

    let aggregate = AggregationEngine::new(ctx.doc_store(), config).unwrap();
    let report = aggregate.run().await.unwrap();
    assert_eq!(report.events_skipped, 1);
    assert_eq!(report.events_applied, 0);

    let rollup = summaries(ctx.doc_store())
        .bucket_info(&Address::new("a").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((rollup.item_count, rollup.total_size), (1, 4));
}

/// Blob store that appends a log event the first time the primary bucket is listed.
struct RacingBlobStore {
    inner: Arc<dyn BlobStore>,
    docs: Arc<MemoryDocumentStore>,
    racer: std::sync::Mutex<Option<LogEvent>>,
}

#[async_trait]
impl BlobStore for RacingBlobStore {
    async fn list(&self, bucket: &str, prefix: &str) -> tally_core::Result<Vec<BlobMeta>> {
        let racer = if bucket == PRIMARY {
            self.racer.lock().unwrap().take()
        } else {
            None
        };
        if let Some(event) = racer {
            self.docs.seed([event])?;
        }
        self.inner.list(bucket, prefix).await
    }

    async fn copy(&self, src_bucket: &str, path: &str, dst_bucket: &str) -> tally_core::Result<()> {
        self.inner.copy(src_bucket, path, dst_bucket).await
    }

    async fn delete(&self, bucket: &str, path: &str) -> tally_core::Result<()> {
        self.inner.delete(bucket, path).await
    }
}

#[tokio::test]
async fn events_written_during_the_scan_are_reported() {
    let ctx = TestContext::new();
    ctx.log([create("k1", "a/1", 4, 1_000)]);
    ctx.put_primary("a/1", 4, 1_000);
    ctx.put_backup("a/1", 4, 1_000);

    let blobs = Arc::new(RacingBlobStore {
        inner: ctx.blob_store(),
        docs: ctx.docs.clone(),
        racer: std::sync::Mutex::new(Some(create("k2", "a/2", 8, 2_000))),
    });
    let engine = ReconciliationEngine::new(ctx.doc_store(), blobs, EngineConfig::default()).unwrap();
    let report = engine.run().await.unwrap();

    let raced = report.issues_of_type(IssueType::RacedEvent);
    assert_eq!(raced.len(), 1);
    assert_eq!(raced[0].subject, "k2");

    // The raced event stays beyond the checkpoint for the next aggregation run.
    assert_eq!(report.watermark, at(1_000));
    let aggregate = AggregationEngine::new(ctx.doc_store(), EngineConfig::default()).unwrap();
    let report = aggregate.run().await.unwrap();
    assert_eq!(report.events_applied, 1);
}
