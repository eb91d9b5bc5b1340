//! Tests for batch execution

mod common;

use common::{init_test_logging, Event, MockProvider};
use futures::stream;
use rivven_dbkit::prelude::*;
use std::sync::Arc;

const INSERT: &str = "INSERT INTO people (id, name) VALUES (:id, :name)";

fn entries(n: usize) -> Vec<Params> {
    (0..n)
        .map(|i| {
            Params::named([
                ("id", Value::Int64(i as i64)),
                ("name", Value::String(format!("person-{}", i))),
            ])
        })
        .collect()
}

// ==================== Flush Arithmetic ====================

#[tokio::test]
async fn test_flush_count_is_ceiling() {
    const B: usize = 5;
    for m in [0, 1, B - 1, B, B + 1, 3 * B] {
        let provider = MockProvider::new();
        let db = SqlExecutor::new(provider.as_provider());
        let ctx = ExecutionContext::new();

        let result = db
            .batch_with(&ctx, INSERT, entries(m), BatchConfig::new(B))
            .await
            .unwrap();

        let expected_flushes = m.div_ceil(B);
        assert_eq!(result.flushes as usize, expected_flushes, "m = {}", m);
        assert_eq!(result.rows_submitted as usize, m);
        assert_eq!(result.rows_affected as usize, m);

        let sizes = provider.connection(0).flush_sizes();
        assert_eq!(sizes.len(), expected_flushes);
        assert_eq!(sizes.iter().sum::<usize>(), m);
        assert!(sizes.iter().all(|&s| s > 0 && s <= B));
        assert_eq!(provider.outstanding(), 0);
    }
}

#[tokio::test]
async fn test_entries_bound_in_order() {
    let provider = MockProvider::new();
    let db = SqlExecutor::new(provider.as_provider());
    let ctx = ExecutionContext::new();

    db.batch_with(&ctx, INSERT, entries(3), BatchConfig::new(2))
        .await
        .unwrap();

    let conn = provider.connection(0);
    assert_eq!(conn.prepared(), vec!["INSERT INTO people (id, name) VALUES (?, ?)"]);
    assert_eq!(
        conn.executed(),
        vec![
            vec![Value::Int64(0), Value::String("person-0".into())],
            vec![Value::Int64(1), Value::String("person-1".into())],
            vec![Value::Int64(2), Value::String("person-2".into())],
        ]
    );
}

// ==================== Auto-commit Suspension ====================

#[tokio::test]
async fn test_multi_flush_batch_commits_once() {
    let provider = MockProvider::new();
    let db = SqlExecutor::new(provider.as_provider());
    let ctx = ExecutionContext::new();

    db.batch_with(&ctx, INSERT, entries(7), BatchConfig::new(3))
        .await
        .unwrap();

    let conn = provider.connection(0);
    assert_eq!(conn.count(&Event::AutoCommit(false)), 1);
    assert_eq!(conn.count(&Event::Commit), 1);
    assert!(conn.is_auto_commit());

    let events = conn.events();
    let last_flush = events
        .iter()
        .rposition(|e| matches!(e, Event::Flush(_)))
        .unwrap();
    let commit = events.iter().position(|e| *e == Event::Commit).unwrap();
    assert!(commit > last_flush);
}

#[tokio::test]
async fn test_single_flush_batch_keeps_auto_commit() {
    let provider = MockProvider::new();
    let db = SqlExecutor::new(provider.as_provider());
    let ctx = ExecutionContext::new();

    db.batch_with(&ctx, INSERT, entries(3), BatchConfig::new(3))
        .await
        .unwrap();

    let conn = provider.connection(0);
    assert_eq!(conn.count(&Event::AutoCommit(false)), 0);
    assert_eq!(conn.count(&Event::Commit), 0);
}

#[tokio::test]
async fn test_suspension_can_be_disabled() {
    let provider = MockProvider::new();
    let db = SqlExecutor::new(provider.as_provider());
    let ctx = ExecutionContext::new();

    db.batch_with(
        &ctx,
        INSERT,
        entries(10),
        BatchConfig::new(3).with_suspend_auto_commit(false),
    )
    .await
    .unwrap();

    let conn = provider.connection(0);
    assert_eq!(conn.count(&Event::AutoCommit(false)), 0);
    assert_eq!(conn.flush_sizes(), vec![3, 3, 3, 1]);
}

#[tokio::test]
async fn test_failed_flush_rolls_back_and_restores() {
    init_test_logging();
    let provider = MockProvider::new().with_failing_flush(2);
    let db = SqlExecutor::new(provider.as_provider());
    let ctx = ExecutionContext::new();

    let err = db
        .batch_with(&ctx, INSERT, entries(9), BatchConfig::new(3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Query { .. }));

    let conn = provider.connection(0);
    assert_eq!(conn.flush_sizes(), vec![3]);
    assert_eq!(conn.count(&Event::Commit), 0);
    assert_eq!(conn.count(&Event::Rollback), 1);
    assert!(conn.is_auto_commit());
    assert_eq!(conn.count(&Event::StatementClosed), 1);
    assert_eq!(provider.outstanding(), 0);
}

#[tokio::test]
async fn test_batch_inside_transaction_defers_commit() {
    let provider = MockProvider::new();
    let db = SqlExecutor::new(provider.as_provider());
    let ctx = ExecutionContext::new();

    let mut tx = db.begin(&ctx, TransactionOptions::default()).await.unwrap();
    db.batch_with(&ctx, INSERT, entries(10), BatchConfig::new(4))
        .await
        .unwrap();

    let conn = provider.connection(0);
    assert_eq!(conn.flush_sizes(), vec![4, 4, 2]);
    assert_eq!(conn.count(&Event::Commit), 0);
    assert_eq!(conn.count(&Event::AutoCommit(false)), 1);

    tx.commit().await.unwrap();
    assert_eq!(conn.count(&Event::Commit), 1);
    assert_eq!(provider.acquired(), 1);
}

// ==================== Filtered / Streamed Input ====================

#[tokio::test]
async fn test_filtered_batch_skips_rejected_entries() {
    let provider = MockProvider::new();
    let db = SqlExecutor::new(provider.as_provider());
    let ctx = ExecutionContext::new();

    let mut query = db.prepare(&ctx, INSERT).await.unwrap();
    let result = rivven_dbkit::batch::execute_batch_filtered(
        &mut query,
        entries(10),
        BatchConfig::new(4),
        |params| match params {
            Params::Named(map) => map.get("id").and_then(Value::as_i64).is_some_and(|id| id % 2 == 0),
            _ => false,
        },
    )
    .await
    .unwrap();
    query.close().await.unwrap();

    assert_eq!(result.rows_submitted, 5);
    assert_eq!(result.flushes, 2);
    assert_eq!(provider.connection(0).flush_sizes(), vec![4, 1]);
}

#[tokio::test]
async fn test_stream_batch_stops_on_producer_error() {
    let provider = MockProvider::new();
    let db = SqlExecutor::new(provider.as_provider());
    let ctx = ExecutionContext::new();

    let mut items: Vec<Result<Params>> = entries(5).into_iter().map(Ok).collect();
    items.push(Err(Error::type_conversion("bad entry")));
    items.extend(entries(5).into_iter().map(Ok));

    let err = db
        .batch_stream(&ctx, INSERT, stream::iter(items))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TypeConversion { .. }));

    let conn = provider.connection(0);
    // Unknown input size suspends auto-commit; the failure rolls it back.
    assert_eq!(conn.count(&Event::AutoCommit(false)), 1);
    assert_eq!(conn.count(&Event::Rollback), 1);
    assert!(conn.is_auto_commit());
}

#[tokio::test]
async fn test_batch_stats_are_recorded() {
    let provider = MockProvider::new();
    let db = SqlExecutor::new(provider.as_provider());
    let ctx = ExecutionContext::new();
    let stats = Arc::new(AtomicBatchStats::default());

    let mut query = db.prepare(&ctx, INSERT).await.unwrap();
    let mut job = BatchJob::start(&mut query, BatchConfig::new(2), Some(5))
        .await
        .unwrap()
        .with_stats(Arc::clone(&stats));
    for params in entries(5) {
        job.add(&params).await.unwrap();
    }
    assert_eq!(job.pending(), 1);
    assert!(job.is_auto_commit_suspended());
    let result = job.finish().await.unwrap();
    query.close().await.unwrap();

    assert_eq!(result.flushes, 3);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.flushes, 3);
    assert_eq!(snapshot.rows_flushed, 5);
}

#[tokio::test]
async fn test_zero_batch_size_rejected() {
    let provider = MockProvider::new();
    let db = SqlExecutor::new(provider.as_provider());
    let ctx = ExecutionContext::new();

    assert!(db
        .batch_with(&ctx, INSERT, entries(1), BatchConfig::new(0))
        .await
        .is_err());
    assert_eq!(provider.acquired(), 0);
}
