//! Tests for the streaming row pipeline

mod common;

use common::people;
use parking_lot::Mutex;
use rivven_dbkit::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn id_of(row: Row) -> Result<i64> {
    row.get_by_name("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::type_conversion("id"))
}

async fn collect_ids(options: StreamOptions, rows: usize) -> (Vec<i64>, StreamSummary) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let pipeline = RowPipeline::new(id_of).with_options(options);
    let mut source = VecRowStream::new(people(rows));

    let summary = pipeline
        .run(&mut source, move |id| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(id);
                Ok(())
            }
        })
        .await
        .unwrap();

    let mut ids = seen.lock().clone();
    ids.sort_unstable();
    (ids, summary)
}

// ==================== Window Exactness ====================

#[tokio::test]
async fn test_window_exact_across_worker_counts() {
    for workers in [0, 1, 4] {
        let options = StreamOptions::new()
            .with_offset(10)
            .with_count(25)
            .with_workers(workers)
            .with_queue_size(8);
        let (ids, summary) = collect_ids(options, 100).await;

        assert_eq!(ids, (10..35).collect::<Vec<i64>>(), "workers = {}", workers);
        assert_eq!(summary.rows_skipped, 10);
        assert_eq!(summary.rows_delivered, 25);
        assert_eq!(summary.rows_processed, 25);
    }
}

#[tokio::test]
async fn test_window_past_end_delivers_nothing() {
    for workers in [0, 3] {
        let options = StreamOptions::new().with_offset(50).with_workers(workers);
        let (ids, summary) = collect_ids(options, 20).await;
        assert!(ids.is_empty());
        assert_eq!(summary.rows_read, 20);
        assert_eq!(summary.rows_skipped, 20);
    }
}

#[tokio::test]
async fn test_count_stops_reading_early() {
    let pipeline = RowPipeline::new(id_of).with_options(StreamOptions::new().with_count(5));
    let mut source = VecRowStream::new(people(50));

    let summary = pipeline
        .run(&mut source, |_| async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(summary.rows_read, 5);
    assert_eq!(source.remaining(), 45);
}

#[tokio::test]
async fn test_predicate_applies_after_offset() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let pipeline = RowPipeline::new(id_of)
        .with_options(StreamOptions::new().with_offset(4).with_count(3))
        .with_predicate(|row: &Row| row.get_by_name("id").and_then(Value::as_i64).is_some_and(|id| id % 2 == 0));
    let mut source = VecRowStream::new(people(20));

    let summary = pipeline
        .run(&mut source, move |id| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(id);
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(*seen.lock(), vec![4, 6, 8]);
    assert_eq!(summary.rows_skipped, 4);
    assert_eq!(summary.rows_filtered, 2);
}

// ==================== Failure Containment ====================

#[tokio::test]
async fn test_callback_failure_stops_run() {
    for workers in [0, 1, 4] {
        let completed = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&completed);
        let pipeline = RowPipeline::new(id_of)
            .with_options(StreamOptions::new().with_workers(workers).with_queue_size(4));
        let mut source = VecRowStream::new(people(200));

        let err = pipeline
            .run_with_completion(
                &mut source,
                |id| async move {
                    if id == 7 {
                        Err(Error::query("bad row"))
                    } else {
                        Ok(())
                    }
                },
                || async move {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Worker { row: 7, .. }), "workers = {}", workers);
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        // The reader stops early instead of draining the cursor.
        assert!(source.remaining() > 0, "workers = {}", workers);
    }
}

#[tokio::test]
async fn test_panicking_callback_fails_without_hanging() {
    for workers in [1, 4] {
        let pipeline = RowPipeline::new(id_of)
            .with_options(StreamOptions::new().with_workers(workers).with_queue_size(2));
        let mut source = VecRowStream::new(people(100));

        let run = pipeline.run(&mut source, |id| async move {
            if id >= 0 {
                panic!("callback exploded on {}", id);
            }
            Ok(())
        });
        let err = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("pipeline hung after worker panic")
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Worker, "workers = {}", workers);
        assert!(err.to_string().contains("callback exploded"));
        assert!(source.remaining() > 50, "workers = {}", workers);
    }
}

#[tokio::test]
async fn test_single_panic_stops_surviving_workers() {
    for workers in [1, 4] {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let pipeline = RowPipeline::new(id_of)
            .with_options(StreamOptions::new().with_workers(workers).with_queue_size(2));
        let mut source = VecRowStream::new(people(500));

        let run = pipeline.run(&mut source, move |id| {
            let counter = Arc::clone(&counter);
            async move {
                if id == 3 {
                    panic!("row 3 is poisoned");
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let err = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("pipeline hung after worker panic")
            .unwrap_err();

        assert!(matches!(err, Error::Worker { row: 3, .. }), "workers = {}", workers);
        assert!(processed.load(Ordering::SeqCst) < 100, "workers = {}", workers);
        assert!(source.remaining() > 0);
    }
}

#[tokio::test]
async fn test_decode_failure_is_reported() {
    let pipeline = RowPipeline::new(|_row: Row| -> Result<i64> {
        Err(Error::type_conversion("cannot decode"))
    })
    .with_options(StreamOptions::new().with_workers(2));
    let mut source = VecRowStream::new(people(10));

    let err = pipeline
        .run(&mut source, |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TypeConversion { .. }));
}

// ==================== Completion ====================

#[tokio::test]
async fn test_completion_runs_once_after_all_rows() {
    for workers in [0, 1, 4] {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let seen_at_completion = Arc::new(AtomicUsize::new(usize::MAX));
        let completions = Arc::new(AtomicUsize::new(0));

        let pipeline = RowPipeline::new(id_of)
            .with_options(StreamOptions::new().with_workers(workers).with_queue_size(2));
        let mut source = VecRowStream::new(people(64));

        let at_completion = Arc::clone(&seen_at_completion);
        let calls = Arc::clone(&completions);
        let snapshot = Arc::clone(&processed);
        let summary = pipeline
            .run_with_completion(
                &mut source,
                move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        tokio::task::yield_now().await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    at_completion.store(snapshot.load(Ordering::SeqCst), Ordering::SeqCst);
                    Ok(())
                },
            )
            .await
            .unwrap();

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(seen_at_completion.load(Ordering::SeqCst), 64);
        assert_eq!(summary.rows_processed, 64);
    }
}

#[tokio::test]
async fn test_completion_failure_is_wrapped() {
    let pipeline = RowPipeline::new(id_of);
    let mut source = VecRowStream::new(people(3));

    let err = pipeline
        .run_with_completion(
            &mut source,
            |_| async { Ok(()) },
            || async { Err(Error::query("flush failed")) },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Completion { .. }));
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let pipeline = RowPipeline::new(id_of)
        .with_options(StreamOptions::new().with_workers(2).with_queue_size(0));
    let mut source = VecRowStream::new(people(3));
    assert!(pipeline.run(&mut source, |_| async { Ok(()) }).await.is_err());
}
