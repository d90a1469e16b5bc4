//! Work queue integration tests
//!
//! Tests the bounded hand-off between completion callbacks and the worker
//! thread.
//!
//! # Test Scenarios
//! - Permits reserved on one thread, submitted from another
//! - Ordering of deferred jobs
//! - Results delivered back to an async caller
//! - Shutdown while jobs are queued
//!
//! Run with: `cargo test -p ffs-common --test work_queue_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::create_work_queue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::oneshot;

// ============================================================================
// Submission
// ============================================================================

#[test]
fn test_permit_submitted_from_other_thread() {
    let (queue, runner) = create_work_queue(1);
    let permit = queue.reserve().unwrap();
    assert!(queue.reserve().is_err());

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    thread::spawn(move || {
        permit
            .submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
    })
    .join()
    .unwrap();

    assert_eq!(runner.run_pending(), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(queue.reserve().is_ok());
}

#[test]
fn test_jobs_run_in_submission_order() {
    let (queue, runner) = create_work_queue(8);
    let order = Arc::new(Mutex::new(Vec::new()));
    for n in 0..5 {
        let order = order.clone();
        queue
            .submit(Box::new(move || order.lock().unwrap().push(n)))
            .unwrap();
    }
    queue.close();

    runner.spawn("order-test").unwrap().join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_concurrent_submitters_respect_capacity() {
    let (queue, runner) = create_work_queue(4);
    let accepted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let queue = queue.clone();
            let accepted = accepted.clone();
            thread::spawn(move || {
                if queue.submit(Box::new(|| {})).is_ok() {
                    accepted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 4);
    assert_eq!(queue.outstanding(), 4);
    assert_eq!(runner.run_pending(), 4);
    assert_eq!(queue.outstanding(), 0);
}

// ============================================================================
// Async delivery
// ============================================================================

#[tokio::test]
async fn test_result_reaches_async_caller() {
    let (queue, runner) = create_work_queue(2);
    let worker = runner.spawn("async-test").unwrap();

    let (tx, rx) = oneshot::channel();
    let permit = queue.reserve().unwrap();
    // Completion context: only hands the result over
    thread::spawn(move || {
        permit
            .submit(Box::new(move || {
                let _ = tx.send(42u32);
            }))
            .unwrap();
    });

    let value = with_timeout(DEFAULT_TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert_eq!(value, 42);

    queue.close();
    worker.join().expect("Worker thread panicked");
}

#[test]
fn test_close_drains_queued_jobs() {
    let (queue, runner) = create_work_queue(4);
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let ran = ran.clone();
        queue
            .submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
    }
    let unused = queue.reserve().unwrap();
    queue.close();

    assert!(unused.submit(Box::new(|| {})).is_err());
    runner.spawn("drain-test").unwrap().join().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert_eq!(queue.outstanding(), 0);
}
