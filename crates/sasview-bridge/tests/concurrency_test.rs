//! Serialization, fail-fast and timeout behaviour of the query lock.

mod common;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::{write_fixture, Event, Recorder, FIXTURE};
use sasview_bridge::{BridgeConfig, BridgeError, LockMode, RuntimeState};
use tempfile::TempDir;

fn fixture_dirs(n: usize) -> (Vec<TempDir>, Vec<PathBuf>) {
    let dirs: Vec<TempDir> = (0..n).map(|_| tempfile::tempdir().unwrap()).collect();
    let paths = dirs
        .iter()
        .map(|d| write_fixture(d.path(), "dm.sas7bdat", FIXTURE))
        .collect();
    (dirs, paths)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_initialize_provisions_once() {
    let recorder = Recorder::new();
    let runtime = recorder.runtime(BridgeConfig::default());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.initialize().await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().expect("initialize");
    }

    assert_eq!(runtime.state(), RuntimeState::Ready);
    assert_eq!(recorder.boots.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.installs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_state_changes_are_observable() {
    let recorder = Recorder::new();
    let runtime = recorder.runtime(BridgeConfig::default());
    let mut rx = runtime.subscribe();
    assert_eq!(*rx.borrow(), RuntimeState::Uninitialized);

    runtime.initialize().await.unwrap();
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), RuntimeState::Ready);

    runtime.teardown().await;
    assert_eq!(*rx.borrow_and_update(), RuntimeState::Destroyed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queries_never_overlap() {
    let recorder = Recorder::new();
    recorder.set_eval_delay(Duration::from_millis(30));
    let runtime = recorder.runtime(BridgeConfig::default());
    runtime.initialize().await.unwrap();

    let (_dirs, paths) = fixture_dirs(4);
    let tasks: Vec<_> = paths
        .iter()
        .cloned()
        .map(|path| {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.read_dataset(path, "all", "all").await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().len(), 3);
    }

    assert_eq!(
        recorder.mount_sequence(),
        [true, false, true, false, true, false, true, false]
    );
    assert_eq!(recorder.live_objects(), 0);
    assert!(!recorder.mount_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiters_are_served_in_arrival_order() {
    let recorder = Recorder::new();
    recorder.set_eval_delay(Duration::from_millis(100));
    let runtime = recorder.runtime(BridgeConfig::default());
    runtime.initialize().await.unwrap();

    let (dirs, paths) = fixture_dirs(3);
    let mut tasks = Vec::new();
    for path in paths {
        let runtime = runtime.clone();
        tasks.push(tokio::spawn(async move {
            runtime.read_dataset(path, "all", "all").await
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mounted: Vec<PathBuf> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Mount(dir) => Some(dir),
            _ => None,
        })
        .collect();
    let expected: Vec<PathBuf> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
    assert_eq!(mounted, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fail_fast_reports_busy() {
    let recorder = Recorder::new();
    recorder.set_eval_delay(Duration::from_millis(200));
    let runtime = recorder.runtime(BridgeConfig::default());
    runtime.initialize().await.unwrap();

    let (_dirs, paths) = fixture_dirs(2);
    let slow = {
        let runtime = runtime.clone();
        let path = paths[0].clone();
        tokio::spawn(async move { runtime.read_dataset(path, "all", "all").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = runtime.try_read_dataset(&paths[1], "all", "all").await.unwrap_err();
    assert!(matches!(err, BridgeError::Busy));
    assert!(err.is_retryable());

    assert_eq!(slow.await.unwrap().unwrap().len(), 3);
    assert_eq!(recorder.mount_sequence(), [true, false]);

    // Once the lock is free the same call goes through.
    recorder.set_eval_delay(Duration::ZERO);
    assert_eq!(runtime.try_read_dataset(&paths[1], "all", "all").await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fail_fast_lock_mode() {
    let recorder = Recorder::new();
    recorder.set_eval_delay(Duration::from_millis(200));
    let runtime = recorder.runtime(BridgeConfig::default().lock_mode(LockMode::FailFast));
    runtime.initialize().await.unwrap();

    let (_dirs, paths) = fixture_dirs(2);
    let slow = {
        let runtime = runtime.clone();
        let path = paths[0].clone();
        tokio::spawn(async move { runtime.read_dataset_shape(path).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = runtime.read_dataset(&paths[1], "all", "all").await.unwrap_err();
    assert!(matches!(err, BridgeError::Busy));
    assert_eq!(slow.await.unwrap().unwrap().rows, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_rebuilds_runtime() {
    let recorder = Recorder::new();
    recorder.set_eval_delay(Duration::from_millis(300));
    let runtime = recorder.runtime(BridgeConfig::default().query_timeout_ms(50));
    runtime.initialize().await.unwrap();

    let (_dirs, paths) = fixture_dirs(1);
    let err = runtime.read_dataset(&paths[0], "all", "all").await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(limit) if limit == Duration::from_millis(50)));
    assert!(err.is_retryable());

    // The abandoned evaluation keeps its old interpreter; the next caller
    // gets a fresh one without waiting for it.
    recorder.set_eval_delay(Duration::ZERO);
    let records = runtime.read_dataset(&paths[0], "all", "all").await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(recorder.boots.load(Ordering::SeqCst), 2);
    assert_eq!(runtime.state(), RuntimeState::Ready);

    // The old interpreter is shut down once its evaluation returns.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(recorder.events().contains(&Event::Shutdown));
    assert_eq!(recorder.live_objects(), 0);
    assert!(!recorder.mount_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_bounds_lock_wait() {
    let recorder = Recorder::new();
    recorder.set_eval_delay(Duration::from_millis(1500));
    let runtime = recorder.runtime(BridgeConfig::default().query_timeout_ms(100));
    runtime.initialize().await.unwrap();

    let (_dirs, paths) = fixture_dirs(2);
    let slow = {
        let runtime = runtime.clone();
        let path = paths[0].clone();
        tokio::spawn(async move { runtime.read_dataset(path, "all", "all").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let start = Instant::now();
    let err = runtime.read_dataset(&paths[1], "all", "all").await.unwrap_err();
    let waited = start.elapsed();
    assert!(matches!(err, BridgeError::Timeout(limit) if limit == Duration::from_millis(100)));
    assert!(waited < Duration::from_millis(500), "waited {:?}", waited);

    let err = slow.await.unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(_)));

    // The first evaluation is still sleeping; neither a new query nor
    // teardown waits for it.
    recorder.set_eval_delay(Duration::ZERO);
    let start = Instant::now();
    assert_eq!(runtime.read_dataset(&paths[1], "all", "all").await.unwrap().len(), 3);
    assert_eq!(recorder.boots.load(Ordering::SeqCst), 2);
    runtime.teardown().await;
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(runtime.state(), RuntimeState::Destroyed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_teardown_waits_at_most_the_query_timeout() {
    let recorder = Recorder::new();
    recorder.set_eval_delay(Duration::from_millis(1500));
    let runtime = recorder.runtime(BridgeConfig::default().query_timeout_ms(300));
    runtime.initialize().await.unwrap();

    let (_dirs, paths) = fixture_dirs(1);
    let slow = {
        let runtime = runtime.clone();
        let path = paths[0].clone();
        tokio::spawn(async move { runtime.read_dataset(path, "all", "all").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    runtime.teardown().await;
    assert!(start.elapsed() < Duration::from_millis(800));
    assert_eq!(runtime.state(), RuntimeState::Destroyed);
    assert!(matches!(slow.await.unwrap().unwrap_err(), BridgeError::Timeout(_)));

    // The abandoned interpreter finishing later must not touch the state.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(runtime.state(), RuntimeState::Destroyed);
    assert!(!recorder.mount_active());

    runtime.initialize().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Ready);
}
