use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskledger_core::{
    Clock, ExecutionRepository, LeaseLock, LeaseSettings, LockRegistry, LockStore, ManualClock,
    MemoryExecutionRepository, MemoryLockStore, MemorySequence, NewExecution, PageRequest,
    SequenceGenerator, SystemClock, TaskConfig,
};

fn settings(ttl: Duration, retry: Duration) -> LeaseSettings {
    LeaseSettings {
        ttl,
        retry_interval: retry,
        clock_skew_tolerance: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_find_by_name_pagination() {
    let clock = Arc::new(ManualClock::default());
    let repo = MemoryExecutionRepository::new(Arc::new(MemorySequence::new()), clock.clone());

    for _ in 0..25 {
        clock.advance(ChronoDuration::seconds(1));
        repo.create(NewExecution::new("nightly-job", clock.now()))
            .await
            .unwrap();
    }
    repo.create(NewExecution::new("other-job", clock.now()))
        .await
        .unwrap();

    let first = repo
        .find_by_name("nightly-job", PageRequest::new(0, 10).unwrap())
        .await
        .unwrap();
    assert_eq!(first.items.len(), 10);
    assert_eq!(first.total, 25);
    assert_eq!(first.total_pages(), 3);

    // Newest first.
    assert!(first
        .items
        .windows(2)
        .all(|pair| pair[0].start_time >= pair[1].start_time));

    let third = repo
        .find_by_name("nightly-job", PageRequest::new(2, 10).unwrap())
        .await
        .unwrap();
    assert_eq!(third.items.len(), 5);
    assert_eq!(third.total, 25);

    let beyond = repo
        .find_by_name("nightly-job", PageRequest::new(3, 10).unwrap())
        .await
        .unwrap();
    assert!(beyond.items.is_empty());
    assert_eq!(beyond.total, 25);

    let all = repo.find_all(PageRequest::new(0, 100).unwrap()).await.unwrap();
    assert_eq!(all.total, 26);
}

#[tokio::test]
async fn test_pages_do_not_overlap() {
    let clock = Arc::new(ManualClock::default());
    let repo = MemoryExecutionRepository::new(Arc::new(MemorySequence::new()), clock.clone());
    for _ in 0..25 {
        repo.create(NewExecution::new("same-start", clock.now()))
            .await
            .unwrap();
    }

    let mut seen = BTreeSet::new();
    for page in 0..3 {
        let page = repo
            .find_by_name("same-start", PageRequest::new(page, 10).unwrap())
            .await
            .unwrap();
        for record in page.items {
            assert!(seen.insert(record.execution_id));
        }
    }
    assert_eq!(seen.len(), 25);
}

#[tokio::test]
async fn test_concurrent_creates_get_unique_ids() {
    let sequence = Arc::new(MemorySequence::new());
    let repo = Arc::new(MemoryExecutionRepository::new(
        sequence.clone(),
        Arc::new(SystemClock),
    ));

    let mut handles = Vec::new();
    for i in 0..50 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.create(NewExecution::new(format!("task-{}", i % 5), Utc::now()))
                .await
                .unwrap()
                .execution_id
        }));
    }

    let mut ids = BTreeSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 50);
    assert_eq!(sequence.next().await.unwrap(), 51);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contending_locks_never_overlap() {
    let store = Arc::new(MemoryLockStore::new());
    let holders = Arc::new(AtomicUsize::new(0));
    let max_holders = Arc::new(AtomicUsize::new(0));
    let acquisitions = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        // Each lock has its own owner token, as if it lived in another process.
        let lock = LeaseLock::new(
            "nightly-job",
            "DEFAULT",
            settings(Duration::from_secs(5), Duration::from_millis(5)),
            store.clone(),
            Arc::new(SystemClock),
        )
        .unwrap();
        let holders = holders.clone();
        let max_holders = max_holders.clone();
        let acquisitions = acquisitions.clone();

        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                if lock.acquire(Duration::from_secs(5)).await.unwrap() {
                    let current = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_holders.fetch_max(current, Ordering::SeqCst);
                    acquisitions.fetch_add(1, Ordering::SeqCst);

                    tokio::time::sleep(Duration::from_millis(2)).await;

                    holders.fetch_sub(1, Ordering::SeqCst);
                    assert!(lock.release().await.unwrap());
                }
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(max_holders.load(Ordering::SeqCst), 1);
    assert_eq!(acquisitions.load(Ordering::SeqCst), 40);
}

#[tokio::test]
async fn test_two_processes_racing_for_nightly_job() {
    let store = Arc::new(MemoryLockStore::new());
    let config = TaskConfig {
        lease_ttl: Duration::from_secs(5),
        ..Default::default()
    };
    let process_a = LockRegistry::from_config(&config, store.clone(), Arc::new(SystemClock));
    let process_b = LockRegistry::from_config(&config, store.clone(), Arc::new(SystemClock));

    let lock_a = process_a.obtain("nightly-job").await.unwrap();
    let lock_b = process_b.obtain("nightly-job").await.unwrap();

    let timeout = Duration::from_secs(2);
    let started = Instant::now();
    let (a, b) = tokio::join!(
        async {
            let acquired = lock_a.acquire(timeout).await.unwrap();
            (acquired, started.elapsed())
        },
        async {
            let acquired = lock_b.acquire(timeout).await.unwrap();
            (acquired, started.elapsed())
        }
    );

    let (winner, loser) = if a.0 { (a, b) } else { (b, a) };
    assert!(winner.0);
    assert!(!loser.0);
    assert!(winner.1 < Duration::from_secs(1));
    assert!(loser.1 >= timeout);
}

#[tokio::test]
async fn test_abandoned_lease_is_taken_over_after_ttl() {
    let store = Arc::new(MemoryLockStore::new());
    let clock = Arc::new(ManualClock::default());
    let crashed = LeaseLock::new(
        "nightly-job",
        "DEFAULT",
        settings(Duration::from_secs(5), Duration::from_millis(10)),
        store.clone(),
        clock.clone(),
    )
    .unwrap();
    let survivor = LeaseLock::new(
        "nightly-job",
        "DEFAULT",
        settings(Duration::from_secs(5), Duration::from_millis(10)),
        store.clone(),
        clock.clone(),
    )
    .unwrap();

    assert!(crashed.try_acquire_once().await.unwrap());
    assert!(!survivor.acquire(Duration::from_millis(50)).await.unwrap());

    clock.advance(ChronoDuration::seconds(5));
    assert!(survivor.acquire(Duration::from_millis(50)).await.unwrap());

    let holder = store.find("nightly-job", "DEFAULT").await.unwrap().unwrap();
    assert_eq!(holder.owner_id, survivor.owner_id());
    assert_eq!(holder.created_at, clock.now());
}

#[tokio::test]
async fn test_complete_round_trip_through_repository() {
    let clock = Arc::new(ManualClock::default());
    let repo = MemoryExecutionRepository::new(Arc::new(MemorySequence::new()), clock.clone());

    let created = repo
        .create(
            NewExecution::new("export", clock.now())
                .with_arguments(["--format", "csv"])
                .with_external_execution_id("scheduler-17"),
        )
        .await
        .unwrap();
    let found = repo.find_by_id(created.execution_id).await.unwrap().unwrap();
    assert!(found.end_time.is_none());

    let end = clock.now() + ChronoDuration::minutes(3);
    repo.complete(created.execution_id, 3, end, Some("partial".to_string()))
        .await
        .unwrap();

    let found = repo.find_by_id(created.execution_id).await.unwrap().unwrap();
    assert_eq!(found.end_time, Some(end));
    assert_eq!(found.exit_code, Some(3));
    assert_eq!(found.arguments, vec!["--format", "csv"]);
    assert_eq!(found.external_execution_id.as_deref(), Some("scheduler-17"));

    repo.update_external_execution_id(created.execution_id, "scheduler-18")
        .await
        .unwrap();
    let found = repo.find_by_id(created.execution_id).await.unwrap().unwrap();
    assert_eq!(found.external_execution_id.as_deref(), Some("scheduler-18"));
}
