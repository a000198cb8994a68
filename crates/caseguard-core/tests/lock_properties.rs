// Integration tests have relaxed clippy settings.
// Production code (src/) must use strict zero-unwrap/panic patterns.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]
//! Advisory lock behavior under concurrency.

mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use caseguard_core::{Error, LockMode, LockOptions, LockType, Result};
use common::Harness;
use tokio::sync::Barrier;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_holders_never_overlap() -> Result<()> {
    let harness = Harness::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let entered = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let locks = harness.locks.clone();
        let inside = Arc::clone(&inside);
        let max_inside = Arc::clone(&max_inside);
        let entered = Arc::clone(&entered);
        tasks.push(tokio::spawn(async move {
            locks
                .with_lock(
                    LockType::Case,
                    "C1",
                    LockMode::Exclusive,
                    LockOptions::new(),
                    || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        entered.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, Error>(())
                    },
                )
                .await
        }));
    }
    for task in tasks {
        task.await.expect("task panicked")?;
    }

    assert_eq!(entered.load(Ordering::SeqCst), 8);
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert!(!harness.locks.is_locked(LockType::Case, "C1", None).await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_holders_coexist_and_block_exclusive() -> Result<()> {
    let harness = Harness::new();
    let barrier = Arc::new(Barrier::new(5));

    let mut readers = Vec::new();
    for _ in 0..4 {
        let locks = harness.locks.clone();
        let barrier = Arc::clone(&barrier);
        readers.push(tokio::spawn(async move {
            let info = locks
                .acquire_lock(
                    LockType::Document,
                    "D1",
                    LockMode::Shared,
                    LockOptions::new().with_timeout(Duration::from_millis(200)),
                )
                .await?;
            barrier.wait().await;
            Ok::<_, Error>(info)
        }));
    }
    // All four readers hold the lock at the same time once the barrier opens.
    barrier.wait().await;

    let blocked = harness
        .locks
        .acquire_lock(
            LockType::Document,
            "D1",
            LockMode::Exclusive,
            LockOptions::new().with_timeout(Duration::from_millis(30)),
        )
        .await?;
    assert!(blocked.is_none());

    let mut held = Vec::new();
    for reader in readers {
        held.push(reader.await.expect("reader panicked")?.expect("shared lock"));
    }
    assert_eq!(held.len(), 4);
    assert!(harness.locks.is_locked(LockType::Document, "D1", Some(LockMode::Shared)).await?);

    let writer = {
        let locks = harness.locks.clone();
        tokio::spawn(async move {
            locks
                .acquire_lock(LockType::Document, "D1", LockMode::Exclusive, LockOptions::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!writer.is_finished());

    for info in &held {
        assert!(harness.locks.release(info).await);
    }
    let acquired = writer.await.expect("writer panicked")?;
    assert!(acquired.is_some_and(|info| info.mode == LockMode::Exclusive));
    Ok(())
}

#[tokio::test]
async fn acquisition_gives_up_within_timeout_plus_one_poll() -> Result<()> {
    let harness = Harness::new();
    harness
        .locks
        .acquire_lock(LockType::VectorIndex, "main", LockMode::Exclusive, LockOptions::new())
        .await?
        .expect("first lock");

    for timeout_ms in [0_u64, 15, 40] {
        let timeout = Duration::from_millis(timeout_ms);
        let started = Instant::now();
        let outcome = harness
            .locks
            .acquire_lock(
                LockType::VectorIndex,
                "main",
                LockMode::Exclusive,
                LockOptions::new().with_timeout(timeout),
            )
            .await?;
        let elapsed = started.elapsed();
        assert!(outcome.is_none());
        assert!(elapsed >= timeout, "gave up early after {:?}", elapsed);
        assert!(
            elapsed < timeout + Duration::from_millis(150),
            "overran timeout {:?}: {:?}",
            timeout,
            elapsed
        );
    }
    Ok(())
}

#[tokio::test]
async fn releasing_foreign_or_missing_locks_is_harmless() -> Result<()> {
    let harness = Harness::new();
    assert!(!harness.locks.release_lock(LockType::User, "nobody", LockMode::Exclusive).await);

    let info = harness
        .locks
        .acquire_lock(LockType::User, "U1", LockMode::Shared, LockOptions::new())
        .await?
        .expect("lock");
    assert!(harness.locks.release(&info).await);
    // Second release of the same lock: nothing held any more.
    assert!(!harness.locks.release(&info).await);
    assert!(!harness.locks.release_lock(LockType::User, "U1", LockMode::Shared).await);
    Ok(())
}

#[tokio::test]
async fn store_outage_surfaces_as_error_not_contention() {
    let harness = Harness::new();
    harness.backend.set_available(false);
    let outcome = harness
        .locks
        .acquire_lock(LockType::Case, "C1", LockMode::Exclusive, LockOptions::new())
        .await;
    assert!(matches!(outcome, Err(Error::Database(_))));

    let err = harness
        .locks
        .with_lock(
            LockType::Case,
            "C1",
            LockMode::Exclusive,
            LockOptions::new(),
            || async { Ok::<_, Error>(()) },
        )
        .await
        .unwrap_err();
    assert!(!err.is_contention());
    assert_eq!(err.code(), "DATABASE_ERROR");
}

#[test]
fn with_lock_on_a_plain_runtime() {
    let harness = Harness::new();
    let outcome: anyhow::Result<&str> = tokio_test::block_on(harness.locks.with_lock(
        LockType::Workflow,
        "W1",
        LockMode::Update,
        LockOptions::new().with_user("clerk"),
        || async { Ok::<_, anyhow::Error>("done") },
    ));
    assert_eq!(outcome.unwrap(), "done");
}
