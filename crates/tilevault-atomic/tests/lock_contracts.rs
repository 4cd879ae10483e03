//! Lock manager contract tests, run against every backend.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tilevault_atomic::lock::{
    acquire_with_retry, create_lock_manager, AcquireOptions, DurableLockManager,
    InMemoryLockManager, LockManager, LockManagerOptions, LockOperation, LockType, RetryPolicy,
};
use tilevault_core::config::LockBackendKind;
use tilevault_core::dal::{DalConnection, SqliteDal};
use tilevault_core::error::Error;
use tilevault_test_utils::{init_test_logging, FailingSink, RecordingLockSink};

fn backends() -> Vec<(&'static str, Arc<dyn LockManager>)> {
    let dal: Arc<dyn DalConnection> = Arc::new(SqliteDal::open_in_memory().unwrap());
    vec![
        ("memory", Arc::new(InMemoryLockManager::new())),
        ("durable", Arc::new(DurableLockManager::new(dal))),
    ]
}

#[tokio::test]
async fn second_writer_fails_until_release() {
    init_test_logging();
    for (backend, locks) in backends() {
        let opts = AcquireOptions::default();
        let first = locks.acquire("t", "a", LockType::Write, &opts).await.unwrap();

        let err = locks.acquire("t", "b", LockType::Write, &opts).await.unwrap_err();
        assert!(err.is_contention(), "{backend}: {err}");

        locks.release(&first).await.unwrap();
        let third = locks.acquire("t", "c", LockType::Write, &opts).await;
        assert!(third.is_ok(), "{backend}: {third:?}");
    }
}

#[tokio::test]
async fn concurrent_readers_exclude_writers() {
    for (backend, locks) in backends() {
        let opts = AcquireOptions::default();
        let (r1, r2) = tokio::join!(
            locks.acquire("t", "r1", LockType::Read, &opts),
            locks.acquire("t", "r2", LockType::Read, &opts),
        );
        let r1 = r1.unwrap();
        r2.unwrap();

        assert!(
            locks.acquire("t", "w", LockType::Write, &opts).await.is_err(),
            "{backend}: writer admitted alongside readers"
        );

        // One reader leaving is not enough.
        locks.release(&r1).await.unwrap();
        assert!(
            locks.acquire("t", "w", LockType::Write, &opts).await.is_err(),
            "{backend}: writer admitted alongside a remaining reader"
        );
    }
}

#[tokio::test]
async fn upgradeable_coexists_with_readers_only() {
    for (backend, locks) in backends() {
        let opts = AcquireOptions::default();
        let up = locks.acquire("t", "u", LockType::Upgradeable, &opts).await.unwrap();
        locks.acquire("t", "r", LockType::Read, &opts).await.unwrap();

        assert!(locks.acquire("t", "u2", LockType::Upgradeable, &opts).await.is_err(), "{backend}");
        assert!(locks.acquire("t", "w", LockType::Write, &opts).await.is_err(), "{backend}");

        locks.release(&up).await.unwrap();
        locks.acquire("t", "u2", LockType::Upgradeable, &opts).await.unwrap();
    }
}

#[tokio::test]
async fn non_owner_renew_and_release_always_fail() {
    for (backend, locks) in backends() {
        for lock_type in [LockType::Read, LockType::Write, LockType::Upgradeable] {
            let lock_id = format!("t-{lock_type}");
            let lease = locks
                .acquire(&lock_id, "owner", lock_type, &AcquireOptions::default())
                .await
                .unwrap();
            let mut intruder = lease.clone();
            intruder.owner_id = "intruder".into();

            let renew = locks.renew(&intruder).await.unwrap_err();
            assert!(matches!(renew, Error::LockOwnership { .. }), "{backend}: {renew}");
            let release = locks.release(&intruder).await.unwrap_err();
            assert!(matches!(release, Error::LockOwnership { .. }), "{backend}: {release}");

            // The real owner is unaffected.
            locks.renew(&lease).await.unwrap();
            locks.release(&lease).await.unwrap();
        }
    }
}

#[tokio::test]
async fn expired_lease_is_free() {
    for (backend, locks) in backends() {
        locks
            .acquire("t", "a", LockType::Write, &AcquireOptions::with_ttl(Duration::from_millis(30)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let lease = locks
            .acquire("t", "b", LockType::Write, &AcquireOptions::default())
            .await;
        assert_eq!(lease.map(|l| l.owner_id).ok().as_deref(), Some("b"), "{backend}");
    }
}

#[tokio::test]
async fn retry_waits_out_a_short_lease() {
    for (backend, locks) in backends() {
        locks
            .acquire("t", "a", LockType::Write, &AcquireOptions::with_ttl(Duration::from_millis(40)))
            .await
            .unwrap();

        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            multiplier: 2,
        };
        let acquired = acquire_with_retry(
            locks.as_ref(),
            "t",
            "b",
            LockType::Write,
            &AcquireOptions::default(),
            &policy,
        )
        .await
        .unwrap();
        assert!(acquired.contended(), "{backend}: expected at least one retry");
        assert_eq!(acquired.lock.owner_id, "b");
    }
}

#[tokio::test]
async fn factory_wraps_with_diagnostics() {
    let sink = RecordingLockSink::new();
    let locks = create_lock_manager(
        LockBackendKind::Memory,
        None,
        LockManagerOptions {
            diagnostics: Some(Arc::new(sink.clone())),
            ..LockManagerOptions::default()
        },
    )
    .unwrap();

    let lease = locks
        .acquire("t", "a", LockType::Write, &AcquireOptions::default())
        .await
        .unwrap();
    locks.renew(&lease).await.unwrap();
    locks.release(&lease).await.unwrap();

    let ops: Vec<_> = sink.events().iter().map(|e| e.operation).collect();
    assert_eq!(
        ops,
        vec![LockOperation::Acquire, LockOperation::Renew, LockOperation::Release]
    );
}

#[tokio::test]
async fn factory_durable_uses_custom_table() {
    let dal: Arc<dyn DalConnection> = Arc::new(SqliteDal::open_in_memory().unwrap());
    let locks = create_lock_manager(
        LockBackendKind::Durable,
        Some(Arc::clone(&dal)),
        LockManagerOptions {
            table: "tile_leases".into(),
            diagnostics: Some(Arc::new(FailingSink)),
        },
    )
    .unwrap();

    locks
        .acquire("t", "a", LockType::Write, &AcquireOptions::default())
        .await
        .unwrap();

    let rows = dal
        .execute_query(tilevault_core::dal::DalQuery::new("SELECT owner FROM tile_leases"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn durable_leases_are_shared_across_managers() {
    let dal: Arc<dyn DalConnection> = Arc::new(SqliteDal::open_in_memory().unwrap());
    let svc_a = DurableLockManager::new(Arc::clone(&dal));
    let svc_b = DurableLockManager::new(dal);

    let lease = svc_a
        .acquire("t", "a", LockType::Write, &AcquireOptions::default())
        .await
        .unwrap();
    assert!(svc_b
        .acquire("t", "b", LockType::Write, &AcquireOptions::default())
        .await
        .unwrap_err()
        .is_contention());

    svc_a.release(&lease).await.unwrap();
    svc_b
        .acquire("t", "b", LockType::Write, &AcquireOptions::default())
        .await
        .unwrap();
}
