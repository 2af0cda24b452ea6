//! Single-instance protocol behavior.
//!
//! One `LockService` over a `MemoryStore`: acquisition ordering, conflict
//! waiting, atomic multi-lock requests, idempotent release, and
//! client-level leases.

use std::sync::Arc;
use std::time::Duration;

use lockstep_common::LockstepError;
use lockstep_core::{AcquireOptions, Lock, LockRequest};
use lockstep_store::MemoryStore;

use lockstep_integration_tests::{start_service, volume_request, wait_until};

/// Ids are handed out from the global index, one per commit.
#[tokio::test]
async fn test_acquire_returns_sequential_ids() {
    let store = Arc::new(MemoryStore::new());
    let service = start_service(store).await;

    let first = service
        .acquire_default(volume_request("resize v1", "v1", "write"))
        .await
        .expect("first acquire failed");
    let second = service
        .acquire_default(volume_request("resize v2", "v2", "write"))
        .await
        .expect("second acquire failed");

    assert_eq!(first, 1);
    assert_eq!(second, 2);
}

/// A conflicting acquire waits out its timeout and reports the conflict.
#[tokio::test]
async fn test_conflicting_acquire_times_out() {
    let store = Arc::new(MemoryStore::new());
    let service = start_service(store).await;

    service
        .acquire_default(volume_request("hold", "v1", "write"))
        .await
        .expect("acquire failed");

    let err = service
        .acquire(
            volume_request("contend", "v1", "write"),
            AcquireOptions::default().with_timeout(Duration::from_millis(150)),
        )
        .await
        .expect_err("conflicting acquire should not succeed");
    assert!(matches!(err, LockstepError::Timeout));
}

/// A waiting acquire is granted once the holder releases.
#[tokio::test]
async fn test_waiting_acquire_proceeds_on_release() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(start_service(store).await);

    let held = service
        .acquire_default(volume_request("hold", "v1", "write"))
        .await
        .expect("acquire failed");

    let waiter_service = service.clone();
    let waiter = tokio::spawn(async move {
        waiter_service
            .acquire_default(volume_request("wait", "v1", "write"))
            .await
    });

    // Give the waiter time to park.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    service.release(held);
    let granted = waiter
        .await
        .expect("waiter panicked")
        .expect("waiter should be granted after release");
    assert!(granted > held);
}

/// Releasing twice, or releasing an id that never existed, is harmless.
#[tokio::test]
async fn test_release_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let service = start_service(store).await;

    let id = service
        .acquire_default(volume_request("hold", "v1", "write"))
        .await
        .expect("acquire failed");
    service.release(id);
    service.release(id);
    service.release(9999);

    // The lock is acquirable again and the doubled releases changed
    // nothing.
    service
        .acquire_default(volume_request("again", "v1", "write"))
        .await
        .expect("reacquire after release failed");
}

/// A request either gets all its locks or none of them.
#[tokio::test]
async fn test_multi_lock_request_is_atomic() {
    let store = Arc::new(MemoryStore::new());
    let service = start_service(store).await;

    service
        .acquire_default(volume_request("hold a", "a", "write"))
        .await
        .expect("acquire failed");

    // Conflicts on `a`, so `b` must not be taken either.
    let request = LockRequest::new(
        "move a to b",
        vec![
            Lock::new(["volumes", "b"], "write"),
            Lock::new(["volumes", "a"], "write"),
        ],
    );
    let err = service
        .acquire(
            request,
            AcquireOptions::default().with_timeout(Duration::from_millis(150)),
        )
        .await
        .expect_err("partially conflicting request should not succeed");
    assert!(matches!(err, LockstepError::Timeout));

    service
        .acquire_default(volume_request("take b", "b", "write"))
        .await
        .expect("lock b should be free after the atomic request failed");
}

/// Locks within one request are not checked against each other.
#[tokio::test]
async fn test_intra_request_conflicts_are_permitted() {
    let store = Arc::new(MemoryStore::new());
    let service = start_service(store).await;

    let request = LockRequest::new(
        "double",
        vec![
            Lock::new(["volumes", "v1"], "write"),
            Lock::new(["volumes", "v1"], "write"),
        ],
    );
    service
        .acquire_default(request)
        .await
        .expect("intra-request duplicate locks should be granted");
}

/// An unrenewed client lease force-releases the request.
#[tokio::test]
async fn test_lease_expiry_auto_releases() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(start_service(store).await);

    service
        .acquire(
            volume_request("leased", "v1", "write"),
            AcquireOptions::default().with_lease(Duration::from_millis(100)),
        )
        .await
        .expect("acquire failed");

    let probe = service.clone();
    wait_until(Duration::from_secs(3), async move || {
        probe
            .acquire(
                volume_request("probe", "v1", "write"),
                AcquireOptions::default().with_timeout(Duration::from_millis(50)),
            )
            .await
            .is_ok()
    })
    .await;
}

/// Renewal pushes the lease deadline out; the lock stays held.
#[tokio::test]
async fn test_lease_renewal_keeps_lock() {
    let store = Arc::new(MemoryStore::new());
    let service = start_service(store).await;

    let id = service
        .acquire(
            volume_request("leased", "v1", "write"),
            AcquireOptions::default().with_lease(Duration::from_millis(200)),
        )
        .await
        .expect("acquire failed");

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        service.renew(id).await.expect("renew failed");
    }

    let err = service
        .acquire(
            volume_request("probe", "v1", "write"),
            AcquireOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .expect_err("renewed lock should still be held");
    assert!(matches!(err, LockstepError::Timeout));
}

/// Renewing a request that holds no lease is an error.
#[tokio::test]
async fn test_renew_unknown_request_errors() {
    let store = Arc::new(MemoryStore::new());
    let service = start_service(store).await;

    let err = service.renew(42).await.expect_err("renew should fail");
    assert!(matches!(err, LockstepError::UnknownRequest(42)));
}

/// A lock under a path no provider covers fails immediately, without
/// waiting.
#[tokio::test]
async fn test_unprovided_path_fails_fast() {
    let store = Arc::new(MemoryStore::new());
    let service = start_service(store).await;

    let started = tokio::time::Instant::now();
    let request = LockRequest::new("bad", vec![Lock::new(["tapes", "t1"], "write")]);
    let err = service
        .acquire_default(request)
        .await
        .expect_err("unprovided path should fail");
    assert!(matches!(err, LockstepError::NoProvider(_)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

/// An empty lock list is rejected up front as a caller mistake, not a
/// conflict that could ever clear.
#[tokio::test]
async fn test_empty_request_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let service = start_service(store).await;

    let err = service
        .acquire_default(LockRequest::new("empty", vec![]))
        .await
        .expect_err("empty request should fail");
    assert!(matches!(err, LockstepError::InvalidRequest(_)));
}
