//! Shared harness for the end-to-end protocol tests.
//!
//! Every test runs one or more complete `LockService` instances over a
//! single shared `MemoryStore`, which stands in for the coordination
//! cluster. Timings are shrunk so lease expiry and retry paths fire within
//! test budgets.

use std::sync::{Arc, Once};
use std::time::Duration;

use lockstep_core::{
    ExclusiveProvider, Lock, LockRequest, LockService, LockServiceBuilder, LockServiceConfig,
    ServiceRecord,
};
use lockstep_store::{CoordinationStore, LeaseId, MemoryStore};

pub const TEST_PREFIX: &str = "/lockstep-test";

static INIT_LOGGING: Once = Once::new();

/// Install a test-friendly subscriber once; controlled by `RUST_LOG`.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Configuration with timings small enough for tests to exercise retry,
/// lease-expiry and resynchronization paths quickly.
pub fn fast_config() -> LockServiceConfig {
    LockServiceConfig {
        key_prefix: TEST_PREFIX.to_string(),
        service_ttl: Duration::from_secs(5),
        propose_lock_ttl: Duration::from_secs(2),
        propose_lock_timeout: Duration::from_secs(5),
        propose_retry_delay: Duration::from_millis(5),
        catch_up_timeout: Duration::from_secs(5),
        lease_tick: Duration::from_millis(20),
        release_retry_base: Duration::from_millis(20),
        release_retry_jitter: Duration::from_millis(30),
        default_acquire_timeout: Duration::from_secs(5),
        resync_retry_delay: Duration::from_millis(50),
    }
}

/// Start a service instance with exclusive-lock providers for the
/// `volumes/*` and `nodes/*` subtrees.
pub async fn start_service(store: Arc<MemoryStore>) -> LockService {
    init_logging();
    LockServiceBuilder::new(store, fast_config())
        .register_provider(["volumes", "*"], Box::new(ExclusiveProvider::new()))
        .register_provider(["nodes", "*"], Box::new(ExclusiveProvider::new()))
        .start()
        .await
        .expect("service failed to start")
}

/// A single-lock request for the named volume.
pub fn volume_request(reason: &str, volume: &str, name: &str) -> LockRequest {
    LockRequest::new(reason, vec![Lock::new(["volumes", volume], name)])
}

/// Look up the store lease backing a service's liveness key, so tests can
/// simulate a crash by expiring it.
pub async fn liveness_lease(store: &MemoryStore, service_id: &str) -> LeaseId {
    let key = format!("{TEST_PREFIX}/services/{service_id}");
    let raw = store
        .get(&key)
        .await
        .expect("store read failed")
        .expect("service record missing");
    let record: ServiceRecord = serde_json::from_str(&raw).expect("corrupt service record");
    record.lease_id
}

/// Poll `check` until it returns true or the deadline lapses.
pub async fn wait_until<F>(deadline: Duration, mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    loop {
        if check().await {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "condition not met within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
